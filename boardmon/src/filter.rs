//! Device match rules.
//!
//! The same [`DeviceFilter`] is applied when enumerating and when a hotplug
//! event arrives, so a device is either visible on both paths or on neither.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceType, RawDevice};
use crate::error::{Error, Result};

/// One match rule. Absent fields are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMatch {
    #[serde(default, rename = "type")]
    pub device_type: Option<DeviceType>,
    #[serde(default, with = "usb_id")]
    pub vid: Option<u16>,
    #[serde(default, with = "usb_id")]
    pub pid: Option<u16>,
}

impl DeviceMatch {
    /// Match every device.
    pub const fn any() -> Self {
        Self {
            device_type: None,
            vid: None,
            pid: None,
        }
    }

    pub const fn of_type(device_type: DeviceType) -> Self {
        Self {
            device_type: Some(device_type),
            vid: None,
            pid: None,
        }
    }

    pub const fn vid(vid: u16) -> Self {
        Self {
            device_type: None,
            vid: Some(vid),
            pid: None,
        }
    }

    pub const fn vid_pid(vid: u16, pid: u16) -> Self {
        Self {
            device_type: None,
            vid: Some(vid),
            pid: Some(pid),
        }
    }

    pub const fn type_vid_pid(device_type: DeviceType, vid: u16, pid: u16) -> Self {
        Self {
            device_type: Some(device_type),
            vid: Some(vid),
            pid: Some(pid),
        }
    }

    pub fn matches(&self, device: &RawDevice) -> bool {
        self.device_type.map_or(true, |t| t == device.device_type)
            && self.vid.map_or(true, |v| v == device.vid)
            && self.pid.map_or(true, |p| p == device.pid)
    }

    pub fn admits_type(&self, device_type: DeviceType) -> bool {
        self.device_type.map_or(true, |t| t == device_type)
    }

    /// How narrowly this rule selects devices.
    ///
    /// Vendor and product ids outweigh the device type, so a rule naming a
    /// vendor beats a rule naming only a type.
    pub fn specificity(&self) -> u32 {
        let mut score = 0;
        if self.device_type.is_some() {
            score += 1;
        }
        if self.vid.is_some() {
            score += 2;
        }
        if self.pid.is_some() {
            score += 2;
        }
        score
    }
}

/// A set of rules, OR-ed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    rules: Vec<DeviceMatch>,
}

impl DeviceFilter {
    /// Build a filter from `rules`. An empty rule set matches everything.
    pub fn new(rules: Vec<DeviceMatch>) -> Result<Self> {
        for rule in &rules {
            if rule.pid.is_some() && rule.vid.is_none() {
                return Err(Error::Param(format!(
                    "product id {:04x} given without a vendor id",
                    rule.pid.unwrap_or_default()
                )));
            }
        }
        Ok(Self { rules })
    }

    /// Filter that accepts every device.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[DeviceMatch] {
        &self.rules
    }

    /// True if at least one rule matches `device`.
    pub fn matches(&self, device: &RawDevice) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(device))
    }

    /// True if at least one rule admits `device_type`.
    pub fn has_type(&self, device_type: DeviceType) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.admits_type(device_type))
    }
}

/// USB ids in config files: hex strings such as "16c0" (an "0x" prefix is
/// allowed), or plain numbers. Serialized as four hex digits.
mod usb_id {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u16),
        Hex(String),
    }

    pub fn serialize<S>(value: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(id) => serializer.serialize_some(&format!("{id:04x}")),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Number(id)) => Ok(Some(id)),
            Some(Repr::Hex(text)) => {
                let digits = text.trim();
                let digits = digits
                    .strip_prefix("0x")
                    .or_else(|| digits.strip_prefix("0X"))
                    .unwrap_or(digits);
                u16::from_str_radix(digits, 16).map(Some).map_err(|_| {
                    de::Error::custom(format!("invalid USB id {text:?}, expected hex"))
                })
            }
        }
    }
}
