//! Raw OS devices as reported by a backend.
//!
//! A [`RawDevice`] is one device node (a hidraw node or a tty) belonging to a
//! USB interface. Several raw devices may belong to the same physical board;
//! they share a [`location`](RawDevice::location).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Kind of OS device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Hid,
    Serial,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Hid, DeviceType::Serial];
}

/// Whether the node is still present on the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Disconnected,
}

/// Raw-device level notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Added,
    Removed,
}

/// One OS-visible endpoint of a USB device.
#[derive(Debug)]
pub struct RawDevice {
    pub device_type: DeviceType,
    /// Device node, e.g. "/dev/ttyACM0"
    pub path: PathBuf,
    /// Backend identity of the node (udev devpath on Linux)
    pub key: String,
    /// USB port path, e.g. "usb-1-2-3"
    pub location: String,
    pub vid: u16,
    pub pid: u16,
    pub interface_number: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Top-level HID usage page and usage, 0 when unknown or not HID
    pub hid_usage_page: u16,
    pub hid_usage: u16,
    online: AtomicBool,
}

impl RawDevice {
    /// Create an online device record.
    pub fn new(
        device_type: DeviceType,
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        location: impl Into<String>,
        vid: u16,
        pid: u16,
        interface_number: u8,
    ) -> Self {
        Self {
            device_type,
            path: path.into(),
            key: key.into(),
            location: location.into(),
            vid,
            pid,
            interface_number,
            manufacturer: None,
            product: None,
            serial_number: None,
            hid_usage_page: 0,
            hid_usage: 0,
            online: AtomicBool::new(true),
        }
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_hid_usage(mut self, usage_page: u16, usage: u16) -> Self {
        self.hid_usage_page = usage_page;
        self.hid_usage = usage;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> DeviceStatus {
        if self.online.load(Ordering::Acquire) {
            DeviceStatus::Online
        } else {
            DeviceStatus::Disconnected
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        self.online.store(false, Ordering::Release);
    }
}

impl std::fmt::Display for RawDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x} ({:?}, iface {})",
            self.path.display(),
            self.vid,
            self.pid,
            self.device_type,
            self.interface_number
        )
    }
}
