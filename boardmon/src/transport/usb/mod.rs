//! USB device discovery.
//!
//! This module handles USB device enumeration and hotplug events. It
//! provides raw device information without any knowledge of what the devices
//! are or which board they belong to.
//!
//! ## Platform Support
//!
//! - **Linux**: Uses udev for device enumeration and hotplug monitoring

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{Context, UdevBackend};

#[cfg(not(target_os = "linux"))]
compile_error!("USB discovery is not implemented for this platform");

/// Build the location string of a USB device from its bus number and port
/// path, e.g. bus "1" and devpath "2.4" become "usb-1-2-4".
///
/// Dots separate hub levels in sysfs; they are turned into dashes so the
/// result is unambiguous and safe to use in file names.
pub fn usb_location(busnum: &str, devpath: &str) -> String {
    format!("usb-{}-{}", busnum, devpath).replace('.', "-")
}

/// Extract the interface number from a USB interface devpath such as
/// "/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0".
pub fn interface_number(devpath: &str) -> Option<u8> {
    let digits = devpath.rsplit('.').next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse a hex id attribute such as "16c0".
pub fn parse_usb_id(value: &str) -> Option<u16> {
    u16::from_str_radix(value.trim(), 16).ok()
}

/// Top-level usage page and usage of a HID report descriptor, the ones
/// declared before the first collection. A truncated item ends the scan.
pub fn parse_report_descriptor(desc: &[u8]) -> (u16, u16) {
    let (mut usage_page, mut usage) = (0, 0);

    let mut i = 0;
    while i < desc.len() {
        let prefix = desc[i];
        let size = match prefix & 0x03 {
            3 => 4,
            n => usize::from(n),
        };
        let Some(data) = desc.get(i + 1..i + 1 + size) else {
            break;
        };
        // Little endian, at most 4 bytes
        let value = data.iter().rev().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

        match prefix & 0xfc {
            0x04 => usage_page = value as u16,
            0x08 => usage = value as u16,
            0xa0 => break,
            _ => {}
        }
        i += size + 1;
    }

    (usage_page, usage)
}
