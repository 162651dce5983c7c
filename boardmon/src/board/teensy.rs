//! Teensy boards (PJRC, vid 0x16C0).
//!
//! Application firmware shows up as a USB serial port or as HID interfaces
//! (Seremu serial emulation, RawHID). The HalfKay bootloader is a HID device
//! with its own product id and reports the serial number in hex. HID
//! interfaces are identified by the usage page of their report descriptor.

use crate::{
    board::{class::BoardClass, BoardModel, Capabilities, InterfaceInfo},
    device::{DeviceType, RawDevice},
    filter::DeviceMatch,
};

pub const TEENSY_VID: u16 = 0x16c0;
pub const HALFKAY_PID: u16 = 0x0478;

pub static TEENSY: BoardModel = BoardModel {
    name: "Teensy",
    mcu: "unknown",
};

const USAGE_PAGE_BOOTLOADER: u16 = 0xff9c;
const USAGE_PAGE_RAWHID: u16 = 0xffab;
const USAGE_PAGE_SEREMU: u16 = 0xffc9;

/// Serial reported by AVR bootloaders, which have no serial string.
const AVR_BOOTLOADER_SERIAL: u64 = 12345;

inventory::submit! {
    BoardClass {
        name: "teensy",
        pattern: DeviceMatch::vid(TEENSY_VID),
        probe,
    }
}

fn probe(dev: &RawDevice) -> Option<InterfaceInfo> {
    if !matches!(dev.pid, HALFKAY_PID | 0x0482..=0x0488) {
        return None;
    }

    let running = Capabilities::RUN | Capabilities::SERIAL | Capabilities::REBOOT;
    let serial = dev.serial_number.as_deref();
    let (name, capabilities, serial) = match dev.device_type {
        DeviceType::Serial if dev.pid != HALFKAY_PID => {
            ("Serial", running, parse_running_serial(serial))
        }
        DeviceType::Serial => return None,
        DeviceType::Hid => match dev.hid_usage_page {
            USAGE_PAGE_BOOTLOADER => (
                "HalfKay Bootloader",
                Capabilities::UPLOAD | Capabilities::RESET,
                parse_bootloader_serial(serial),
            ),
            USAGE_PAGE_SEREMU => ("Seremu", running, parse_running_serial(serial)),
            USAGE_PAGE_RAWHID => ("RawHID", Capabilities::RUN, parse_running_serial(serial)),
            _ => return None,
        },
    };

    Some(InterfaceInfo {
        name,
        capabilities,
        model: Some(&TEENSY),
        serial,
    })
}

/// Bootloader serials are hex with leading zeros. Running firmware appends a
/// 0 to serials below 10000000, so do the same to make both modes agree.
/// 100 is what boards without a programmed serial report.
fn parse_bootloader_serial(s: Option<&str>) -> u64 {
    let Some(s) = s else {
        return AVR_BOOTLOADER_SERIAL;
    };

    match u64::from_str_radix(s.trim(), 16).unwrap_or(0) {
        100 => 0,
        serial if serial < 10_000_000 => serial * 10,
        serial => serial,
    }
}

fn parse_running_serial(s: Option<&str>) -> u64 {
    s.and_then(|s| s.trim().parse().ok()).unwrap_or(0)
}
