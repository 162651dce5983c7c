//! Any USB serial device. Claims only what no specific class wants.

use crate::{
    board::{class::BoardClass, Capabilities, InterfaceInfo},
    device::{DeviceType, RawDevice},
    filter::DeviceMatch,
};

inventory::submit! {
    BoardClass {
        name: "generic",
        pattern: DeviceMatch::of_type(DeviceType::Serial),
        probe,
    }
}

fn probe(dev: &RawDevice) -> Option<InterfaceInfo> {
    Some(InterfaceInfo {
        name: "Serial",
        capabilities: Capabilities::SERIAL,
        model: None,
        serial: dev
            .serial_number
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0),
    })
}
