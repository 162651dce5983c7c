//! OS device backends.
//!
//! A backend turns the platform's device database into [`RawDevice`]
//! records: a one-shot enumeration, and a live hotplug subscription exposed
//! through a pollable descriptor. It knows nothing about boards.
//!
//! ## Platform Support
//!
//! - **Linux**: udev enumeration and netlink hotplug monitoring

use std::os::fd::BorrowedFd;

use crate::{device::RawDevice, error::Result, filter::DeviceFilter};

pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

pub use usb::{Context, UdevBackend};

/// Hotplug transition reported by a backend.
#[derive(Debug)]
pub enum BackendEvent {
    /// A fully-described device appeared
    Add(RawDevice),

    /// The device identified by `key` went away
    Remove { key: String },
}

/// Platform-specific device discovery.
///
/// The owning [`DeviceMonitor`](crate::device_monitor::DeviceMonitor)
/// handles indexing and the stable descriptor; implementations only talk to
/// the OS.
///
/// # Implementation Requirements
///
/// 1. `enumerate` must skip incomplete records rather than fail
/// 2. `poll_events` must never block
/// 3. `live_descriptor` must become readable whenever `poll_events` has
///    something to deliver
pub trait DeviceBackend {
    /// Never-ready descriptor shared by monitors that are not started.
    fn placeholder(&self) -> BorrowedFd<'_>;

    /// Visit every present device accepted by `filter`.
    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(RawDevice) -> Result<()>,
    ) -> Result<()>;

    /// Open the live hotplug subscription for the types `filter` admits.
    fn start(&mut self, filter: &DeviceFilter) -> Result<()>;

    /// Close the live subscription. Safe to call when not started.
    fn stop(&mut self);

    /// Descriptor of the live subscription, if started.
    fn live_descriptor(&self) -> Option<BorrowedFd<'_>>;

    /// Deliver pending hotplug events without blocking.
    ///
    /// Stops at the first error returned by `visit` and returns it; events
    /// not yet delivered stay queued for the next call.
    fn poll_events(&mut self, visit: &mut dyn FnMut(BackendEvent) -> Result<()>) -> Result<()>;
}
