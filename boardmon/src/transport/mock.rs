//! In-memory backend for exercising monitors without udev.
//!
//! Uses real eventfds for both the placeholder and the live descriptor, so
//! descriptor splicing and `wait` behave exactly as with udev.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use rustix::event::{eventfd, EventfdFlags};

use crate::{
    device::{DeviceType, RawDevice},
    error::{Error, Result},
    filter::DeviceFilter,
    transport::{BackendEvent, DeviceBackend},
};

#[derive(Default)]
struct State {
    present: Vec<RawDevice>,
    pending: VecDeque<BackendEvent>,
    /// Duplicate of the backend's live eventfd, for signalling
    live: Option<OwnedFd>,
    fail_enumeration: bool,
}

/// Mock backend. Tests keep a [`MockHandle`] to inject hotplug events.
pub struct MockBackend {
    placeholder: OwnedFd,
    live: Option<OwnedFd>,
    state: Rc<RefCell<State>>,
}

/// Test-side control of a [`MockBackend`].
#[derive(Clone)]
pub struct MockHandle {
    state: Rc<RefCell<State>>,
}

fn new_eventfd() -> OwnedFd {
    eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap()
}

fn signal(fd: &OwnedFd) {
    rustix::io::write(fd, &1u64.to_ne_bytes()).unwrap();
}

fn drain(fd: &OwnedFd) {
    let mut buf = [0u8; 8];
    let _ = rustix::io::read(fd, &mut buf);
}

impl MockBackend {
    pub fn new() -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(State::default()));
        let backend = Self {
            placeholder: new_eventfd(),
            live: None,
            state: Rc::clone(&state),
        };
        (backend, MockHandle { state })
    }
}

impl MockHandle {
    /// Make a device visible to enumeration without a hotplug event.
    pub fn preload(&self, dev: RawDevice) {
        self.state.borrow_mut().present.push(dev);
    }

    /// Queue a hotplug "add" and make the live descriptor readable.
    pub fn plug(&self, dev: RawDevice) {
        let mut state = self.state.borrow_mut();
        state.pending.push_back(BackendEvent::Add(dev));
        if let Some(fd) = &state.live {
            signal(fd);
        }
    }

    /// Queue a hotplug "remove" and make the live descriptor readable.
    pub fn unplug(&self, key: &str) {
        let mut state = self.state.borrow_mut();
        state.pending.push_back(BackendEvent::Remove { key: key.to_owned() });
        if let Some(fd) = &state.live {
            signal(fd);
        }
    }

    pub fn fail_enumeration(&self) {
        self.state.borrow_mut().fail_enumeration = true;
    }

    pub fn is_started(&self) -> bool {
        self.state.borrow().live.is_some()
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }
}

impl DeviceBackend for MockBackend {
    fn placeholder(&self) -> BorrowedFd<'_> {
        self.placeholder.as_fd()
    }

    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(RawDevice) -> Result<()>,
    ) -> Result<()> {
        if self.state.borrow().fail_enumeration {
            return Err(Error::Memory);
        }

        let present: Vec<_> = self.state.borrow().present.iter().map(copy_device).collect();
        for dev in present {
            if filter.matches(&dev) {
                visit(dev)?;
            }
        }
        Ok(())
    }

    fn start(&mut self, _filter: &DeviceFilter) -> Result<()> {
        if self.live.is_none() {
            let fd = new_eventfd();
            let mut state = self.state.borrow_mut();
            if !state.pending.is_empty() {
                signal(&fd);
            }
            state.live = Some(fd.try_clone()?);
            self.live = Some(fd);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.state.borrow_mut().live = None;
        self.live = None;
    }

    fn live_descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.live.as_ref().map(AsFd::as_fd)
    }

    fn poll_events(&mut self, visit: &mut dyn FnMut(BackendEvent) -> Result<()>) -> Result<()> {
        if let Some(fd) = &self.live {
            drain(fd);
        }

        loop {
            let Some(event) = self.state.borrow_mut().pending.pop_front() else {
                return Ok(());
            };
            if let Err(e) = visit(event) {
                // Anything left over must still wake the reactor.
                let pending = !self.state.borrow().pending.is_empty();
                if let (Some(fd), true) = (&self.live, pending) {
                    signal(fd);
                }
                return Err(e);
            }
        }
    }
}

fn copy_device(dev: &RawDevice) -> RawDevice {
    let mut copy = RawDevice::new(
        dev.device_type,
        dev.path.clone(),
        dev.key.clone(),
        dev.location.clone(),
        dev.vid,
        dev.pid,
        dev.interface_number,
    );
    copy.manufacturer = dev.manufacturer.clone();
    copy.product = dev.product.clone();
    copy.serial_number = dev.serial_number.clone();
    copy.with_hid_usage(dev.hid_usage_page, dev.hid_usage)
}

/// Teensy in application mode: USB serial, pid 0x483.
pub fn teensy_serial(location: &str, serial: &str) -> RawDevice {
    RawDevice::new(
        DeviceType::Serial,
        format!("/dev/ttyACM-{location}"),
        format!("/devices/{location}:1.0/tty"),
        location,
        0x16c0,
        0x0483,
        0,
    )
    .with_serial_number(serial)
}

/// Teensy HID interface of the application firmware (Seremu), pid 0x483.
pub fn teensy_seremu(location: &str, serial: &str) -> RawDevice {
    RawDevice::new(
        DeviceType::Hid,
        format!("/dev/hidraw-{location}"),
        format!("/devices/{location}:1.1/hidraw"),
        location,
        0x16c0,
        0x0483,
        1,
    )
    .with_serial_number(serial)
    .with_hid_usage(0xffc9, 0x04)
}

/// Teensy HalfKay bootloader: HID, pid 0x478, hex serial.
pub fn teensy_bootloader(location: &str, serial: &str) -> RawDevice {
    RawDevice::new(
        DeviceType::Hid,
        format!("/dev/hidraw-{location}-boot"),
        format!("/devices/{location}:1.0/hidraw-boot"),
        location,
        0x16c0,
        0x0478,
        0,
    )
    .with_serial_number(serial)
    .with_hid_usage(0xff9c, 0x24)
}
