//! Linux udev-based USB discovery.
//!
//! Enumeration walks udev's database for `hidraw` and `tty` nodes and climbs
//! to their USB parents to recover identity and topology. Hotplug uses a udev
//! netlink monitor; its socket is what the device monitor splices onto its
//! stable descriptor.
//!
//! udev objects wrap raw C pointers and are not `Send`, so a [`Context`] and
//! every backend built from it stay on the thread that created them.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use rustix::event::{eventfd, EventfdFlags};
use udev::{Device, Enumerator, EventType, MonitorBuilder, MonitorSocket, Udev};

use super::{interface_number, parse_report_descriptor, parse_usb_id, usb_location};
use crate::{
    device::{DeviceType, RawDevice},
    error::{Error, Result},
    filter::DeviceFilter,
    tracing::prelude::*,
    transport::{BackendEvent, DeviceBackend},
};

/// udev subsystems we know how to turn into raw devices.
const DEVICE_SUBSYSTEMS: &[(&str, DeviceType)] = &[
    ("hidraw", DeviceType::Hid),
    ("tty", DeviceType::Serial),
];

/// Process-scoped discovery state.
///
/// Holds the udev handle and the never-ready placeholder descriptor that
/// every stopped monitor points its stable descriptor at. Create one per
/// thread that runs monitors and pass it to each of them; everything is
/// released when the last reference drops.
pub struct Context {
    udev: Udev,
    placeholder: OwnedFd,
}

impl Context {
    pub fn new() -> Result<Rc<Self>> {
        let udev = Udev::new().map_err(Error::os("udev_new"))?;

        // An eventfd nobody ever writes to: reads would block, poll never
        // reports it readable.
        let placeholder = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(Error::errno("eventfd"))?;

        trace!("udev context initialized.");
        Ok(Rc::new(Self { udev, placeholder }))
    }
}

/// udev device backend.
pub struct UdevBackend {
    ctx: Rc<Context>,
    socket: Option<MonitorSocket>,
}

impl UdevBackend {
    pub fn new(ctx: &Rc<Context>) -> Self {
        Self {
            ctx: Rc::clone(ctx),
            socket: None,
        }
    }
}

impl DeviceBackend for UdevBackend {
    fn placeholder(&self) -> BorrowedFd<'_> {
        self.ctx.placeholder.as_fd()
    }

    fn enumerate(
        &mut self,
        filter: &DeviceFilter,
        visit: &mut dyn FnMut(RawDevice) -> Result<()>,
    ) -> Result<()> {
        let mut enumerator =
            Enumerator::with_udev(self.ctx.udev.clone()).map_err(Error::os("udev_enumerate_new"))?;
        enumerator
            .match_is_initialized()
            .map_err(Error::os("udev_enumerate_add_match_is_initialized"))?;

        let mut subsystems = 0;
        for (subsystem, device_type) in DEVICE_SUBSYSTEMS {
            if filter.has_type(*device_type) {
                enumerator
                    .match_subsystem(subsystem)
                    .map_err(Error::os("udev_enumerate_add_match_subsystem"))?;
                subsystems += 1;
            }
        }
        // Without a subsystem match udev would list every device it knows.
        if subsystems == 0 {
            return Ok(());
        }

        let devices = enumerator
            .scan_devices()
            .map_err(Error::os("udev_enumerate_scan_devices"))?;

        for device in devices {
            let dev = match read_device_information(&device)? {
                Ok(dev) => dev,
                Err(reason) => {
                    debug!(key = ?device.devpath(), reason, "Skipping incomplete device record.");
                    continue;
                }
            };

            if filter.matches(&dev) {
                visit(dev)?;
            }
        }

        Ok(())
    }

    fn start(&mut self, filter: &DeviceFilter) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let mut builder = MonitorBuilder::new()
            .map_err(Error::os("udev_monitor_new_from_netlink"))?;
        for (subsystem, device_type) in DEVICE_SUBSYSTEMS {
            if filter.has_type(*device_type) {
                builder = builder
                    .match_subsystem(subsystem)
                    .map_err(Error::os("udev_monitor_filter_add_match_subsystem_devtype"))?;
            }
        }

        let socket = builder
            .listen()
            .map_err(Error::os("udev_monitor_enable_receiving"))?;
        debug!(fd = socket.as_raw_fd(), "udev monitor listening.");

        self.socket = Some(socket);
        Ok(())
    }

    fn stop(&mut self) {
        if self.socket.take().is_some() {
            debug!("udev monitor closed.");
        }
    }

    fn live_descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(AsFd::as_fd)
    }

    fn poll_events(&mut self, visit: &mut dyn FnMut(BackendEvent) -> Result<()>) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };

        for event in socket.iter() {
            match event.event_type() {
                EventType::Add => match read_device_information(&event)? {
                    Ok(dev) => {
                        trace!(device = %dev, "udev add.");
                        visit(BackendEvent::Add(dev))?;
                    }
                    Err(reason) => {
                        debug!(
                            key = ?event.devpath(),
                            reason,
                            "Ignoring incomplete hotplug record."
                        );
                    }
                },
                EventType::Remove => {
                    let key = event.devpath().to_string_lossy().into_owned();
                    trace!(key = %key, "udev remove.");
                    visit(BackendEvent::Remove { key })?;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Either a complete device, or the reason the record was skipped.
type Probe = std::result::Result<RawDevice, &'static str>;

/// Build a [`RawDevice`] from a udev device node.
///
/// Mid-hotplug, udev regularly hands out nodes whose USB parents or
/// attributes are not there yet; those come back as `Ok(Err(reason))`. Only
/// memory exhaustion is an error.
fn read_device_information(device: &Device) -> Result<Probe> {
    let usb = match device.parent_with_subsystem_devtype("usb", "usb_device") {
        Ok(Some(usb)) => usb,
        Ok(None) => return Ok(Err("no USB device parent")),
        Err(e) => return skip_unless_oom(e, "USB device parent lookup failed"),
    };
    let iface = match device.parent_with_subsystem_devtype("usb", "usb_interface") {
        Ok(Some(iface)) => iface,
        Ok(None) => return Ok(Err("no USB interface parent")),
        Err(e) => return skip_unless_oom(e, "USB interface parent lookup failed"),
    };

    let Some(subsystem) = device.subsystem().and_then(|s| s.to_str()) else {
        return Ok(Err("no subsystem"));
    };
    let Some(&(_, device_type)) = DEVICE_SUBSYSTEMS
        .iter()
        .find(|(name, _)| *name == subsystem)
    else {
        return Ok(Err("unsupported subsystem"));
    };

    let Some(path) = device.devnode().filter(|path| path.exists()) else {
        return Ok(Err("device node missing"));
    };
    let Some(key) = device.devpath().to_str() else {
        return Ok(Err("devpath is not UTF-8"));
    };

    let (Some(busnum), Some(devpath)) = (attribute(&usb, "busnum"), attribute(&usb, "devpath"))
    else {
        return Ok(Err("incomplete USB topology"));
    };
    let location = usb_location(busnum, devpath);

    let Some(vid) = attribute(&usb, "idVendor").and_then(parse_usb_id) else {
        return Ok(Err("missing vendor id"));
    };
    let Some(pid) = attribute(&usb, "idProduct").and_then(parse_usb_id) else {
        return Ok(Err("missing product id"));
    };

    let Some(interface_number) = iface.devpath().to_str().and_then(interface_number) else {
        return Ok(Err("unparsable interface number"));
    };

    let mut dev = RawDevice::new(device_type, path, key, location, vid, pid, interface_number);
    dev.manufacturer = attribute(&usb, "manufacturer").map(str::to_owned);
    dev.product = attribute(&usb, "product").map(str::to_owned);
    dev.serial_number = attribute(&usb, "serial").map(str::to_owned);

    if device_type == DeviceType::Hid {
        let Some((usage_page, usage)) = read_hid_usage(device) else {
            return Ok(Err("unreadable HID report descriptor"));
        };
        dev = dev.with_hid_usage(usage_page, usage);
    }

    Ok(Ok(dev))
}

/// Top-level usage of the HID device behind a hidraw node, from the report
/// descriptor sysfs exposes on the `hid` parent.
fn read_hid_usage(device: &Device) -> Option<(u16, u16)> {
    let hid = device.parent_with_subsystem("hid").ok().flatten()?;
    let desc = fs::read(hid.syspath().join("report_descriptor")).ok()?;
    Some(parse_report_descriptor(&desc))
}

fn attribute<'a>(device: &'a Device, name: &str) -> Option<&'a str> {
    device.attribute_value(name).and_then(|value| value.to_str())
}

fn skip_unless_oom(e: io::Error, reason: &'static str) -> Result<Probe> {
    match Error::system("udev_device_get_parent_with_subsystem_devtype", e) {
        Error::Memory => Err(Error::Memory),
        _ => Ok(Err(reason)),
    }
}
