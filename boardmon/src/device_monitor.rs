//! Raw device index and the stable monitor descriptor.
//!
//! A [`DeviceMonitor`] owns a backend and tracks every raw device the
//! backend reported, keyed by device key. Its descriptor never changes for
//! the life of the monitor: it starts out as a duplicate of the backend's
//! idle placeholder, `start` splices the live hotplug socket onto it with
//! `dup3`, and `stop` splices the placeholder back. A reactor can register
//! the descriptor once and forget about start/stop.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use rustix::io::{dup3, fcntl_dupfd_cloexec, DupFlags};

use crate::{
    collections::{hash_str, GrowArray, HTable},
    device::{DeviceEvent, RawDevice},
    error::{Error, Result},
    filter::DeviceFilter,
    tracing::prelude::*,
    transport::{BackendEvent, DeviceBackend},
};

/// Callback invoked for every effective change of the index.
pub type DeviceCallback<'a> = dyn FnMut(&Arc<RawDevice>, DeviceEvent) -> Result<()> + 'a;

/// Devices currently known, keyed by backend key.
pub struct DeviceIndex {
    filter: DeviceFilter,
    devices: HTable<Arc<RawDevice>>,
}

impl DeviceIndex {
    pub fn new(filter: DeviceFilter, buckets: usize) -> Result<Self> {
        Ok(Self {
            filter,
            devices: HTable::new(buckets)?,
        })
    }

    pub fn filter(&self) -> &DeviceFilter {
        &self.filter
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Index `dev` and report it, unless the filter rejects it or the same
    /// interface is already indexed.
    pub fn add(&mut self, dev: RawDevice, f: &mut DeviceCallback<'_>) -> Result<()> {
        if !self.filter.matches(&dev) {
            trace!(device = %dev, "Device rejected by filter.");
            return Ok(());
        }

        let hash = hash_str(&dev.key);
        let duplicate = self
            .devices
            .get_head(hash)
            .any(|(_, known)| {
                known.key == dev.key && known.interface_number == dev.interface_number
            });
        if duplicate {
            trace!(device = %dev, "Device already indexed.");
            return Ok(());
        }

        let dev = Arc::new(dev);
        self.devices.add(hash, Arc::clone(&dev));
        debug!(device = %dev, location = %dev.location, "Device added.");

        f(&dev, DeviceEvent::Added)
    }

    /// Drop every device indexed under `key` and report each removal.
    ///
    /// All matching devices leave the index before the first callback runs,
    /// and every one of them is reported even if a callback fails; the first
    /// error is returned.
    pub fn remove(&mut self, key: &str, f: &mut DeviceCallback<'_>) -> Result<()> {
        let hash = hash_str(key);
        let ids: Vec<_> = self
            .devices
            .get_head(hash)
            .filter(|(_, dev)| dev.key == key)
            .map(|(id, _)| id)
            .collect();

        let mut removed = GrowArray::new();
        for id in ids {
            if let Some(dev) = self.devices.remove(id) {
                dev.mark_disconnected();
                debug!(device = %dev, "Device removed.");
                removed.push(dev)?;
            }
        }

        let mut result = Ok(());
        for dev in &removed {
            if let Err(e) = f(dev, DeviceEvent::Removed) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Snapshot of the indexed devices.
    pub fn snapshot(&self) -> Result<GrowArray<Arc<RawDevice>>> {
        let mut devices = GrowArray::new();
        for (_, dev) in self.devices.iter() {
            devices.push(Arc::clone(dev))?;
        }
        Ok(devices)
    }

    /// Empty the index, marking every device disconnected.
    pub fn clear(&mut self) -> Result<GrowArray<Arc<RawDevice>>> {
        let devices = self.snapshot()?;
        for dev in &devices {
            dev.mark_disconnected();
        }
        self.devices.clear();
        Ok(devices)
    }
}

/// Raw device monitor built on a [`DeviceBackend`].
pub struct DeviceMonitor<B> {
    backend: B,
    index: DeviceIndex,
    fd: OwnedFd,
    started: bool,
}

impl<B: DeviceBackend> DeviceMonitor<B> {
    pub fn new(backend: B, filter: DeviceFilter, buckets: usize) -> Result<Self> {
        let index = DeviceIndex::new(filter, buckets)?;
        let fd = fcntl_dupfd_cloexec(backend.placeholder(), 0)
            .map_err(Error::errno("fcntl(F_DUPFD_CLOEXEC)"))?;

        Ok(Self {
            backend,
            index,
            fd,
            started: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn filter(&self) -> &DeviceFilter {
        self.index.filter()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Descriptor to register with a reactor. Readable whenever `refresh`
    /// has work to do; never readable while stopped.
    pub fn descriptor(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Subscribe to hotplug events and seed the index from a full
    /// enumeration, reporting each present device through `f`.
    ///
    /// The subscription opens before enumerating, so a device plugged in
    /// meanwhile shows up in at least one of the two. On failure the monitor
    /// is left stopped with an empty index.
    pub fn start(&mut self, f: &mut DeviceCallback<'_>) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.backend.start(self.index.filter())?;

        let Self { backend, index, .. } = self;
        let filter = index.filter().clone();
        let seeded = backend.enumerate(&filter, &mut |dev| index.add(dev, f));
        if let Err(e) = seeded {
            warn!(error = %e, "Initial enumeration failed.");
            self.backend.stop();
            self.index.devices.clear();
            return Err(e);
        }

        if let Err(e) = self.splice_live() {
            self.backend.stop();
            self.index.clear()?;
            return Err(e);
        }
        self.started = true;
        debug!(devices = self.index.len(), "Device monitor started.");
        Ok(())
    }

    fn splice_live(&mut self) -> Result<()> {
        let Some(live) = self.backend.live_descriptor() else {
            return Err(Error::NotFound("backend has no live descriptor".into()));
        };
        dup3(live, &mut self.fd, DupFlags::CLOEXEC).map_err(Error::errno("dup3"))
    }

    /// Point the descriptor back at the idle placeholder, close the hotplug
    /// subscription, and report every indexed device as removed.
    pub fn stop(&mut self, f: &mut DeviceCallback<'_>) {
        if !self.started {
            return;
        }

        if let Err(e) = dup3(self.backend.placeholder(), &mut self.fd, DupFlags::CLOEXEC) {
            // dup3 onto a descriptor we own cannot really fail; if it does,
            // the old socket stays behind the descriptor until drop.
            error!(error = %e, "Failed to restore placeholder descriptor.");
        }
        self.backend.stop();
        self.started = false;

        let devices = match self.index.clear() {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "Failed to snapshot devices on stop.");
                return;
            }
        };
        for dev in &devices {
            if let Err(e) = f(dev, DeviceEvent::Removed) {
                warn!(device = %dev, error = %e, "Removal callback failed during stop.");
            }
        }
        debug!("Device monitor stopped.");
    }

    /// Apply pending hotplug events to the index.
    ///
    /// Each event updates the index before `f` sees it. An error from `f`
    /// stops the drain; remaining events are delivered on the next call.
    pub fn refresh(&mut self, f: &mut DeviceCallback<'_>) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let Self { backend, index, .. } = self;
        backend.poll_events(&mut |event| match event {
            BackendEvent::Add(dev) => index.add(dev, f),
            BackendEvent::Remove { key } => index.remove(&key, f),
        })
    }

    /// Replay the current index as [`DeviceEvent::Added`] events.
    pub fn list(&self, f: &mut DeviceCallback<'_>) -> Result<()> {
        for dev in &self.index.snapshot()? {
            f(dev, DeviceEvent::Added)?;
        }
        Ok(())
    }

    /// Snapshot of the indexed devices.
    pub fn devices(&self) -> Result<Vec<Arc<RawDevice>>> {
        Ok(self.index.snapshot()?.iter().cloned().collect())
    }
}
