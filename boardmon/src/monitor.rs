//! Board monitor.
//!
//! [`Monitor`] ties a raw [`DeviceMonitor`] to a [`BoardManager`]: raw
//! events go through the device index, are folded into boards, and the
//! resulting board events reach the registered callbacks. All of it runs on
//! the caller's thread from `start`, `refresh` and `wait`.
//!
//! The monitor can be driven two ways. Either call [`Monitor::wait`], or
//! register [`Monitor::descriptor`] with an external poll loop, bound the
//! poll timeout with [`Monitor::next_timeout`] and call
//! [`Monitor::refresh`] whenever the descriptor is readable or the timeout
//! fires. Epoll-style registrations follow the descriptor number, which
//! never changes over start/stop.

use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;

use crate::{
    board::{Board, BoardEvent, BoardState, Capability},
    board_manager::{BoardManager, CallbackId},
    config::MonitorConfig,
    device::RawDevice,
    device_monitor::DeviceMonitor,
    error::{Error, Result},
    filter::DeviceFilter,
    tracing::prelude::*,
    transport::{Context, DeviceBackend, UdevBackend},
};

/// Board monitor.
pub struct Monitor<B: DeviceBackend = UdevBackend> {
    devices: DeviceMonitor<B>,
    boards: BoardManager,
}

impl Monitor<UdevBackend> {
    /// Create a udev-backed monitor with the default configuration.
    pub fn new(ctx: &Rc<Context>, filter: DeviceFilter) -> Result<Self> {
        Self::with_config(ctx, filter, &MonitorConfig::default())
    }

    pub fn with_config(
        ctx: &Rc<Context>,
        filter: DeviceFilter,
        config: &MonitorConfig,
    ) -> Result<Self> {
        Self::with_backend(UdevBackend::new(ctx), filter, config)
    }
}

impl<B: DeviceBackend> Monitor<B> {
    pub fn with_backend(backend: B, filter: DeviceFilter, config: &MonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            devices: DeviceMonitor::new(backend, filter, config.buckets)?,
            boards: BoardManager::new(config.drop_delay, config.buckets)?,
        })
    }

    pub fn is_started(&self) -> bool {
        self.devices.is_started()
    }

    /// Start listening for hotplug events and report every board already
    /// present as `Added`.
    ///
    /// On failure, including a callback error, the monitor is left stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.devices.is_started() {
            return Ok(());
        }

        let now = Instant::now();
        let boards = &mut self.boards;
        let started = self
            .devices
            .start(&mut |dev, event| boards.handle(dev, event, now));

        if let Err(e) = started {
            self.boards.clear();
            return Err(e);
        }
        info!(boards = self.boards.boards().len(), "Board monitor started.");
        Ok(())
    }

    /// Stop listening and forget every board and device, without callbacks.
    /// Boards still held elsewhere report [`BoardState::Dropped`].
    pub fn stop(&mut self) {
        if !self.devices.is_started() {
            return;
        }
        self.devices.stop(&mut |_, _| Ok(()));
        self.boards.clear();
        info!("Board monitor stopped.");
    }

    /// Stable descriptor, readable whenever [`refresh`](Self::refresh) has
    /// hotplug events to process.
    pub fn descriptor(&self) -> BorrowedFd<'_> {
        self.devices.descriptor()
    }

    pub fn register_callback(
        &mut self,
        f: impl FnMut(&Arc<Board>, BoardEvent) -> Result<()> + 'static,
    ) -> CallbackId {
        self.boards.register_callback(f)
    }

    pub fn deregister_callback(&mut self, id: CallbackId) {
        self.boards.deregister_callback(id);
    }

    /// Drop boards whose grace period elapsed, then process pending hotplug
    /// events.
    ///
    /// A callback error stops processing and is returned; the remaining
    /// events are picked up by the next call.
    pub fn refresh(&mut self) -> Result<()> {
        self.boards.drop_expired(Instant::now())?;

        let boards = &mut self.boards;
        self.devices
            .refresh(&mut |dev, event| boards.handle(dev, event, Instant::now()))
    }

    /// Process events until `until` returns true or `timeout` elapses.
    ///
    /// Returns `Ok(true)` when `until` ended the wait and `Ok(false)` on
    /// timeout. `None` waits without limit. `until` is checked once before
    /// blocking, so a zero timeout amounts to a refresh and one check.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        mut until: impl FnMut(&Self) -> Result<bool>,
    ) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            self.refresh()?;
            if until(self)? {
                return Ok(true);
            }

            let now = Instant::now();
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(now));
            if remaining == Some(Duration::ZERO) {
                return Ok(false);
            }

            let limit = match (remaining, self.next_timeout()) {
                (Some(remaining), Some(drop)) => Some(remaining.min(drop)),
                (remaining, drop) => remaining.or(drop),
            };
            poll_readable(self.descriptor(), limit)?;
        }
    }

    /// Wait until `board` offers `capability`.
    ///
    /// Returns `Ok(false)` on timeout and [`Error::NotFound`] if the board is
    /// dropped in the meantime.
    pub fn wait_for(
        &mut self,
        board: &Arc<Board>,
        capability: Capability,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.wait(timeout, |_| {
            if board.state() == BoardState::Dropped {
                return Err(Error::NotFound(format!("board {} has been dropped", board.tag())));
            }
            Ok(board.has_capability(capability))
        })
    }

    /// Replay every running board as `Added`.
    pub fn list(&self, mut f: impl FnMut(&Arc<Board>, BoardEvent) -> Result<()>) -> Result<()> {
        self.boards.list(&mut f)
    }

    /// Running and missing boards.
    pub fn boards(&self) -> &[Arc<Board>] {
        self.boards.boards()
    }

    /// First board matching `tag`, see [`Board::matches_tag`].
    pub fn find(&self, tag: &str) -> Option<Arc<Board>> {
        self.boards.find(tag)
    }

    /// Raw devices currently indexed.
    pub fn devices(&self) -> Result<Vec<Arc<RawDevice>>> {
        self.devices.devices()
    }

    /// Time until the next missing board is due to be dropped.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.boards
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn drop_delay(&self) -> Duration {
        self.boards.drop_delay()
    }
}

impl<B: DeviceBackend> Drop for Monitor<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Block until `fd` is readable or `limit` elapses. Interrupted polls count
/// as a wakeup.
fn poll_readable(fd: BorrowedFd<'_>, limit: Option<Duration>) -> Result<()> {
    let timeout = match limit {
        // Round up, or a sub-millisecond deadline would spin.
        Some(limit) => limit.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
        None => -1,
    };

    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    match poll(&mut fds, timeout) {
        Ok(_) | Err(Errno::INTR) => Ok(()),
        Err(e) => Err(Error::errno("poll")(e)),
    }
}
