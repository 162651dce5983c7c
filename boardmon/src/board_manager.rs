//! Board lifecycle and hotplug correlation.
//!
//! The board manager folds raw device events into boards. Interfaces sharing
//! a USB location belong to the same board, so a board survives the
//! application/bootloader round trip even though every one of its raw
//! devices is replaced on the way. Each board goes through
//!
//! ```text
//! RUNNING <-> MISSING --(grace period)--> DROPPED
//! ```
//!
//! A board whose last interface disappeared is kept for a grace period
//! before being dropped; a device showing up at the same location in the
//! meantime revives the very same `Board` object.
//!
//! Time is passed in explicitly so the state machine can be driven without
//! sleeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    board::{class::BoardClassRegistry, Board, BoardEvent, BoardInterface, BoardState},
    collections::{hash_str, GrowArray, HTable},
    device::{DeviceEvent, RawDevice},
    error::Result,
    tracing::prelude::*,
};

/// Board event callback. Returning an error aborts the dispatch pass.
pub type BoardCallback = dyn FnMut(&Arc<Board>, BoardEvent) -> Result<()>;

/// Handle returned by callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Board manager that handles board lifecycle.
pub struct BoardManager {
    registry: BoardClassRegistry,
    /// Running and missing boards, in order of appearance
    boards: GrowArray<Arc<Board>>,
    /// Missing boards, oldest first
    missing: GrowArray<Arc<Board>>,
    /// Live interfaces keyed by device key
    interfaces: HTable<Arc<BoardInterface>>,
    callbacks: Vec<(CallbackId, Box<BoardCallback>)>,
    next_callback: u64,
    drop_delay: Duration,
}

impl BoardManager {
    /// Create a new board manager.
    pub fn new(drop_delay: Duration, buckets: usize) -> Result<Self> {
        Ok(Self {
            registry: BoardClassRegistry,
            boards: GrowArray::new(),
            missing: GrowArray::new(),
            interfaces: HTable::new(buckets)?,
            callbacks: Vec::new(),
            next_callback: 0,
            drop_delay,
        })
    }

    pub fn drop_delay(&self) -> Duration {
        self.drop_delay
    }

    pub fn register_callback(
        &mut self,
        f: impl FnMut(&Arc<Board>, BoardEvent) -> Result<()> + 'static,
    ) -> CallbackId {
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.callbacks.push((id, Box::new(f)));
        id
    }

    /// Unregister a callback. Unknown ids are ignored.
    pub fn deregister_callback(&mut self, id: CallbackId) {
        self.callbacks.retain(|(cb, _)| *cb != id);
    }

    /// Running and missing boards.
    pub fn boards(&self) -> &[Arc<Board>] {
        &self.boards
    }

    /// First live board matching the tag, see [`Board::matches_tag`].
    pub fn find(&self, tag: &str) -> Option<Arc<Board>> {
        self.boards.iter().find(|board| board.matches_tag(tag)).cloned()
    }

    /// Replay every running board as `Added`.
    pub fn list(&self, f: &mut dyn FnMut(&Arc<Board>, BoardEvent) -> Result<()>) -> Result<()> {
        for board in self.boards.iter() {
            if board.state() == BoardState::Running {
                f(board, BoardEvent::Added)?;
            }
        }
        Ok(())
    }

    /// Fold one raw device event into the board state.
    pub fn handle(&mut self, dev: &Arc<RawDevice>, event: DeviceEvent, now: Instant) -> Result<()> {
        match event {
            DeviceEvent::Added => self.add_interface(dev),
            DeviceEvent::Removed => self.remove_interface(dev, now),
        }
    }

    fn add_interface(&mut self, dev: &Arc<RawDevice>) -> Result<()> {
        let Some((class, info)) = self.registry.identify(dev) else {
            trace!(device = %dev, "No board class for device.");
            return Ok(());
        };

        let found = self.boards.iter().find(|b| b.location() == dev.location).cloned();

        // A different physical board at the same port retires the old one.
        let retired = found.clone().filter(|board| !board.lock().is_compatible(&info));
        if let Some(old) = &retired {
            self.retire(old);
        }
        let existing = found.filter(|_| retired.is_none());

        let (board, event) = match existing {
            Some(board) => (board, BoardEvent::Changed),
            None => {
                let board = Board::new(&dev.location, dev);
                self.boards.push(Arc::clone(&board))?;
                (board, BoardEvent::Added)
            }
        };

        let iface = BoardInterface::new(&board, Arc::clone(dev), class.name, info);
        let (replaced, revived) = {
            let mut inner = board.lock();

            // One interface per USB interface slot; a mode switch reuses
            // slots. A new vid/pid means the old mode is gone altogether, even
            // if its removals have not been seen yet.
            let replaced = if (inner.vid, inner.pid) != (dev.vid, dev.pid) {
                inner.remove_interfaces(|_| true)
            } else {
                inner.remove_interfaces(|old| {
                    old.device().interface_number == dev.interface_number
                })
            };
            inner.add_interface(Arc::clone(&iface))?;

            let revived = inner.state == BoardState::Missing;
            inner.state = BoardState::Running;
            inner.missing_since = None;
            (replaced, revived)
        };

        for old in &replaced {
            self.unindex(old);
        }
        self.interfaces.add(hash_str(&dev.key), Arc::clone(&iface));
        if revived {
            self.missing.remove_first(|b| Arc::ptr_eq(b, &board));
            debug!(board = %board.tag(), "Board is back.");
        }

        debug!(
            board = %board.tag(),
            interface = iface.name(),
            class = class.name,
            path = %dev.path.display(),
            "Interface added."
        );
        if let Some(old) = retired {
            debug!(board = %old.tag(), replacement = %board.tag(), "Board replaced.");
            self.dispatch(&old, BoardEvent::Dropped)?;
        }
        self.dispatch(&board, event)
    }

    fn remove_interface(&mut self, dev: &Arc<RawDevice>, now: Instant) -> Result<()> {
        let ids: Vec<_> = self
            .interfaces
            .get_head(hash_str(&dev.key))
            .filter(|(_, iface)| Arc::ptr_eq(iface.device(), dev))
            .map(|(id, _)| id)
            .collect();

        for id in ids {
            let Some(iface) = self.interfaces.remove(id) else {
                continue;
            };
            let Some(board) = iface.board() else {
                continue;
            };

            let event = {
                let mut inner = board.lock();
                inner.remove_interfaces(|i| Arc::ptr_eq(i, &iface));

                if inner.interfaces.is_empty() {
                    inner.state = BoardState::Missing;
                    inner.missing_since = Some(now);
                    BoardEvent::Disappeared
                } else {
                    BoardEvent::Changed
                }
            };

            debug!(board = %board.tag(), interface = iface.name(), "Interface removed.");
            if event == BoardEvent::Disappeared {
                self.missing.push(Arc::clone(&board))?;
                debug!(board = %board.tag(), "Board is missing.");
            }
            self.dispatch(&board, event)?;
        }

        Ok(())
    }

    /// Drop every missing board whose grace period has elapsed at `now`.
    pub fn drop_expired(&mut self, now: Instant) -> Result<()> {
        while let Some(board) = self.missing.first().cloned() {
            let expired = board
                .missing_since()
                .map_or(true, |since| now.saturating_duration_since(since) >= self.drop_delay);
            if !expired {
                break;
            }

            self.missing.dequeue(1);
            self.boards.remove_first(|b| Arc::ptr_eq(b, &board));
            board.lock().state = BoardState::Dropped;

            debug!(board = %board.tag(), "Board dropped.");
            self.dispatch(&board, BoardEvent::Dropped)?;
        }
        Ok(())
    }

    /// When the oldest missing board is due to be dropped.
    pub fn next_deadline(&self) -> Option<Instant> {
        let since = self.missing.first()?.missing_since()?;
        Some(since + self.drop_delay)
    }

    /// Forget every board without notifying anyone. Holders see them as
    /// dropped.
    pub fn clear(&mut self) {
        for board in self.boards.iter() {
            let mut inner = board.lock();
            inner.interfaces.clear();
            inner.recompute_capabilities();
            inner.state = BoardState::Dropped;
        }
        self.boards.clear();
        self.missing.clear();
        self.interfaces.clear();
    }

    /// Take `board` out of the manager for good, without notifying anyone.
    fn retire(&mut self, board: &Arc<Board>) {
        let stale = {
            let mut inner = board.lock();
            inner.state = BoardState::Dropped;
            inner.remove_interfaces(|_| true)
        };
        for iface in &stale {
            self.unindex(iface);
        }
        self.boards.remove_first(|b| Arc::ptr_eq(b, board));
        self.missing.remove_first(|b| Arc::ptr_eq(b, board));
    }

    fn unindex(&mut self, iface: &Arc<BoardInterface>) {
        let id = self
            .interfaces
            .get_head(hash_str(&iface.device().key))
            .find(|(_, known)| Arc::ptr_eq(known, iface))
            .map(|(id, _)| id);
        if let Some(id) = id {
            self.interfaces.remove(id);
        }
    }

    fn dispatch(&mut self, board: &Arc<Board>, event: BoardEvent) -> Result<()> {
        trace!(board = %board.tag(), %event, "Dispatching board event.");
        for (_, f) in self.callbacks.iter_mut() {
            f(board, event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Capabilities, Capability};
    use crate::transport::mock;
    use std::cell::RefCell;
    use std::rc::Rc;
    use strum::IntoEnumIterator;

    type Log = Rc<RefCell<Vec<(String, BoardEvent)>>>;

    fn manager(drop_delay: Duration) -> (BoardManager, Log) {
        let mut manager = BoardManager::new(drop_delay, 16).unwrap();
        let log: Log = Rc::default();
        let sink = Rc::clone(&log);
        manager.register_callback(move |board, event| {
            sink.borrow_mut().push((board.location().to_owned(), event));
            Ok(())
        });
        (manager, log)
    }

    fn events(log: &Log) -> Vec<BoardEvent> {
        log.borrow().iter().map(|(_, event)| *event).collect()
    }

    fn assert_capability_table(board: &Board) {
        let interfaces = board.interfaces();
        let union = interfaces
            .iter()
            .fold(Capabilities::empty(), |acc, iface| acc | iface.capabilities());
        assert_eq!(board.capabilities(), union);
        for capability in Capability::iter() {
            match board.interface_for(capability) {
                Some(iface) => {
                    assert!(iface.capabilities().has(capability));
                    assert!(interfaces.iter().any(|i| Arc::ptr_eq(i, &iface)));
                }
                None => assert!(!union.has(capability)),
            }
        }
    }

    #[test]
    fn test_second_interface_joins_board() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        let serial = Arc::new(mock::teensy_serial("usb-1-2", "12345670"));
        let seremu = Arc::new(mock::teensy_seremu("usb-1-2", "12345670"));

        manager.handle(&serial, DeviceEvent::Added, t0).unwrap();
        manager
            .handle(&seremu, DeviceEvent::Added, t0 + Duration::from_millis(200))
            .unwrap();
        manager
            .handle(&serial, DeviceEvent::Removed, t0 + Duration::from_millis(300))
            .unwrap();

        assert_eq!(
            events(&log),
            vec![BoardEvent::Added, BoardEvent::Changed, BoardEvent::Changed]
        );
        assert_eq!(manager.boards().len(), 1);

        let board = &manager.boards()[0];
        assert_eq!(board.state(), BoardState::Running);
        assert_eq!(board.interfaces().len(), 1);
        assert_eq!(board.description(), "Seremu");
        assert_eq!(board.tag(), "12345670@usb-1-2");
        assert_capability_table(board);
    }

    #[test]
    fn test_grace_period_then_drop() {
        let (mut manager, log) = manager(Duration::from_millis(250));
        let t0 = Instant::now();

        let serial = Arc::new(mock::teensy_serial("usb-1-2", "12345670"));
        manager.handle(&serial, DeviceEvent::Added, t0).unwrap();
        let board = Arc::clone(&manager.boards()[0]);

        let gone = t0 + Duration::from_millis(100);
        manager.handle(&serial, DeviceEvent::Removed, gone).unwrap();
        assert_eq!(board.state(), BoardState::Missing);
        assert_eq!(board.missing_since(), Some(gone));
        assert_eq!(board.capabilities(), Capabilities::empty());
        assert_eq!(manager.next_deadline(), Some(gone + Duration::from_millis(250)));

        manager.drop_expired(gone + Duration::from_millis(249)).unwrap();
        assert_eq!(board.state(), BoardState::Missing);
        assert_eq!(manager.boards().len(), 1);

        manager.drop_expired(gone + Duration::from_millis(250)).unwrap();
        assert_eq!(board.state(), BoardState::Dropped);
        assert!(manager.boards().is_empty());
        assert!(manager.next_deadline().is_none());
        assert_eq!(
            events(&log),
            vec![BoardEvent::Added, BoardEvent::Disappeared, BoardEvent::Dropped]
        );

        // Holders keep a usable object.
        assert_eq!(board.location(), "usb-1-2");
    }

    #[test]
    fn test_bootloader_round_trip_keeps_identity() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        let serial = Arc::new(mock::teensy_serial("usb-1-2", "12345670"));
        let boot = Arc::new(mock::teensy_bootloader("usb-1-2", "0012D687"));

        manager.handle(&serial, DeviceEvent::Added, t0).unwrap();
        let board = Arc::clone(&manager.boards()[0]);

        manager.handle(&serial, DeviceEvent::Removed, t0).unwrap();
        manager
            .handle(&boot, DeviceEvent::Added, t0 + Duration::from_millis(500))
            .unwrap();

        assert!(Arc::ptr_eq(&board, &manager.boards()[0]));
        assert_eq!(board.state(), BoardState::Running);
        assert_eq!(board.missing_since(), None);
        assert_eq!(board.pid(), mock::teensy_bootloader("x", "1").pid);
        assert_eq!(board.serial_number(), 12345670);
        assert!(board.has_capability(Capability::Upload));
        assert!(!board.has_capability(Capability::Serial));
        assert!(manager.next_deadline().is_none());
        assert_eq!(
            events(&log),
            vec![BoardEvent::Added, BoardEvent::Disappeared, BoardEvent::Changed]
        );

        // Revived boards are no longer in the drop queue.
        manager.drop_expired(t0 + Duration::from_secs(60)).unwrap();
        assert_eq!(board.state(), BoardState::Running);
    }

    #[test]
    fn test_same_slot_is_replaced() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        let serial = Arc::new(mock::teensy_serial("usb-1-2", "12345670"));
        let boot = Arc::new(mock::teensy_bootloader("usb-1-2", "0012D687"));

        manager.handle(&serial, DeviceEvent::Added, t0).unwrap();
        // Bootloader shows up before the serial removal is seen.
        manager.handle(&boot, DeviceEvent::Added, t0).unwrap();

        let board = Arc::clone(&manager.boards()[0]);
        assert_eq!(board.interfaces().len(), 1);
        assert_capability_table(&board);

        // The stale removal no longer refers to any interface.
        manager.handle(&serial, DeviceEvent::Removed, t0).unwrap();
        assert_eq!(board.state(), BoardState::Running);
        assert_eq!(events(&log), vec![BoardEvent::Added, BoardEvent::Changed]);
    }

    #[test]
    fn test_mode_switch_clears_stale_interfaces() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        let serial = Arc::new(mock::teensy_serial("usb-1-2", "12345670"));
        let seremu = Arc::new(mock::teensy_seremu("usb-1-2", "12345670"));
        let boot = Arc::new(mock::teensy_bootloader("usb-1-2", "0012D687"));

        manager.handle(&serial, DeviceEvent::Added, t0).unwrap();
        manager.handle(&seremu, DeviceEvent::Added, t0).unwrap();
        // The bootloader shows up before either removal is seen.
        manager.handle(&boot, DeviceEvent::Added, t0).unwrap();

        let board = Arc::clone(&manager.boards()[0]);
        assert_eq!(board.pid(), boot.pid);
        let names: Vec<_> = board.interfaces().iter().map(|iface| iface.name()).collect();
        assert_eq!(names, vec!["HalfKay Bootloader"]);
        assert_eq!(board.capabilities(), Capabilities::UPLOAD | Capabilities::RESET);
        assert!(board.interface_for(Capability::Serial).is_none());
        assert_capability_table(&board);

        // Late removals of the old mode no longer touch the board.
        manager.handle(&seremu, DeviceEvent::Removed, t0).unwrap();
        manager.handle(&serial, DeviceEvent::Removed, t0).unwrap();
        assert_eq!(board.state(), BoardState::Running);
        assert_eq!(board.interfaces().len(), 1);
        assert_eq!(
            events(&log),
            vec![BoardEvent::Added, BoardEvent::Changed, BoardEvent::Changed]
        );
    }

    #[test]
    fn test_other_board_on_same_port_replaces_missing_one() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        let first = Arc::new(mock::teensy_serial("usb-1-2", "1111"));
        manager.handle(&first, DeviceEvent::Added, t0).unwrap();
        let old = Arc::clone(&manager.boards()[0]);
        manager.handle(&first, DeviceEvent::Removed, t0).unwrap();
        assert_eq!(old.state(), BoardState::Missing);

        let second = Arc::new(mock::teensy_serial("usb-1-2", "2222"));
        manager
            .handle(&second, DeviceEvent::Added, t0 + Duration::from_millis(500))
            .unwrap();

        assert_eq!(old.state(), BoardState::Dropped);
        assert_eq!(old.tag(), "1111@usb-1-2");
        assert_eq!(manager.boards().len(), 1);
        let new = Arc::clone(&manager.boards()[0]);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.tag(), "2222@usb-1-2");
        assert_eq!(new.state(), BoardState::Running);
        assert!(manager.next_deadline().is_none());
        assert_eq!(
            events(&log),
            vec![
                BoardEvent::Added,
                BoardEvent::Disappeared,
                BoardEvent::Dropped,
                BoardEvent::Added
            ]
        );
    }

    #[test]
    fn test_other_board_on_same_port_replaces_running_one() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        let first = Arc::new(mock::teensy_serial("usb-1-2", "1111"));
        let second = Arc::new(mock::teensy_seremu("usb-1-2", "2222"));
        manager.handle(&first, DeviceEvent::Added, t0).unwrap();
        let old = Arc::clone(&manager.boards()[0]);
        manager.handle(&second, DeviceEvent::Added, t0).unwrap();

        assert_eq!(old.state(), BoardState::Dropped);
        assert!(old.interfaces().is_empty());
        let new = Arc::clone(&manager.boards()[0]);
        assert_eq!(new.serial_number(), 2222);
        assert_eq!(new.interfaces().len(), 1);

        // The old board's interface was unindexed with it.
        manager.handle(&first, DeviceEvent::Removed, t0).unwrap();
        assert_eq!(new.state(), BoardState::Running);
        assert_eq!(
            events(&log),
            vec![BoardEvent::Added, BoardEvent::Dropped, BoardEvent::Added]
        );
    }

    #[test]
    fn test_one_board_per_location() {
        let (mut manager, _log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();

        for (location, serial) in [("usb-1-1", "1"), ("usb-1-2", "2"), ("usb-1-1", "1"), ("usb-3-1-4", "3")] {
            let dev = Arc::new(mock::teensy_seremu(location, serial));
            manager.handle(&dev, DeviceEvent::Added, t0).unwrap();
        }
        assert_eq!(manager.boards().len(), 3);

        assert!(manager.find("2").is_some());
        assert_eq!(manager.find("@usb-3-1-4").unwrap().serial_number(), 3);
        assert!(manager.find("9").is_none());
    }

    #[test]
    fn test_unclaimed_devices_are_ignored() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let dev = Arc::new(RawDevice::new(
            crate::device::DeviceType::Hid,
            "/dev/hidraw0",
            "/devices/usb-1-5:1.0/hidraw",
            "usb-1-5",
            0x046d,
            0xc52b,
            0,
        ));

        manager.handle(&dev, DeviceEvent::Added, Instant::now()).unwrap();
        manager.handle(&dev, DeviceEvent::Removed, Instant::now()).unwrap();
        assert!(manager.boards().is_empty());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_callback_error_aborts_dispatch() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let failing = manager.register_callback(|_, _| Err(crate::Error::Callback("stop".into())));
        let late = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&late);
        manager.register_callback(move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(())
        });

        let dev = Arc::new(mock::teensy_serial("usb-1-2", "1"));
        let result = manager.handle(&dev, DeviceEvent::Added, Instant::now());
        assert!(matches!(result, Err(crate::Error::Callback(_))));
        // State is updated before dispatch.
        assert_eq!(manager.boards().len(), 1);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(*late.borrow(), 0);

        manager.deregister_callback(failing);
        manager
            .handle(&Arc::new(mock::teensy_seremu("usb-1-2", "1")), DeviceEvent::Added, Instant::now())
            .unwrap();
        assert_eq!(*late.borrow(), 1);
    }

    #[test]
    fn test_list_replays_running_boards() {
        let (mut manager, _log) = manager(Duration::from_secs(7));
        let t0 = Instant::now();
        let a = Arc::new(mock::teensy_serial("usb-1-1", "1"));
        let b = Arc::new(mock::teensy_serial("usb-1-2", "2"));
        manager.handle(&a, DeviceEvent::Added, t0).unwrap();
        manager.handle(&b, DeviceEvent::Added, t0).unwrap();
        manager.handle(&b, DeviceEvent::Removed, t0).unwrap();

        let mut seen = Vec::new();
        manager
            .list(&mut |board, event| {
                seen.push((board.location().to_owned(), event));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![("usb-1-1".to_owned(), BoardEvent::Added)]);
    }

    #[test]
    fn test_clear_is_silent() {
        let (mut manager, log) = manager(Duration::from_secs(7));
        let dev = Arc::new(mock::teensy_serial("usb-1-1", "1"));
        manager.handle(&dev, DeviceEvent::Added, Instant::now()).unwrap();
        let board = Arc::clone(&manager.boards()[0]);

        manager.clear();
        assert!(manager.boards().is_empty());
        assert_eq!(board.state(), BoardState::Dropped);
        assert!(board.interfaces().is_empty());
        assert_eq!(log.borrow().len(), 1);
    }
}
