//! Logical boards and the interfaces they are made of.
//!
//! A [`Board`] is one physical unit, identified by the USB port it sits on.
//! Its [`BoardInterface`]s are the raw devices it currently exposes; they come
//! and go as the board switches between application and bootloader mode,
//! while the `Board` object itself stays the same.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};

use crate::{
    collections::GrowArray,
    device::{DeviceStatus, RawDevice},
    error::{Error, Result},
};

pub mod class;
pub mod generic;
pub mod teensy;

/// Something an interface lets you do with a board.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::EnumCount,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
    Run,
    Upload,
    Reset,
    Reboot,
    Serial,
}

/// Number of distinct capabilities, and size of the dispatch table.
pub const CAPABILITY_COUNT: usize = Capability::COUNT;

impl Capability {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Look a capability up by its name, e.g. "upload".
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn bit(self) -> Capabilities {
        Capabilities::from_bits_truncate(1 << self.index())
    }
}

bitflags! {
    /// Set of [`Capability`] values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const RUN = 1 << 0;
        const UPLOAD = 1 << 1;
        const RESET = 1 << 2;
        const REBOOT = 1 << 3;
        const SERIAL = 1 << 4;
    }
}

impl Capabilities {
    pub fn has(self, capability: Capability) -> bool {
        self.contains(capability.bit())
    }

    /// Capabilities in the set, lowest bit first.
    pub fn each(self) -> impl Iterator<Item = Capability> {
        Capability::iter().filter(move |c| self.has(*c))
    }

    pub fn names(self) -> Vec<&'static str> {
        self.each().map(Capability::name).collect()
    }
}

impl From<Capability> for Capabilities {
    fn from(capability: Capability) -> Self {
        capability.bit()
    }
}

/// Board lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BoardState {
    Running,
    Missing,
    Dropped,
}

/// Board lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BoardEvent {
    Added,
    Changed,
    Disappeared,
    Dropped,
}

/// Board model as identified by a board class.
#[derive(Debug, PartialEq, Eq)]
pub struct BoardModel {
    pub name: &'static str,
    pub mcu: &'static str,
}

/// What a board class found out about a raw device.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceInfo {
    pub name: &'static str,
    pub capabilities: Capabilities,
    pub model: Option<&'static BoardModel>,
    /// Board serial number, 0 when the interface does not expose it
    pub serial: u64,
}

#[derive(Default)]
struct OpenState {
    count: usize,
    file: Option<Arc<File>>,
}

/// One raw device adopted by a board.
pub struct BoardInterface {
    info: InterfaceInfo,
    class: &'static str,
    device: Arc<RawDevice>,
    board: Weak<Board>,
    open: Mutex<OpenState>,
}

impl BoardInterface {
    pub(crate) fn new(
        board: &Arc<Board>,
        device: Arc<RawDevice>,
        class: &'static str,
        info: InterfaceInfo,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            class,
            device,
            board: Arc::downgrade(board),
            open: Mutex::new(OpenState::default()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    /// Name of the board class that claimed this interface.
    pub fn class_name(&self) -> &'static str {
        self.class
    }

    pub fn path(&self) -> &Path {
        self.device.path()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.info.capabilities
    }

    pub fn model(&self) -> Option<&'static BoardModel> {
        self.info.model
    }

    pub fn serial(&self) -> u64 {
        self.info.serial
    }

    pub fn device(&self) -> &Arc<RawDevice> {
        &self.device
    }

    /// Owning board, unless every holder has released it.
    pub fn board(&self) -> Option<Arc<Board>> {
        self.board.upgrade()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().count
    }

    /// Open the device node, sharing the file with other open handles.
    ///
    /// The node is opened on the first call and closed when the last
    /// [`InterfaceHandle`] is dropped.
    pub fn open(self: &Arc<Self>) -> Result<InterfaceHandle> {
        let mut state = self.open.lock();

        let file = match &state.file {
            Some(file) => Arc::clone(file),
            None => {
                if self.device.status() == DeviceStatus::Disconnected {
                    return Err(Error::NotFound(format!(
                        "{} has been disconnected",
                        self.path().display()
                    )));
                }
                let file = Arc::new(open_node(self.path())?);
                state.file = Some(Arc::clone(&file));
                file
            }
        };
        state.count += 1;

        Ok(InterfaceHandle {
            iface: Arc::clone(self),
            file,
        })
    }

    fn release(&self) {
        let mut state = self.open.lock();
        state.count -= 1;
        if state.count == 0 {
            state.file = None;
        }
    }
}

impl std::fmt::Debug for BoardInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardInterface")
            .field("name", &self.info.name)
            .field("class", &self.class)
            .field("capabilities", &self.info.capabilities)
            .field("path", &self.device.path)
            .finish()
    }
}

fn open_node(path: &Path) -> Result<File> {
    use rustix::fs::OFlags;

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags((OFlags::NOCTTY | OFlags::NONBLOCK).bits() as i32)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("{} has disappeared", path.display()))
            }
            _ => Error::Io(e),
        })
}

/// An open interface. Dropping it releases the shared file.
pub struct InterfaceHandle {
    iface: Arc<BoardInterface>,
    file: Arc<File>,
}

impl InterfaceHandle {
    pub fn interface(&self) -> &Arc<BoardInterface> {
        &self.iface
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        self.iface.release();
    }
}

/// Mutable part of a board, guarded by the board mutex.
pub(crate) struct BoardInner {
    pub(crate) state: BoardState,
    pub(crate) missing_since: Option<Instant>,
    pub(crate) vid: u16,
    pub(crate) pid: u16,
    pub(crate) serial: u64,
    pub(crate) model: Option<&'static BoardModel>,
    pub(crate) description: &'static str,
    pub(crate) interfaces: GrowArray<Arc<BoardInterface>>,
    pub(crate) capabilities: Capabilities,
    pub(crate) cap2iface: [Option<Arc<BoardInterface>>; CAPABILITY_COUNT],
}

impl BoardInner {
    /// Append `iface`. Its capabilities take over the dispatch table, since
    /// the newest interface reflects the board's current mode.
    pub(crate) fn add_interface(&mut self, iface: Arc<BoardInterface>) -> Result<()> {
        self.interfaces.push(Arc::clone(&iface))?;

        for capability in iface.capabilities().each() {
            self.cap2iface[capability.index()] = Some(Arc::clone(&iface));
        }
        self.capabilities |= iface.capabilities();

        self.vid = iface.device.vid;
        self.pid = iface.device.pid;
        self.description = iface.name();
        if iface.model().is_some() {
            self.model = iface.model();
        }
        if iface.serial() != 0 {
            self.serial = iface.serial();
        }
        Ok(())
    }

    /// False if `info` belongs to another physical board: a different known
    /// model, or a different serial number where both are known.
    pub(crate) fn is_compatible(&self, info: &InterfaceInfo) -> bool {
        let model_conflict = matches!((self.model, info.model), (Some(a), Some(b)) if a != b);
        let serial_conflict = self.serial != 0 && info.serial != 0 && self.serial != info.serial;
        !model_conflict && !serial_conflict
    }

    /// Remove interfaces matching `pred` and rebuild the capability state.
    pub(crate) fn remove_interfaces(
        &mut self,
        pred: impl FnMut(&Arc<BoardInterface>) -> bool,
    ) -> Vec<Arc<BoardInterface>> {
        let removed = self.interfaces.remove_all(pred);
        if !removed.is_empty() {
            self.recompute_capabilities();
        }
        removed
    }

    pub(crate) fn recompute_capabilities(&mut self) {
        self.cap2iface = Default::default();
        self.capabilities = Capabilities::empty();

        for iface in self.interfaces.iter() {
            for capability in iface.capabilities().each() {
                self.cap2iface[capability.index()] = Some(Arc::clone(iface));
            }
            self.capabilities |= iface.capabilities();
        }
    }
}

/// Stable identity of a physical board.
pub struct Board {
    location: String,
    inner: Mutex<BoardInner>,
}

impl Board {
    pub(crate) fn new(location: &str, dev: &RawDevice) -> Arc<Self> {
        Arc::new(Self {
            location: location.to_owned(),
            inner: Mutex::new(BoardInner {
                state: BoardState::Running,
                missing_since: None,
                vid: dev.vid,
                pid: dev.pid,
                serial: 0,
                model: None,
                description: "",
                interfaces: GrowArray::new(),
                capabilities: Capabilities::empty(),
                cap2iface: Default::default(),
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner.lock()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Human identifier, "<serial>@<location>".
    pub fn tag(&self) -> String {
        format!("{}@{}", self.serial_number(), self.location)
    }

    pub fn serial_number(&self) -> u64 {
        self.inner.lock().serial
    }

    pub fn vid(&self) -> u16 {
        self.inner.lock().vid
    }

    pub fn pid(&self) -> u16 {
        self.inner.lock().pid
    }

    pub fn model(&self) -> Option<&'static BoardModel> {
        self.inner.lock().model
    }

    pub fn model_name(&self) -> &'static str {
        self.model().map_or("(unknown)", |model| model.name)
    }

    /// Name of the most recently attached interface.
    pub fn description(&self) -> &'static str {
        self.inner.lock().description
    }

    pub fn state(&self) -> BoardState {
        self.inner.lock().state
    }

    /// When the last interface went away, while the board is missing.
    pub fn missing_since(&self) -> Option<Instant> {
        self.inner.lock().missing_since
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.lock().capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().has(capability)
    }

    pub fn capability_names(&self) -> Vec<&'static str> {
        self.capabilities().names()
    }

    pub fn interfaces(&self) -> Vec<Arc<BoardInterface>> {
        self.inner.lock().interfaces.iter().cloned().collect()
    }

    /// Interface currently providing `capability`.
    pub fn interface_for(&self, capability: Capability) -> Option<Arc<BoardInterface>> {
        self.inner.lock().cap2iface[capability.index()].clone()
    }

    /// Open the interface providing `capability`, if any.
    ///
    /// The board stays locked while opening, so the interface cannot be
    /// swapped out from under the call.
    pub fn open_interface(&self, capability: Capability) -> Result<Option<InterfaceHandle>> {
        let inner = self.inner.lock();
        match &inner.cap2iface[capability.index()] {
            Some(iface) => iface.open().map(Some),
            None => Ok(None),
        }
    }

    /// Check the board against a user-supplied identifier.
    ///
    /// Accepted forms are the full tag, "<serial>", "@<location>" and
    /// "<serial>@<location>". A location also matches the device path of any
    /// interface. The empty identifier matches every board.
    pub fn matches_tag(&self, id: &str) -> bool {
        if id.is_empty() || id == self.tag() {
            return true;
        }

        let (serial, location) = match id.split_once('@') {
            Some((serial, location)) => (serial, Some(location)),
            None => (id, None),
        };

        if !serial.is_empty() {
            match serial.parse::<u64>() {
                Ok(serial) if serial == self.serial_number() => {}
                _ => return false,
            }
        }

        match location {
            Some(location) if !location.is_empty() => {
                location == self.location
                    || self
                        .interfaces()
                        .iter()
                        .any(|iface| iface.path() == Path::new(location))
            }
            _ => true,
        }
    }

    /// Serializable snapshot for logs and front-ends.
    pub fn summary(&self) -> BoardSummary {
        let inner = self.inner.lock();
        BoardSummary {
            tag: format!("{}@{}", inner.serial, self.location),
            location: self.location.clone(),
            serial_number: inner.serial,
            vid: inner.vid,
            pid: inner.pid,
            model: inner.model.map(|model| model.name),
            description: inner.description,
            state: inner.state,
            capabilities: inner.capabilities.names(),
            interfaces: inner
                .interfaces
                .iter()
                .map(|iface| InterfaceSummary {
                    name: iface.name(),
                    path: iface.path().display().to_string(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Board")
            .field("location", &self.location)
            .field("serial", &inner.serial)
            .field("state", &inner.state)
            .field("capabilities", &inner.capabilities)
            .field("interfaces", &inner.interfaces.len())
            .finish()
    }
}

/// Board snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BoardSummary {
    pub tag: String,
    pub location: String,
    pub serial_number: u64,
    pub vid: u16,
    pub pid: u16,
    pub model: Option<&'static str>,
    pub description: &'static str,
    pub state: BoardState,
    pub capabilities: Vec<&'static str>,
    pub interfaces: Vec<InterfaceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSummary {
    pub name: &'static str,
    pub path: String,
}
