//! Board class registry.
//!
//! A board class recognizes the raw devices of one family of boards and says
//! what each of them can do. Classes register themselves with
//! `inventory::submit!` and are looked up here.

use crate::{board::InterfaceInfo, device::RawDevice, filter::DeviceMatch};

/// A family of boards.
pub struct BoardClass {
    pub name: &'static str,
    /// Devices this class is willing to look at
    pub pattern: DeviceMatch,
    /// Inspect a matching device; `None` if it is not one of ours after all
    pub probe: fn(&RawDevice) -> Option<InterfaceInfo>,
}

inventory::collect!(BoardClass);

/// Board class registry that uses inventory to find registered classes.
pub struct BoardClassRegistry;

impl BoardClassRegistry {
    /// Find the class that claims `device`.
    ///
    /// Classes whose pattern matches are tried from most to least specific;
    /// the first one whose probe accepts the device wins.
    pub fn identify(&self, device: &RawDevice) -> Option<(&'static BoardClass, InterfaceInfo)> {
        let mut candidates: Vec<&'static BoardClass> = inventory::iter::<BoardClass>()
            .filter(|class| class.pattern.matches(device))
            .collect();
        candidates.sort_by_key(|class| std::cmp::Reverse(class.pattern.specificity()));

        candidates
            .into_iter()
            .find_map(|class| (class.probe)(device).map(|info| (class, info)))
    }
}
