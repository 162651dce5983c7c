//! Containers backing the device and board indices.

pub mod array;
pub mod htable;

pub use array::GrowArray;
pub use htable::{hash_str, HTable, NodeId};
