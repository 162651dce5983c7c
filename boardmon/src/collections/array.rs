//! Growable array with an explicit growth and shrink policy.
//!
//! `Vec` already grows geometrically, but it never gives memory back on its
//! own and it aborts the process when an allocation fails. Hotplug storms
//! make the interface lists and missing-board queue swing between a handful
//! and a few dozen entries, so this wrapper doubles on growth, shrinks once
//! usage falls to half the allocation, and reports allocation failure as
//! [`Error::Memory`].

use std::ops::Deref;

use crate::error::{Error, Result};

/// Smallest capacity ever allocated once the array holds something.
pub const MIN_CAPACITY: usize = 4;

/// Ordered container with amortized O(1) `push` and bounded slack.
#[derive(Debug, Clone)]
pub struct GrowArray<T> {
    values: Vec<T>,
}

impl<T> GrowArray<T> {
    /// Create an empty array. Nothing is allocated until the first push.
    pub const fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Append `value`, doubling capacity when full.
    pub fn push(&mut self, value: T) -> Result<()> {
        self.grow(1)?;
        self.values.push(value);
        Ok(())
    }

    /// Remove up to `count` values from the tail.
    ///
    /// Returns the number of values actually removed.
    pub fn pop(&mut self, count: usize) -> usize {
        let count = count.min(self.values.len());
        let len = self.values.len() - count;
        self.values.truncate(len);
        self.shrink();
        count
    }

    /// Remove up to `count` values from the head, keeping the order of the
    /// remaining values.
    ///
    /// Returns the number of values actually removed.
    pub fn dequeue(&mut self, count: usize) -> usize {
        let count = count.min(self.values.len());
        self.values.drain(..count);
        self.shrink();
        count
    }

    /// Remove the value at `index`, shifting later values down.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.values.len() {
            return None;
        }
        let value = self.values.remove(index);
        self.shrink();
        Some(value)
    }

    /// Remove the first value for which `pred` returns true.
    pub fn remove_first(&mut self, pred: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.values.iter().position(pred)?;
        self.remove(index)
    }

    /// Remove every value for which `pred` returns true, keeping the order
    /// of the others. Returns the removed values in their original order.
    pub fn remove_all(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.values.len() {
            if pred(&self.values[i]) {
                removed.push(self.values.remove(i));
            } else {
                i += 1;
            }
        }
        if !removed.is_empty() {
            self.shrink();
        }
        removed
    }

    /// Drop every value and release the allocation.
    pub fn clear(&mut self) {
        self.values = Vec::new();
    }

    /// Allocated capacity, in values.
    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    fn grow(&mut self, need: usize) -> Result<()> {
        let len = self.values.len();
        let cap = self.values.capacity();
        if len + need <= cap {
            return Ok(());
        }

        let mut new_cap = cap.max(MIN_CAPACITY);
        while new_cap < len + need {
            new_cap = new_cap.checked_mul(2).ok_or(Error::Memory)?;
        }

        self.values
            .try_reserve_exact(new_cap - len)
            .map_err(|_| Error::Memory)
    }

    fn shrink(&mut self) {
        let len = self.values.len();
        let cap = self.values.capacity();
        if cap > MIN_CAPACITY && len <= cap / 2 {
            self.values.shrink_to(len.max(MIN_CAPACITY));
        }
    }
}

impl<T> Default for GrowArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for GrowArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.values
    }
}

impl<'a, T> IntoIterator for &'a GrowArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
