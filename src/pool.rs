//! Fixed-capacity arena of connection records.
//!
//! Every record is allocated up front. `acquire` and `release` only move an
//! index on or off the free stack, so connection churn never reaches the
//! allocator. Indices double as `mio` tokens.

use crate::error::{Error, Result};

/// Per-record cleanup run when a record goes back on the free stack.
pub trait Recycle {
    fn recycle(&mut self);
}

struct Slot<T> {
    value: T,
    active: bool,
}

pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T: Recycle> Pool<T> {
    pub fn new<F>(capacity: usize, mut init: F) -> Pool<T>
    where
        F: FnMut() -> T,
    {
        let slots = (0..capacity)
            .map(|_| Slot {
                value: init(),
                active: false,
            })
            .collect();
        // Lowest indices are handed out first.
        let free = (0..capacity).rev().collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Takes a record off the free stack.
    ///
    /// The pool is sized to the configured concurrency, so running dry means
    /// the caller has lost track of its records.
    pub fn acquire(&mut self) -> Result<usize> {
        let index = self.free.pop().ok_or(Error::PoolExhausted {
            capacity: self.capacity(),
        })?;
        self.slots[index].active = true;
        Ok(index)
    }

    /// Clears the record and returns it to the free stack. Releasing a record
    /// that is not active is a no-op.
    pub fn release(&mut self, index: usize) {
        match self.slots.get_mut(index) {
            Some(slot) if slot.active => {
                slot.active = false;
                slot.value.recycle();
                self.free.push(index);
            }
            _ => {}
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        match self.slots.get(index) {
            Some(slot) if slot.active => Some(&slot.value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.active => Some(&mut slot.value),
            _ => None,
        }
    }

    /// Indices of all active records.
    #[cfg(test)]
    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
            .map(|(index, _)| index)
    }
}
