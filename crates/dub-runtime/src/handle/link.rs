//! Native-side back-references to handles
//!
//! An object that may be deleted outside the script runtime embeds a
//! `HandleLink`. Every handle wrapping the object registers its slot here, and
//! deleting the object natively nulls all of them before the memory goes away.

use std::cell::RefCell;
use std::mem;
use std::rc::{Rc, Weak};

use super::{Ownership, Slot};

/// Registry of handle slots pointing at one native object.
#[derive(Default)]
pub struct HandleLink {
    slots: RefCell<Vec<Weak<RefCell<Ownership>>>>,
}

impl HandleLink {
    /// Create an empty link
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, slot: &Slot) {
        let mut slots = self.slots.borrow_mut();
        slots.retain(|weak| weak.strong_count() > 0);
        slots.push(Rc::downgrade(slot));
    }

    /// Number of handles still attached
    pub fn len(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns true if no handle is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark every attached handle dead. Returns how many were still live.
    ///
    /// Owned pointers released here are dropped after all slots are updated,
    /// so the object may be freed by this call if no one else holds it.
    pub fn invalidate(&self) -> usize {
        let slots = mem::take(&mut *self.slots.borrow_mut());
        let mut released = Vec::with_capacity(slots.len());
        for slot in slots.iter().filter_map(Weak::upgrade) {
            let previous = mem::take(&mut *slot.borrow_mut());
            if !previous.is_dead() {
                released.push(previous);
            }
        }
        let count = released.len();
        drop(released);
        count
    }
}

impl Drop for HandleLink {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().drain(..).filter_map(|weak| weak.upgrade()) {
            if let Ok(mut state) = slot.try_borrow_mut() {
                *state = Ownership::Dead;
            }
        }
    }
}
