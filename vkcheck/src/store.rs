// Copyright (c) 2024 the vkcheck developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Storage for the mirrored state objects.
//!
//! The layer never trusts the opaque handles it intercepts to be
//! dereferenceable; instead each native handle is mapped to a slot in an
//! arena, and the handle the rest of the crate passes around is a thin value
//! type over the slot index plus a generation counter. Resolving a handle is
//! therefore always total: a destroyed or never-created handle yields `None`,
//! never a crash.

use parking_lot::RwLock;
use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

/// A stable key addressing one state object in a [`HandleArena`].
///
/// The generation counter distinguishes a slot's current occupant from
/// earlier occupants, so handles to destroyed objects stay invalid even when
/// the slot is reused.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Handle {
            index,
            generation,
            marker: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// An arena of reference-counted state objects addressed by generation-checked
/// handles.
///
/// Lookups return shared ownership; the caller may keep using the state
/// object after the handle has been removed from the arena, which mirrors how
/// a driver keeps an object alive while in-flight work still references it.
pub struct HandleArena<T> {
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        HandleArena {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Inserts a state object and returns its handle.
    pub fn insert(&self, value: T) -> Handle<T> {
        let value = Arc::new(value);
        let mut slots = self.slots.write();

        // Reuse the first free slot, bumping its generation.
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = Some(value);
                return Handle::new(index as u32, slot.generation);
            }
        }

        let index = slots.len() as u32;
        slots.push(Slot {
            generation: 0,
            value: Some(value),
        });

        Handle::new(index, 0)
    }

    /// Resolves a handle to its state object, or `None` if the handle was
    /// never created here or the object was removed since.
    pub fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index as usize)?;

        if slot.generation != handle.generation {
            return None;
        }

        slot.value.clone()
    }

    /// Removes a state object, returning it if the handle was still live.
    pub fn remove(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(handle.index as usize)?;

        if slot.generation != handle.generation {
            return None;
        }

        slot.value.take()
    }
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        let live = slots.iter().filter(|slot| slot.value.is_some()).count();
        write!(f, "HandleArena {{ slots: {}, live: {} }}", slots.len(), live)
    }
}
