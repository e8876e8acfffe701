//! Opaque handles and the generation-tagged slab behind them.
//!
//! A handle packs a slot index (low 32 bits) with the slot's generation (high
//! 32 bits). Generations start at 1, so the all-zero value is the one invalid
//! sentinel shared by every handle kind. Destroying an object bumps its
//! slot's generation, so a stale handle can never alias the next occupant.

use crate::error::{ObjectKind, TmError, TmResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const FIRST_GENERATION: u32 = 1;
const NO_FREE_SLOT: u32 = u32::MAX;

/// Untyped 64-bit handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    pub const fn from_u64(raw: u64) -> Self {
        Handle(raw)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}v{}", self.index(), self.generation())
        } else {
            write!(f, "#invalid")
        }
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident => $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(Handle);

        impl $name {
            pub const INVALID: $name = $name(Handle::INVALID);
            pub const KIND: ObjectKind = $kind;

            pub const fn from_u64(raw: u64) -> Self {
                $name(Handle::from_u64(raw))
            }

            /// Id of the first object ever placed in slot `index`.
            pub const fn from_index(index: u32) -> Self {
                $name(Handle::from_parts(index, FIRST_GENERATION))
            }

            pub const fn to_u64(self) -> u64 {
                self.0.to_u64()
            }

            pub const fn index(self) -> u32 {
                self.0.index()
            }

            pub const fn is_valid(self) -> bool {
                self.0.is_valid()
            }

            pub(crate) const fn handle(self) -> Handle {
                self.0
            }
        }

        impl From<Handle> for $name {
            fn from(handle: Handle) -> Self {
                $name(handle)
            }
        }

        impl From<$name> for Handle {
            fn from(id: $name) -> Handle {
                id.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0.to_u64())
            }
        }
    };
}

typed_handle!(
    /// Handle of a leaf queue inside one TM system.
    TmQueueId => ObjectKind::Queue
);
typed_handle!(
    /// Handle of an internal scheduling node inside one TM system.
    TmNodeId => ObjectKind::Node
);
typed_handle!(ShaperId => ObjectKind::ShaperProfile);
typed_handle!(WredId => ObjectKind::WredProfile);
typed_handle!(SchedId => ObjectKind::SchedProfile);
typed_handle!(ThresholdId => ObjectKind::ThresholdProfile);
typed_handle!(
    /// Handle of one FIFO inside a packet queue pool.
    PktQueueId => ObjectKind::PktQueue
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
    next_free: u32,
}

/// Generation-tagged arena with a free list of vacated slots.
#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    len: u32,
    max: u32,
    kind: ObjectKind,
}

impl<T> Slab<T> {
    /// Create an arena that never holds more than `max` live values.
    ///
    /// Nothing is allocated up front; slots are pushed on first use.
    pub fn new(kind: ObjectKind, max: u32) -> Self {
        Self {
            slots: Vec::new(),
            free_head: NO_FREE_SLOT,
            len: 0,
            max,
            kind,
        }
    }

    pub fn insert(&mut self, value: T) -> TmResult<Handle> {
        if self.len >= self.max {
            return Err(TmError::CapacityExceeded {
                kind: self.kind,
                max: self.max as u64,
            });
        }

        let index = if self.free_head != NO_FREE_SLOT {
            let index = self.free_head;
            let slot = &mut self.slots[index as usize];
            self.free_head = slot.next_free;
            slot.next_free = NO_FREE_SLOT;
            slot.value = Some(value);
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: FIRST_GENERATION,
                value: Some(value),
                next_free: NO_FREE_SLOT,
            });
            index
        };

        self.len += 1;
        Ok(Handle::from_parts(index, self.slots[index as usize].generation))
    }

    fn slot_for(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation() && slot.value.is_some())
    }

    fn invalid(&self, handle: Handle) -> TmError {
        TmError::InvalidHandle {
            kind: self.kind,
            id: handle.to_u64(),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        handle.is_valid() && self.slot_for(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> TmResult<&T> {
        self.slot_for(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| self.invalid(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> TmResult<&mut T> {
        let err = self.invalid(handle);
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or(err)
    }

    /// Remove the value and retire the handle.
    pub fn remove(&mut self, handle: Handle) -> TmResult<T> {
        if !self.contains(handle) {
            return Err(self.invalid(handle));
        }
        let index = handle.index();
        let slot = &mut self.slots[index as usize];
        let value = slot.value.take().expect("slot checked occupied above");
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => FIRST_GENERATION,
            next => next,
        };
        slot.next_free = self.free_head;
        self.free_head = index;
        self.len -= 1;
        Ok(value)
    }

    /// True when `index` is below the declared maximum but no value was ever
    /// placed in that slot.
    pub fn is_untouched_index(&self, index: u32) -> bool {
        index < self.max && index as usize >= self.slots.len()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::from_parts(index as u32, slot.generation), value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (Handle::from_parts(index as u32, generation), value))
        })
    }
}
