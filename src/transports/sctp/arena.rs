//! Generational slot storage for per-association records.
//!
//! Chunks and pending messages refer to destinations through a [`Handle`]
//! instead of a shared pointer. Each slot carries an explicit reference count
//! so a destination removed while chunks still point at it stays resolvable
//! until the last of them lets go.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    refs: u32,
    retired: bool,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.refs = 0;
            slot.retired = false;
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            refs: 0,
            retired: false,
            value: Some(value),
        });
        Handle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
    }

    /// Resolves a handle, including retired entries that are still referenced.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|s| s.value.as_mut())
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.slot(handle).is_some_and(|s| !s.retired)
    }

    pub fn acquire(&mut self, handle: Handle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.refs += 1;
        }
    }

    /// Drops one reference. Returns the value when this was the last reference
    /// to an entry that had already been removed.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slot_mut(handle)?;
        debug_assert!(slot.refs > 0, "arena release without acquire");
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 && slot.retired {
            let value = slot.value.take();
            self.free.push(handle.index);
            return value;
        }
        None
    }

    pub fn refs(&self, handle: Handle) -> u32 {
        self.slot(handle).map_or(0, |s| s.refs)
    }

    /// Removes an entry. If references remain the entry is only retired and is
    /// freed by the final [`Arena::release`].
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = handle.index;
        let slot = self.slot_mut(handle)?;
        if slot.refs > 0 {
            slot.retired = true;
            return None;
        }
        let value = slot.value.take();
        self.free.push(index);
        value
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            if s.retired {
                return None;
            }
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
