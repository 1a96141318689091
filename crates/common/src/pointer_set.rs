//! Unordered handle set
//!
//! A membership container with slot reuse and doubling growth. Removal leaves
//! a hole that the next insert fills, so iteration order is unspecified and
//! changes as members come and go.
//!
//! The set is not synchronized. Owners wrap it in whatever lock guards the
//! rest of their state.

/// Initial number of slots
const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct PointerSet<T> {
    slots: Vec<Option<T>>,
    count: usize,
}

impl<T> Default for PointerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PointerSet<T> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        slots.resize_with(INITIAL_CAPACITY, || None);
        Self { slots, count: 0 }
    }

    /// Add a member, doubling the slot table when every slot is taken
    pub fn insert(&mut self, item: T) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(item);
        } else {
            let old = self.slots.len();
            self.slots.resize_with(old.max(1) * 2, || None);
            self.slots[old] = Some(item);
        }
        self.count += 1;
    }

    /// Remove and return the first member matching `pred`
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(&mut pred))?;
        let item = slot.take();
        self.count -= 1;
        item
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.iter().find(|item| pred(*item))
    }

    pub fn find_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.iter_mut().find(|item| pred(&**item))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots currently allocated
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T: PartialEq> PointerSet<T> {
    /// Remove a member by identity; returns whether it was present
    pub fn remove(&mut self, item: &T) -> bool {
        self.remove_where(|member| member == item).is_some()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.iter().any(|member| member == item)
    }
}
