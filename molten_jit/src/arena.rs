//! Typed arenas.
//!
//! Traces are cyclic graphs: operations point at boxes, guards point at
//! snapshots, snapshots point back at boxes and at virtual objects. All of
//! them live in per-trace arenas indexed by integer handles, so a trace is
//! freed as a unit and no lifetime tracking is needed for the cycles.
//!
//! `Id<T>` is a phantom-typed u32 so box ids, snapshot ids and virtual ids
//! cannot be mixed up.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Typed Id
// =============================================================================

/// A type-safe handle into an `Arena<T>`.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls so Id<T> is Copy/Eq/Hash regardless of T.
impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Id<T> {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }
}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index)
    }
}

// =============================================================================
// Arena
// =============================================================================

/// A homogeneous bump arena addressed by `Id<T>`. Nothing is ever removed;
/// the owning trace drops the whole arena at once.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

// Derived `Default` would demand `T: Default`; an empty arena needs nothing.
impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    #[inline]
    pub fn new() -> Self {
        Arena { items: Vec::new() }
    }

    #[inline]
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let index = self.items.len() as u32;
        self.items.push(item);
        Id::new(index)
    }

    #[inline]
    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.as_usize())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }

    #[inline]
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.items.len() as u32).map(Id::new)
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.as_usize()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.as_usize()]
    }
}

// =============================================================================
// Secondary Map
// =============================================================================

/// Side table keyed by arena id, for per-item data computed after the arena
/// is built (the backend's slot assignment per box). Missing entries read as
/// `V::default()`.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    values: Vec<V>,
    _marker: PhantomData<K>,
}

impl<K, V: Default + Clone> SecondaryMap<K, V> {
    pub fn new() -> Self {
        SecondaryMap {
            values: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SecondaryMap {
            values: vec![V::default(); capacity],
            _marker: PhantomData,
        }
    }

    pub fn get(&self, id: Id<K>) -> Option<&V> {
        self.values.get(id.as_usize())
    }

    pub fn set(&mut self, id: Id<K>, value: V) {
        let idx = id.as_usize();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, V::default());
        }
        self.values[idx] = value;
    }
}

impl<K, V: Default + Clone> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Item(i32);

    #[test]
    fn default_is_empty_without_bounds() {
        // `Item` itself is not `Default`.
        let arena: Arena<Item> = Arena::default();
        assert!(arena.is_empty());
    }

    #[test]
    fn alloc_and_index() {
        let mut arena: Arena<Item> = Arena::new();
        let a = arena.alloc(Item(10));
        let b = arena.alloc(Item(20));

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena[a].0, 10);
        arena[b].0 = 21;
        assert_eq!(arena[b].0, 21);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn iteration_order_is_allocation_order() {
        let mut arena: Arena<Item> = Arena::new();
        for i in 0..5 {
            arena.alloc(Item(i));
        }
        let values: Vec<i32> = arena.iter().map(|(_, it)| it.0).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn secondary_map_defaults() {
        let mut arena: Arena<Item> = Arena::new();
        let a = arena.alloc(Item(0));
        let b = arena.alloc(Item(0));

        let mut map: SecondaryMap<Item, u32> = SecondaryMap::new();
        map.set(b, 7);
        assert_eq!(map.get(b), Some(&7));
        // `a` was never set; reads as missing.
        assert_eq!(map.get(a), Some(&0));
    }
}
