//! Differ / Patch
//!
//! A [`Differ`] turns "old value, new value" into a patch that can be combined
//! with other patches and replayed against a different value. Fiber refs use
//! it to merge a child fiber's changes into its parent at join: the child's
//! patch is computed against the value it started with and applied to whatever
//! the parent holds by then.
//!
//! # Laws
//!
//! For every differ `d` and values `a`, `b`, `c`:
//!
//! - `d.patch(&d.diff(a, b), a) == b`
//! - `d.patch(&d.empty(), a) == a`
//! - `d.patch(&d.combine(d.diff(a, b), d.diff(b, c)), a) == c`
//!
//! # Provided differs
//!
//! | Differ | Patch | Merge behaviour |
//! |--------|-------|-----------------|
//! | [`UpdateDiffer`] | last write | child replaces parent |
//! | [`SumDiffer`] | delta | changes add up |
//! | [`HashMapDiffer`] | insert/remove ops | per-key merge |
//! | [`HashSetDiffer`] | added/removed sets | per-element merge |
//! | [`ZipDiffer`] | pair of patches | positional composition |
//! | [`ContextDiffer`](crate::context::ContextDiffer) | service ops | per-service merge |

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// A strategy for computing and applying patches to values of one type.
pub trait Differ: Send + Sync + 'static {
    /// The value type.
    type Value;
    /// The patch type.
    type Patch: Clone + Send + Sync;

    /// The patch that changes nothing.
    fn empty(&self) -> Self::Patch;

    /// The patch that turns `old` into `new`.
    fn diff(&self, old: &Self::Value, new: &Self::Value) -> Self::Patch;

    /// A patch applying `first`, then `second`.
    fn combine(&self, first: Self::Patch, second: Self::Patch) -> Self::Patch;

    /// Apply `patch` to `old`.
    fn patch(&self, patch: &Self::Patch, old: &Self::Value) -> Self::Value;

    /// Pair this differ with another one, component-wise.
    fn zip<D>(self, other: D) -> ZipDiffer<Self, D>
    where
        Self: Sized,
        D: Differ,
    {
        ZipDiffer::new(self, other)
    }
}

// ============================================================================
// Update
// ============================================================================

/// Patch of an [`UpdateDiffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePatch<V> {
    /// Leave the value alone.
    Keep,
    /// Replace the value.
    Set(V),
}

/// Replace-on-change differ: the last write wins.
#[derive(Debug)]
pub struct UpdateDiffer<V>(PhantomData<fn() -> V>);

impl<V> UpdateDiffer<V> {
    /// Create the differ.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for UpdateDiffer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for UpdateDiffer<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Differ for UpdateDiffer<V> {
    type Value = V;
    type Patch = UpdatePatch<V>;

    fn empty(&self) -> Self::Patch {
        UpdatePatch::Keep
    }

    fn diff(&self, _old: &V, new: &V) -> Self::Patch {
        UpdatePatch::Set(new.clone())
    }

    fn combine(&self, first: Self::Patch, second: Self::Patch) -> Self::Patch {
        match second {
            UpdatePatch::Keep => first,
            set => set,
        }
    }

    fn patch(&self, patch: &Self::Patch, old: &V) -> V {
        match patch {
            UpdatePatch::Keep => old.clone(),
            UpdatePatch::Set(v) => v.clone(),
        }
    }
}

// ============================================================================
// Sum
// ============================================================================

/// Additive differ: the patch is the delta, so concurrent changes add up.
///
/// Intended for signed numbers; an unsigned value that decreases cannot be
/// represented as a delta.
#[derive(Debug)]
pub struct SumDiffer<N>(PhantomData<fn() -> N>);

impl<N> SumDiffer<N> {
    /// Create the differ.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<N> Default for SumDiffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Differ for SumDiffer<N>
where
    N: Copy + Default + Add<Output = N> + Sub<Output = N> + Send + Sync + 'static,
{
    type Value = N;
    type Patch = N;

    fn empty(&self) -> N {
        N::default()
    }

    fn diff(&self, old: &N, new: &N) -> N {
        *new - *old
    }

    fn combine(&self, first: N, second: N) -> N {
        first + second
    }

    fn patch(&self, patch: &N, old: &N) -> N {
        *old + *patch
    }
}

// ============================================================================
// HashMap
// ============================================================================

/// One step of a [`HashMapDiffer`] patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOp<K, V> {
    /// Insert or overwrite a key.
    Insert(K, V),
    /// Remove a key.
    Remove(K),
}

/// Per-key differ for hash maps.
///
/// Keys the child never touched keep whatever value the parent holds.
#[derive(Debug)]
pub struct HashMapDiffer<K, V>(PhantomData<fn() -> (K, V)>);

impl<K, V> HashMapDiffer<K, V> {
    /// Create the differ.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K, V> Default for HashMapDiffer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Differ for HashMapDiffer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: PartialEq + Clone + Send + Sync + 'static,
{
    type Value = HashMap<K, V>;
    type Patch = Vec<MapOp<K, V>>;

    fn empty(&self) -> Self::Patch {
        Vec::new()
    }

    fn diff(&self, old: &HashMap<K, V>, new: &HashMap<K, V>) -> Self::Patch {
        let mut ops = Vec::new();
        for (k, v) in new {
            if old.get(k) != Some(v) {
                ops.push(MapOp::Insert(k.clone(), v.clone()));
            }
        }
        for k in old.keys() {
            if !new.contains_key(k) {
                ops.push(MapOp::Remove(k.clone()));
            }
        }
        ops
    }

    fn combine(&self, mut first: Self::Patch, second: Self::Patch) -> Self::Patch {
        first.extend(second);
        first
    }

    fn patch(&self, patch: &Self::Patch, old: &HashMap<K, V>) -> HashMap<K, V> {
        let mut map = old.clone();
        for op in patch {
            match op {
                MapOp::Insert(k, v) => {
                    map.insert(k.clone(), v.clone());
                }
                MapOp::Remove(k) => {
                    map.remove(k);
                }
            }
        }
        map
    }
}

// ============================================================================
// HashSet
// ============================================================================

/// Patch of a [`HashSetDiffer`]: removals are applied before additions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPatch<T: Eq + Hash> {
    /// Elements to add.
    pub added: HashSet<T>,
    /// Elements to remove.
    pub removed: HashSet<T>,
}

/// Per-element differ for hash sets.
#[derive(Debug)]
pub struct HashSetDiffer<T>(PhantomData<fn() -> T>);

impl<T> HashSetDiffer<T> {
    /// Create the differ.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for HashSetDiffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Differ for HashSetDiffer<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    type Value = HashSet<T>;
    type Patch = SetPatch<T>;

    fn empty(&self) -> Self::Patch {
        SetPatch {
            added: HashSet::new(),
            removed: HashSet::new(),
        }
    }

    fn diff(&self, old: &HashSet<T>, new: &HashSet<T>) -> Self::Patch {
        SetPatch {
            added: new.difference(old).cloned().collect(),
            removed: old.difference(new).cloned().collect(),
        }
    }

    fn combine(&self, first: Self::Patch, second: Self::Patch) -> Self::Patch {
        let mut added: HashSet<T> = first.added.difference(&second.removed).cloned().collect();
        added.extend(second.added);
        let mut removed = first.removed;
        removed.extend(second.removed);
        SetPatch { added, removed }
    }

    fn patch(&self, patch: &Self::Patch, old: &HashSet<T>) -> HashSet<T> {
        let mut set: HashSet<T> = old.difference(&patch.removed).cloned().collect();
        set.extend(patch.added.iter().cloned());
        set
    }
}

// ============================================================================
// Zip
// ============================================================================

/// Two differs applied component-wise to a pair.
#[derive(Debug, Clone, Default)]
pub struct ZipDiffer<D1, D2> {
    left: D1,
    right: D2,
}

impl<D1, D2> ZipDiffer<D1, D2> {
    /// Pair two differs.
    pub fn new(left: D1, right: D2) -> Self {
        Self { left, right }
    }
}

impl<D1: Differ, D2: Differ> Differ for ZipDiffer<D1, D2> {
    type Value = (D1::Value, D2::Value);
    type Patch = (D1::Patch, D2::Patch);

    fn empty(&self) -> Self::Patch {
        (self.left.empty(), self.right.empty())
    }

    fn diff(&self, old: &Self::Value, new: &Self::Value) -> Self::Patch {
        (self.left.diff(&old.0, &new.0), self.right.diff(&old.1, &new.1))
    }

    fn combine(&self, first: Self::Patch, second: Self::Patch) -> Self::Patch {
        (
            self.left.combine(first.0, second.0),
            self.right.combine(first.1, second.1),
        )
    }

    fn patch(&self, patch: &Self::Patch, old: &Self::Value) -> Self::Value {
        (self.left.patch(&patch.0, &old.0), self.right.patch(&patch.1, &old.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_last_write_wins() {
        let d = UpdateDiffer::<String>::new();
        let p1 = d.diff(&"a".to_string(), &"b".to_string());
        let p2 = d.diff(&"b".to_string(), &"c".to_string());
        assert_eq!(d.patch(&d.combine(p1.clone(), d.empty()), &"x".into()), "b");
        assert_eq!(d.patch(&d.combine(p1, p2), &"x".into()), "c");
    }

    #[test]
    fn test_sum_patches_add_up() {
        let d = SumDiffer::<i64>::new();
        let child_a = d.diff(&10, &11);
        let child_b = d.diff(&10, &11);
        let parent = d.patch(&child_b, &d.patch(&child_a, &10));
        assert_eq!(parent, 12);
    }

    #[test]
    fn test_hash_map_merges_per_key() {
        let d = HashMapDiffer::<&str, i32>::new();
        let base: HashMap<_, _> = [("a", 1), ("b", 2)].into_iter().collect();
        let child: HashMap<_, _> = [("a", 1), ("c", 3)].into_iter().collect();
        let patch = d.diff(&base, &child);

        let parent: HashMap<_, _> = [("a", 9), ("b", 2), ("z", 0)].into_iter().collect();
        let merged = d.patch(&patch, &parent);
        assert_eq!(merged.get("a"), Some(&9));
        assert_eq!(merged.get("b"), None);
        assert_eq!(merged.get("c"), Some(&3));
        assert_eq!(merged.get("z"), Some(&0));
    }

    #[test]
    fn test_hash_set_combine_readd_after_remove() {
        let d = HashSetDiffer::<u8>::new();
        let a: HashSet<u8> = [1, 2].into_iter().collect();
        let b: HashSet<u8> = [2].into_iter().collect();
        let c: HashSet<u8> = [1, 2, 3].into_iter().collect();
        let combined = d.combine(d.diff(&a, &b), d.diff(&b, &c));
        assert_eq!(d.patch(&combined, &a), c);
    }

    #[test]
    fn test_zip_is_component_wise() {
        let d = SumDiffer::<i64>::new().zip(UpdateDiffer::<bool>::new());
        let patch = d.diff(&(1, false), &(4, true));
        assert_eq!(d.patch(&patch, &(10, false)), (13, true));
        assert_eq!(d.patch(&d.empty(), &(10, false)), (10, false));
    }
}
