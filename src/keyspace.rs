// Copyright 2024 The Shardplane Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Keys, key ranges and the interval map shared by the shard registry
//! and the physical shard collection.

use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound::{Excluded, Included, Unbounded},
};

use bytes::Bytes;

/// Byte-lexicographic key.
pub type Key = Bytes;

/// Exclusive upper bound of the universal key space.
pub fn max_key() -> Key {
    Bytes::from_static(&[0xff])
}

/// Half-open interval `[begin, end)` over the key space.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        let range = KeyRange {
            begin: begin.into(),
            end: end.into(),
        };
        debug_assert!(range.begin <= range.end, "inverted key range");
        range
    }

    /// The whole key space `["", 0xff)`.
    pub fn all() -> Self {
        KeyRange::new(Key::new(), max_key())
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.begin.as_ref() <= key && key < self.end.as_ref()
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let begin = self.begin.clone().max(other.begin.clone());
        let end = self.end.clone().min(other.end.clone());
        (begin < end).then(|| KeyRange { begin, end })
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.begin),
            String::from_utf8_lossy(&self.end)
        )
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An interval map covering the whole key space.
///
/// Backed by a balanced tree keyed by range begin; the entry at key `k`
/// carries the value for `[k, next boundary)`, and the last entry runs to
/// the end of the key space. Point lookup, split and range iteration are
/// all O(log n + output).
#[derive(Clone, Debug)]
pub struct RangeMap<V> {
    entries: BTreeMap<Key, V>,
}

impl<V: Clone> RangeMap<V> {
    pub fn new(initial: V) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Key::new(), initial);
        RangeMap { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn floor_key(&self, key: &[u8]) -> Key {
        self.entries
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("range map always covers the key space")
    }

    pub fn get(&self, key: &[u8]) -> &V {
        self.entries
            .range::<[u8], _>((Unbounded, Included(key)))
            .next_back()
            .map(|(_, v)| v)
            .expect("range map always covers the key space")
    }

    /// The maximal entry containing `key`.
    pub fn range_containing(&self, key: &[u8]) -> (KeyRange, &V) {
        let begin = self.floor_key(key);
        let end = self
            .entries
            .range::<[u8], _>((Excluded(begin.as_ref()), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(max_key);
        (KeyRange { begin: begin.clone(), end }, self.get(key))
    }

    /// Splits the entry covering `key` at `key`, cloning the value onto
    /// both sides. A no-op on an existing boundary.
    pub fn split_at(&mut self, key: &Key) {
        if key.is_empty() || key.as_ref() >= max_key().as_ref() {
            return;
        }
        if self.entries.contains_key(key.as_ref()) {
            return;
        }
        let value = self.get(key).clone();
        self.entries.insert(key.clone(), value);
    }

    /// Replaces everything covered by `range` with a single entry.
    pub fn insert(&mut self, range: &KeyRange, value: V) {
        if range.is_empty() {
            return;
        }
        self.split_at(&range.begin);
        self.split_at(&range.end);
        let inner: Vec<Key> = self
            .entries
            .range::<[u8], _>((Excluded(range.begin.as_ref()), Excluded(range.end.as_ref())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in inner {
            self.entries.remove(key.as_ref());
        }
        self.entries.insert(range.begin.clone(), value);
    }

    /// All maximal entries intersecting `range`, unclipped.
    pub fn intersecting(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        let mut out = Vec::new();
        if range.is_empty() {
            return out;
        }
        let start = self.floor_key(&range.begin);
        let mut iter = self
            .entries
            .range::<[u8], _>((Included(start.as_ref()), Unbounded))
            .peekable();
        while let Some((begin, value)) = iter.next() {
            if *begin >= range.end {
                break;
            }
            let end = iter
                .peek()
                .map(|(k, _)| (*k).clone())
                .unwrap_or_else(max_key);
            out.push((
                KeyRange {
                    begin: begin.clone(),
                    end,
                },
                value,
            ));
        }
        out
    }

    /// Entry ranges intersecting `range`, without the values.
    pub fn intersecting_ranges(&self, range: &KeyRange) -> Vec<KeyRange> {
        self.intersecting(range).into_iter().map(|(r, _)| r).collect()
    }

    /// Applies `f` to every entry intersecting `range`.
    pub fn update_intersecting(&mut self, range: &KeyRange, mut f: impl FnMut(&KeyRange, &mut V)) {
        let bounds = self.intersecting_ranges(range);
        for r in bounds {
            let value = self
                .entries
                .get_mut(r.begin.as_ref())
                .expect("boundary vanished during update");
            f(&r, value);
        }
    }

    /// All entries, in key order.
    pub fn iter(&self) -> RangeIter<'_, V> {
        RangeIter {
            inner: self.entries.iter().peekable(),
        }
    }
}

impl<V: Clone + PartialEq> RangeMap<V> {
    /// Merges adjacent equal-valued entries whose shared boundary lies
    /// strictly inside `range`.
    pub fn coalesce(&mut self, range: &KeyRange) {
        let inner: Vec<Key> = self
            .entries
            .range::<[u8], _>((Excluded(range.begin.as_ref()), Excluded(range.end.as_ref())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in inner {
            let equal = {
                let prev = self
                    .entries
                    .range::<[u8], _>((Unbounded, Excluded(key.as_ref())))
                    .next_back()
                    .map(|(_, v)| v);
                let cur = self.entries.get(key.as_ref());
                prev == cur
            };
            if equal {
                self.entries.remove(key.as_ref());
            }
        }
    }
}

pub struct RangeIter<'a, V> {
    inner: std::iter::Peekable<std::collections::btree_map::Iter<'a, Key, V>>,
}

impl<'a, V> Iterator for RangeIter<'a, V> {
    type Item = (KeyRange, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let (begin, value) = self.inner.next()?;
        let end = self
            .inner
            .peek()
            .map(|(k, _)| (*k).clone())
            .unwrap_or_else(max_key);
        Some((
            KeyRange {
                begin: begin.clone(),
                end,
            },
            value,
        ))
    }
}
