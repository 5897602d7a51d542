// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Id-keyed object storage.
//!
//! Devices and devhosts reference each other only through ids. An id is
//! resolved through the owning [`Arena`]; once the object has been destroyed
//! the lookup fails with [`Error::NotFound`] instead of touching freed state.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Integer identifier of an arena-managed object.
pub trait ArenaId: Copy + Ord + fmt::Display {
    fn from_raw(raw: u64) -> Self;
    fn raw(self) -> u64;
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $crate::arena::ArenaId for $name {
            fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

pub(crate) use define_id;

/// Objects stored in creation order, addressed by ids that are never reused.
pub struct Arena<K, V> {
    kind: &'static str,
    next: u64,
    entries: BTreeMap<K, V>,
}

impl<K: ArenaId, V> Arena<K, V> {
    pub fn new(kind: &'static str) -> Self {
        Arena {
            kind,
            next: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Allocate an id and store the object built for it.
    pub fn insert_with<F>(&mut self, build: F) -> K
    where
        F: FnOnce(K) -> V,
    {
        let id = K::from_raw(self.next);
        self.next += 1;
        self.entries.insert(id, build(id));
        id
    }

    pub fn get(&self, id: K) -> Result<&V> {
        self.entries.get(&id).ok_or_else(|| self.not_found(id))
    }

    pub fn get_mut(&mut self, id: K) -> Result<&mut V> {
        let err = self.not_found(id);
        self.entries.get_mut(&id).ok_or(err)
    }

    pub fn remove(&mut self, id: K) -> Result<V> {
        let err = self.not_found(id);
        self.entries.remove(&id).ok_or(err)
    }

    pub fn contains(&self, id: K) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids in creation order.
    pub fn ids(&self) -> Vec<K> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn not_found(&self, id: K) -> Error {
        Error::NotFound(format!("{} {}", self.kind, id))
    }
}
