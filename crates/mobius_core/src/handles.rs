//! Typed entity handles and the name registry that issues them.

use crate::error::MobiusError;
use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Common behaviour of the typed handle newtypes.
///
/// Handle values start at 1. The value 0 is never issued, so arrays indexed by `value()`
/// have one unused slot at the front and `slot_count()` entries in total.
pub trait EntityHandle: Copy + Eq + Ord + std::hash::Hash + std::fmt::Debug {
    const KIND: &'static str;

    fn from_value(value: u32) -> Self;

    fn value(self) -> usize;
}

macro_rules! entity_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl EntityHandle for $name {
            const KIND: &'static str = $kind;

            fn from_value(value: u32) -> Self {
                $name(value)
            }

            fn value(self) -> usize {
                self.0 as usize
            }
        }

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

entity_handle!(UnitId, "unit");
entity_handle!(IndexSetId, "index set");
entity_handle!(GroupId, "parameter group");
entity_handle!(ParameterId, "parameter");
entity_handle!(InputId, "input");
entity_handle!(
    /// Also used as the handle of result series, since every equation owns one.
    EquationId,
    "equation"
);
entity_handle!(SolverId, "solver");
entity_handle!(ConditionalId, "conditional");
entity_handle!(ModuleId, "module");

/// A position inside one index set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    pub index_set: IndexSetId,
    pub value: u32,
}

impl Index {
    pub fn new(index_set: IndexSetId, value: u32) -> Self {
        Self { index_set, value }
    }
}

/// Append-only name table for one entity kind.
#[derive(Debug, Clone)]
pub struct Registry<H: EntityHandle, S> {
    entries: IndexMap<String, S>,
    _kind: PhantomData<H>,
}

impl<H: EntityHandle, S> Default for Registry<H, S> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            _kind: PhantomData,
        }
    }
}

impl<H: EntityHandle, S> Registry<H, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, building the spec with `make` only if the name is new.
    /// Returns the handle and whether the entry was created.
    pub fn register_with(&mut self, name: &str, make: impl FnOnce() -> S) -> (H, bool) {
        if let Some(pos) = self.entries.get_index_of(name) {
            return (H::from_value(pos as u32 + 1), false);
        }
        let (pos, _) = self.entries.insert_full(name.to_string(), make());
        (H::from_value(pos as u32 + 1), true)
    }

    pub fn find(&self, name: &str) -> Option<H> {
        self.entries
            .get_index_of(name)
            .map(|pos| H::from_value(pos as u32 + 1))
    }

    pub fn handle_of(&self, name: &str) -> Result<H> {
        self.find(name).ok_or_else(|| {
            MobiusError::UnknownEntity {
                kind: H::KIND,
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn name(&self, handle: H) -> &str {
        self.entries
            .get_index(handle.value() - 1)
            .map(|(name, _)| name.as_str())
            .unwrap_or("(invalid)")
    }

    pub fn spec(&self, handle: H) -> &S {
        &self.entries[handle.value() - 1]
    }

    pub fn spec_mut(&mut self, handle: H) -> &mut S {
        &mut self.entries[handle.value() - 1]
    }

    pub fn contains(&self, handle: H) -> bool {
        handle.value() >= 1 && handle.value() <= self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of an array indexed directly by handle value.
    pub fn slot_count(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn handles(&self) -> impl Iterator<Item = H> + '_ {
        (1..=self.entries.len()).map(|value| H::from_value(value as u32))
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &str, &S)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(pos, (name, spec))| (H::from_value(pos as u32 + 1), name.as_str(), spec))
    }
}
