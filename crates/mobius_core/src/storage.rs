//! Flat storage layout for parameter, input and result values.
//!
//! Entities sharing the exact same ordered list of index sets form a storage unit. Within a
//! unit, values are laid out row-major over the index sets with the entity as the fastest
//! varying position:
//!
//! `unit_offset + ((i0 * c1 + i1) * c2 + i2) * handles_in_unit + location_in_unit`

use crate::error::MobiusError;
use crate::handles::{EntityHandle, Index, IndexSetId, Registry};
use crate::model::IndexSetSpec;
use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageUnit<H> {
    pub index_sets: Vec<IndexSetId>,
    pub handles: Vec<H>,
}

/// Partitions entities into units keyed by their ordered index set list, in order of first
/// appearance.
pub fn units_by_index_sets<H, I>(entities: I) -> Vec<StorageUnit<H>>
where
    H: EntityHandle,
    I: IntoIterator<Item = (H, Vec<IndexSetId>)>,
{
    let mut units: IndexMap<Vec<IndexSetId>, Vec<H>> = IndexMap::new();
    for (handle, sets) in entities {
        units.entry(sets).or_default().push(handle);
    }
    units
        .into_iter()
        .map(|(index_sets, handles)| StorageUnit {
            index_sets,
            handles,
        })
        .collect()
}

/// Why an index tuple could not be mapped to an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFault {
    OutOfBounds {
        index_set: IndexSetId,
        index: u32,
        count: u32,
    },
    WrongIndexSet {
        got: IndexSetId,
        expected: IndexSetId,
    },
    IndexCount {
        given: usize,
        expected: usize,
    },
}

impl IndexFault {
    pub fn into_error(
        self,
        index_sets: &Registry<IndexSetId, IndexSetSpec>,
        kind: &'static str,
        entity: &str,
    ) -> anyhow::Error {
        match self {
            IndexFault::OutOfBounds {
                index_set,
                index,
                count,
            } => MobiusError::IndexOutOfBounds {
                index_set: index_sets.name(index_set).to_string(),
                index,
                count,
                kind,
                entity: entity.to_string(),
            }
            .into(),
            IndexFault::WrongIndexSet { got, expected } => MobiusError::WrongIndexSet {
                got: index_sets.name(got).to_string(),
                expected: index_sets.name(expected).to_string(),
                kind,
                entity: entity.to_string(),
            }
            .into(),
            IndexFault::IndexCount { given, expected } => anyhow::anyhow!(
                "Got {} indexes for the {} \"{}\", which depends on {} index sets.",
                given,
                kind,
                entity,
                expected
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageStructure<H> {
    units: Vec<StorageUnit<H>>,
    unit_of: Vec<Option<usize>>,
    location_in_unit: Vec<usize>,
    unit_offsets: Vec<usize>,
    /// Indexed by index set handle value.
    index_counts: Vec<u32>,
    total_count: usize,
}

impl<H: EntityHandle> Default for StorageStructure<H> {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            unit_of: Vec::new(),
            location_in_unit: Vec::new(),
            unit_offsets: Vec::new(),
            index_counts: Vec::new(),
            total_count: 0,
        }
    }
}

impl<H: EntityHandle> StorageStructure<H> {
    /// `index_counts` is indexed by index set handle value; `slot_count` is the size of the
    /// handle space of `H`.
    pub fn build(units: Vec<StorageUnit<H>>, index_counts: &[u32], slot_count: usize) -> Self {
        let mut unit_of = vec![None; slot_count];
        let mut location_in_unit = vec![0; slot_count];
        let mut unit_offsets = Vec::with_capacity(units.len());
        let mut offset = 0;
        for (unit_index, unit) in units.iter().enumerate() {
            for (location, handle) in unit.handles.iter().enumerate() {
                unit_of[handle.value()] = Some(unit_index);
                location_in_unit[handle.value()] = location;
            }
            unit_offsets.push(offset);
            let instances: usize = unit
                .index_sets
                .iter()
                .map(|set| index_counts[set.index()] as usize)
                .product();
            offset += instances * unit.handles.len();
        }
        Self {
            units,
            unit_of,
            location_in_unit,
            unit_offsets,
            index_counts: index_counts.to_vec(),
            total_count: offset,
        }
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn units(&self) -> &[StorageUnit<H>] {
        &self.units
    }

    pub fn unit_of(&self, handle: H) -> Option<usize> {
        self.unit_of.get(handle.value()).copied().flatten()
    }

    pub fn location_in_unit(&self, handle: H) -> usize {
        self.location_in_unit[handle.value()]
    }

    pub fn unit_offset(&self, unit: usize) -> usize {
        self.unit_offsets[unit]
    }

    pub fn index_count(&self, index_set: IndexSetId) -> u32 {
        self.index_counts[index_set.index()]
    }

    /// Index sets of the unit holding `handle`.
    pub fn index_sets_of(&self, handle: H) -> &[IndexSetId] {
        match self.unit_of(handle) {
            Some(unit) => &self.units[unit].index_sets,
            None => &[],
        }
    }

    pub fn instance_count(&self, unit: usize) -> usize {
        self.units[unit]
            .index_sets
            .iter()
            .map(|set| self.index_counts[set.index()] as usize)
            .product()
    }

    /// The index tuple of instance number `instance` of `unit` (row-major order).
    pub fn instance_indexes(&self, unit: usize, instance: usize) -> Vec<Index> {
        let sets = &self.units[unit].index_sets;
        let mut indexes = vec![Index::new(IndexSetId::from_value(0), 0); sets.len()];
        let mut rest = instance;
        for (level, set) in sets.iter().enumerate().rev() {
            let count = self.index_counts[set.index()] as usize;
            indexes[level] = Index::new(*set, (rest % count) as u32);
            rest /= count;
        }
        indexes
    }

    fn parts(&self, handle: H) -> (usize, usize, usize) {
        let unit = self.unit_of(handle);
        debug_assert!(
            unit.is_some(),
            "handle {} has no storage unit",
            handle.value()
        );
        let unit = unit.unwrap_or(0);
        (
            self.unit_offsets.get(unit).copied().unwrap_or(0),
            self.units.get(unit).map(|u| u.handles.len()).unwrap_or(0),
            self.location_in_unit[handle.value()],
        )
    }

    fn check(&self, set: IndexSetId, index: u32) -> Result<(), IndexFault> {
        let count = self.index_counts[set.index()];
        if index >= count {
            return Err(IndexFault::OutOfBounds {
                index_set: set,
                index,
                count,
            });
        }
        Ok(())
    }

    /// Offset using the current index of every index set. `current` is indexed by index set
    /// handle value.
    pub fn offset(&self, handle: H, current: &[u32]) -> usize {
        let (unit_offset, handles_in_unit, location) = self.parts(handle);
        let mut instance = 0;
        for set in self.index_sets_of(handle) {
            instance = instance * self.index_counts[set.index()] as usize
                + current[set.index()] as usize;
        }
        unit_offset + instance * handles_in_unit + location
    }

    /// Like [`offset`](Self::offset), but the last `overrides.len()` index sets take their
    /// indexes from `overrides`.
    pub fn offset_with_overrides(
        &self,
        handle: H,
        current: &[u32],
        overrides: &[Index],
        check_bounds: bool,
    ) -> Result<usize, IndexFault> {
        let (unit_offset, handles_in_unit, location) = self.parts(handle);
        let sets = self.index_sets_of(handle);
        if overrides.len() > sets.len() {
            return Err(IndexFault::IndexCount {
                given: overrides.len(),
                expected: sets.len(),
            });
        }
        let first_override = sets.len() - overrides.len();
        let mut instance = 0;
        for (level, set) in sets.iter().enumerate() {
            let index = if level < first_override {
                current[set.index()]
            } else {
                let explicit = overrides[level - first_override];
                if check_bounds && explicit.index_set != *set {
                    return Err(IndexFault::WrongIndexSet {
                        got: explicit.index_set,
                        expected: *set,
                    });
                }
                explicit.value
            };
            if check_bounds {
                self.check(*set, index)?;
            }
            instance = instance * self.index_counts[set.index()] as usize + index as usize;
        }
        Ok(unit_offset + instance * handles_in_unit + location)
    }

    /// Offset for a full positional index tuple, always bounds checked.
    pub fn offset_for_indexes(&self, handle: H, indexes: &[u32]) -> Result<usize, IndexFault> {
        let (unit_offset, handles_in_unit, location) = self.parts(handle);
        let sets = self.index_sets_of(handle);
        if indexes.len() != sets.len() {
            return Err(IndexFault::IndexCount {
                given: indexes.len(),
                expected: sets.len(),
            });
        }
        let mut instance = 0;
        for (set, index) in sets.iter().zip(indexes) {
            self.check(*set, *index)?;
            instance = instance * self.index_counts[set.index()] as usize + *index as usize;
        }
        Ok(unit_offset + instance * handles_in_unit + location)
    }

    /// Offset of the first instance along `skip` (its index taken as 0) and the stride
    /// between consecutive indexes of `skip`.
    pub fn offset_skipping(&self, handle: H, current: &[u32], skip: IndexSetId) -> (usize, usize) {
        let (unit_offset, handles_in_unit, location) = self.parts(handle);
        let mut instance = 0;
        let mut stride = 1;
        let mut skipped = false;
        for set in self.index_sets_of(handle) {
            let count = self.index_counts[set.index()] as usize;
            if skipped {
                stride *= count;
            }
            let index = if *set == skip {
                skipped = true;
                0
            } else {
                current[set.index()] as usize
            };
            instance = instance * count + index;
        }
        if !skipped {
            stride = 0;
        }
        (
            unit_offset + instance * handles_in_unit + location,
            stride * handles_in_unit,
        )
    }

    /// Every offset holding a value of `handle`, in row-major instance order.
    pub fn offsets_of(&self, handle: H) -> impl Iterator<Item = usize> + '_ {
        let (unit_offset, handles_in_unit, location) = self.parts(handle);
        let instances = self.unit_of(handle).map_or(0, |unit| self.instance_count(unit));
        (0..instances).map(move |instance| unit_offset + instance * handles_in_unit + location)
    }
}
