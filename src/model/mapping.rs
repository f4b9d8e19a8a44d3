use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::tables::normalize_table_name;
use crate::model::BranchError;

/// A persisted `wiser_id_mappings` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub table_name: String,
    pub our_id: u64,
    pub production_id: u64,
}

/// Translates branch-local ids into production ids.
///
/// Seeded from the branch's mapping table at the start of a merge and kept in
/// sync with it while new objects are created in production. Ids that were
/// never remapped resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct IdReconciler {
    mappings: HashMap<String, HashMap<u64, u64>>,
}

impl IdReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted rows. Duplicate rows that disagree mean the
    /// mapping table is corrupt and the merge must not continue.
    pub fn from_mappings<I>(mappings: I) -> Result<Self, BranchError>
    where
        I: IntoIterator<Item = IdMapping>,
    {
        let mut reconciler = Self::new();
        for mapping in mappings {
            reconciler.record(&mapping.table_name, mapping.our_id, mapping.production_id)?;
        }
        Ok(reconciler)
    }

    pub fn lookup(&self, table: &str, our_id: u64) -> Option<u64> {
        self.mappings
            .get(&normalize_table_name(table))
            .and_then(|ids| ids.get(&our_id))
            .copied()
    }

    /// The production id for `our_id`, or `our_id` itself when it was never remapped.
    pub fn resolve(&self, table: &str, our_id: u64) -> u64 {
        self.lookup(table, our_id).unwrap_or(our_id)
    }

    /// Record a mapping. Returns `true` when it is new and still has to be persisted.
    pub fn record(
        &mut self,
        table: &str,
        our_id: u64,
        production_id: u64,
    ) -> Result<bool, BranchError> {
        let table = normalize_table_name(table);
        let ids = self.mappings.entry(table.clone()).or_default();
        match ids.get(&our_id) {
            Some(existing) if *existing == production_id => Ok(false),
            Some(existing) => Err(BranchError::MappingConflict {
                table,
                our_id,
                existing: *existing,
                attempted: production_id,
            }),
            None => {
                ids.insert(our_id, production_id);
                Ok(true)
            }
        }
    }

    /// Distinct (normalised) table names that have at least one mapping.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mappings.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pick a production id for a new row.
///
/// The same table lives independently in both databases and their
/// auto-increment counters have diverged, so the new id has to clear both.
pub fn allocate_id(production_max: u64, branch_max: u64) -> u64 {
    production_max.max(branch_max) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_ids_resolve_to_themselves() {
        let reconciler = IdReconciler::new();
        assert_eq!(reconciler.resolve("wiser_item", 42), 42);
        assert!(reconciler.is_empty());
    }

    #[test]
    fn test_mappings_are_shared_with_archive_tables() {
        let mut reconciler = IdReconciler::new();
        assert!(reconciler.record("wiser_item", 5, 105).unwrap());
        assert_eq!(reconciler.resolve("wiser_item_archive", 5), 105);
        assert_eq!(reconciler.resolve("WISER_ITEM", 5), 105);
        assert_eq!(reconciler.resolve("wiser_itemlink", 5), 5);
    }

    #[test]
    fn test_remapping_to_a_different_id_is_rejected() {
        let mut reconciler = IdReconciler::new();
        reconciler.record("wiser_entity", 1, 10).unwrap();
        assert!(!reconciler.record("wiser_entity", 1, 10).unwrap());

        let err = reconciler.record("wiser_entity", 1, 11).unwrap_err();
        assert!(matches!(
            err,
            BranchError::MappingConflict { existing: 10, attempted: 11, .. }
        ));
        assert_eq!(reconciler.resolve("wiser_entity", 1), 10);
    }

    #[test]
    fn test_from_mappings_detects_corruption() {
        let rows = vec![
            IdMapping { table_name: "wiser_item".into(), our_id: 1, production_id: 2 },
            IdMapping { table_name: "wiser_item".into(), our_id: 1, production_id: 3 },
        ];
        assert!(IdReconciler::from_mappings(rows).is_err());
    }

    #[test]
    fn test_allocate_id_clears_both_databases() {
        assert_eq!(allocate_id(10, 3), 11);
        assert_eq!(allocate_id(3, 10), 11);
        assert_eq!(allocate_id(0, 0), 1);
    }
}
