//! Protein variant table: records keyed by
//! `(protein accession id << 16) | first position` on 5 bytes.

use crate::engine::tasks::WorkerPools;
use crate::engine::Record;
use crate::ids::{IdentifierBag, IdentifierKind};
use crate::tables::{ChangedIds, VariantRecord, VariantTable};
use crate::variant::{ProteinVariantRecord, VariantSeen};
use crate::Error;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

impl VariantRecord for ProteinVariantRecord {
    const ID_KIND: IdentifierKind = IdentifierKind::Pa;

    fn bag(&self) -> &IdentifierBag {
        &self.identifiers
    }

    fn bag_mut(&mut self) -> &mut IdentifierBag {
        &mut self.identifiers
    }

    fn same_definition(&self, other: &Self) -> bool {
        self.definition == other.definition
    }

    fn definition_cmp(&self, other: &Self) -> Ordering {
        self.definition.cmp(&other.definition)
    }

    fn seen(&self) -> VariantSeen {
        VariantSeen::Protein(self.definition.clone())
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    fn first_region_end(&self) -> u64 {
        self.key() + u64::from(self.definition.modifications()[0].length_before)
    }
}

pub struct ProteinTable {
    inner: VariantTable<ProteinVariantRecord>,
}

impl ProteinTable {
    pub fn open(
        dir: &Path,
        pools: Arc<WorkerPools>,
        cache_megabytes: u64,
        next_free_id: Arc<AtomicU32>,
    ) -> Result<ProteinTable, Error> {
        let inner = VariantTable::open(&dir.join("protein"), pools, cache_megabytes, next_free_id)?;
        tracing::info!(
            records = inner.db().record_count()?,
            largest_key = inner.db().largest_key()?,
            "protein table open"
        );
        Ok(ProteinTable { inner })
    }

    pub fn query(
        &self,
        visitor: &mut dyn FnMut(Vec<ProteinVariantRecord>, bool) -> Result<bool, Error>,
        records_to_skip: &mut u64,
        first: u64,
        last: u64,
        min_chunk: usize,
    ) -> Result<(), Error> {
        self.inner.query(visitor, records_to_skip, first, last, min_chunk)
    }

    pub fn fetch(&self, records: Vec<ProteinVariantRecord>) -> Result<Vec<ProteinVariantRecord>, Error> {
        self.inner.fetch(records)
    }

    pub fn fetch_and_add(
        &self,
        records: Vec<ProteinVariantRecord>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<ProteinVariantRecord>, Error> {
        self.inner.fetch_and_add(records, changes)
    }

    pub fn fetch_and_delete(
        &self,
        records: Vec<ProteinVariantRecord>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<ProteinVariantRecord>, Error> {
        self.inner.fetch_and_delete(records, changes)
    }

    pub fn fetch_and_full_delete(
        &self,
        records: Vec<ProteinVariantRecord>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<ProteinVariantRecord>, Error> {
        self.inner.fetch_and_full_delete(records, changes)
    }

    pub fn delete_identifiers(
        &self,
        records: Vec<ProteinVariantRecord>,
        kind: IdentifierKind,
    ) -> Result<Vec<ProteinVariantRecord>, Error> {
        self.inner.delete_identifiers(records, kind)
    }

    pub fn record_count(&self) -> Result<u64, Error> {
        self.inner.db().record_count()
    }

    pub fn largest_key(&self) -> Result<u64, Error> {
        self.inner.db().largest_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{AminoAcidModification, ProteinDefinition, VariantCategory};
    use crate::NULL_ID;
    use tempfile::TempDir;

    fn substitution(protein_id: u64, position: u16, aa: u32) -> ProteinVariantRecord {
        ProteinVariantRecord::new(
            ProteinDefinition::new(
                protein_id,
                vec![AminoAcidModification {
                    position,
                    length_before: 1,
                    length_change_or_seq: 1,
                    sequence: aa,
                    category: VariantCategory::NonShiftable,
                }],
            )
            .unwrap(),
        )
    }

    fn table(dir: &TempDir) -> ProteinTable {
        let pools = WorkerPools::new(2, 1).unwrap();
        ProteinTable::open(dir.path(), pools, 8, Arc::new(AtomicU32::new(1))).unwrap()
    }

    #[test]
    fn pa_ids_come_from_the_shared_counter() {
        let tmp = TempDir::new().unwrap();
        let counter = Arc::new(AtomicU32::new(100));
        let pools = WorkerPools::new(2, 1).unwrap();
        let tab = ProteinTable::open(tmp.path(), pools, 8, counter.clone()).unwrap();

        let changes = Mutex::new(ChangedIds::default());
        let out = tab
            .fetch_and_add(vec![substitution(9, 17, 4), substitution(9, 30, 5)], &changes)
            .unwrap();
        assert!(out.iter().all(|r| r.identifiers.last_id >= 100));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 102);
        let changes = changes.into_inner().unwrap();
        assert_eq!(changes[&IdentifierKind::Pa].len(), 2);
    }

    #[test]
    fn wide_keys_separate_proteins() {
        let tmp = TempDir::new().unwrap();
        let tab = table(&tmp);
        let changes = Mutex::new(ChangedIds::default());
        // same position on two different proteins, far apart in key space
        tab.fetch_and_add(
            vec![substitution(1, 50, 2), substitution(0xabcdef, 50, 2)],
            &changes,
        )
        .unwrap();
        let fetched = tab
            .fetch(vec![substitution(1, 50, 2), substitution(0xabcdef, 50, 2)])
            .unwrap();
        assert!(fetched.iter().all(|r| r.identifiers.last_id != NULL_ID));
        assert_ne!(fetched[0].identifiers.last_id, fetched[1].identifiers.last_id);
        assert_eq!(tab.largest_key().unwrap(), (0xabcdef << 16) | 50);
    }

    #[test]
    fn stale_pa_id_clears_the_bag() {
        let tmp = TempDir::new().unwrap();
        let tab = table(&tmp);
        let changes = Mutex::new(ChangedIds::default());
        tab.fetch_and_add(vec![substitution(3, 8, 1)], &changes).unwrap();

        let mut wrong = substitution(3, 8, 1);
        wrong.identifiers.last_id = 999_999;
        let fetched = tab.fetch(vec![wrong]).unwrap();
        assert_eq!(fetched[0].identifiers.last_id, NULL_ID);
        assert!(fetched[0].identifiers.is_empty());
    }

    #[test]
    fn protein_scan_in_key_order() {
        let tmp = TempDir::new().unwrap();
        let tab = table(&tmp);
        let changes = Mutex::new(ChangedIds::default());
        let records: Vec<ProteinVariantRecord> =
            (1..6u64).map(|p| substitution(p, 10, 3)).collect();
        tab.fetch_and_add(records, &changes).unwrap();
        let mut seen = Vec::new();
        let mut skip = 0u64;
        tab.query(
            &mut |chunk, _last| {
                seen.extend(chunk.into_iter().map(|r| r.key()));
                Ok(false)
            },
            &mut skip,
            0,
            u64::MAX >> 24,
            2,
        )
        .unwrap();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
