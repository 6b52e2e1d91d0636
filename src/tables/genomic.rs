//! Genomic variant table: records keyed by the first modification's 32-bit
//! linear genome position.

use crate::engine::tasks::WorkerPools;
use crate::engine::Record;
use crate::ids::{IdentifierBag, IdentifierKind};
use crate::tables::{ChangedIds, VariantRecord, VariantTable};
use crate::variant::{GenomicVariantRecord, VariantSeen};
use crate::Error;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

impl VariantRecord for GenomicVariantRecord {
    const ID_KIND: IdentifierKind = IdentifierKind::Ca;

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
        VariantSeen::Genomic(self.definition.clone())
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

pub struct GenomicTable {
    inner: VariantTable<GenomicVariantRecord>,
}

impl GenomicTable {
    pub fn open(
        dir: &Path,
        pools: Arc<WorkerPools>,
        cache_megabytes: u64,
        next_free_id: Arc<AtomicU32>,
    ) -> Result<GenomicTable, Error> {
        let inner = VariantTable::open(&dir.join("genomic"), pools, cache_megabytes, next_free_id)?;
        tracing::info!(
            records = inner.db().record_count()?,
            largest_key = inner.db().largest_key()?,
            "genomic table open"
        );
        Ok(GenomicTable { inner })
    }

    pub fn query(
        &self,
        visitor: &mut dyn FnMut(Vec<GenomicVariantRecord>, bool) -> Result<bool, Error>,
        records_to_skip: &mut u64,
        first: u32,
        last: u32,
        min_chunk: usize,
    ) -> Result<(), Error> {
        self.inner.query(visitor, records_to_skip, u64::from(first), u64::from(last), min_chunk)
    }

    pub fn fetch(&self, records: Vec<GenomicVariantRecord>) -> Result<Vec<GenomicVariantRecord>, Error> {
        self.inner.fetch(records)
    }

    pub fn fetch_and_add(
        &self,
        records: Vec<GenomicVariantRecord>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<GenomicVariantRecord>, Error> {
        self.inner.fetch_and_add(records, changes)
    }

    pub fn fetch_and_delete(
        &self,
        records: Vec<GenomicVariantRecord>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<GenomicVariantRecord>, Error> {
        self.inner.fetch_and_delete(records, changes)
    }

    pub fn fetch_and_full_delete(
        &self,
        records: Vec<GenomicVariantRecord>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<GenomicVariantRecord>, Error> {
        self.inner.fetch_and_full_delete(records, changes)
    }

    pub fn delete_identifiers(
        &self,
        records: Vec<GenomicVariantRecord>,
        kind: IdentifierKind,
    ) -> Result<Vec<GenomicVariantRecord>, Error> {
        self.inner.delete_identifiers(records, kind)
    }

    pub fn record_count(&self) -> Result<u64, Error> {
        self.inner.db().record_count()
    }

    pub fn largest_key(&self) -> Result<u64, Error> {
        self.inner.db().largest_key()
    }
}
