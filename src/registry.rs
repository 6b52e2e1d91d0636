//! The allele registry: the façade over tables and indexes.
//!
//! Callers speak in documents (reference-local coordinates, plain
//! sequences); this layer converts them to packed records, drives the
//! engine batches, keeps the identifier indexes aligned with the tables,
//! and rebuilds any index whose file went missing.

use crate::config::Config;
use crate::engine::tasks::WorkerPools;
use crate::engine::Record;
use crate::ids::{HgvsId, IdentifierBag, IdentifierKind, ShortId};
use crate::index::ca::CaIndex;
use crate::index::pa::PaIndex;
use crate::index::short_id::ShortIdIndex;
use crate::tables::genomic::GenomicTable;
use crate::tables::protein::ProteinTable;
use crate::tables::sequence::SequenceTable;
use crate::tables::{ChangedIds, VariantRecord};
use crate::variant::{
    AminoAcidModification, GenomicDefinition, GenomicVariantRecord, NucleotideModification,
    ProteinDefinition, ProteinVariantRecord, VariantCategory, VariantSeen, UNKNOWN_SEQUENCE,
};
use crate::alphabet::{amino_acids_to_bits, bits_to_amino_acids, bits_to_nucleotides, nucleotides_to_bits};
use crate::{Error, HashSet, NULL_ID};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Maps (reference, offset) coordinates onto the linear 32-bit key space by
/// prefix sums of the reference lengths.
pub struct ReferenceMap {
    offsets: Vec<u32>,
    lengths: Vec<u32>,
}

impl ReferenceMap {
    pub fn new(lengths: &[u32]) -> ReferenceMap {
        let mut offsets = vec![0u32; lengths.len()];
        for i in 1..lengths.len() {
            offsets[i] = offsets[i - 1] + lengths[i - 1];
        }
        ReferenceMap { offsets, lengths: lengths.to_vec() }
    }

    pub fn key(&self, reference: usize, position: u32) -> Result<u32, Error> {
        if reference >= self.offsets.len() {
            return Err(Error::AssertionFailed("reference outside the main genome"));
        }
        Ok(self.offsets[reference] + position)
    }

    pub fn coordinates(&self, key: u32) -> (usize, u32) {
        let reference = match self.offsets.binary_search(&key) {
            Ok(i) => {
                // a run of zero-length references collapses onto one offset;
                // take the last one starting here
                let mut i = i;
                while i + 1 < self.offsets.len() && self.offsets[i + 1] == key {
                    i += 1;
                }
                i
            }
            Err(i) => i - 1,
        };
        (reference, key - self.offsets[reference])
    }

    pub fn reference_count(&self) -> usize {
        self.lengths.len()
    }
}

// ------------------------------------------------------------- documents

/// One edit in caller coordinates. For repeat-unit edits
/// (duplication / shiftable deletion) `length_change` is set and
/// `inserted_sequence` empty; for the others the inserted sequence is
/// spelled out.
#[derive(Clone, Debug, PartialEq)]
pub struct DocModification {
    pub category: VariantCategory,
    pub start: u32,
    pub region_length: u16,
    pub length_change: u16,
    pub inserted_sequence: String,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct GenomicDoc {
    pub reference: usize,
    pub modifications: Vec<DocModification>,
    pub ca_id: u32,
    pub short_ids: Vec<ShortId>,
    pub hgvs_ids: Vec<HgvsId>,
    pub revision: u32,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ProteinDoc {
    pub protein_id: u64,
    pub modifications: Vec<DocModification>,
    pub pa_id: u32,
    pub short_ids: Vec<ShortId>,
    pub hgvs_ids: Vec<HgvsId>,
    pub revision: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocError {
    NotFound,
    SequenceTooLong,
    InvalidDefinition,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VariantDoc {
    Genomic(GenomicDoc),
    Protein(ProteinDoc),
    Error(DocError),
}

impl VariantDoc {
    pub fn as_genomic(&self) -> Option<&GenomicDoc> {
        match self {
            VariantDoc::Genomic(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_protein(&self) -> Option<&ProteinDoc> {
        match self {
            VariantDoc::Protein(d) => Some(d),
            _ => None,
        }
    }
}

/// The engine hands batches back sorted by key; this permutation maps the
/// sorted order back onto input order (stable, so duplicate keys keep their
/// relative positions).
fn sorted_permutation(keys: &[u64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|&i| keys[i]);
    order
}

pub struct AlleleRegistry {
    pools: Arc<WorkerPools>,
    references: ReferenceMap,
    sequences: SequenceTable,
    genomic: GenomicTable,
    protein: ProteinTable,
    ca_index: CaIndex,
    pa_index: PaIndex,
    short_indexes: BTreeMap<IdentifierKind, ShortIdIndex>,
    next_free_id: Arc<AtomicU32>,
}

impl AlleleRegistry {
    pub fn open(config: &Config) -> Result<AlleleRegistry, Error> {
        std::fs::create_dir_all(&config.database_path).map_err(|e| {
            Error::from(e)
                .with_context(format!("creating {}", config.database_path.display()))
        })?;
        let pools = WorkerPools::new(config.cpu_threads, config.io_threads)?;
        let next_free_id = Arc::new(AtomicU32::new(1));
        let dir = config.database_path.as_path();
        let caches = &config.cache_megabytes;

        let sequences = SequenceTable::open(dir, pools.clone(), caches.sequence)?;
        let genomic = GenomicTable::open(dir, pools.clone(), caches.genomic, next_free_id.clone())?;
        let protein = ProteinTable::open(dir, pools.clone(), caches.protein, next_free_id.clone())?;
        let ca_index = CaIndex::open(dir, pools.clone(), caches.id_ca)?;
        let pa_index = PaIndex::open(dir, pools.clone(), caches.id_pa)?;

        let mut short_indexes = BTreeMap::new();
        for (kind, name) in &[
            (IdentifierKind::DbSnp, "DbSnp"),
            (IdentifierKind::ClinVarAllele, "ClinVarAllele"),
            (IdentifierKind::ClinVarVariant, "ClinVarVariant"),
            (IdentifierKind::ClinVarRcv, "ClinVarRCV"),
        ] {
            short_indexes
                .insert(*kind, ShortIdIndex::open(dir, pools.clone(), name, caches.id_short)?);
        }

        // ids are never reused: seed past everything on record
        next_free_id.store(
            ca_index.max_identifier()?.max(pa_index.max_identifier()?) + 1,
            Ordering::SeqCst,
        );

        let registry = AlleleRegistry {
            pools,
            references: ReferenceMap::new(&config.reference_lengths),
            sequences,
            genomic,
            protein,
            ca_index,
            pa_index,
            short_indexes,
            next_free_id,
        };

        // an index file deleted after a crash comes back empty; rebuild it
        // from the tables, the single recovery path
        let mut to_rebuild: HashSet<IdentifierKind> = HashSet::default();
        if registry.ca_index.is_newly_created() {
            to_rebuild.insert(IdentifierKind::Ca);
        }
        if registry.pa_index.is_newly_created() {
            to_rebuild.insert(IdentifierKind::Pa);
        }
        for (kind, index) in &registry.short_indexes {
            if index.is_newly_created() {
                to_rebuild.insert(*kind);
            }
        }
        registry.rebuild_indexes(&to_rebuild)?;
        Ok(registry)
    }

    pub fn next_free_id(&self) -> u32 {
        self.next_free_id.load(Ordering::SeqCst)
    }

    pub fn references(&self) -> &ReferenceMap {
        &self.references
    }

    pub fn worker_pools(&self) -> &Arc<WorkerPools> {
        &self.pools
    }

    pub fn genomic_record_count(&self) -> Result<u64, Error> {
        self.genomic.record_count()
    }

    pub fn protein_record_count(&self) -> Result<u64, Error> {
        self.protein.record_count()
    }

    // -------------------------------------------------- doc <-> record

    fn genomic_record(
        &self,
        doc: &GenomicDoc,
        pending_sequences: &mut Vec<(usize, usize, String)>,
        doc_index: usize,
    ) -> Result<Vec<NucleotideModification>, Error> {
        let mut mods = Vec::with_capacity(doc.modifications.len());
        for (mod_index, m) in doc.modifications.iter().enumerate() {
            let category = m.category;
            let mut packed = NucleotideModification {
                position: self.references.key(doc.reference, m.start)?,
                length_before: m.region_length,
                length_change_or_seq: 0,
                sequence: 0,
                category,
            };
            match category {
                VariantCategory::Duplication | VariantCategory::ShiftableDeletion => {
                    packed.length_change_or_seq = m.length_change;
                }
                _ => {
                    if m.inserted_sequence.len() > u16::MAX as usize {
                        return Err(Error::SequenceTooLong);
                    }
                    packed.length_change_or_seq = m.inserted_sequence.len() as u16;
                    if m.inserted_sequence.len() <= 16 {
                        packed.sequence = nucleotides_to_bits(&m.inserted_sequence)?;
                    } else {
                        pending_sequences.push((doc_index, mod_index, m.inserted_sequence.clone()));
                    }
                }
            }
            mods.push(packed);
        }
        Ok(mods)
    }

    fn protein_record(&self, doc: &ProteinDoc) -> Result<ProteinVariantRecord, Error> {
        let mut mods = Vec::with_capacity(doc.modifications.len());
        for m in &doc.modifications {
            let category = m.category;
            if m.start > u32::from(u16::MAX) {
                return Err(Error::BadRecord("protein position exceeds 16 bits"));
            }
            let mut packed = AminoAcidModification {
                position: m.start as u16,
                length_before: m.region_length,
                length_change_or_seq: 0,
                sequence: 0,
                category,
            };
            match category {
                VariantCategory::Duplication | VariantCategory::ShiftableDeletion => {
                    packed.length_change_or_seq = m.length_change;
                }
                _ => {
                    if m.inserted_sequence.len() > 7 {
                        return Err(Error::SequenceTooLong);
                    }
                    packed.length_change_or_seq = m.inserted_sequence.len() as u16;
                    packed.sequence = amino_acids_to_bits(&m.inserted_sequence)?;
                }
            }
            mods.push(packed);
        }
        let definition = ProteinDefinition::new(doc.protein_id, mods)?;
        let mut record = ProteinVariantRecord::new(definition);
        record.identifiers =
            IdentifierBag::with_ids(IdentifierKind::Pa, doc.short_ids.clone(), doc.hgvs_ids.clone());
        record.identifiers.last_id = doc.pa_id;
        record.revision = doc.revision;
        Ok(record)
    }

    /// Converts active documents to records. Elements that fail conversion
    /// are replaced in `docs` with an error document and skipped; long
    /// inserted sequences are interned (or merely looked up) along the way,
    /// and definitions referencing unknown sequences are dropped.
    fn convert_to_records(
        &self,
        docs: &mut Vec<VariantDoc>,
        register_sequences: bool,
    ) -> Result<(Vec<GenomicVariantRecord>, Vec<usize>, Vec<ProteinVariantRecord>, Vec<usize>), Error>
    {
        let mut raw_genomic: Vec<(usize, Vec<NucleotideModification>)> = Vec::new();
        let mut pending: Vec<(usize, usize, String)> = Vec::new();
        let mut protein_records = Vec::new();
        let mut protein_indices = Vec::new();

        for i in 0..docs.len() {
            match &docs[i] {
                VariantDoc::Genomic(doc) => match self.genomic_record(doc, &mut pending, i) {
                    Ok(mods) => raw_genomic.push((i, mods)),
                    Err(Error::SequenceTooLong) => {
                        docs[i] = VariantDoc::Error(DocError::SequenceTooLong)
                    }
                    Err(_) => docs[i] = VariantDoc::Error(DocError::InvalidDefinition),
                },
                VariantDoc::Protein(doc) => match self.protein_record(doc) {
                    Ok(record) => {
                        protein_indices.push(i);
                        protein_records.push(record);
                    }
                    Err(Error::SequenceTooLong) => {
                        docs[i] = VariantDoc::Error(DocError::SequenceTooLong)
                    }
                    Err(_) => docs[i] = VariantDoc::Error(DocError::InvalidDefinition),
                },
                VariantDoc::Error(_) => {}
            }
        }

        // resolve the spilled sequences in one batch
        if !pending.is_empty() {
            let seqs: Vec<&str> = pending.iter().map(|(_, _, s)| s.as_str()).collect();
            let ids = if register_sequences {
                self.sequences.insert_or_get(&seqs)?
            } else {
                self.sequences.lookup(&seqs)?
            };
            for ((doc_index, mod_index, _), id) in pending.iter().zip(ids) {
                for (i, mods) in raw_genomic.iter_mut() {
                    if *i == *doc_index {
                        mods[*mod_index].sequence = id;
                    }
                }
            }
        }

        let mut genomic_records = Vec::new();
        let mut genomic_indices = Vec::new();
        for (i, mods) in raw_genomic {
            if mods.iter().any(|m| {
                m.category.carries_sequence()
                    && m.length_change_or_seq > 16
                    && m.sequence == UNKNOWN_SEQUENCE
            }) {
                docs[i] = VariantDoc::Error(DocError::NotFound);
                continue;
            }
            let doc = match &docs[i] {
                VariantDoc::Genomic(d) => d,
                _ => continue,
            };
            match GenomicDefinition::new(mods) {
                Ok(definition) => {
                    let mut record = GenomicVariantRecord::new(definition);
                    record.identifiers = IdentifierBag::with_ids(
                        IdentifierKind::Ca,
                        doc.short_ids.clone(),
                        doc.hgvs_ids.clone(),
                    );
                    record.identifiers.last_id = doc.ca_id;
                    record.revision = doc.revision;
                    genomic_indices.push(i);
                    genomic_records.push(record);
                }
                Err(_) => docs[i] = VariantDoc::Error(DocError::InvalidDefinition),
            }
        }
        Ok((genomic_records, genomic_indices, protein_records, protein_indices))
    }

    fn genomic_doc(&self, record: &GenomicVariantRecord) -> Result<GenomicDoc, Error> {
        let mut doc = GenomicDoc::default();
        let (reference, _) = self.references.coordinates(record.definition.first_position());
        doc.reference = reference;
        let mut pending: Vec<(usize, u32)> = Vec::new();
        for (i, m) in record.definition.modifications().iter().enumerate() {
            let (_, start) = self.references.coordinates(m.position);
            let mut dm = DocModification {
                category: m.category,
                start,
                region_length: m.length_before,
                length_change: 0,
                inserted_sequence: String::new(),
            };
            match m.category {
                VariantCategory::Duplication | VariantCategory::ShiftableDeletion => {
                    dm.length_change = m.length_change_or_seq;
                }
                _ => {
                    if m.length_change_or_seq <= 16 {
                        dm.inserted_sequence =
                            bits_to_nucleotides(m.sequence, m.length_change_or_seq as usize)?;
                    } else {
                        pending.push((i, m.sequence));
                    }
                }
            }
            doc.modifications.push(dm);
        }
        if !pending.is_empty() {
            let ids: Vec<u32> = pending.iter().map(|(_, id)| *id).collect();
            let resolved = self.sequences.fetch_sequences(&ids)?;
            for ((mod_index, _), seq) in pending.into_iter().zip(resolved) {
                doc.modifications[mod_index].inserted_sequence =
                    seq.ok_or(Error::BadRecord("interned sequence is missing"))?;
            }
        }
        doc.ca_id = record.identifiers.last_id;
        doc.short_ids = record.identifiers.short_ids().to_vec();
        doc.hgvs_ids = record.identifiers.hgvs_ids().to_vec();
        doc.revision = record.revision;
        Ok(doc)
    }

    fn protein_doc(&self, record: &ProteinVariantRecord) -> Result<ProteinDoc, Error> {
        let mut doc = ProteinDoc::default();
        doc.protein_id = record.definition.protein_id();
        for m in record.definition.modifications() {
            let mut dm = DocModification {
                category: m.category,
                start: u32::from(m.position),
                region_length: m.length_before,
                length_change: 0,
                inserted_sequence: String::new(),
            };
            match m.category {
                VariantCategory::Duplication | VariantCategory::ShiftableDeletion => {
                    dm.length_change = m.length_change_or_seq;
                }
                _ => {
                    dm.inserted_sequence =
                        bits_to_amino_acids(m.sequence, m.length_change_or_seq as usize)?;
                }
            }
            doc.modifications.push(dm);
        }
        doc.pa_id = record.identifiers.last_id;
        doc.short_ids = record.identifiers.short_ids().to_vec();
        doc.hgvs_ids = record.identifiers.hgvs_ids().to_vec();
        doc.revision = record.revision;
        Ok(doc)
    }

    fn write_back_genomic(docs: &mut [VariantDoc], records: &[GenomicVariantRecord], indices: &[usize]) {
        for (slot, record) in records.iter().enumerate() {
            if let VariantDoc::Genomic(doc) = &mut docs[indices[slot]] {
                doc.ca_id = record.identifiers.last_id;
                doc.short_ids = record.identifiers.short_ids().to_vec();
                doc.hgvs_ids = record.identifiers.hgvs_ids().to_vec();
                doc.revision = record.revision;
            }
        }
    }

    fn write_back_protein(docs: &mut [VariantDoc], records: &[ProteinVariantRecord], indices: &[usize]) {
        for (slot, record) in records.iter().enumerate() {
            if let VariantDoc::Protein(doc) = &mut docs[indices[slot]] {
                doc.pa_id = record.identifiers.last_id;
                doc.short_ids = record.identifiers.short_ids().to_vec();
                doc.hgvs_ids = record.identifiers.hgvs_ids().to_vec();
                doc.revision = record.revision;
            }
        }
    }

    // ------------------------------------------------------- batch verbs

    /// Fills each document's identifiers and revision from the stored
    /// record with the same definition.
    pub fn fetch_by_definition(&self, docs: &mut Vec<VariantDoc>) -> Result<(), Error> {
        let (grecs, gidx, precs, pidx) = self.convert_to_records(docs, false)?;
        let gkeys: Vec<u64> = grecs.iter().map(|r| r.key()).collect();
        let pkeys: Vec<u64> = precs.iter().map(|r| r.key()).collect();
        let grecs = self.genomic.fetch(grecs)?;
        let precs = self.protein.fetch(precs)?;
        let gidx = reorder(&gidx, &gkeys);
        let pidx = reorder(&pidx, &pkeys);
        Self::write_back_genomic(docs, &grecs, &gidx);
        Self::write_back_protein(docs, &precs, &pidx);
        Ok(())
    }

    /// Registers the documents: merges identifier bags, mints CA/PA ids for
    /// brand-new variants, and brings every identifier index up to date.
    pub fn fetch_by_definition_and_add(&self, docs: &mut Vec<VariantDoc>) -> Result<(), Error> {
        let (grecs, gidx, precs, pidx) = self.convert_to_records(docs, true)?;
        let gkeys: Vec<u64> = grecs.iter().map(|r| r.key()).collect();
        let pkeys: Vec<u64> = precs.iter().map(|r| r.key()).collect();

        let changes = Mutex::new(ChangedIds::default());
        let grecs = self.genomic.fetch_and_add(grecs, &changes)?;
        let precs = self.protein.fetch_and_add(precs, &changes)?;
        let mut changes = changes.into_inner().unwrap();

        let ca_entries = take_definition_entries(&mut changes, IdentifierKind::Ca);
        let pa_entries = take_definition_entries(&mut changes, IdentifierKind::Pa);
        let ca_conflicts = self.ca_index.add_entries(
            ca_entries
                .into_iter()
                .filter_map(|(id, seen)| match seen {
                    VariantSeen::Genomic(d) => Some((id, d)),
                    VariantSeen::Protein(_) => None,
                })
                .collect(),
        )?;
        if let Some(&id) = ca_conflicts.first() {
            return Err(Error::DuplicateUniqueId(id));
        }
        // first-wins on PA conflicts; the index method already logged them
        let _ = self.pa_index.add_entries(
            pa_entries
                .into_iter()
                .filter_map(|(id, seen)| match seen {
                    VariantSeen::Protein(d) => Some((id, d)),
                    VariantSeen::Genomic(_) => None,
                })
                .collect(),
        )?;

        self.apply_short_id_changes(&changes, true)?;

        let gidx = reorder(&gidx, &gkeys);
        let pidx = reorder(&pidx, &pkeys);
        Self::write_back_genomic(docs, &grecs, &gidx);
        Self::write_back_protein(docs, &precs, &pidx);
        Ok(())
    }

    /// Detaches the documents' identifiers from their variants and from the
    /// short-id indexes.
    pub fn fetch_by_definition_and_delete_identifiers(
        &self,
        docs: &mut Vec<VariantDoc>,
    ) -> Result<(), Error> {
        let (grecs, gidx, precs, pidx) = self.convert_to_records(docs, false)?;
        let gkeys: Vec<u64> = grecs.iter().map(|r| r.key()).collect();
        let pkeys: Vec<u64> = precs.iter().map(|r| r.key()).collect();

        let changes = Mutex::new(ChangedIds::default());
        let grecs = self.genomic.fetch_and_delete(grecs, &changes)?;
        let precs = self.protein.fetch_and_delete(precs, &changes)?;
        let changes = changes.into_inner().unwrap();
        self.apply_short_id_changes(&changes, false)?;

        let gidx = reorder(&gidx, &gkeys);
        let pidx = reorder(&pidx, &pkeys);
        Self::write_back_genomic(docs, &grecs, &gidx);
        Self::write_back_protein(docs, &precs, &pidx);
        Ok(())
    }

    /// Removes the documents' variants outright, scrubbing every index.
    pub fn fetch_by_definition_and_delete(&self, docs: &mut Vec<VariantDoc>) -> Result<(), Error> {
        let (grecs, gidx, precs, pidx) = self.convert_to_records(docs, false)?;
        let gkeys: Vec<u64> = grecs.iter().map(|r| r.key()).collect();
        let pkeys: Vec<u64> = precs.iter().map(|r| r.key()).collect();

        let changes = Mutex::new(ChangedIds::default());
        let grecs = self.genomic.fetch_and_full_delete(grecs, &changes)?;
        let precs = self.protein.fetch_and_full_delete(precs, &changes)?;
        let changes = changes.into_inner().unwrap();

        let ca_ids: Vec<u32> = grecs
            .iter()
            .map(|r| r.identifiers.last_id)
            .filter(|&id| id != NULL_ID)
            .collect();
        let pa_ids: Vec<u32> = precs
            .iter()
            .map(|r| r.identifiers.last_id)
            .filter(|&id| id != NULL_ID)
            .collect();
        self.ca_index.delete_entries(&ca_ids)?;
        self.pa_index.delete_entries(&pa_ids)?;
        self.apply_short_id_changes(&changes, false)?;

        let gidx = reorder(&gidx, &gkeys);
        let pidx = reorder(&pidx, &pkeys);
        Self::write_back_genomic(docs, &grecs, &gidx);
        Self::write_back_protein(docs, &precs, &pidx);
        Ok(())
    }

    /// Resolves CA/PA ids to full variant documents.
    pub fn fetch_by_ca_pa_ids(&self, docs: &mut Vec<VariantDoc>) -> Result<(), Error> {
        let mut ca_ids = Vec::new();
        let mut ca_slots = Vec::new();
        let mut pa_ids = Vec::new();
        let mut pa_slots = Vec::new();
        for (i, doc) in docs.iter().enumerate() {
            match doc {
                VariantDoc::Genomic(d) if d.ca_id != NULL_ID => {
                    ca_ids.push(d.ca_id);
                    ca_slots.push(i);
                }
                VariantDoc::Protein(d) if d.pa_id != NULL_ID => {
                    pa_ids.push(d.pa_id);
                    pa_slots.push(i);
                }
                _ => {}
            }
        }
        let ca_records = self.ca_index.fetch_definitions(&ca_ids)?;
        for (slot, record) in ca_slots.into_iter().zip(ca_records) {
            docs[slot] = match record {
                Some(r) => VariantDoc::Genomic(self.genomic_doc(&r)?),
                None => VariantDoc::Error(DocError::NotFound),
            };
        }
        let pa_records = self.pa_index.fetch_definitions(&pa_ids)?;
        for (slot, record) in pa_slots.into_iter().zip(pa_records) {
            docs[slot] = match record {
                Some(r) => VariantDoc::Protein(self.protein_doc(&r)?),
                None => VariantDoc::Error(DocError::NotFound),
            };
        }
        Ok(())
    }

    /// All variants whose ids of `kinds` (any kind when empty) exist,
    /// streamed as documents; genomic first, then protein.
    pub fn query_all(
        &self,
        sink: &mut dyn FnMut(Vec<VariantDoc>, bool) -> Result<bool, Error>,
        kinds: &[IdentifierKind],
        records_to_skip: &mut u64,
        min_chunk: usize,
    ) -> Result<(), Error> {
        let mut stopped = false;
        self.genomic.query(
            &mut |mut records, _last| {
                if !kinds.is_empty() {
                    records.retain(|r| r.identifiers.has_one_of(kinds));
                }
                let mut docs = Vec::with_capacity(records.len());
                for r in &records {
                    docs.push(VariantDoc::Genomic(self.genomic_doc(r)?));
                }
                let stop = sink(docs, false)?;
                stopped = stop;
                Ok(stop)
            },
            records_to_skip,
            0,
            u32::MAX,
            min_chunk,
        )?;
        if stopped {
            return Ok(());
        }
        self.protein.query(
            &mut |mut records, last| {
                if !kinds.is_empty() {
                    records.retain(|r| r.identifiers.has_one_of(kinds));
                }
                let mut docs = Vec::with_capacity(records.len());
                for r in &records {
                    docs.push(VariantDoc::Protein(self.protein_doc(r)?));
                }
                sink(docs, last)
            },
            records_to_skip,
            0,
            u64::MAX >> 24,
            min_chunk,
        )
    }

    /// Range scan over one genomic reference, as documents.
    pub fn query_by_genomic_range(
        &self,
        sink: &mut dyn FnMut(Vec<VariantDoc>, bool) -> Result<bool, Error>,
        reference: usize,
        from: u32,
        to: u32,
        records_to_skip: &mut u64,
        min_chunk: usize,
    ) -> Result<(), Error> {
        let first = self.references.key(reference, from)?;
        let last = self.references.key(reference, to)?;
        self.genomic.query(
            &mut |records, last_call| {
                let mut docs = Vec::with_capacity(records.len());
                for r in &records {
                    docs.push(VariantDoc::Genomic(self.genomic_doc(r)?));
                }
                sink(docs, last_call)
            },
            records_to_skip,
            first,
            last,
            min_chunk,
        )
    }

    /// Range scan over one protein, as documents.
    pub fn query_by_protein_range(
        &self,
        sink: &mut dyn FnMut(Vec<VariantDoc>, bool) -> Result<bool, Error>,
        protein_id: u64,
        from: u16,
        to: u16,
        records_to_skip: &mut u64,
        min_chunk: usize,
    ) -> Result<(), Error> {
        let first = (protein_id << 16) | u64::from(from);
        let last = (protein_id << 16) | u64::from(to);
        self.protein.query(
            &mut |records, last_call| {
                let mut docs = Vec::with_capacity(records.len());
                for r in &records {
                    docs.push(VariantDoc::Protein(self.protein_doc(r)?));
                }
                sink(docs, last_call)
            },
            records_to_skip,
            first,
            last,
            min_chunk,
        )
    }

    /// Resolves short identifiers (and explicit CA/PA ids) to full
    /// documents, duplicates removed.
    pub fn query_by_short_ids(
        &self,
        ids: &[(IdentifierKind, u32)],
    ) -> Result<Vec<VariantDoc>, Error> {
        let mut by_kind: BTreeMap<IdentifierKind, Vec<u32>> = BTreeMap::new();
        for (kind, value) in ids {
            by_kind.entry(*kind).or_insert_with(Vec::new).push(*value);
        }

        let mut genomic_defs: Vec<GenomicDefinition> = Vec::new();
        let mut protein_defs: Vec<ProteinDefinition> = Vec::new();
        for (kind, values) in &by_kind {
            if let Some(index) = self.short_indexes.get(kind) {
                for seen_list in index.query_definitions(values)? {
                    for seen in seen_list {
                        match seen {
                            VariantSeen::Genomic(d) => genomic_defs.push(d),
                            VariantSeen::Protein(d) => protein_defs.push(d),
                        }
                    }
                }
            }
        }
        if let Some(ca_ids) = by_kind.get(&IdentifierKind::Ca) {
            for record in self.ca_index.fetch_definitions(ca_ids)?.into_iter().flatten() {
                genomic_defs.push(record.definition);
            }
        }
        if let Some(pa_ids) = by_kind.get(&IdentifierKind::Pa) {
            for record in self.pa_index.fetch_definitions(pa_ids)?.into_iter().flatten() {
                protein_defs.push(record.definition);
            }
        }

        genomic_defs.sort();
        genomic_defs.dedup();
        protein_defs.sort();
        protein_defs.dedup();

        let grecs = self
            .genomic
            .fetch(genomic_defs.into_iter().map(GenomicVariantRecord::new).collect())?;
        let precs = self
            .protein
            .fetch(protein_defs.into_iter().map(ProteinVariantRecord::new).collect())?;

        let mut docs = Vec::with_capacity(grecs.len() + precs.len());
        for r in &grecs {
            docs.push(VariantDoc::Genomic(self.genomic_doc(r)?));
        }
        for r in &precs {
            docs.push(VariantDoc::Protein(self.protein_doc(r)?));
        }
        Ok(docs)
    }

    /// Deletes every identifier of `kind` in `[from, to]` from its index and
    /// scrubs the named variants' bags.
    pub fn delete_identifiers(
        &self,
        kind: IdentifierKind,
        from: u32,
        to: u32,
    ) -> Result<(), Error> {
        let index = self
            .short_indexes
            .get(&kind)
            .ok_or(Error::AssertionFailed("identifiers of this kind cannot be bulk-deleted"))?;
        let genomic = &self.genomic;
        let protein = &self.protein;
        index.delete_entries(
            &mut |seen_list, _last| {
                let mut grecs = Vec::new();
                let mut precs = Vec::new();
                for seen in seen_list {
                    match seen {
                        VariantSeen::Genomic(d) => grecs.push(GenomicVariantRecord::new(d)),
                        VariantSeen::Protein(d) => precs.push(ProteinVariantRecord::new(d)),
                    }
                }
                genomic.delete_identifiers(grecs, kind)?;
                protein.delete_identifiers(precs, kind)?;
                Ok(())
            },
            from,
            to,
            512 * 1024,
        )
    }

    /// Re-derives the chosen indexes from a full walk of both variant
    /// tables. The recovery path for a lost index file.
    pub fn rebuild_indexes(&self, kinds: &HashSet<IdentifierKind>) -> Result<(), Error> {
        if kinds.is_empty() {
            return Ok(());
        }
        tracing::info!(?kinds, "rebuilding identifier indexes");

        let mut skip = 0u64;
        self.genomic.query(
            &mut |records, _last| {
                let mut changes = ChangedIds::default();
                let mut ca_entries = Vec::new();
                for r in &records {
                    push_bag_entries(&mut changes, &r.identifiers, &r.seen());
                    if kinds.contains(&IdentifierKind::Ca) && r.identifiers.last_id != NULL_ID {
                        ca_entries.push((r.identifiers.last_id, r.definition.clone()));
                    }
                }
                for (kind, entries) in &changes {
                    if kinds.contains(kind) {
                        if let Some(index) = self.short_indexes.get(kind) {
                            index.add_identifiers(entries)?;
                        }
                    }
                }
                if !ca_entries.is_empty() {
                    self.ca_index.add_entries(ca_entries)?;
                }
                Ok(false)
            },
            &mut skip,
            0,
            u32::MAX,
            64 * 1024,
        )?;

        let mut skip = 0u64;
        self.protein.query(
            &mut |records, _last| {
                let mut changes = ChangedIds::default();
                let mut pa_entries = Vec::new();
                for r in &records {
                    push_bag_entries(&mut changes, &r.identifiers, &r.seen());
                    if kinds.contains(&IdentifierKind::Pa) && r.identifiers.last_id != NULL_ID {
                        pa_entries.push((r.identifiers.last_id, r.definition.clone()));
                    }
                }
                for (kind, entries) in &changes {
                    if kinds.contains(kind) {
                        if let Some(index) = self.short_indexes.get(kind) {
                            index.add_identifiers(entries)?;
                        }
                    }
                }
                if !pa_entries.is_empty() {
                    self.pa_index.add_entries(pa_entries)?;
                }
                Ok(false)
            },
            &mut skip,
            0,
            u64::MAX >> 24,
            64 * 1024,
        )?;

        tracing::info!("index rebuild complete");
        Ok(())
    }
}

fn push_bag_entries(changes: &mut ChangedIds, bag: &IdentifierBag, seen: &VariantSeen) {
    for (kind, value) in bag.short_index_entries() {
        changes.entry(kind).or_insert_with(Vec::new).push((value, seen.clone()));
    }
}

fn take_definition_entries(
    changes: &mut ChangedIds,
    kind: IdentifierKind,
) -> Vec<(u32, VariantSeen)> {
    changes.remove(&kind).unwrap_or_default()
}

/// Applies index-side additions or deletions for each identifier kind.
impl AlleleRegistry {
    fn apply_short_id_changes(&self, changes: &ChangedIds, add: bool) -> Result<(), Error> {
        for (kind, entries) in changes {
            if let Some(index) = self.short_indexes.get(kind) {
                if add {
                    index.add_identifiers(entries)?;
                } else {
                    index.delete_identifiers(entries)?;
                }
            }
        }
        Ok(())
    }
}

/// Remaps positional companions of an engine batch: the engine returns
/// records sorted (stably) by key, so sorting the companion list by the same
/// keys lines it up again.
fn reorder(indices: &[usize], keys: &[u64]) -> Vec<usize> {
    let order = sorted_permutation(keys);
    order.into_iter().map(|j| indices[j]).collect()
}
