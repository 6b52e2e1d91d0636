//! Short-identifier indexes: one engine instance per catalog (dbSNP,
//! ClinVar allele/variant, ClinVar RCV), mapping the catalog's 32-bit id to
//! the definitions it names. An id may name several variants; duplicates of
//! one definition are coalesced.

use crate::bytes::{ByteReader, ByteWriter};
use crate::engine::tasks::WorkerPools;
use crate::engine::{Database, Record, DEFAULT_DATA_PAGE_SIZE};
use crate::variant::{GenomicDefinition, ProteinDefinition, VariantSeen};
use crate::Error;
use std::path::Path;
use std::sync::Arc;

fn seen_data_len(seen: &VariantSeen) -> usize {
    match seen {
        VariantSeen::Genomic(d) => 1 + 4 + d.data_len(),
        VariantSeen::Protein(d) => 1 + 8 + d.data_len(),
    }
}

fn save_seen(seen: &VariantSeen, out: &mut ByteWriter) {
    match seen {
        VariantSeen::Genomic(d) => {
            out.put_uint(1, 1);
            out.put_uint(u64::from(d.first_position()), 4);
            d.save(out);
        }
        VariantSeen::Protein(d) => {
            out.put_uint(0, 1);
            out.put_uint(d.key(), 8);
            d.save(out);
        }
    }
}

fn load_seen(input: &mut ByteReader) -> Result<VariantSeen, Error> {
    if input.read_uint(1)? == 1 {
        let first_position = input.read_uint(4)? as u32;
        Ok(VariantSeen::Genomic(GenomicDefinition::load(first_position, input)?))
    } else {
        let key = input.read_uint(8)?;
        Ok(VariantSeen::Protein(ProteinDefinition::load(key, input)?))
    }
}

#[derive(Clone, Debug)]
struct IdRecord {
    id: u32,
    seen: VariantSeen,
    /// definitions gathered for this query input; never stored
    collected: Vec<VariantSeen>,
    slot: usize,
}

impl IdRecord {
    fn query(id: u32, slot: usize) -> IdRecord {
        IdRecord {
            id,
            seen: VariantSeen::Genomic(GenomicDefinition::placeholder(0)),
            collected: Vec::new(),
            slot,
        }
    }
}

impl Record for IdRecord {
    const KEY_BYTES: usize = 4;

    fn key(&self) -> u64 {
        u64::from(self.id)
    }

    fn data_len(&self) -> usize {
        seen_data_len(&self.seen)
    }

    fn save(&self, out: &mut ByteWriter) {
        save_seen(&self.seen, out);
    }

    fn load(key: u64, input: &mut ByteReader) -> Result<IdRecord, Error> {
        Ok(IdRecord {
            id: key as u32,
            seen: load_seen(input)?,
            collected: Vec::new(),
            slot: usize::MAX,
        })
    }
}

pub struct ShortIdIndex {
    db: Database<IdRecord>,
    name: &'static str,
}

impl ShortIdIndex {
    pub fn open(
        dir: &Path,
        pools: Arc<WorkerPools>,
        name: &'static str,
        cache_megabytes: u64,
    ) -> Result<ShortIdIndex, Error> {
        let db = Database::open(
            &dir.join(format!("id{}", name)),
            DEFAULT_DATA_PAGE_SIZE,
            cache_megabytes,
            pools,
        )?;
        tracing::info!(index = name, records = db.record_count()?, "short-id index open");
        Ok(ShortIdIndex { db, name })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Every definition each input id points at.
    pub fn query_definitions(&self, ids: &[u32]) -> Result<Vec<Vec<VariantSeen>>, Error> {
        let records = ids.iter().enumerate().map(|(slot, &id)| IdRecord::query(id, slot)).collect();
        let records = self.db.read_records(records, &|stored, queried| {
            for q in queried.iter_mut() {
                q.collected = stored.iter().map(|d| d.seen.clone()).collect();
            }
        })?;
        let mut out = vec![Vec::new(); ids.len()];
        for r in records {
            out[r.slot] = r.collected;
        }
        Ok(out)
    }

    /// Attaches definitions to ids; a definition already present under the
    /// id is not duplicated.
    pub fn add_identifiers(&self, entries: &[(u32, VariantSeen)]) -> Result<(), Error> {
        let records = entries
            .iter()
            .map(|(id, seen)| IdRecord {
                id: *id,
                seen: seen.clone(),
                collected: Vec::new(),
                slot: usize::MAX,
            })
            .collect();
        self.db.write_records(records, &|stored, incoming| {
            let mut changed = false;
            for q in incoming.iter() {
                if !stored.iter().any(|d| d.seen == q.seen) {
                    stored.push(q.clone());
                    changed = true;
                }
            }
            Ok(changed)
        })?;
        Ok(())
    }

    pub fn delete_identifiers(&self, entries: &[(u32, VariantSeen)]) -> Result<(), Error> {
        let records = entries
            .iter()
            .map(|(id, seen)| IdRecord {
                id: *id,
                seen: seen.clone(),
                collected: Vec::new(),
                slot: usize::MAX,
            })
            .collect();
        self.db.write_records(records, &|stored, incoming| {
            let mut changed = false;
            for q in incoming.iter() {
                if let Some(i) = stored.iter().position(|d| d.seen == q.seen) {
                    stored.remove(i);
                    changed = true;
                }
            }
            Ok(changed)
        })?;
        Ok(())
    }

    /// Deletes every entry in `[first, last]`, handing the removed
    /// definitions to `sink` in chunks until the range is exhausted. The
    /// final call is flagged.
    pub fn delete_entries(
        &self,
        sink: &mut dyn FnMut(Vec<VariantSeen>, bool) -> Result<(), Error>,
        first: u32,
        last: u32,
        min_chunk: usize,
    ) -> Result<(), Error> {
        let mut exhausted = false;
        while !exhausted {
            let mut doomed: Vec<IdRecord> = Vec::new();
            self.db.read_records_in_order(
                &mut |chunk, last_call| {
                    doomed.extend(chunk);
                    if last_call {
                        exhausted = true;
                        Ok(false)
                    } else {
                        Ok(doomed.len() >= min_chunk)
                    }
                },
                u64::from(first),
                u64::from(last),
                min_chunk,
            )?;

            let removed: Vec<VariantSeen> = doomed.iter().map(|r| r.seen.clone()).collect();
            if !doomed.is_empty() {
                self.db.write_records(doomed, &|stored, _incoming| {
                    if stored.is_empty() {
                        return Ok(false);
                    }
                    stored.clear();
                    Ok(true)
                })?;
            }
            sink(removed, exhausted)?;
        }
        Ok(())
    }

    pub fn is_newly_created(&self) -> bool {
        self.db.is_newly_created()
    }

    pub fn record_count(&self) -> Result<u64, Error> {
        self.db.record_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{NucleotideModification, VariantCategory};
    use tempfile::TempDir;

    fn genomic(position: u32, base: u32) -> VariantSeen {
        VariantSeen::Genomic(
            GenomicDefinition::new(vec![NucleotideModification {
                position,
                length_before: 1,
                length_change_or_seq: 1,
                sequence: base,
                category: VariantCategory::NonShiftable,
            }])
            .unwrap(),
        )
    }

    fn protein(protein_id: u64, position: u16) -> VariantSeen {
        use crate::variant::AminoAcidModification;
        VariantSeen::Protein(
            ProteinDefinition::new(
                protein_id,
                vec![AminoAcidModification {
                    position,
                    length_before: 1,
                    length_change_or_seq: 1,
                    sequence: 2,
                    category: VariantCategory::NonShiftable,
                }],
            )
            .unwrap(),
        )
    }

    fn index(dir: &TempDir) -> ShortIdIndex {
        let pools = WorkerPools::new(2, 1).unwrap();
        ShortIdIndex::open(dir.path(), pools, "DbSnp", 4).unwrap()
    }

    #[test]
    fn one_id_may_name_many_definitions() {
        let tmp = TempDir::new().unwrap();
        let idx = index(&tmp);
        idx.add_identifiers(&[
            (42, genomic(100, 1)),
            (42, protein(9, 31)),
            (42, genomic(100, 1)), // duplicate, coalesced
            (43, genomic(555, 2)),
        ])
        .unwrap();

        let got = idx.query_definitions(&[42, 43, 44]).unwrap();
        assert_eq!(got[0].len(), 2);
        assert!(got[0].contains(&genomic(100, 1)));
        assert!(got[0].contains(&protein(9, 31)));
        assert_eq!(got[1], vec![genomic(555, 2)]);
        assert!(got[2].is_empty());
    }

    #[test]
    fn delete_specific_definitions() {
        let tmp = TempDir::new().unwrap();
        let idx = index(&tmp);
        idx.add_identifiers(&[(7, genomic(1, 0)), (7, genomic(2, 0))]).unwrap();
        idx.delete_identifiers(&[(7, genomic(1, 0))]).unwrap();
        let got = idx.query_definitions(&[7]).unwrap();
        assert_eq!(got[0], vec![genomic(2, 0)]);
    }

    #[test]
    fn range_delete_yields_the_removed_definitions() {
        let tmp = TempDir::new().unwrap();
        let idx = index(&tmp);
        let entries: Vec<(u32, VariantSeen)> =
            (0..30u32).map(|i| (i, genomic(1000 + i, 1))).collect();
        idx.add_identifiers(&entries).unwrap();

        let mut removed = Vec::new();
        let mut calls = 0;
        idx.delete_entries(
            &mut |chunk, _last| {
                removed.extend(chunk);
                calls += 1;
                Ok(())
            },
            5,
            24,
            8,
        )
        .unwrap();
        assert_eq!(removed.len(), 20);
        assert!(calls >= 1);

        // deleted range empty, the rest untouched
        let got = idx.query_definitions(&[4, 5, 24, 25]).unwrap();
        assert!(!got[0].is_empty());
        assert!(got[1].is_empty());
        assert!(got[2].is_empty());
        assert!(!got[3].is_empty());
    }
}
