//! CA index: canonical allele id → genomic definition, unique per id.

use crate::bytes::{ByteReader, ByteWriter};
use crate::engine::tasks::WorkerPools;
use crate::engine::{Database, Record, DEFAULT_DATA_PAGE_SIZE};
use crate::variant::{GenomicDefinition, GenomicVariantRecord};
use crate::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};

const GENOMIC_VARIATION: u8 = 1;

#[derive(Clone, Debug)]
struct CaRecord {
    ca_id: u32,
    definition: GenomicDefinition,
    /// set by the read visitor when the id resolved; never stored
    found: bool,
    slot: usize,
}

impl CaRecord {
    fn query(ca_id: u32, slot: usize) -> CaRecord {
        CaRecord { ca_id, definition: GenomicDefinition::placeholder(0), found: false, slot }
    }
}

impl Record for CaRecord {
    const KEY_BYTES: usize = 4;

    fn key(&self) -> u64 {
        u64::from(self.ca_id)
    }

    fn data_len(&self) -> usize {
        1 + 4 + self.definition.data_len()
    }

    fn save(&self, out: &mut ByteWriter) {
        out.put_uint(u64::from(GENOMIC_VARIATION), 1);
        out.put_uint(u64::from(self.definition.first_position()), 4);
        self.definition.save(out);
    }

    fn load(key: u64, input: &mut ByteReader) -> Result<CaRecord, Error> {
        if input.read_uint(1)? as u8 != GENOMIC_VARIATION {
            return Err(Error::BadRecord("unknown CA record type"));
        }
        let first_position = input.read_uint(4)? as u32;
        let definition = GenomicDefinition::load(first_position, input)?;
        Ok(CaRecord { ca_id: key as u32, definition, found: true, slot: usize::MAX })
    }
}

pub struct CaIndex {
    db: Database<CaRecord>,
}

impl CaIndex {
    pub fn open(dir: &Path, pools: Arc<WorkerPools>, cache_megabytes: u64) -> Result<CaIndex, Error> {
        let db = Database::open(&dir.join("idCa"), DEFAULT_DATA_PAGE_SIZE, cache_megabytes, pools)?;
        tracing::info!(
            records = db.record_count()?,
            largest_key = db.largest_key()?,
            "CA index open"
        );
        Ok(CaIndex { db })
    }

    /// The stored definition for each id, as a bare variant record carrying
    /// the CA id in its bag.
    pub fn fetch_definitions(
        &self,
        ids: &[u32],
    ) -> Result<Vec<Option<GenomicVariantRecord>>, Error> {
        let records = ids.iter().enumerate().map(|(slot, &id)| CaRecord::query(id, slot)).collect();
        let records = self.db.read_records(records, &|stored, queried| {
            if stored.len() > 1 {
                tracing::warn!(ca_id = stored[0].ca_id, "more than one record for a CA id");
            }
            if let Some(d) = stored.first() {
                for q in queried.iter_mut() {
                    q.definition = d.definition.clone();
                    q.found = true;
                }
            }
        })?;
        let mut out = vec![None; ids.len()];
        for r in records {
            if r.found {
                let mut record = GenomicVariantRecord::new(r.definition);
                record.identifiers.last_id = r.ca_id;
                out[r.slot] = Some(record);
            }
        }
        Ok(out)
    }

    /// Registers id → definition pairs. Re-adding an identical pair is a
    /// no-op; an id already bound to a different definition is skipped and
    /// reported, for the caller to escalate.
    pub fn add_entries(&self, entries: Vec<(u32, GenomicDefinition)>) -> Result<Vec<u32>, Error> {
        let records = entries
            .into_iter()
            .map(|(id, definition)| CaRecord { ca_id: id, definition, found: false, slot: usize::MAX })
            .collect();
        let conflicts = Mutex::new(Vec::new());
        self.db.write_records(records, &|stored, incoming| {
            let mut changed = false;
            for q in incoming.iter() {
                match stored.first() {
                    Some(d) => {
                        if d.definition != q.definition {
                            tracing::warn!(ca_id = q.ca_id, "CA id already bound to another definition");
                            conflicts.lock().unwrap().push(q.ca_id);
                        }
                    }
                    None => {
                        stored.push(q.clone());
                        changed = true;
                    }
                }
            }
            Ok(changed)
        })?;
        Ok(conflicts.into_inner().unwrap())
    }

    pub fn delete_entries(&self, ids: &[u32]) -> Result<(), Error> {
        let records = ids.iter().enumerate().map(|(slot, &id)| CaRecord::query(id, slot)).collect();
        self.db.write_records(records, &|stored, _incoming| {
            if stored.is_empty() {
                return Ok(false);
            }
            stored.clear();
            Ok(true)
        })?;
        Ok(())
    }

    pub fn max_identifier(&self) -> Result<u32, Error> {
        Ok(self.db.largest_key()? as u32)
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

    fn def(position: u32, base: u32) -> GenomicDefinition {
        GenomicDefinition::new(vec![NucleotideModification {
            position,
            length_before: 1,
            length_change_or_seq: 1,
            sequence: base,
            category: VariantCategory::NonShiftable,
        }])
        .unwrap()
    }

    fn index(dir: &TempDir) -> CaIndex {
        let pools = WorkerPools::new(2, 1).unwrap();
        CaIndex::open(dir.path(), pools, 4).unwrap()
    }

    #[test]
    fn add_fetch_delete() {
        let tmp = TempDir::new().unwrap();
        let idx = index(&tmp);
        assert!(idx.is_newly_created());
        let conflicts =
            idx.add_entries(vec![(10, def(100, 1)), (11, def(200, 2))]).unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(idx.max_identifier().unwrap(), 11);

        let got = idx.fetch_definitions(&[11, 10, 12]).unwrap();
        assert_eq!(got[0].as_ref().unwrap().definition, def(200, 2));
        assert_eq!(got[0].as_ref().unwrap().identifiers.last_id, 11);
        assert_eq!(got[1].as_ref().unwrap().definition, def(100, 1));
        assert!(got[2].is_none());

        idx.delete_entries(&[10]).unwrap();
        let got = idx.fetch_definitions(&[10]).unwrap();
        assert!(got[0].is_none());
    }

    #[test]
    fn conflicting_rebind_is_counted_not_applied() {
        let tmp = TempDir::new().unwrap();
        let idx = index(&tmp);
        idx.add_entries(vec![(5, def(100, 1))]).unwrap();
        // identical pair: fine
        assert!(idx.add_entries(vec![(5, def(100, 1))]).unwrap().is_empty());
        // different definition under the same id: rejected
        assert_eq!(idx.add_entries(vec![(5, def(100, 3))]).unwrap(), vec![5]);
        let got = idx.fetch_definitions(&[5]).unwrap();
        assert_eq!(got[0].as_ref().unwrap().definition, def(100, 1));
    }
}
