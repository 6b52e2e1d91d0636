//! PA index: protein allele id → protein definition, unique per id.

use crate::bytes::{ByteReader, ByteWriter};
use crate::engine::tasks::WorkerPools;
use crate::engine::{Database, Record, DEFAULT_DATA_PAGE_SIZE};
use crate::variant::{ProteinDefinition, ProteinVariantRecord};
use crate::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};

const PROTEIN_VARIATION: u8 = 1;

#[derive(Clone, Debug)]
struct PaRecord {
    pa_id: u32,
    definition: ProteinDefinition,
    found: bool,
    slot: usize,
}

impl PaRecord {
    fn query(pa_id: u32, slot: usize) -> PaRecord {
        PaRecord { pa_id, definition: ProteinDefinition::placeholder(0), found: false, slot }
    }
}

impl Record for PaRecord {
    const KEY_BYTES: usize = 4;

    fn key(&self) -> u64 {
        u64::from(self.pa_id)
    }

    fn data_len(&self) -> usize {
        1 + 8 + self.definition.data_len()
    }

    fn save(&self, out: &mut ByteWriter) {
        out.put_uint(u64::from(PROTEIN_VARIATION), 1);
        out.put_uint(self.definition.key(), 8);
        self.definition.save(out);
    }

    fn load(key: u64, input: &mut ByteReader) -> Result<PaRecord, Error> {
        if input.read_uint(1)? as u8 != PROTEIN_VARIATION {
            return Err(Error::BadRecord("unknown PA record type"));
        }
        let protein_key = input.read_uint(8)?;
        let definition = ProteinDefinition::load(protein_key, input)?;
        Ok(PaRecord { pa_id: key as u32, definition, found: true, slot: usize::MAX })
    }
}

pub struct PaIndex {
    db: Database<PaRecord>,
}

impl PaIndex {
    pub fn open(dir: &Path, pools: Arc<WorkerPools>, cache_megabytes: u64) -> Result<PaIndex, Error> {
        let db = Database::open(&dir.join("idPa"), DEFAULT_DATA_PAGE_SIZE, cache_megabytes, pools)?;
        tracing::info!(
            records = db.record_count()?,
            largest_key = db.largest_key()?,
            "PA index open"
        );
        Ok(PaIndex { db })
    }

    pub fn fetch_definitions(
        &self,
        ids: &[u32],
    ) -> Result<Vec<Option<ProteinVariantRecord>>, Error> {
        let records = ids.iter().enumerate().map(|(slot, &id)| PaRecord::query(id, slot)).collect();
        let records = self.db.read_records(records, &|stored, queried| {
            if stored.len() > 1 {
                tracing::warn!(pa_id = stored[0].pa_id, "more than one record for a PA id");
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
                let mut record = ProteinVariantRecord::new(r.definition);
                record.identifiers.last_id = r.pa_id;
                out[r.slot] = Some(record);
            }
        }
        Ok(out)
    }

    /// Same policy as the CA index: identical re-adds are no-ops, rebinding
    /// attempts are skipped and reported.
    pub fn add_entries(&self, entries: Vec<(u32, ProteinDefinition)>) -> Result<Vec<u32>, Error> {
        let records = entries
            .into_iter()
            .map(|(id, definition)| PaRecord { pa_id: id, definition, found: false, slot: usize::MAX })
            .collect();
        let conflicts = Mutex::new(Vec::new());
        self.db.write_records(records, &|stored, incoming| {
            let mut changed = false;
            for q in incoming.iter() {
                match stored.first() {
                    Some(d) => {
                        if d.definition != q.definition {
                            tracing::warn!(pa_id = q.pa_id, "PA id already bound to another definition");
                            conflicts.lock().unwrap().push(q.pa_id);
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
        let records = ids.iter().enumerate().map(|(slot, &id)| PaRecord::query(id, slot)).collect();
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
    use crate::variant::{AminoAcidModification, VariantCategory};
    use tempfile::TempDir;

    fn def(protein_id: u64, position: u16) -> ProteinDefinition {
        ProteinDefinition::new(
            protein_id,
            vec![AminoAcidModification {
                position,
                length_before: 1,
                length_change_or_seq: 1,
                sequence: 5,
                category: VariantCategory::NonShiftable,
            }],
        )
        .unwrap()
    }

    #[test]
    fn pa_entries_roundtrip_with_wide_protein_keys() {
        let tmp = TempDir::new().unwrap();
        let pools = WorkerPools::new(2, 1).unwrap();
        let idx = PaIndex::open(tmp.path(), pools, 4).unwrap();
        idx.add_entries(vec![(7, def(0xabcdef, 44)), (8, def(2, 1))]).unwrap();

        let got = idx.fetch_definitions(&[7, 8, 9]).unwrap();
        assert_eq!(got[0].as_ref().unwrap().definition, def(0xabcdef, 44));
        assert_eq!(got[1].as_ref().unwrap().identifiers.last_id, 8);
        assert!(got[2].is_none());

        assert_eq!(idx.add_entries(vec![(7, def(1, 1))]).unwrap(), vec![7]);
        assert_eq!(idx.max_identifier().unwrap(), 8);
    }
}
