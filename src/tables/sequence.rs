//! Interning of long inserted/deleted nucleotide runs.
//!
//! Keyed by the top 24 bits of the sequence's CRC32; colliding sequences in
//! one bucket are told apart by an 8-bit internal id, so a sequence id is
//! `(crc >> 8) << 8 | internal`. A bucket can hold 256 sequences; beyond
//! that `insert_or_get` reports the sequence as unresolvable.

use crate::alphabet::{bits_to_nucleotides, nucleotides_to_bits};
use crate::bytes::{crc32, var_uint_len, ByteReader, ByteWriter};
use crate::engine::tasks::WorkerPools;
use crate::engine::{Database, Record, DEFAULT_DATA_PAGE_SIZE};
use crate::variant::UNKNOWN_SEQUENCE;
use crate::Error;
use std::path::Path;
use std::sync::Arc;

/// Marks a query record whose bucket scan found nothing.
const UNRESOLVED: u32 = u32::MAX;

#[derive(Clone, Debug)]
pub(crate) struct SequenceRecord {
    crc_key: u32,
    internal_id: u32,
    sequence: Option<String>,
    /// position in the caller's batch; never stored
    slot: usize,
}

impl Record for SequenceRecord {
    const KEY_BYTES: usize = 4;

    fn key(&self) -> u64 {
        u64::from(self.crc_key)
    }

    fn data_len(&self) -> usize {
        let len = self.sequence.as_ref().map_or(0, |s| s.len());
        1 + var_uint_len(len as u64, 1, 1) + (len + 3) / 4
    }

    fn save(&self, out: &mut ByteWriter) {
        out.put_uint(u64::from(self.internal_id), 1);
        let seq = match &self.sequence {
            None => {
                out.put_var_uint(0, 1, 1);
                return;
            }
            Some(s) => s,
        };
        out.put_var_uint(seq.len() as u64, 1, 1);
        let full_words = seq.len() / 16;
        for i in 0..full_words {
            let bits = nucleotides_to_bits(&seq[i * 16..(i + 1) * 16]).expect("validated on intake");
            out.put_uint(u64::from(bits), 4);
        }
        let rest = &seq[full_words * 16..];
        if !rest.is_empty() {
            let bits = nucleotides_to_bits(rest).expect("validated on intake");
            out.put_uint(u64::from(bits), (rest.len() + 3) / 4);
        }
    }

    fn load(key: u64, input: &mut ByteReader) -> Result<SequenceRecord, Error> {
        let internal_id = input.read_uint(1)? as u32;
        let len = input.read_var_uint(1, 1)? as usize;
        let mut seq = String::with_capacity(len);
        let full_words = len / 16;
        for _ in 0..full_words {
            let bits = input.read_uint(4)? as u32;
            seq.push_str(&bits_to_nucleotides(bits, 16)?);
        }
        let rest = len - full_words * 16;
        if rest > 0 {
            let bits = input.read_uint((rest + 3) / 4)? as u32;
            seq.push_str(&bits_to_nucleotides(bits, rest)?);
        }
        Ok(SequenceRecord {
            crc_key: key as u32,
            internal_id,
            sequence: Some(seq),
            slot: usize::MAX,
        })
    }
}

fn bucket_key(sequence: &str) -> u32 {
    crc32(sequence.as_bytes()) >> 8
}

fn check_nucleotides(sequences: &[&str]) -> Result<(), Error> {
    for s in sequences {
        if s.bytes().any(|b| !matches!(b, b'A' | b'C' | b'G' | b'T')) {
            return Err(Error::BadRecord("not a nucleotide sequence"));
        }
    }
    Ok(())
}

pub struct SequenceTable {
    db: Database<SequenceRecord>,
}

impl SequenceTable {
    pub fn open(
        dir: &Path,
        pools: Arc<WorkerPools>,
        cache_megabytes: u64,
    ) -> Result<SequenceTable, Error> {
        let db = Database::open(&dir.join("sequence"), DEFAULT_DATA_PAGE_SIZE, cache_megabytes, pools)?;
        tracing::info!(records = db.record_count()?, "sequence table open");
        Ok(SequenceTable { db })
    }

    /// Sequence ids for each input, `UNKNOWN_SEQUENCE` where absent.
    pub fn lookup(&self, sequences: &[&str]) -> Result<Vec<u32>, Error> {
        check_nucleotides(sequences)?;
        let records = sequences
            .iter()
            .enumerate()
            .map(|(slot, s)| SequenceRecord {
                crc_key: bucket_key(s),
                internal_id: UNRESOLVED,
                sequence: Some((*s).to_string()),
                slot,
            })
            .collect();
        let records = self.db.read_records(records, &|stored, queried| {
            for q in queried.iter_mut() {
                for d in stored {
                    if d.sequence == q.sequence {
                        q.internal_id = d.internal_id;
                        break;
                    }
                }
            }
        })?;
        let mut out = vec![UNKNOWN_SEQUENCE; sequences.len()];
        for r in records {
            if r.internal_id < 256 {
                out[r.slot] = (r.crc_key << 8) | r.internal_id;
            }
        }
        Ok(out)
    }

    /// Sequences for each id, `None` where the id resolves to nothing.
    pub fn fetch_sequences(&self, ids: &[u32]) -> Result<Vec<Option<String>>, Error> {
        let records = ids
            .iter()
            .enumerate()
            .map(|(slot, &id)| SequenceRecord {
                crc_key: id >> 8,
                internal_id: id & 0xff,
                sequence: None,
                slot,
            })
            .collect();
        let records = self.db.read_records(records, &|stored, queried| {
            for q in queried.iter_mut() {
                for d in stored {
                    if d.internal_id == q.internal_id {
                        q.sequence = d.sequence.clone();
                        break;
                    }
                }
            }
        })?;
        let mut out = vec![None; ids.len()];
        for r in records {
            out[r.slot] = r.sequence;
        }
        Ok(out)
    }

    /// Like `lookup`, but registers sequences that are not present yet.
    /// Buckets that already hold 256 colliding sequences yield
    /// `UNKNOWN_SEQUENCE`.
    pub fn insert_or_get(&self, sequences: &[&str]) -> Result<Vec<u32>, Error> {
        check_nucleotides(sequences)?;
        let records = sequences
            .iter()
            .enumerate()
            .map(|(slot, s)| SequenceRecord {
                crc_key: bucket_key(s),
                internal_id: UNRESOLVED,
                sequence: Some((*s).to_string()),
                slot,
            })
            .collect();
        let records = self.db.write_records(records, &|stored, incoming| {
            let mut changed = false;
            for q in incoming.iter_mut() {
                let mut next_internal = 0;
                for d in stored.iter() {
                    if d.sequence == q.sequence {
                        q.internal_id = d.internal_id;
                        break;
                    }
                    if next_internal <= d.internal_id {
                        next_internal = d.internal_id + 1;
                    }
                }
                if q.internal_id == UNRESOLVED && next_internal < 256 {
                    q.internal_id = next_internal;
                    let mut fresh = q.clone();
                    fresh.slot = usize::MAX;
                    stored.push(fresh);
                    changed = true;
                }
            }
            Ok(changed)
        })?;
        let mut out = vec![UNKNOWN_SEQUENCE; sequences.len()];
        for r in records {
            if r.internal_id < 256 {
                out[r.slot] = (r.crc_key << 8) | r.internal_id;
            }
        }
        Ok(out)
    }
}
