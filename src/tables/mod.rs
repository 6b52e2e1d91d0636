//! The registry's tables: genomic and protein variants plus interned
//! sequences. Both variant tables run the same batch protocols over their
//! engine; the records differ only in key shape and identifier tag, so the
//! protocols live here once, generically.

pub mod genomic;
pub mod protein;
pub mod sequence;

use crate::engine::tasks::WorkerPools;
use crate::engine::{Database, Record, DEFAULT_DATA_PAGE_SIZE};
use crate::ids::{IdentifierBag, IdentifierKind};
use crate::variant::VariantSeen;
use crate::{Error, HashMap, NULL_ID};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

/// Per-kind identifier changes produced by a table batch, consumed by the
/// identifier indexes: `(identifier value, definition it names)`.
pub type ChangedIds = HashMap<IdentifierKind, Vec<(u32, VariantSeen)>>;

/// What the variant-table protocols need from a record beyond the engine's
/// contract.
pub trait VariantRecord: Record + Clone {
    /// CA for genomic records, PA for protein records.
    const ID_KIND: IdentifierKind;

    fn bag(&self) -> &IdentifierBag;
    fn bag_mut(&mut self) -> &mut IdentifierBag;
    fn same_definition(&self, other: &Self) -> bool;
    fn definition_cmp(&self, other: &Self) -> Ordering;
    fn seen(&self) -> VariantSeen;
    fn revision(&self) -> u32;
    fn set_revision(&mut self, revision: u32);
    /// Right edge of the first modification, in key space.
    fn first_region_end(&self) -> u64;
}

fn push_short_changes(changes: &mut ChangedIds, bag: &IdentifierBag, seen: &VariantSeen) {
    for (kind, value) in bag.short_index_entries() {
        changes.entry(kind).or_insert_with(Vec::new).push((value, seen.clone()));
    }
}

/// Batch inputs may name the same variant twice; their bags are unioned
/// before the database merge so both carry the outcome.
fn merge_duplicate_inputs<R: VariantRecord>(incoming: &mut [R]) {
    for i in 0..incoming.len() {
        for j in i + 1..incoming.len() {
            if incoming[i].same_definition(&incoming[j]) {
                let (left, right) = incoming.split_at_mut(j);
                left[i].bag_mut().exchange(right[0].bag_mut());
            }
        }
    }
}

/// Records within 10 kb left of the queried range may still reach into it;
/// the scan starts early and filters on the first modification's right edge.
const QUERY_MARGIN: u64 = 10_000;

pub(crate) struct VariantTable<R: VariantRecord> {
    db: Database<R>,
    next_free_id: Arc<AtomicU32>,
}

impl<R: VariantRecord> VariantTable<R> {
    pub fn open(
        basename: &Path,
        pools: Arc<WorkerPools>,
        cache_megabytes: u64,
        next_free_id: Arc<AtomicU32>,
    ) -> Result<VariantTable<R>, Error> {
        let db = Database::open(basename, DEFAULT_DATA_PAGE_SIZE, cache_megabytes, pools)?;
        Ok(VariantTable { db, next_free_id })
    }

    pub fn db(&self) -> &Database<R> {
        &self.db
    }

    /// Range scan in key order; each chunk is sorted by definition before it
    /// reaches the visitor. `records_to_skip` is consumed across chunks.
    pub fn query(
        &self,
        visitor: &mut dyn FnMut(Vec<R>, bool) -> Result<bool, Error>,
        records_to_skip: &mut u64,
        first: u64,
        last: u64,
        min_chunk: usize,
    ) -> Result<(), Error> {
        let mut pending: Vec<R> = Vec::new();
        self.db.read_records_in_order(
            &mut |chunk, last_call| {
                for record in chunk {
                    if record.first_region_end() > first {
                        if *records_to_skip > 0 {
                            *records_to_skip -= 1;
                        } else {
                            pending.push(record);
                        }
                    }
                }
                if pending.len() >= min_chunk || last_call {
                    pending.sort_by(|a, b| a.definition_cmp(b));
                    visitor(std::mem::take(&mut pending), last_call)
                } else {
                    Ok(false)
                }
            },
            first.saturating_sub(QUERY_MARGIN),
            last,
            min_chunk,
        )
    }

    /// Fills each input's bag and revision from the stored record with the
    /// byte-identical definition; inputs without a match (or with a stale
    /// CA/PA id) come back with an empty bag.
    pub fn fetch(&self, records: Vec<R>) -> Result<Vec<R>, Error> {
        self.db.read_records(records, &|stored, queried| {
            for q in queried.iter_mut() {
                match stored.iter().find(|d| d.same_definition(q)) {
                    None => q.bag_mut().clear(),
                    Some(d) => {
                        if q.bag().last_id == NULL_ID || q.bag().last_id == d.bag().last_id {
                            q.set_revision(d.revision());
                            *q.bag_mut() = d.bag().clone();
                        } else {
                            q.bag_mut().clear();
                        }
                    }
                }
            }
        })
    }

    /// Registers the inputs: merges bags into existing records, creates
    /// missing ones (drawing fresh CA/PA ids), and reports every identifier
    /// that became newly attached, keyed by kind.
    pub fn fetch_and_add(
        &self,
        records: Vec<R>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<R>, Error> {
        let next_free_id = &self.next_free_id;
        self.db.write_records(records, &|stored, incoming| {
            merge_duplicate_inputs(incoming);
            let mut changed = false;
            for q in incoming.iter_mut() {
                match stored.iter().position(|d| d.same_definition(q)) {
                    None => {
                        if q.bag().last_id == NULL_ID {
                            q.bag_mut().last_id =
                                next_free_id.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                        stored.push(q.clone());
                        changed = true;
                        let mut ch = changes.lock().unwrap();
                        push_short_changes(&mut ch, q.bag(), &q.seen());
                        ch.entry(R::ID_KIND)
                            .or_insert_with(Vec::new)
                            .push((q.bag().last_id, q.seen()));
                    }
                    Some(i) => {
                        let d = &mut stored[i];
                        if q.bag().last_id == NULL_ID || q.bag().last_id == d.bag().last_id {
                            let added = d.bag_mut().add(q.bag());
                            if !added.is_empty() {
                                changed = true;
                                push_short_changes(
                                    &mut changes.lock().unwrap(),
                                    &added,
                                    &q.seen(),
                                );
                            }
                            *q.bag_mut() = d.bag().clone();
                        } else {
                            q.bag_mut().clear();
                        }
                    }
                }
            }
            Ok(changed)
        })
    }

    /// Detaches the inputs' identifiers from their stored records; the
    /// actually-removed identifiers are reported for index cleanup.
    pub fn fetch_and_delete(
        &self,
        records: Vec<R>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<R>, Error> {
        self.db.write_records(records, &|stored, incoming| {
            merge_duplicate_inputs(incoming);
            let mut changed = false;
            for q in incoming.iter_mut() {
                let matched = stored.iter().position(|d| d.same_definition(q));
                match matched {
                    Some(i)
                        if q.bag().last_id == NULL_ID
                            || q.bag().last_id == stored[i].bag().last_id =>
                    {
                        let removed = stored[i].bag_mut().remove(q.bag());
                        if !removed.is_empty() {
                            changed = true;
                            push_short_changes(
                                &mut changes.lock().unwrap(),
                                &removed,
                                &q.seen(),
                            );
                        }
                        *q.bag_mut() = stored[i].bag().clone();
                    }
                    _ => q.bag_mut().clear(),
                }
            }
            Ok(changed)
        })
    }

    /// Removes the matching stored records entirely; every identifier they
    /// carried is reported for index cleanup.
    pub fn fetch_and_full_delete(
        &self,
        records: Vec<R>,
        changes: &Mutex<ChangedIds>,
    ) -> Result<Vec<R>, Error> {
        self.db.write_records(records, &|stored, incoming| {
            let mut changed = false;
            for q in incoming.iter_mut() {
                let matched = stored.iter().position(|d| d.same_definition(q));
                match matched {
                    Some(i)
                        if q.bag().last_id == NULL_ID
                            || q.bag().last_id == stored[i].bag().last_id =>
                    {
                        let removed = stored.remove(i);
                        if !removed.bag().is_empty() {
                            push_short_changes(
                                &mut changes.lock().unwrap(),
                                removed.bag(),
                                &q.seen(),
                            );
                        }
                        *q.bag_mut() = removed.bag().clone();
                        changed = true;
                    }
                    _ => q.bag_mut().clear(),
                }
            }
            Ok(changed)
        })
    }

    /// Scrubs every identifier of `kind` from all records stored under the
    /// inputs' keys.
    pub fn delete_identifiers(&self, records: Vec<R>, kind: IdentifierKind) -> Result<Vec<R>, Error> {
        self.db.write_records(records, &|stored, _incoming| {
            let mut changed = false;
            for d in stored.iter_mut() {
                if !d.bag_mut().remove_kind(kind).is_empty() {
                    changed = true;
                }
            }
            Ok(changed)
        })
    }
}
