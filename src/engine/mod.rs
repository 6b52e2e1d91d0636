//! The prefix-tree storage engine.
//!
//! A `Database` is one prefix tree over dense integer keys in a pair of
//! files: `<name>.index` (3 KiB index-node records, two alternating
//! half-pages each) and `<name>.data` (fixed-size data pages). Records are
//! opaque blobs; the engine only needs their length and (de)serializers.
//!
//! The three public verbs are batch-shaped: the batch is sorted by key,
//! fanned out over independent sub-trees on the worker pool, and the
//! visitor is invoked exactly once per distinct key. Update visitors may
//! rewrite the stored record set for their key; every touched leaf is
//! repacked into fresh pages and the node's alternate half-page is written
//! last, so a crash at any point leaves the previous revision readable.

pub mod index_node;
pub mod page_cache;
pub mod paged_file;
pub mod tasks;

use crate::bytes::{ByteReader, ByteWriter};
use crate::engine::index_node::{IndexNode, PendingWrites, Shared, INDEX_PAGE_SIZE};
use crate::engine::page_cache::PageCache;
use crate::engine::paged_file::PagedFile;
use crate::engine::tasks::WorkerPools;
use crate::Error;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_DATA_PAGE_SIZE: usize = 8 * 1024;

/// One stored blob tied to an integer key. `save` must emit exactly
/// `data_len()` bytes and `load` must consume them.
pub trait Record: Send + Sized + 'static {
    /// Key width on disk; 4 for 32-bit keyed tables, 5 for protein keys.
    const KEY_BYTES: usize;
    fn key(&self) -> u64;
    fn data_len(&self) -> usize;
    fn save(&self, out: &mut ByteWriter);
    fn load(key: u64, input: &mut ByteReader) -> Result<Self, Error>;
}

/// Read visitor: `(records stored under the key, batch records with that
/// key)`. May rewrite the batch records, never the stored ones.
pub type ReadFn<'v, R> = &'v (dyn Fn(&[R], &mut [R]) + Sync);

/// Update visitor: may append to / remove from the stored set and rewrite
/// the batch records. `Ok(true)` persists the changes for the touched leaf;
/// an error discards every pending change of the node and aborts the batch.
pub type UpdateFn<'v, R> = &'v (dyn Fn(&mut Vec<R>, &mut [R]) -> Result<bool, Error> + Sync);

/// First error wins; concurrent sub-tree tasks only ever add errors.
pub(crate) struct ErrorSink(Mutex<Option<Error>>);

impl ErrorSink {
    pub fn new() -> ErrorSink {
        ErrorSink(Mutex::new(None))
    }

    pub fn set(&self, err: Error) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn into_result(self) -> Result<(), Error> {
        match self.0.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct Database<R: Record> {
    shared: Arc<Shared>,
    root: Arc<IndexNode<R>>,
    pools: Arc<WorkerPools>,
    newly_created: bool,
}

fn with_suffix(basename: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = basename.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl<R: Record> Database<R> {
    /// Opens (creating if absent) the `<basename>.index` / `<basename>.data`
    /// pair. The data-file free list is rebuilt from the live tree and the
    /// file trimmed to its last used page.
    pub fn open(
        basename: &Path,
        page_size: usize,
        cache_megabytes: u64,
        pools: Arc<WorkerPools>,
    ) -> Result<Database<R>, Error> {
        let index_file = PagedFile::open(&with_suffix(basename, ".index"), INDEX_PAGE_SIZE)?;
        let data_file = PagedFile::open(&with_suffix(basename, ".data"), page_size)?;
        let shared = Arc::new(Shared {
            index_pages: PageCache::new(index_file, cache_megabytes),
            data_pages: PageCache::new(data_file, cache_megabytes),
        });

        let index_pages = shared.index_pages.num_pages();
        if index_pages % 2 == 1 {
            return Err(Error::AssertionFailed("odd number of index pages"));
        }
        let newly_created = index_pages == 0;

        let root = if newly_created {
            let mut pending = PendingWrites::default();
            let root = IndexNode::build(&shared, 0, Vec::new(), &mut pending)?;
            shared.data_pages.write_back(pending.data)?;
            shared.index_pages.write_back(pending.index)?;
            root
        } else {
            IndexNode::load(&shared, 0)?
        };

        // reconstruct the data-file free list from the tree
        let data_pages = shared.data_pages.num_pages();
        let mut used = vec![false; data_pages as usize];
        root.mark_used_data_pages(&mut used);
        let mut live_pages = data_pages;
        while live_pages > 0 && !used[live_pages as usize - 1] {
            live_pages -= 1;
        }
        let mut free_runs: BTreeMap<u32, u32> = BTreeMap::new();
        let mut i = 0;
        while i < live_pages {
            if used[i as usize] {
                i += 1;
                continue;
            }
            let start = i;
            while i < live_pages && !used[i as usize] {
                i += 1;
            }
            free_runs.insert(start, i - start);
        }
        shared.data_pages.set_free_pages(live_pages, &free_runs)?;

        Ok(Database { shared, root, pools, newly_created })
    }

    pub fn is_newly_created(&self) -> bool {
        self.newly_created
    }

    /// Calls the visitor exactly once per distinct key of the batch, with
    /// the records stored under that key. Batch records come back (sorted
    /// by key) with whatever the visitor wrote into them.
    pub fn read_records(
        &self,
        mut records: Vec<R>,
        visitor: ReadFn<R>,
    ) -> Result<Vec<R>, Error> {
        if records.is_empty() {
            return Ok(records);
        }
        records.sort_by_key(|r| r.key());
        let errors = ErrorSink::new();
        {
            let shared = &*self.shared;
            let root = &self.root;
            let errs = &errors;
            let chunk = &mut records[..];
            self.pools.cpu.scope(move |scope| {
                root.read_records(shared, scope, chunk, visitor, errs);
            });
        }
        errors.into_result()?;
        Ok(records)
    }

    /// Like `read_records` but the visitor may change the stored record set.
    pub fn write_records(
        &self,
        mut records: Vec<R>,
        visitor: UpdateFn<R>,
    ) -> Result<Vec<R>, Error> {
        if records.is_empty() {
            return Ok(records);
        }
        records.sort_by_key(|r| r.key());
        let errors = ErrorSink::new();
        {
            let shared = &*self.shared;
            let root = &self.root;
            let errs = &errors;
            let chunk = &mut records[..];
            self.pools.cpu.scope(move |scope| {
                root.write_records(shared, scope, chunk, visitor, errs);
            });
        }
        errors.into_result()?;
        Ok(records)
    }

    /// Ascending-key traversal over `[first, last]`; chunks of at least
    /// `min_chunk` records per visitor call (the final call may be smaller
    /// and is flagged). The visitor returns true to stop early.
    pub fn read_records_in_order(
        &self,
        visitor: &mut dyn FnMut(Vec<R>, bool) -> Result<bool, Error>,
        first: u64,
        last: u64,
        min_chunk: usize,
    ) -> Result<(), Error> {
        let mut buffer = Vec::new();
        self.root
            .read_records_in_order(&self.shared, &mut buffer, visitor, first, last, min_chunk)?;
        Ok(())
    }

    pub fn largest_key(&self) -> Result<u64, Error> {
        self.root.largest_key(&self.shared)
    }

    pub fn record_count(&self) -> Result<u64, Error> {
        let shared = &*self.shared;
        let root = &self.root;
        self.pools.io.scope(move |_| root.record_count(shared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Key plus a little variable payload, like the engine's real records.
    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Blob {
        key: u64,
        payload: Vec<u8>,
    }

    impl Blob {
        fn new(key: u64, payload: &[u8]) -> Blob {
            Blob { key, payload: payload.to_vec() }
        }
    }

    impl Record for Blob {
        const KEY_BYTES: usize = 4;
        fn key(&self) -> u64 {
            self.key
        }
        fn data_len(&self) -> usize {
            1 + self.payload.len()
        }
        fn save(&self, out: &mut ByteWriter) {
            out.put_uint(self.payload.len() as u64, 1);
            out.put_slice(&self.payload);
        }
        fn load(key: u64, input: &mut ByteReader) -> Result<Blob, Error> {
            let n = input.read_uint(1)? as usize;
            Ok(Blob { key, payload: input.advance(n)?.to_vec() })
        }
    }

    fn open_db(dir: &Path) -> Database<Blob> {
        let pools = WorkerPools::new(2, 1).unwrap();
        Database::open(&dir.join("t"), 512, 4, pools).unwrap()
    }

    fn insert_all(db: &Database<Blob>, records: Vec<Blob>) {
        db.write_records(records, &|current, incoming| {
            for r in incoming.iter() {
                current.push(r.clone());
            }
            Ok(true)
        })
        .unwrap();
    }

    fn read_all(db: &Database<Blob>) -> Vec<Blob> {
        let mut out = Vec::new();
        db.read_records_in_order(
            &mut |chunk, _last| {
                out.extend(chunk);
                Ok(false)
            },
            0,
            u64::MAX,
            1,
        )
        .unwrap();
        out
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        assert!(db.is_newly_created());
        insert_all(&db, vec![
            Blob::new(1_000_000, b"snp-a"),
            Blob::new(2, b"tiny"),
            Blob::new(0xfedcba, b"far"),
        ]);

        let got = db
            .read_records(vec![Blob::new(1_000_000, b""), Blob::new(7, b"")], &|db_recs, queried| {
                for q in queried.iter_mut() {
                    if let Some(hit) = db_recs.first() {
                        q.payload = hit.payload.clone();
                    }
                }
            })
            .unwrap();
        assert_eq!(got[0].payload, b"");
        assert_eq!(got[1].payload, b"snp-a");
        assert_eq!(db.record_count().unwrap(), 3);
        assert_eq!(db.largest_key().unwrap(), 0xfedcba);
    }

    #[test]
    fn duplicate_keys_are_a_multiset() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        insert_all(&db, vec![
            Blob::new(10, b"one"),
            Blob::new(10, b"two"),
            Blob::new(10, b"three"),
        ]);
        let seen = AtomicUsize::new(0);
        db.read_records(vec![Blob::new(10, b"")], &|db_recs, _q| {
            seen.store(db_recs.len(), Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn visitor_runs_once_per_key_in_order() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        insert_all(&db, vec![Blob::new(5, b"x")]);
        let keys = Mutex::new(Vec::new());
        db.read_records(
            vec![Blob::new(9, b""), Blob::new(5, b""), Blob::new(9, b""), Blob::new(5, b"")],
            &|_db, queried| {
                keys.lock().unwrap().push(queried[0].key());
                assert_eq!(queried.len(), 2);
            },
        )
        .unwrap();
        assert_eq!(*keys.lock().unwrap(), vec![5, 9]);
    }

    #[test]
    fn in_order_scan_is_sorted_and_complete() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        let mut records = Vec::new();
        for i in 0..500u64 {
            records.push(Blob::new(i * 37 % 10_000, &format!("r{}", i).into_bytes()));
        }
        insert_all(&db, records.clone());
        let got = read_all(&db);
        assert_eq!(got.len(), 500);
        let keys: Vec<u64> = got.iter().map(|b| b.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        records.sort();
        let mut got_sorted = got;
        got_sorted.sort();
        assert_eq!(got_sorted, records);
    }

    #[test]
    fn range_scan_respects_bounds() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        insert_all(&db, (0..100u64).map(|i| Blob::new(i, b"p")).collect());
        let mut seen = Vec::new();
        db.read_records_in_order(
            &mut |chunk, _last| {
                seen.extend(chunk.into_iter().map(|b| b.key));
                Ok(false)
            },
            10,
            19,
            1,
        )
        .unwrap();
        assert_eq!(seen, (10..=19).collect::<Vec<u64>>());

    }

    #[test]
    fn early_stop_skips_later_subtrees() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        // large payloads split the records over several child nodes, so
        // chunks arrive one subtree at a time
        insert_all(&db, (0..300u64).map(|i| Blob::new(0xab00_0000 + i, &[7u8; 64])).collect());
        let mut first_chunk_only = 0;
        db.read_records_in_order(
            &mut |chunk, _last| {
                first_chunk_only += chunk.len();
                Ok(true)
            },
            0,
            u64::MAX,
            8,
        )
        .unwrap();
        assert!(first_chunk_only >= 8);
        assert!(first_chunk_only < 300);
    }

    #[test]
    fn update_and_delete_records() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        insert_all(&db, vec![Blob::new(50, b"old"), Blob::new(60, b"keep")]);
        // rewrite key 50
        db.write_records(vec![Blob::new(50, b"new")], &|current, incoming| {
            current.clear();
            current.push(incoming[0].clone());
            Ok(true)
        })
        .unwrap();
        // delete key 60
        db.write_records(vec![Blob::new(60, b"")], &|current, _incoming| {
            current.clear();
            Ok(true)
        })
        .unwrap();
        let all = read_all(&db);
        assert_eq!(all, vec![Blob::new(50, b"new")]);
    }

    #[test]
    fn visitor_error_discards_node_changes() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        insert_all(&db, vec![Blob::new(5, b"keep")]);
        let result = db.write_records(vec![Blob::new(5, b"boom")], &|current, _incoming| {
            current.clear();
            Err(Error::AssertionFailed("visitor failure"))
        });
        assert!(result.is_err());
        assert_eq!(read_all(&db), vec![Blob::new(5, b"keep")]);
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let records: Vec<Blob> = (0..300u64).map(|i| Blob::new(i * 11, b"persist")).collect();
        {
            let db = open_db(tmp.path());
            insert_all(&db, records.clone());
        }
        let db = open_db(tmp.path());
        assert!(!db.is_newly_created());
        let mut expected = records;
        expected.sort();
        assert_eq!(read_all(&db), expected);
    }

    #[test]
    fn grows_past_one_page_and_deepens() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        // 300 records with 64-byte payloads inside one 256-key subtree do
        // not fit one 512-byte page: the tree must deepen and still serve
        // every key
        let records: Vec<Blob> =
            (0..300u64).map(|i| Blob::new(0xab00_0000 + i, &[i as u8; 64])).collect();
        insert_all(&db, records.clone());
        let mut expected = records;
        expected.sort();
        assert_eq!(read_all(&db), expected);
        assert_eq!(db.record_count().unwrap(), 300);
        assert_eq!(db.largest_key().unwrap(), 0xab00_0000 + 299);
    }

    #[test]
    fn torn_write_recovers_previous_state() {
        use std::io::{Read, Seek, SeekFrom, Write};
        let tmp = TempDir::new().unwrap();
        let index_path = tmp.path().join("t.index");
        {
            let db = open_db(tmp.path());
            insert_all(&db, vec![Blob::new(3, b"stable")]);
        }
        // capture the index file, apply another write, then tear the new
        // half-page by restoring the old index bytes (data pages keep both
        // revisions, so this is exactly the crash-before-half-page window)
        let mut stable_index = Vec::new();
        std::fs::File::open(&index_path).unwrap().read_to_end(&mut stable_index).unwrap();
        {
            let db = open_db(tmp.path());
            db.write_records(vec![Blob::new(3, b"doomed")], &|current, incoming| {
                current.clear();
                current.push(incoming[0].clone());
                Ok(true)
            })
            .unwrap();
        }
        let mut f = std::fs::OpenOptions::new().write(true).open(&index_path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&stable_index).unwrap();
        drop(f);

        let db = open_db(tmp.path());
        assert_eq!(read_all(&db), vec![Blob::new(3, b"stable")]);
    }
}
