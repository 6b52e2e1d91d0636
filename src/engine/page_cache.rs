//! Buffer cache over a PagedFile, keyed by whole page runs.
//!
//! Entries are filled exactly once: the first acquirer reads from disk with
//! the cache mutex released, everyone else waits on the condvar until the
//! bytes are published. Pins are explicit; an entry joins the eviction queue
//! only when its last pin drops. A run flagged deleted gives its pages back
//! to the file instead.

use crate::engine::paged_file::PagedFile;
use crate::{Error, HashMap};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

type RunKey = (u32, u32);

struct Entry {
    data: Option<Arc<Vec<u8>>>,
    pins: u32,
    deleted: bool,
    in_lru: bool,
}

struct CacheInner {
    entries: HashMap<RunKey, Entry>,
    // most-recently-released at the front; stale keys skipped on eviction
    lru: VecDeque<RunKey>,
    cached_pages: u64,
}

pub struct PageCache {
    file: PagedFile,
    max_pages: u64,
    inner: Mutex<CacheInner>,
    filled: Condvar,
}

impl PageCache {
    pub fn new(file: PagedFile, cache_megabytes: u64) -> PageCache {
        let max_pages = (cache_megabytes * 1024 * 1024 / file.page_size() as u64).max(1);
        PageCache {
            file,
            max_pages,
            inner: Mutex::new(CacheInner {
                entries: HashMap::default(),
                lru: VecDeque::new(),
                cached_pages: 0,
            }),
            filled: Condvar::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    pub fn num_pages(&self) -> u32 {
        self.file.num_pages()
    }

    pub fn allocate(&self, count: u32) -> Result<u32, Error> {
        self.file.allocate(count)
    }

    pub fn set_free_pages(
        &self,
        new_pages: u32,
        runs: &std::collections::BTreeMap<u32, u32>,
    ) -> Result<(), Error> {
        self.file.set_free_pages(new_pages, runs)
    }

    /// Pinned view of a page run; the caller must pair this with `release`.
    pub fn load(&self, first_page: u32, count: u32) -> Result<Arc<Vec<u8>>, Error> {
        if count == 0 {
            return Ok(Arc::new(Vec::new()));
        }
        enum Found {
            Missing,
            Ready(Arc<Vec<u8>>),
            Filling,
        }
        let key = (first_page, count);
        let mut inner = self.inner.lock().unwrap();
        loop {
            let found = match inner.entries.get_mut(&key) {
                None => Found::Missing,
                Some(e) => match &e.data {
                    Some(data) => {
                        e.pins += 1;
                        e.in_lru = false;
                        Found::Ready(data.clone())
                    }
                    None => Found::Filling,
                },
            };
            match found {
                Found::Missing => break,
                Found::Ready(data) => return Ok(data),
                // someone else is filling this entry
                Found::Filling => inner = self.filled.wait(inner).unwrap(),
            }
        }
        inner.entries.insert(
            key,
            Entry { data: None, pins: 1, deleted: false, in_lru: false },
        );
        inner.cached_pages += u64::from(count);
        self.evict(&mut inner);
        drop(inner);

        let read = self.file.read(first_page, count);
        let mut inner = self.inner.lock().unwrap();
        match read {
            Ok(bytes) => {
                let data = Arc::new(bytes);
                match inner.entries.get_mut(&key) {
                    Some(e) => e.data = Some(data.clone()),
                    None => {
                        self.filled.notify_all();
                        return Err(Error::AssertionFailed("cache entry vanished while filling"));
                    }
                }
                self.filled.notify_all();
                Ok(data)
            }
            Err(err) => {
                inner.entries.remove(&key);
                inner.cached_pages -= u64::from(count);
                self.filled.notify_all();
                Err(err)
            }
        }
    }

    /// Registers freshly written pages as a completed, pinned entry.
    pub fn insert(&self, first_page: u32, count: u32, bytes: Vec<u8>) -> Arc<Vec<u8>> {
        debug_assert_eq!(bytes.len(), count as usize * self.page_size());
        let data = Arc::new(bytes);
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            (first_page, count),
            Entry { data: Some(data.clone()), pins: 1, deleted: false, in_lru: false },
        );
        inner.cached_pages += u64::from(count);
        self.evict(&mut inner);
        data
    }

    pub fn release(&self, first_page: u32, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let key = (first_page, count);
        let mut inner = self.inner.lock().unwrap();
        let deleted = {
            let e = inner
                .entries
                .get_mut(&key)
                .ok_or(Error::AssertionFailed("releasing a page run that is not cached"))?;
            if e.pins == 0 {
                return Err(Error::AssertionFailed("releasing a page run that is not pinned"));
            }
            e.pins -= 1;
            if e.pins > 0 {
                return Ok(());
            }
            if !e.deleted {
                e.in_lru = true;
            }
            e.deleted
        };
        if deleted {
            inner.entries.remove(&key);
            inner.cached_pages -= u64::from(count);
            self.file.release(first_page, count)?;
        } else {
            inner.lru.push_front(key);
            self.evict(&mut inner);
        }
        Ok(())
    }

    /// Flags a run for deletion: its pages go back to the file as soon as the
    /// last pin drops (immediately, when nobody holds it).
    pub fn mark_deleted(&self, first_page: u32, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        enum Action {
            Deferred,
            DropEntry,
            FileOnly,
        }
        let key = (first_page, count);
        let mut inner = self.inner.lock().unwrap();
        let action = match inner.entries.get_mut(&key) {
            Some(e) if e.pins > 0 => {
                e.deleted = true;
                e.in_lru = false;
                Action::Deferred
            }
            Some(_) => Action::DropEntry,
            None => Action::FileOnly,
        };
        match action {
            Action::Deferred => Ok(()),
            Action::DropEntry => {
                inner.entries.remove(&key);
                inner.cached_pages -= u64::from(count);
                self.file.release(first_page, count)
            }
            Action::FileOnly => self.file.release(first_page, count),
        }
    }

    /// Writes page runs through to the file, lowest page first. Runs are not
    /// merged; callers keep them disjoint.
    pub fn write_back(&self, mut writes: Vec<(u32, Vec<u8>)>) -> Result<(), Error> {
        writes.sort_by_key(|(page, _)| *page);
        for (page, bytes) in writes {
            self.file.write(page, &bytes)?;
        }
        Ok(())
    }

    fn evict(&self, inner: &mut CacheInner) {
        while inner.cached_pages > self.max_pages {
            let key = match inner.lru.pop_back() {
                Some(k) => k,
                None => return,
            };
            let stale = match inner.entries.get(&key) {
                Some(e) => e.pins > 0 || !e.in_lru,
                None => true,
            };
            if stale {
                continue;
            }
            inner.entries.remove(&key);
            inner.cached_pages -= u64::from(key.1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn cache(dir: &TempDir, megs: u64) -> PageCache {
        let file = PagedFile::open(&dir.path().join("c.data"), 512).unwrap();
        PageCache::new(file, megs)
    }

    #[test]
    fn load_caches_and_pins() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let c = cache(&tmp, 1);
        let p = c.allocate(2)?;
        c.write_back(vec![(p, vec![9u8; 1024])])?;
        let b1 = c.load(p, 2)?;
        let b2 = c.load(p, 2)?;
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(b1[0], 9);
        c.release(p, 2)?;
        c.release(p, 2)?;
        assert!(c.release(p, 2).is_err());
        Ok(())
    }

    #[test]
    fn eviction_frees_unpinned_only() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        // 2 KiB budget = 4 pages of 512
        let file = PagedFile::open(&tmp.path().join("c.data"), 512)?;
        let c = PageCache { max_pages: 4, ..PageCache::new(file, 1) };
        let a = c.allocate(2)?;
        let b = c.allocate(2)?;
        let d = c.allocate(2)?;
        c.write_back(vec![
            (a, vec![1u8; 1024]),
            (b, vec![2u8; 1024]),
            (d, vec![3u8; 1024]),
        ])?;
        let _pa = c.load(a, 2)?;
        let pb = c.load(b, 2)?;
        drop(pb);
        c.release(b, 2)?;
        // loading d (2 pages) pushes the cache to 6 pages; b is evictable, a pinned
        let _pd = c.load(d, 2)?;
        let inner = c.inner.lock().unwrap();
        assert!(inner.entries.contains_key(&(a, 2)));
        assert!(!inner.entries.contains_key(&(b, 2)));
        assert!(inner.entries.contains_key(&(d, 2)));
        Ok(())
    }

    #[test]
    fn mark_deleted_returns_pages() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let c = cache(&tmp, 1);
        let a = c.allocate(4)?;
        c.write_back(vec![(a, vec![5u8; 4 * 512])])?;
        let _pinned = c.load(a, 4)?;
        c.mark_deleted(a, 4)?;
        // still pinned: the run is not reusable yet
        assert_eq!(c.allocate(4)?, a + 4);
        c.release(a, 4)?;
        // now it is
        assert_eq!(c.allocate(4)?, a);
        Ok(())
    }

    #[test]
    fn concurrent_loads_fill_once() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let c = Arc::new(cache(&tmp, 4));
        let p = c.allocate(2)?;
        c.write_back(vec![(p, vec![42u8; 1024])])?;
        let hits = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            let hits = hits.clone();
            handles.push(std::thread::spawn(move || {
                let b = c.load(p, 2).unwrap();
                if b[0] == 42 {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
                c.release(p, 2).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 8);
        Ok(())
    }
}
