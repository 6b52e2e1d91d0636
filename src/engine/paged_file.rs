//! One flat file split into fixed-size pages, with a best-fit free list.
//!
//! The file only grows in big steps (multiples of 4096 pages); free runs are
//! coalesced on release. All sizing state sits behind a mutex; positioned
//! reads and writes go straight to the descriptor and may run from many
//! threads at once.

use crate::Error;
use fs2::FileExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as UnixFileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct FreeList {
    pages: u32,
    by_start: BTreeMap<u32, u32>,
    by_len: BTreeMap<u32, BTreeSet<u32>>,
    allocated_since_open: bool,
}

impl FreeList {
    fn insert_run(&mut self, start: u32, len: u32) {
        self.by_start.insert(start, len);
        self.by_len.entry(len).or_insert_with(BTreeSet::new).insert(start);
    }

    fn remove_run(&mut self, start: u32, len: u32) {
        self.by_start.remove(&start);
        if let Some(set) = self.by_len.get_mut(&len) {
            set.remove(&start);
            if set.is_empty() {
                self.by_len.remove(&len);
            }
        }
    }
}

pub struct PagedFile {
    file: File,
    path: PathBuf,
    page_size: usize,
    state: Mutex<FreeList>,
}

impl PagedFile {
    /// Opens (creating if needed) and takes the exclusive lock. The file size
    /// must be a whole number of pages; every page starts out allocated.
    pub fn open(path: &Path, page_size: usize) -> Result<PagedFile, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::from(e).with_context(format!("opening {}", path.display())))?;
        if file.try_lock_exclusive().is_err() {
            return Err(Error::LockedByAnotherProcess(path.to_path_buf()));
        }
        let file_len = file.metadata()?.len();
        if file_len % page_size as u64 != 0 {
            return Err(Error::AssertionFailed(
                "file size is not a multiple of the page size",
            ));
        }
        Ok(PagedFile {
            file,
            path: path.to_path_buf(),
            page_size,
            state: Mutex::new(FreeList {
                pages: (file_len / page_size as u64) as u32,
                by_start: BTreeMap::new(),
                by_len: BTreeMap::new(),
                allocated_since_open: false,
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> u32 {
        self.state.lock().unwrap().pages
    }

    /// Best-fit: the smallest free run that holds `count` pages; splits the
    /// remainder back into the free list. Grows the file when nothing fits.
    pub fn allocate(&self, count: u32) -> Result<u32, Error> {
        assert!(count > 0);
        let mut st = self.state.lock().unwrap();
        st.allocated_since_open = true;
        let best_fit = st
            .by_len
            .range(count..)
            .next()
            .map(|(&len, starts)| (len, *starts.iter().next().expect("by_len set never empty")));
        if let Some((run_len, start)) = best_fit {
            st.remove_run(start, run_len);
            if run_len > count {
                st.insert_run(start + count, run_len - count);
            }
            return Ok(start);
        }
        // nothing fits: extend by at least 4096 pages
        let start = st.pages;
        let growth = (count / 4096 + 1).max(st.pages / 4096 / 3) * 4096;
        let new_len = (st.pages as u64 + growth as u64) * self.page_size as u64;
        self.file
            .set_len(new_len)
            .map_err(|e| Error::from(e).with_context(format!("growing {}", self.path.display())))?;
        tracing::debug!(file = %self.path.display(), pages = st.pages + growth, "page file grown");
        st.pages += growth;
        st.insert_run(start + count, growth - count);
        Ok(start)
    }

    /// Returns a run to the free list, coalescing with free neighbours.
    pub fn release(&self, page_id: u32, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let mut st = self.state.lock().unwrap();
        let mut start = page_id;
        let mut len = count;
        let next = st.by_start.range(page_id..).next().map(|(&s, &l)| (s, l));
        if let Some((next_start, next_len)) = next {
            if next_start < page_id + count {
                return Err(Error::AssertionFailed("page run released twice"));
            }
            if next_start == page_id + count {
                st.remove_run(next_start, next_len);
                len += next_len;
            }
        }
        let prev = st.by_start.range(..page_id).next_back().map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len > page_id {
                return Err(Error::AssertionFailed("page run released twice"));
            }
            if prev_start + prev_len == page_id {
                st.remove_run(prev_start, prev_len);
                start = prev_start;
                len += prev_len;
            }
        }
        st.insert_run(start, len);
        Ok(())
    }

    pub fn write(&self, page_id: u32, buf: &[u8]) -> Result<(), Error> {
        debug_assert!(buf.len() % self.page_size == 0);
        let offset = page_id as u64 * self.page_size as u64;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::from(e).with_context(format!("writing {}", self.path.display())))
    }

    pub fn read(&self, page_id: u32, count: u32) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; count as usize * self.page_size];
        let offset = page_id as u64 * self.page_size as u64;
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::from(e).with_context(format!("reading {}", self.path.display())))?;
        Ok(buf)
    }

    /// One-shot startup trim: shrink to `new_pages` and install the free
    /// runs reconstructed from the live tree. Only legal before the first
    /// allocation.
    pub fn set_free_pages(&self, new_pages: u32, runs: &BTreeMap<u32, u32>) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        if st.allocated_since_open || !st.by_start.is_empty() {
            return Err(Error::AssertionFailed("set_free_pages after allocation"));
        }
        if st.pages < new_pages {
            return Err(Error::AssertionFailed("set_free_pages cannot grow the file"));
        }
        if st.pages > new_pages {
            self.file
                .set_len(new_pages as u64 * self.page_size as u64)
                .map_err(|e| {
                    Error::from(e).with_context(format!("truncating {}", self.path.display()))
                })?;
            st.pages = new_pages;
        }
        for (&start, &len) in runs {
            st.insert_run(start, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn allocate_grows_in_big_steps() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let f = PagedFile::open(&tmp.path().join("t.data"), 512)?;
        assert_eq!(f.num_pages(), 0);
        let p = f.allocate(3)?;
        assert_eq!(p, 0);
        assert_eq!(f.num_pages(), 4096);
        // the tail of the growth is immediately reusable
        let q = f.allocate(10)?;
        assert_eq!(q, 3);
        Ok(())
    }

    #[test]
    fn best_fit_and_coalescing() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let f = PagedFile::open(&tmp.path().join("t.data"), 512)?;
        let a = f.allocate(4)?;
        let b = f.allocate(4)?;
        let c = f.allocate(4)?;
        assert_eq!((a, b, c), (0, 4, 8));
        f.release(a, 4)?;
        f.release(c, 4)?;
        // two separate 4-page holes; a 4-page ask picks one exactly
        assert_eq!(f.allocate(4)?, 0);
        // releasing b merges with the hole at c
        f.release(b, 4)?;
        assert_eq!(f.allocate(8)?, 4);
        Ok(())
    }

    #[test]
    fn double_release_is_detected() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let f = PagedFile::open(&tmp.path().join("t.data"), 512)?;
        let a = f.allocate(2)?;
        f.release(a, 2)?;
        assert!(f.release(a, 2).is_err());
        Ok(())
    }

    #[test]
    fn write_read_roundtrip() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let f = PagedFile::open(&tmp.path().join("t.data"), 512)?;
        let p = f.allocate(2)?;
        let data = vec![0xabu8; 1024];
        f.write(p, &data)?;
        assert_eq!(f.read(p, 2)?, data);
        Ok(())
    }

    #[test]
    fn startup_trim() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("t.data");
        {
            let f = PagedFile::open(&path, 512)?;
            f.allocate(8)?;
            f.write(0, &vec![7u8; 8 * 512])?;
        }
        let f = PagedFile::open(&path, 512)?;
        assert_eq!(f.num_pages(), 4096);
        let mut runs = BTreeMap::new();
        runs.insert(2u32, 3u32);
        f.set_free_pages(8, &runs)?;
        assert_eq!(f.num_pages(), 8);
        // the installed hole is used before the file grows again
        assert_eq!(f.allocate(2)?, 2);
        Ok(())
    }

    #[test]
    fn second_opener_is_rejected() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("t.data");
        let _f = PagedFile::open(&path, 512)?;
        match PagedFile::open(&path, 512) {
            Err(Error::LockedByAnotherProcess(_)) => Ok(()),
            other => panic!("expected lock failure, got {:?}", other.map(|_| ())),
        }
    }
}
