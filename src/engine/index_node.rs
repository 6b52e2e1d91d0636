//! Index nodes of the prefix tree.
//!
//! A node routes one 8-bit slice of the key through 256 slots. Each slot
//! belongs either to a data leaf shared with its neighbours (a contiguous
//! slot interval packed into one data page) or, once an interval would no
//! longer fit a page even as a single slot, to a child index node handling
//! the next key byte. `levels[slot]` records the rooted level of the
//! interval owning the slot; `leaves[slot]` names the data page or child
//! node page.
//!
//! On disk a node is two alternating 1536-byte half-pages; the half with the
//! highest valid revision wins at load, and writes always go to the other
//! half, after the data pages they reference. A torn write therefore leaves
//! the previous revision intact.

use crate::bytes::{crc32, shift_right, var_uint_len, ByteReader, ByteWriter};
use crate::engine::page_cache::PageCache;
use crate::engine::{ErrorSink, ReadFn, Record, UpdateFn};
use crate::{Error, HashMap};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub(crate) const SENTINEL: u32 = u32::MAX;
pub(crate) const INDEX_PAGE_SIZE: usize = 1536;
const SLOTS: usize = 256;
const DATA_NODE_HEADER: usize = 2;

pub(crate) struct Shared {
    pub index_pages: PageCache,
    pub data_pages: PageCache,
}

/// Page writes accumulated while building subtrees; flushed data-first so an
/// index half-page never points at unwritten pages.
#[derive(Default)]
pub(crate) struct PendingWrites {
    pub data: Vec<(u32, Vec<u8>)>,
    pub index: Vec<(u32, Vec<u8>)>,
}

pub(crate) struct IndexNode<R: Record> {
    pub page_id: u32,
    level: usize,
    leftmost_key: u64,
    state: RwLock<NodeState<R>>,
}

struct NodeState<R: Record> {
    revision: u32,
    levels: [u8; SLOTS],
    leaves: [u32; SLOTS],
    first_data_page: u32,
    data_page_count: u32,
    children: HashMap<u32, Arc<IndexNode<R>>>,
}

// ---------------------------------------------------------------- slot tree

fn slot_leftmost(slot: usize, rooted_level: u8) -> usize {
    let h = 8 - rooted_level as usize;
    (slot >> h) << h
}

fn slot_span(rooted_level: u8) -> usize {
    1 << (8 - rooted_level as usize)
}

/// The data page (or child page) serving `slot`, scanning its whole
/// interval: slots without records stay SENTINEL even inside a live leaf.
fn bucket_of(levels: &[u8; SLOTS], leaves: &[u32; SLOTS], slot: usize) -> u32 {
    let lm = slot_leftmost(slot, levels[slot]);
    for i in 0..slot_span(levels[slot]) {
        if leaves[lm + i] != SENTINEL {
            return leaves[lm + i];
        }
    }
    SENTINEL
}

fn max_bucket(leaves: &[u32; SLOTS]) -> Option<u32> {
    let mut max = None;
    for i in 0..SLOTS {
        if leaves[i] == SENTINEL {
            continue;
        }
        if max.map_or(true, |m| m < leaves[i]) {
            max = Some(leaves[i]);
        }
    }
    max
}

/// Number of distinct data pages (leaf intervals below the full height).
fn data_bucket_count(levels: &[u8; SLOTS], leaves: &[u32; SLOTS]) -> u32 {
    let mut count = 0;
    let mut last = SENTINEL;
    for i in 0..SLOTS {
        if leaves[i] == SENTINEL || levels[i] == 8 {
            continue;
        }
        if leaves[i] != last {
            last = leaves[i];
            count += 1;
        }
    }
    count
}

fn min_data_bucket(levels: &[u8; SLOTS], leaves: &[u32; SLOTS]) -> Option<u32> {
    let mut min = None;
    for i in 0..SLOTS {
        if leaves[i] == SENTINEL || levels[i] == 8 {
            continue;
        }
        if min.map_or(true, |m| m > leaves[i]) {
            min = Some(leaves[i]);
        }
    }
    min
}

/// Recomputes `levels`/`leaves` over one subtree from per-slot byte sizes:
/// halve the interval until the payload fits a page; intervals still too
/// large as single slots are pushed to the full height (child nodes).
/// Every non-empty interval gets a fresh bucket id from `next_bucket`.
fn overwrite_slots(
    levels: &mut [u8; SLOTS],
    leaves: &mut [u32; SLOTS],
    sizes: &BTreeMap<usize, u64>,
    next_bucket: &mut u32,
    rooted_level: u8,
    leaf_capacity: u64,
) -> Result<(), Error> {
    let first_slot = *sizes.keys().next().ok_or(Error::AssertionFailed(
        "subtree overwrite without any records",
    ))?;
    let last_slot = *sizes.keys().next_back().unwrap();
    let leftmost = slot_leftmost(first_slot, rooted_level);
    if leftmost != slot_leftmost(last_slot, rooted_level) {
        return Err(Error::AssertionFailed("records cross subtree boundaries"));
    }
    let span = slot_span(rooted_level);

    let mut cumulative = vec![0u64; span + 1];
    for (&slot, &size) in sizes {
        cumulative[slot - leftmost + 1] += size;
    }
    for i in 1..=span {
        cumulative[i] += cumulative[i - 1];
    }

    for i in 0..span {
        leaves[leftmost + i] = SENTINEL;
    }

    let mut intervals = vec![(0usize, span)];
    for level in rooted_level..8 {
        let mut next_intervals = Vec::new();
        for (a, b) in intervals {
            if cumulative[b] - cumulative[a] <= leaf_capacity {
                for i in a..b {
                    levels[leftmost + i] = level;
                }
                if cumulative[b] != cumulative[a] {
                    let bucket = *next_bucket;
                    *next_bucket += 1;
                    for i in a..b {
                        if cumulative[i + 1] != cumulative[i] {
                            leaves[leftmost + i] = bucket;
                        }
                    }
                }
            } else {
                let mid = (a + b) / 2;
                next_intervals.push((a, mid));
                next_intervals.push((mid, b));
            }
        }
        intervals = next_intervals;
    }
    for (a, _b) in intervals {
        levels[leftmost + a] = 8;
        if cumulative[a + 1] != cumulative[a] {
            leaves[leftmost + a] = *next_bucket;
            *next_bucket += 1;
        }
    }
    Ok(())
}

// ------------------------------------------------------------- data nodes

fn data_node_len<R: Record>(level: usize, records: &[R]) -> u64 {
    let suffix = R::KEY_BYTES - level;
    let mut len = DATA_NODE_HEADER as u64;
    for r in records {
        let n = r.data_len() as u64;
        len += suffix as u64 + var_uint_len(n, 1, 1) as u64 + n;
    }
    len
}

fn encode_data_node<R: Record>(
    page: &mut [u8],
    leftmost_key: u64,
    level: usize,
    records: &[R],
) -> Result<(), Error> {
    let suffix = R::KEY_BYTES - level;
    let mut w = ByteWriter::new(page);
    w.put_uint(records.len() as u64, DATA_NODE_HEADER);
    for r in records {
        w.put_uint(r.key() - leftmost_key, suffix);
        let n = r.data_len();
        w.put_var_uint(n as u64, 1, 1);
        let before = w.tell();
        r.save(&mut w);
        if w.tell() - before != n {
            return Err(Error::AssertionFailed("record wrote a different length than it declared"));
        }
    }
    Ok(())
}

fn decode_data_node<R: Record>(
    page: &[u8],
    leftmost_key: u64,
    level: usize,
    first: u64,
    last: u64,
    mut sink: impl FnMut(R),
) -> Result<(), Error> {
    let suffix = R::KEY_BYTES - level;
    let mut r = ByteReader::new(page);
    let count = r.read_uint(DATA_NODE_HEADER)?;
    for _ in 0..count {
        let key = leftmost_key + r.read_uint(suffix)?;
        let n = r.read_var_uint(1, 1)? as usize;
        if key < first || key > last {
            r.skip(n)?;
            continue;
        }
        let before = r.tell();
        let record = R::load(key, &mut r)?;
        if r.tell() - before != n {
            return Err(Error::BadRecord("record length prefix does not match its payload"));
        }
        sink(record);
    }
    Ok(())
}

fn count_data_node_records<R: Record>(page: &[u8], level: usize) -> Result<u64, Error> {
    let suffix = R::KEY_BYTES - level;
    let mut r = ByteReader::new(page);
    let count = r.read_uint(DATA_NODE_HEADER)?;
    for _ in 0..count {
        r.skip(suffix)?;
        let n = r.read_var_uint(1, 1)? as usize;
        r.skip(n)?;
    }
    Ok(count)
}

// ------------------------------------------------------------- half-pages

fn serialize_half_page(
    revision: u32,
    level: usize,
    leftmost_key: u64,
    levels: &[u8; SLOTS],
    leaves: &[u32; SLOTS],
) -> Vec<u8> {
    let mut page = vec![0u8; INDEX_PAGE_SIZE];
    {
        let mut w = ByteWriter::new(&mut page[4..]);
        w.put_uint(u64::from(revision), 4);
        w.put_uint(level as u64, 4);
        w.put_uint(leftmost_key, 20);
    }
    page[256..512].copy_from_slice(levels);
    {
        let mut w = ByteWriter::new(&mut page[512..]);
        for &leaf in leaves.iter() {
            w.put_uint(u64::from(leaf), 4);
        }
    }
    let checksum = crc32(&page[4..]);
    ByteWriter::new(&mut page[..4]).put_uint(u64::from(checksum), 4);
    page
}

struct ParsedHalf {
    revision: u32,
    level: usize,
    leftmost_key: u64,
    levels: [u8; SLOTS],
    leaves: [u32; SLOTS],
}

fn parse_half_page(page: &[u8]) -> Result<ParsedHalf, Error> {
    let mut r = ByteReader::new(page);
    let stored_crc = r.read_uint(4)? as u32;
    if stored_crc != crc32(&page[4..INDEX_PAGE_SIZE]) {
        return Err(Error::CorruptedPage);
    }
    let revision = r.read_uint(4)? as u32;
    let level = r.read_uint(4)? as usize;
    let leftmost_key = r.read_uint(20)?;
    let mut levels = [0u8; SLOTS];
    levels.copy_from_slice(&page[256..512]);
    let mut leaves = [SENTINEL; SLOTS];
    let mut r = ByteReader::new(&page[512..INDEX_PAGE_SIZE]);
    for leaf in leaves.iter_mut() {
        *leaf = r.read_uint(4)? as u32;
    }
    Ok(ParsedHalf { revision, level, leftmost_key, levels, leaves })
}

// ----------------------------------------------------------------- groups

struct GroupPlan {
    len: usize,
    /// the slot interval is at the full height: `bucket` is a child node
    top_level: bool,
    bucket: u32,
    /// at least one requested key's own slot is non-empty
    hit: bool,
}

fn slot_of<R: Record>(key: u64, level: usize) -> usize {
    (shift_right(key, ((R::KEY_BYTES - 1 - level) * 8) as u32) & 0xff) as usize
}

fn partition_plan<R: Record>(
    levels: &[u8; SLOTS],
    leaves: &[u32; SLOTS],
    level: usize,
    records: &[R],
) -> Vec<GroupPlan> {
    let mut plans = Vec::new();
    let mut i = 0;
    while i < records.len() {
        let slot = slot_of::<R>(records[i].key(), level);
        let next_leftmost = slot_leftmost(slot, levels[slot]) + slot_span(levels[slot]);
        let mut hit = false;
        let start = i;
        while i < records.len() {
            let s = slot_of::<R>(records[i].key(), level);
            if s >= next_leftmost {
                break;
            }
            if leaves[s] != SENTINEL {
                hit = true;
            }
            i += 1;
        }
        plans.push(GroupPlan {
            len: i - start,
            top_level: levels[slot] == 8,
            bucket: bucket_of(levels, leaves, slot),
            hit,
        });
    }
    plans
}

fn split_key_runs<R: Record>(mut chunk: &mut [R]) -> Vec<(u64, &mut [R])> {
    let mut runs = Vec::new();
    while !chunk.is_empty() {
        let key = chunk[0].key();
        let mut end = 1;
        while end < chunk.len() && chunk[end].key() == key {
            end += 1;
        }
        let (run, rest) = chunk.split_at_mut(end);
        runs.push((key, run));
        chunk = rest;
    }
    runs
}

// ------------------------------------------------------------------ nodes

impl<R: Record> IndexNode<R> {
    /// Key span covered by one slot of this node.
    fn keys_per_slot(&self) -> u64 {
        1u64 << (8 * (R::KEY_BYTES - self.level - 1))
    }

    fn page_region<'a>(&self, run: &'a [u8], bucket: u32, first_data_page: u32, page_size: usize) -> &'a [u8] {
        let index = (bucket - first_data_page) as usize;
        &run[index * page_size..(index + 1) * page_size]
    }

    /// Builds a brand-new node (and recursively its children) from records,
    /// all of which must share this node's key prefix. Page contents land in
    /// `pending`; nothing is written here.
    pub(crate) fn build(
        shared: &Shared,
        level: usize,
        records: Vec<R>,
        pending: &mut PendingWrites,
    ) -> Result<Arc<IndexNode<R>>, Error> {
        if level >= R::KEY_BYTES {
            return Err(Error::AssertionFailed("index node level exceeds the key width"));
        }
        if level > 0 && records.is_empty() {
            return Err(Error::AssertionFailed("child index node without records"));
        }
        let page_id = shared.index_pages.allocate(2)?;
        let mut levels = [0u8; SLOTS];
        let mut leaves = [SENTINEL; SLOTS];
        let mut children = HashMap::default();
        let mut leftmost_key = 0;
        let mut first_data_page = 0;
        let mut data_page_count = 0;

        if !records.is_empty() {
            let h = (8 * (R::KEY_BYTES - level)) as u32;
            leftmost_key = (shift_right(records[0].key(), h)) << h;
            let mut new_buckets: BTreeMap<u32, Vec<R>> = BTreeMap::new();
            let mut next_temp = 1;
            overwrite_group(
                shared,
                level,
                &mut levels,
                &mut leaves,
                records,
                &mut next_temp,
                &mut new_buckets,
                &mut children,
                pending,
            )?;

            for bucket_records in new_buckets.values_mut() {
                bucket_records.sort_by_key(|r| r.key());
            }
            data_page_count = data_bucket_count(&levels, &leaves);
            if data_page_count > 0 {
                first_data_page = shared.data_pages.allocate(data_page_count)?;
                let page_size = shared.data_pages.page_size();
                let mut run = vec![0u8; data_page_count as usize * page_size];
                let mut old_to_new: HashMap<u32, u32> = HashMap::default();
                for i in 0..SLOTS {
                    if leaves[i] == SENTINEL || levels[i] == 8 {
                        continue;
                    }
                    if !old_to_new.contains_key(&leaves[i]) {
                        let index = old_to_new.len();
                        let new_page = first_data_page + index as u32;
                        let bucket_records = new_buckets
                            .get(&leaves[i])
                            .ok_or(Error::AssertionFailed("fresh leaf without records"))?;
                        encode_data_node(
                            &mut run[index * page_size..(index + 1) * page_size],
                            leftmost_key,
                            level,
                            bucket_records,
                        )?;
                        old_to_new.insert(leaves[i], new_page);
                    }
                    leaves[i] = old_to_new[&leaves[i]];
                }
                pending.data.push((first_data_page, run));
            }
        }

        let half = serialize_half_page(0, level, leftmost_key, &levels, &leaves);
        pending.index.push((page_id, half));

        Ok(Arc::new(IndexNode {
            page_id,
            level,
            leftmost_key,
            state: RwLock::new(NodeState {
                revision: 0,
                levels,
                leaves,
                first_data_page,
                data_page_count,
                children,
            }),
        }))
    }

    /// Loads a node (and recursively its children) from the index file,
    /// picking the highest-revision half-page that checks out.
    pub(crate) fn load(shared: &Shared, page_id: u32) -> Result<Arc<IndexNode<R>>, Error> {
        let buf = shared.index_pages.load(page_id, 2)?;
        let parsed = {
            let half0 = parse_half_page(&buf[..INDEX_PAGE_SIZE]);
            let half1 = parse_half_page(&buf[INDEX_PAGE_SIZE..]);
            let ok0 = half0.ok().filter(|h| h.revision % 2 == 0);
            let ok1 = half1.ok().filter(|h| h.revision % 2 == 1);
            match (ok0, ok1) {
                (Some(a), Some(b)) => {
                    if a.revision > b.revision {
                        a
                    } else {
                        b
                    }
                }
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => {
                    let _ = shared.index_pages.release(page_id, 2);
                    return Err(Error::CorruptedPage);
                }
            }
        };
        shared.index_pages.release(page_id, 2)?;
        if parsed.level >= R::KEY_BYTES {
            return Err(Error::BadRecord("index node level exceeds the key width"));
        }

        let data_page_count = data_bucket_count(&parsed.levels, &parsed.leaves);
        let first_data_page = min_data_bucket(&parsed.levels, &parsed.leaves).unwrap_or(0);

        let mut children = HashMap::default();
        for i in 0..SLOTS {
            if parsed.levels[i] == 8 && parsed.leaves[i] != SENTINEL {
                let child_page = parsed.leaves[i];
                if !children.contains_key(&child_page) {
                    children.insert(child_page, IndexNode::load(shared, child_page)?);
                }
            }
        }

        Ok(Arc::new(IndexNode {
            page_id,
            level: parsed.level,
            leftmost_key: parsed.leftmost_key,
            state: RwLock::new(NodeState {
                revision: parsed.revision,
                levels: parsed.levels,
                leaves: parsed.leaves,
                first_data_page,
                data_page_count,
                children,
            }),
        }))
    }

    // ------------------------------------------------------------- reads

    pub(crate) fn read_records<'s>(
        &self,
        shared: &'s Shared,
        scope: &rayon::Scope<'s>,
        records: &'s mut [R],
        visitor: ReadFn<'s, R>,
        errors: &'s ErrorSink,
    ) {
        let st = self.state.read().unwrap();
        let plans = partition_plan::<R>(&st.levels, &st.leaves, self.level, records);

        enum Local {
            Data(u32),
            Unmatched,
        }
        let mut rest = records;
        let mut local: Vec<(Local, &mut [R])> = Vec::new();
        for plan in plans {
            let (chunk, remaining) = rest.split_at_mut(plan.len);
            rest = remaining;
            if plan.top_level && plan.bucket != SENTINEL {
                let child = match st.children.get(&plan.bucket) {
                    Some(c) => c.clone(),
                    None => {
                        errors.set(Error::AssertionFailed("leaf points at an unknown child node"));
                        continue;
                    }
                };
                scope.spawn(move |scope| {
                    child.read_records(shared, scope, chunk, visitor, errors);
                });
            } else if !plan.top_level && plan.bucket != SENTINEL && plan.hit {
                local.push((Local::Data(plan.bucket), chunk));
            } else {
                local.push((Local::Unmatched, chunk));
            }
        }

        let needs_pages = local.iter().any(|(l, _)| matches!(l, Local::Data(_)));
        let run = if needs_pages {
            match shared.data_pages.load(st.first_data_page, st.data_page_count) {
                Ok(run) => Some(run),
                Err(e) => {
                    errors.set(e);
                    return;
                }
            }
        } else {
            None
        };

        let page_size = shared.data_pages.page_size();
        for (kind, chunk) in local {
            match kind {
                Local::Data(bucket) => {
                    let page =
                        self.page_region(run.as_ref().unwrap(), bucket, st.first_data_page, page_size);
                    let mut current: BTreeMap<u64, Vec<R>> = BTreeMap::new();
                    let decoded = decode_data_node(page, self.leftmost_key, self.level, 0, u64::MAX, |r: R| {
                        current.entry(r.key()).or_insert_with(Vec::new).push(r);
                    });
                    if let Err(e) = decoded {
                        errors.set(e);
                        break;
                    }
                    for (key, run_chunk) in split_key_runs(chunk) {
                        let db: &[R] = current.get(&key).map(|v| &v[..]).unwrap_or(&[]);
                        visitor(db, run_chunk);
                    }
                }
                Local::Unmatched => {
                    for (_key, run_chunk) in split_key_runs(chunk) {
                        visitor(&[], run_chunk);
                    }
                }
            }
        }
        if let Some(_run) = run {
            if let Err(e) = shared.data_pages.release(st.first_data_page, st.data_page_count) {
                errors.set(e);
            }
        }
    }

    /// Ascending-order traversal. Returns true once the query is finished
    /// (the visitor asked to stop, or the root made its last call).
    pub(crate) fn read_records_in_order(
        &self,
        shared: &Shared,
        buffer: &mut Vec<R>,
        visitor: &mut dyn FnMut(Vec<R>, bool) -> Result<bool, Error>,
        first: u64,
        last: u64,
        min_chunk: usize,
    ) -> Result<bool, Error> {
        let keys_per_slot = self.keys_per_slot();
        {
            let st = self.state.read().unwrap();
            let run = shared.data_pages.load(st.first_data_page, st.data_page_count)?;
            let walk = (|| -> Result<bool, Error> {
                let page_size = shared.data_pages.page_size();
                let mut last_bucket = SENTINEL;
                for i in 0..SLOTS {
                    if self.leftmost_key + i as u64 * keys_per_slot > last {
                        break;
                    }
                    if self.leftmost_key + (i as u64 + 1) * keys_per_slot <= first {
                        continue;
                    }
                    if st.leaves[i] == SENTINEL {
                        continue;
                    }
                    if st.levels[i] == 8 {
                        let child = st
                            .children
                            .get(&st.leaves[i])
                            .ok_or(Error::AssertionFailed("leaf points at an unknown child node"))?
                            .clone();
                        if child.read_records_in_order(shared, buffer, visitor, first, last, min_chunk)? {
                            return Ok(true);
                        }
                    } else if st.leaves[i] != last_bucket {
                        last_bucket = st.leaves[i];
                        let page = self.page_region(&run, st.leaves[i], st.first_data_page, page_size);
                        decode_data_node(page, self.leftmost_key, self.level, first, last, |r: R| {
                            buffer.push(r)
                        })?;
                    }
                }
                Ok(false)
            })();
            shared.data_pages.release(st.first_data_page, st.data_page_count)?;
            if walk? {
                return Ok(true);
            }
        }

        let last_call = self.level == 0;
        if buffer.len() >= min_chunk || last_call {
            let stop = visitor(std::mem::take(buffer), last_call)?;
            if stop || last_call {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) fn largest_key(&self, shared: &Shared) -> Result<u64, Error> {
        let st = self.state.read().unwrap();
        for i in (0..SLOTS).rev() {
            if st.leaves[i] == SENTINEL {
                continue;
            }
            if st.levels[i] == 8 {
                let child = st
                    .children
                    .get(&st.leaves[i])
                    .ok_or(Error::AssertionFailed("leaf points at an unknown child node"))?
                    .clone();
                drop(st);
                return child.largest_key(shared);
            }
            let run = shared.data_pages.load(st.first_data_page, st.data_page_count)?;
            let mut result = self.leftmost_key;
            let page = self.page_region(&run, st.leaves[i], st.first_data_page, shared.data_pages.page_size());
            let decoded = decode_data_node(page, self.leftmost_key, self.level, 0, u64::MAX, |r: R| {
                if r.key() > result {
                    result = r.key();
                }
            });
            shared.data_pages.release(st.first_data_page, st.data_page_count)?;
            decoded?;
            return Ok(result);
        }
        Ok(self.leftmost_key)
    }

    pub(crate) fn record_count(&self, shared: &Shared) -> Result<u64, Error> {
        let st = self.state.read().unwrap();
        let run = shared.data_pages.load(st.first_data_page, st.data_page_count)?;
        let counted = (|| -> Result<u64, Error> {
            let page_size = shared.data_pages.page_size();
            let mut total = 0;
            let mut last_bucket = SENTINEL;
            for i in 0..SLOTS {
                if st.leaves[i] == SENTINEL || st.levels[i] == 8 || st.leaves[i] == last_bucket {
                    continue;
                }
                last_bucket = st.leaves[i];
                let page = self.page_region(&run, st.leaves[i], st.first_data_page, page_size);
                total += count_data_node_records::<R>(page, self.level)?;
            }
            Ok(total)
        })();
        shared.data_pages.release(st.first_data_page, st.data_page_count)?;
        let mut total = counted?;
        for child in st.children.values() {
            total += child.record_count(shared)?;
        }
        Ok(total)
    }

    pub(crate) fn mark_used_data_pages(&self, used: &mut Vec<bool>) {
        let st = self.state.read().unwrap();
        for i in 0..st.data_page_count {
            used[(st.first_data_page + i) as usize] = true;
        }
        for child in st.children.values() {
            child.mark_used_data_pages(used);
        }
    }

    // ------------------------------------------------------------- writes

    pub(crate) fn write_records<'s>(
        &self,
        shared: &'s Shared,
        scope: &rayon::Scope<'s>,
        records: &'s mut [R],
        visitor: UpdateFn<'s, R>,
        errors: &'s ErrorSink,
    ) {
        if let Err(e) = self.write_records_inner(shared, scope, records, visitor, errors) {
            errors.set(e);
        }
    }

    fn write_records_inner<'s>(
        &self,
        shared: &'s Shared,
        scope: &rayon::Scope<'s>,
        records: &'s mut [R],
        visitor: UpdateFn<'s, R>,
        errors: &'s ErrorSink,
    ) -> Result<(), Error> {
        let mut st = self.state.write().unwrap();
        let page_size = shared.data_pages.page_size();
        let plans = partition_plan::<R>(&st.levels, &st.leaves, self.level, records);

        enum Local {
            ChildCreate,
            DataVisit(u32),
            DataExtend(u32),
            DataCreate,
        }
        let mut rest = records;
        let mut local: Vec<(Local, &mut [R])> = Vec::new();
        for plan in plans {
            let (chunk, remaining) = rest.split_at_mut(plan.len);
            rest = remaining;
            if plan.top_level {
                if plan.bucket == SENTINEL {
                    local.push((Local::ChildCreate, chunk));
                } else {
                    let child = match st.children.get(&plan.bucket) {
                        Some(c) => c.clone(),
                        None => {
                            errors.set(Error::AssertionFailed("leaf points at an unknown child node"));
                            continue;
                        }
                    };
                    scope.spawn(move |scope| {
                        child.write_records(shared, scope, chunk, visitor, errors);
                    });
                }
            } else if plan.bucket == SENTINEL {
                local.push((Local::DataCreate, chunk));
            } else if !plan.hit {
                local.push((Local::DataExtend(plan.bucket), chunk));
            } else {
                local.push((Local::DataVisit(plan.bucket), chunk));
            }
        }

        // run the visitors; nothing on disk or in the node state changes yet
        let mut run: Option<Arc<Vec<u8>>> = None;
        let mut changed_subtrees: Vec<Vec<R>> = Vec::new();
        let mut doomed_keys: Vec<u64> = Vec::new();
        let outcome = (|run: &mut Option<Arc<Vec<u8>>>| -> Result<(), Error> {
            for (kind, chunk) in local {
                match kind {
                    Local::ChildCreate | Local::DataCreate => {
                        let mut produced: Vec<R> = Vec::new();
                        for (_key, key_chunk) in split_key_runs(chunk) {
                            let mut current: Vec<R> = Vec::new();
                            if visitor(&mut current, key_chunk)? {
                                produced.append(&mut current);
                            }
                        }
                        if !produced.is_empty() {
                            changed_subtrees.push(produced);
                        }
                    }
                    Local::DataVisit(bucket) => {
                        if run.is_none() {
                            *run = Some(shared.data_pages.load(st.first_data_page, st.data_page_count)?);
                        }
                        let page =
                            self.page_region(run.as_ref().unwrap(), bucket, st.first_data_page, page_size);
                        let mut current: BTreeMap<u64, Vec<R>> = BTreeMap::new();
                        decode_data_node(page, self.leftmost_key, self.level, 0, u64::MAX, |r: R| {
                            current.entry(r.key()).or_insert_with(Vec::new).push(r);
                        })?;
                        let mut changes = false;
                        let mut group_key = 0;
                        for (key, key_chunk) in split_key_runs(chunk) {
                            group_key = key;
                            let slot_records = current.entry(key).or_insert_with(Vec::new);
                            if visitor(slot_records, key_chunk)? {
                                changes = true;
                            }
                        }
                        if changes {
                            let all: Vec<R> = current.into_iter().flat_map(|(_, v)| v).collect();
                            if all.is_empty() {
                                doomed_keys.push(group_key);
                            } else {
                                changed_subtrees.push(all);
                            }
                        }
                    }
                    Local::DataExtend(bucket) => {
                        let mut produced: Vec<R> = Vec::new();
                        for (_key, key_chunk) in split_key_runs(chunk) {
                            let mut current: Vec<R> = Vec::new();
                            if visitor(&mut current, key_chunk)? {
                                produced.append(&mut current);
                            }
                        }
                        if !produced.is_empty() {
                            if run.is_none() {
                                *run =
                                    Some(shared.data_pages.load(st.first_data_page, st.data_page_count)?);
                            }
                            let page = self.page_region(
                                run.as_ref().unwrap(),
                                bucket,
                                st.first_data_page,
                                page_size,
                            );
                            decode_data_node(page, self.leftmost_key, self.level, 0, u64::MAX, |r: R| {
                                produced.push(r)
                            })?;
                            changed_subtrees.push(produced);
                        }
                    }
                }
            }

            if changed_subtrees.is_empty() && doomed_keys.is_empty() {
                return Ok(());
            }
            // everything changed below gets fresh pages; the old data run
            // survives on disk until the new half-page is durable
            if run.is_none() && st.data_page_count > 0 {
                *run = Some(shared.data_pages.load(st.first_data_page, st.data_page_count)?);
            }

            let mut new_levels = st.levels;
            let mut new_leaves = st.leaves;
            let mut pending = PendingWrites::default();
            let mut new_buckets: BTreeMap<u32, Vec<R>> = BTreeMap::new();
            let mut new_children: HashMap<u32, Arc<IndexNode<R>>> = HashMap::default();
            let mut next_temp = max_bucket(&new_leaves).map_or(1, |m| m + 1);

            for subtree in changed_subtrees.drain(..) {
                overwrite_group(
                    shared,
                    self.level,
                    &mut new_levels,
                    &mut new_leaves,
                    subtree,
                    &mut next_temp,
                    &mut new_buckets,
                    &mut new_children,
                    &mut pending,
                )?;
            }
            for key in doomed_keys.drain(..) {
                let slot = slot_of::<R>(key, self.level);
                let lm = slot_leftmost(slot, new_levels[slot]);
                for i in 0..slot_span(new_levels[slot]) {
                    new_leaves[lm + i] = SENTINEL;
                }
            }

            for bucket_records in new_buckets.values_mut() {
                bucket_records.sort_by_key(|r| r.key());
            }
            let new_count = data_bucket_count(&new_levels, &new_leaves);
            let new_first = if new_count > 0 {
                shared.data_pages.allocate(new_count)?
            } else {
                0
            };
            let mut new_run = vec![0u8; new_count as usize * page_size];
            let mut old_to_new: HashMap<u32, u32> = HashMap::default();
            for i in 0..SLOTS {
                if new_leaves[i] == SENTINEL || new_levels[i] == 8 {
                    continue;
                }
                if !old_to_new.contains_key(&new_leaves[i]) {
                    let index = old_to_new.len();
                    let region = &mut new_run[index * page_size..(index + 1) * page_size];
                    if let Some(bucket_records) = new_buckets.get(&new_leaves[i]) {
                        encode_data_node(region, self.leftmost_key, self.level, bucket_records)?;
                    } else {
                        // untouched leaf: byte-copy from the old run
                        let old = run
                            .as_ref()
                            .ok_or(Error::AssertionFailed("surviving leaf without an old data run"))?;
                        let old_index = (new_leaves[i] - st.first_data_page) as usize;
                        region.copy_from_slice(&old[old_index * page_size..(old_index + 1) * page_size]);
                    }
                    old_to_new.insert(new_leaves[i], new_first + index as u32);
                }
                new_leaves[i] = old_to_new[&new_leaves[i]];
            }

            // data pages first, children's half-pages next, our own last
            if new_count > 0 {
                pending.data.push((new_first, new_run));
            }
            let new_revision = st.revision + 1;
            let own_half = serialize_half_page(
                new_revision,
                self.level,
                self.leftmost_key,
                &new_levels,
                &new_leaves,
            );
            shared.data_pages.write_back(std::mem::take(&mut pending.data))?;
            shared.index_pages.write_back(std::mem::take(&mut pending.index))?;
            shared
                .index_pages
                .write_back(vec![(self.page_id + new_revision % 2, own_half)])?;

            let old_first = st.first_data_page;
            let old_count = st.data_page_count;
            st.revision = new_revision;
            st.levels = new_levels;
            st.leaves = new_leaves;
            st.first_data_page = new_first;
            st.data_page_count = new_count;
            for (page, child) in new_children.drain() {
                st.children.insert(page, child);
            }

            if run.take().is_some() {
                shared.data_pages.release(old_first, old_count)?;
            }
            shared.data_pages.mark_deleted(old_first, old_count)?;
            Ok(())
        })(&mut run);

        if let Some(_r) = run {
            let _ = shared.data_pages.release(st.first_data_page, st.data_page_count);
        }
        outcome
    }
}

/// Rewrites one leaf interval of `levels`/`leaves` to hold `records`,
/// deepening where needed; slots pushed to the full height become child
/// index nodes built from their share of the records.
fn overwrite_group<R: Record>(
    shared: &Shared,
    node_level: usize,
    levels: &mut [u8; SLOTS],
    leaves: &mut [u32; SLOTS],
    records: Vec<R>,
    next_temp: &mut u32,
    new_buckets: &mut BTreeMap<u32, Vec<R>>,
    new_children: &mut HashMap<u32, Arc<IndexNode<R>>>,
    pending: &mut PendingWrites,
) -> Result<(), Error> {
    if records.is_empty() {
        return Err(Error::AssertionFailed("subtree overwrite without records"));
    }
    let rooted_level = levels[slot_of::<R>(records[0].key(), node_level)];
    let mut by_slot: BTreeMap<usize, Vec<R>> = BTreeMap::new();
    for r in records {
        by_slot.entry(slot_of::<R>(r.key(), node_level)).or_insert_with(Vec::new).push(r);
    }

    let mut sizes: BTreeMap<usize, u64> = BTreeMap::new();
    for (&slot, slot_records) in &by_slot {
        sizes.insert(slot, data_node_len(node_level, slot_records));
    }

    overwrite_slots(
        levels,
        leaves,
        &sizes,
        next_temp,
        rooted_level,
        shared.data_pages.page_size() as u64,
    )?;

    let leftmost_slot = slot_leftmost(*sizes.keys().next().unwrap(), rooted_level);
    for i in 0..slot_span(rooted_level) {
        let slot = leftmost_slot + i;
        if leaves[slot] == SENTINEL {
            continue;
        }
        let slot_records = match by_slot.remove(&slot) {
            Some(v) => v,
            None => continue,
        };
        if levels[slot] < 8 {
            new_buckets.entry(leaves[slot]).or_insert_with(Vec::new).extend(slot_records);
        } else {
            let child = IndexNode::build(shared, node_level + 1, slot_records, pending)?;
            leaves[slot] = child.page_id;
            new_children.insert(child.page_id, child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Record;

    #[derive(Clone, Debug, PartialEq)]
    struct Fixed {
        key: u64,
        data: [u8; 16],
    }

    impl Fixed {
        fn new(key: u64, tag: u8) -> Fixed {
            Fixed { key, data: [tag; 16] }
        }
    }

    impl Record for Fixed {
        const KEY_BYTES: usize = 4;
        fn key(&self) -> u64 {
            self.key
        }
        fn data_len(&self) -> usize {
            16
        }
        fn save(&self, out: &mut ByteWriter) {
            out.put_slice(&self.data);
        }
        fn load(key: u64, input: &mut ByteReader) -> Result<Fixed, Error> {
            let mut data = [0u8; 16];
            data.copy_from_slice(input.advance(16)?);
            Ok(Fixed { key, data })
        }
    }

    #[test]
    fn data_node_roundtrip() {
        let records = vec![Fixed::new(0x0101, 1), Fixed::new(0x0101, 2), Fixed::new(0x0207, 3)];
        let len = data_node_len(0, &records) as usize;
        assert_eq!(len, 2 + 3 * (4 + 1 + 16));
        let mut page = vec![0u8; 512];
        encode_data_node(&mut page, 0, 0, &records).unwrap();
        let mut out = Vec::new();
        decode_data_node(&page, 0, 0, 0, u64::MAX, |r: Fixed| out.push(r)).unwrap();
        assert_eq!(out, records);

        out.clear();
        decode_data_node(&page, 0, 0, 0x0102, u64::MAX, |r: Fixed| out.push(r)).unwrap();
        assert_eq!(out, vec![Fixed::new(0x0207, 3)]);
        assert_eq!(count_data_node_records::<Fixed>(&page, 0).unwrap(), 3);
    }

    #[test]
    fn half_page_roundtrip_and_corruption() {
        let mut levels = [3u8; SLOTS];
        levels[7] = 8;
        let mut leaves = [SENTINEL; SLOTS];
        leaves[7] = 42;
        let page = serialize_half_page(9, 1, 0xaa0000, &levels, &leaves);
        let parsed = parse_half_page(&page).unwrap();
        assert_eq!(parsed.revision, 9);
        assert_eq!(parsed.level, 1);
        assert_eq!(parsed.leftmost_key, 0xaa0000);
        assert_eq!(parsed.levels[0], 3);
        assert_eq!(parsed.leaves[7], 42);

        let mut bad = page.clone();
        bad[700] ^= 0xff;
        assert!(matches!(parse_half_page(&bad), Err(Error::CorruptedPage)));
    }

    #[test]
    fn slot_overwrite_splits_on_capacity() {
        let mut levels = [0u8; SLOTS];
        let mut leaves = [SENTINEL; SLOTS];
        // two hot slots that cannot share one 4 KiB page
        let mut sizes = BTreeMap::new();
        sizes.insert(10usize, 3000u64);
        sizes.insert(200usize, 3000u64);
        let mut next = 1;
        overwrite_slots(&mut levels, &mut leaves, &sizes, &mut next, 0, 4096).unwrap();
        assert_eq!(leaves[10], 1);
        assert_eq!(leaves[200], 2);
        assert_ne!(leaves[10], leaves[200]);
        // halves [0,128) and [128,256) each fit
        assert_eq!(levels[10], 1);
        assert_eq!(levels[200], 1);
        assert_eq!(data_bucket_count(&levels, &leaves), 2);
        // untouched slots in a non-empty interval stay SENTINEL
        assert_eq!(leaves[11], SENTINEL);
        assert_eq!(bucket_of(&levels, &leaves, 11), 1);
    }

    #[test]
    fn slot_overwrite_promotes_single_hot_slot() {
        let mut levels = [0u8; SLOTS];
        let mut leaves = [SENTINEL; SLOTS];
        let mut sizes = BTreeMap::new();
        sizes.insert(77usize, 10_000u64); // larger than a page by itself
        sizes.insert(78usize, 100u64);
        let mut next = 1;
        overwrite_slots(&mut levels, &mut leaves, &sizes, &mut next, 0, 8192).unwrap();
        assert_eq!(levels[77], 8);
        assert_ne!(leaves[77], SENTINEL);
        assert!(levels[78] < 8);
        assert_ne!(leaves[78], SENTINEL);
        assert_eq!(data_bucket_count(&levels, &leaves), 1);
    }
}
