//! Write-back page cache with concurrent miss coalescing.
//!
//! The cache sits between the filesystem operations layer and the remote
//! transport. Arbitrary-offset reads and writes are sliced into fixed
//! power-of-two pages keyed by `(file id, page index)`. Misses fetch whole
//! pages from the device; concurrent callers for one missing page coalesce
//! onto a single fetch and observe the same outcome. Writes only touch the
//! cache (write-back): dirty pages reach the device when the host calls
//! [Cache::flush], or through the orphan sink when they are evicted first.
//!
//! # Concurrency
//!
//! Every operation is a suspendable task. Shared state lives behind one
//! async lock that is only ever held between suspension points, so on a
//! current-thread executor the cache is cooperatively single-threaded and
//! its invariants need only hold when a task yields. Any handle obtained
//! before a suspension is stale after it: each resume re-consults the
//! residency index, which is also what makes miss coalescing correct (a
//! waiter that wakes finds the page installed, or a clean miss it may claim
//! for itself).
//!
//! # Capacity
//!
//! Residency is bounded by a page budget. Admission evicts from the tail of
//! the recency list; clean victims are dropped, dirty victims are parked in
//! the orphan sink for the host to drain. Eviction never performs I/O.

mod inflight;
mod lru;
mod orphan;
mod page;

pub use page::{Page, PageKey};

use crate::Error;
use bytes::Bytes;
use inflight::{InFlightMap, Outcome, Subscriber};
use lru::LruIndex;
use orphan::OrphanSink;
use std::{future::Future, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

/// Remote I/O capability for a single file.
///
/// The cache is path-agnostic: callers bind their `(id -> path)` mapping
/// outside the cache, typically with
/// [RemoteFile](crate::transport::RemoteFile), and hand the bound capability
/// to [Cache::read] and [Cache::flush]. Ids are only hashed, never resolved.
pub trait Remote: Send + Sync {
    /// Read up to `len` bytes starting at `offset`. A short result means the
    /// file ended inside the requested range.
    fn fetch(&self, offset: u64, len: usize)
        -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn flush(&self, data: Bytes, offset: u64)
        -> impl Future<Output = Result<usize, Error>> + Send;
}

struct State {
    page_size: usize,
    max_pages: usize,
    /// Bumped on every reconfiguration. Operations snapshot it when they
    /// split a request into pages and restart if it moved; a fetch that
    /// completes across a bump resolves its waiters without installing. No
    /// page of stale geometry can enter the cache.
    epoch: u64,
    lru: LruIndex,
    inflight: InFlightMap,
    orphans: OrphanSink,
}

impl State {
    /// Evict until the page budget holds. Dirty victims park in the sink.
    fn enforce_capacity(&mut self) {
        while self.lru.len() > self.max_pages {
            let Some(victim) = self.lru.pop_back() else {
                break;
            };
            if victim.is_dirty() {
                let PageKey { id, index } = victim.key();
                warn!(id, index, "evicted dirty page into orphan sink");
                self.orphans.push(victim);
            }
        }
    }
}

/// Shared handle to the page cache. Clones are cheap and refer to the same
/// cache.
#[derive(Clone)]
pub struct Cache {
    state: Arc<RwLock<State>>,
}

impl Cache {
    /// Create a cache holding at most `max_pages` pages of `page_size` bytes
    /// each. The page size is rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        assert!(max_pages > 0, "page budget must be non-zero");
        Self {
            state: Arc::new(RwLock::new(State {
                page_size: page_size.next_power_of_two(),
                max_pages,
                epoch: 0,
                lru: LruIndex::new(),
                inflight: InFlightMap::new(),
                orphans: OrphanSink::new(),
            })),
        }
    }

    /// Read up to `out.len()` bytes of file `id` starting at byte `offset`,
    /// returning the number of bytes copied. Misses fetch whole pages
    /// through `remote`; concurrent misses on one page coalesce onto a
    /// single fetch.
    ///
    /// A short count means the file ended inside the requested range. If any
    /// page fails, the whole call fails: bytes already copied into `out` are
    /// not rolled back, but the caller sees only the error.
    pub async fn read<R: Remote>(
        &self,
        id: u64,
        out: &mut [u8],
        offset: u64,
        remote: &R,
    ) -> Result<usize, Error> {
        if out.is_empty() {
            return Ok(0);
        }
        'restart: loop {
            let (epoch, page_size) = self.geometry().await;
            let first = offset / page_size as u64;
            let last = (offset + out.len() as u64 - 1) / page_size as u64;
            let mut total = 0;
            for index in first..=last {
                let key = PageKey { id, index };
                loop {
                    let mut state = self.state.write().await;
                    if state.epoch != epoch {
                        trace!(id, index, "cache reconfigured mid-read, restarting");
                        continue 'restart;
                    }
                    // Honor an outstanding fetch before consulting residency.
                    if let Some(subscriber) = state.inflight.find(&key) {
                        drop(state);
                        self.wait_inflight(key, subscriber).await?;
                        continue;
                    }
                    if let Some(handle) = state.lru.get(&key) {
                        state.lru.touch(handle);
                        let local = if index == first {
                            (offset % page_size as u64) as usize
                        } else {
                            0
                        };
                        total += state.lru.page(handle).read(&mut out[total..], local);
                        break;
                    }
                    // A dirty page evicted before its flush still holds the
                    // latest bytes; residency is restored from the sink, not
                    // the device.
                    if let Some(orphan) = state.orphans.remove(&key) {
                        debug!(id, index, "restored orphaned page");
                        state.lru.insert_front(orphan);
                        state.enforce_capacity();
                        continue;
                    }
                    trace!(id, index, "page miss");
                    let producer = state.inflight.begin(key);
                    drop(state);
                    let fetched = remote.fetch(index * page_size as u64, page_size).await;
                    let mut state = self.state.write().await;
                    match fetched {
                        Ok(data) => {
                            if state.epoch == epoch {
                                state.lru.insert_front(Page::fetched(key, data, page_size));
                            }
                            state.inflight.resolve(producer, Outcome::Fetched);
                            state.enforce_capacity();
                            // Copy through a fresh handle on the next pass.
                        }
                        Err(err) => {
                            state
                                .inflight
                                .resolve(producer, Outcome::Failed(Arc::new(err.clone())));
                            return Err(err);
                        }
                    }
                }
            }
            return Ok(total);
        }
    }

    /// Write all of `src` to file `id` at byte `offset`, dirtying every page
    /// it touches, and return the number of bytes written.
    ///
    /// Writes are write-allocate but never fetch: a page created here treats
    /// its unwritten prefix as zeros. Sub-page writes into a region that
    /// holds device bytes not present in the cache will therefore not merge
    /// with them; hosts that need that must read the range first.
    pub async fn write(&self, id: u64, src: &[u8], offset: u64) -> Result<usize, Error> {
        if src.is_empty() {
            return Ok(0);
        }
        'restart: loop {
            let (epoch, page_size) = self.geometry().await;
            let first = offset / page_size as u64;
            let last = (offset + src.len() as u64 - 1) / page_size as u64;
            let mut total = 0;
            for index in first..=last {
                let key = PageKey { id, index };
                loop {
                    let mut state = self.state.write().await;
                    if state.epoch != epoch {
                        trace!(id, index, "cache reconfigured mid-write, restarting");
                        continue 'restart;
                    }
                    if let Some(subscriber) = state.inflight.find(&key) {
                        drop(state);
                        self.wait_inflight(key, subscriber).await?;
                        continue;
                    }
                    let handle = match state.lru.get(&key) {
                        Some(handle) => handle,
                        None => {
                            // Write-allocate. An orphaned page keeps its bytes.
                            let page = match state.orphans.remove(&key) {
                                Some(orphan) => {
                                    debug!(id, index, "restored orphaned page");
                                    orphan
                                }
                                None => Page::empty(key, page_size),
                            };
                            state.lru.insert_front(page)
                        }
                    };
                    let local = if index == first {
                        (offset % page_size as u64) as usize
                    } else {
                        0
                    };
                    let n = (page_size - local).min(src.len() - total);
                    trace!(id, index, n, "page write");
                    let page = state.lru.page_mut(handle);
                    page.write(&src[total..total + n], local);
                    page.set_dirty(true);
                    state.lru.touch(handle);
                    total += n;
                    state.enforce_capacity();
                    break;
                }
            }
            return Ok(total);
        }
    }

    /// Push every dirty resident page of file `id` (whose current size is
    /// `size` bytes) to the device through `remote`. Pages never cached are
    /// skipped: nothing cached means nothing dirty.
    ///
    /// On failure the page stays dirty and the call aborts; retrying is the
    /// caller's decision. A write racing a flush re-dirties the page and the
    /// next flush picks it up. Parked orphans are not flushed here; they
    /// belong to the host via [Cache::take_orphans].
    pub async fn flush<R: Remote>(&self, id: u64, size: u64, remote: &R) -> Result<(), Error> {
        'restart: loop {
            let (epoch, page_size) = self.geometry().await;
            let pages = size.div_ceil(page_size as u64);
            for index in 0..pages {
                let key = PageKey { id, index };
                loop {
                    let mut state = self.state.write().await;
                    if state.epoch != epoch {
                        trace!(id, index, "cache reconfigured mid-flush, restarting");
                        continue 'restart;
                    }
                    if let Some(subscriber) = state.inflight.find(&key) {
                        drop(state);
                        self.wait_inflight(key, subscriber).await?;
                        continue;
                    }
                    let Some(handle) = state.lru.get(&key) else {
                        break;
                    };
                    let page = state.lru.page_mut(handle);
                    if !page.is_dirty() {
                        break;
                    }
                    // Snapshot, then write outside the lock: the page may
                    // take new writes while the flush is on the wire, which
                    // re-dirties it for the next flush.
                    let snapshot = Bytes::copy_from_slice(page.contents());
                    page.set_dirty(false);
                    drop(state);
                    debug!(id, index, len = snapshot.len(), "flushing page");
                    if let Err(err) = remote
                        .flush(snapshot.clone(), index * page_size as u64)
                        .await
                    {
                        let mut state = self.state.write().await;
                        if state.epoch == epoch {
                            match state.lru.get(&key) {
                                Some(handle) => state.lru.page_mut(handle).set_dirty(true),
                                // Evicted clean while the flush was failing;
                                // reconstitute the snapshot so the bytes are
                                // not lost, unless a younger write already
                                // parked its own copy.
                                None if !state.orphans.contains(&key) => {
                                    let mut page = Page::empty(key, page_size);
                                    page.write(&snapshot, 0);
                                    page.set_dirty(true);
                                    state.orphans.push(page);
                                }
                                None => {}
                            }
                        }
                        return Err(err);
                    }
                    break;
                }
            }
            return Ok(());
        }
    }

    /// Transfer ownership of every parked orphan to the caller. The host
    /// maps each page's id back to a path and pushes
    /// [contents](Page::contents) through the transport at
    /// `key().index * page_size()` — or re-inserts the bytes with
    /// [Cache::write] to retry later. The cache itself never retries them.
    pub async fn take_orphans(&self) -> Vec<Page> {
        self.state.write().await.orphans.take_all()
    }

    /// Whether any dirty page is parked awaiting a host drain.
    pub async fn has_orphans(&self) -> bool {
        !self.state.read().await.orphans.is_empty()
    }

    /// Discard all resident pages, dirty ones included; callers flush first.
    /// Parked orphans stay drainable, and outstanding fetches complete into
    /// the now-empty cache with fresh device bytes.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.lru.clear();
        info!("cache invalidated");
    }

    /// Replace the page size (rounded up to the next power of two) and drop
    /// all cached state: resident pages, parked orphans, and in-flight
    /// fetches. Dirty data is discarded; callers flush first. Mixing page
    /// geometries is never allowed, which keeps the buffer model simple at
    /// the price of a cold cache.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero.
    pub async fn set_page_size(&self, page_size: usize) {
        assert!(page_size > 0, "page size must be non-zero");
        let mut state = self.state.write().await;
        state.page_size = page_size.next_power_of_two();
        state.epoch += 1;
        state.lru.clear();
        state.inflight.clear();
        state.orphans.clear();
        info!(page_size = state.page_size, "page size changed");
    }

    /// Replace the page budget, with the same destructive semantics as
    /// [Cache::set_page_size].
    ///
    /// # Panics
    ///
    /// Panics if `max_pages` is zero.
    pub async fn set_max_pages(&self, max_pages: usize) {
        assert!(max_pages > 0, "page budget must be non-zero");
        let mut state = self.state.write().await;
        state.max_pages = max_pages;
        state.epoch += 1;
        state.lru.clear();
        state.inflight.clear();
        state.orphans.clear();
        info!(max_pages, "page budget changed");
    }

    /// Current page size in bytes.
    pub async fn page_size(&self) -> usize {
        self.state.read().await.page_size
    }

    /// Current page budget.
    pub async fn max_pages(&self) -> usize {
        self.state.read().await.max_pages
    }

    async fn geometry(&self) -> (u64, usize) {
        let state = self.state.read().await;
        (state.epoch, state.page_size)
    }

    /// Wait out another caller's fetch of `key`. A failed outcome aborts the
    /// caller; an abandoned one (the initiator was cancelled mid-fetch)
    /// cleans up the stale entry so the page can be retried.
    async fn wait_inflight(&self, key: PageKey, subscriber: Subscriber) -> Result<(), Error> {
        match subscriber.clone().await {
            Outcome::Fetched => Ok(()),
            Outcome::Failed(err) => Err((*err).clone()),
            Outcome::Abandoned => {
                let mut state = self.state.write().await;
                state.inflight.remove_abandoned(&key, &subscriber);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{Memory, Op},
        transport::RemoteFile,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const PAGE_SIZE: usize = 4096;
    const MAX_PAGES: usize = 4;

    fn setup(path: &str, contents: Vec<u8>) -> (Cache, Memory, RemoteFile<Memory>) {
        let memory = Memory::default();
        memory.insert(path, contents);
        let remote = RemoteFile::new(memory.clone(), path);
        (Cache::new(PAGE_SIZE, MAX_PAGES), memory, remote)
    }

    async fn resident_pages(cache: &Cache) -> usize {
        cache.state.read().await.lru.len()
    }

    #[tokio::test]
    async fn test_read_single_page() {
        let (cache, memory, remote) = setup("/f", vec![0xAA; PAGE_SIZE]);

        let mut out = vec![0u8; PAGE_SIZE];
        let n = cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(out, vec![0xAA; PAGE_SIZE]);
        assert_eq!(resident_pages(&cache).await, 1);
        assert_eq!(memory.read_count(), 1);

        // A second read is served from residency.
        let n = cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(memory.read_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reads_coalesce() {
        let (cache, memory, remote) = setup("/f", vec![0xAA; PAGE_SIZE]);

        let mut a = vec![0u8; PAGE_SIZE];
        let mut b = vec![0u8; PAGE_SIZE];
        let (ra, rb) = tokio::join!(
            cache.read(1, &mut a, 0, &remote),
            cache.read(1, &mut b, 0, &remote),
        );
        assert_eq!(ra.unwrap(), PAGE_SIZE);
        assert_eq!(rb.unwrap(), PAGE_SIZE);
        assert_eq!(a, vec![0xAA; PAGE_SIZE]);
        assert_eq!(b, vec![0xAA; PAGE_SIZE]);

        // Both callers were served by a single fetch.
        assert_eq!(memory.read_count(), 1);
    }

    #[tokio::test]
    async fn test_unaligned_read_spans_pages() {
        let mut contents = vec![0u8; 3 * PAGE_SIZE];
        for (at, byte) in contents.iter_mut().enumerate() {
            *byte = (at / PAGE_SIZE) as u8 + 1;
        }
        let (cache, memory, remote) = setup("/f", contents.clone());

        let mut out = vec![0u8; PAGE_SIZE];
        let offset = PAGE_SIZE as u64 / 2;
        let n = cache.read(1, &mut out, offset, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(
            out,
            contents[offset as usize..offset as usize + PAGE_SIZE].to_vec()
        );
        assert_eq!(memory.read_count(), 2);
    }

    #[tokio::test]
    async fn test_short_read_at_end_of_file() {
        let (cache, memory, remote) = setup("/f", vec![0x11; 5000]);

        let mut out = vec![0u8; 2 * PAGE_SIZE];
        let n = cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(n, 5000);
        assert_eq!(&out[..5000], &vec![0x11; 5000][..]);
        assert_eq!(memory.read_count(), 2);
    }

    #[tokio::test]
    async fn test_write_allocates_without_fetch() {
        let (cache, memory, remote) = setup("/f", vec![0u8; 3 * PAGE_SIZE]);

        let n = cache
            .write(1, &[0x55; 2 * PAGE_SIZE], PAGE_SIZE as u64 / 2)
            .await
            .unwrap();
        assert_eq!(n, 2 * PAGE_SIZE);
        assert_eq!(resident_pages(&cache).await, 3);
        assert_eq!(memory.read_count(), 0);

        // Read-after-write sees the written bytes without fetching.
        let mut out = vec![0u8; 2 * PAGE_SIZE];
        let n = cache
            .read(1, &mut out, PAGE_SIZE as u64 / 2, &remote)
            .await
            .unwrap();
        assert_eq!(n, 2 * PAGE_SIZE);
        assert_eq!(out, vec![0x55; 2 * PAGE_SIZE]);
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_pushes_dirty_pages_once() {
        let (cache, memory, remote) = setup("/f", Vec::new());

        let offset = 2048;
        cache.write(1, &[0x55; 2 * PAGE_SIZE], offset).await.unwrap();
        let size = offset + 2 * PAGE_SIZE as u64;
        cache.flush(1, size, &remote).await.unwrap();

        // One write per dirty page, in ascending order.
        let flushed: Vec<(u64, usize)> = memory
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Write { offset, len, .. } => Some((offset, len)),
                Op::Read { .. } => None,
            })
            .collect();
        assert_eq!(
            flushed,
            vec![
                (0, PAGE_SIZE),
                (PAGE_SIZE as u64, PAGE_SIZE),
                (2 * PAGE_SIZE as u64, 2048)
            ]
        );

        // The device holds zeros below the write offset and 0x55 above it.
        let device = memory.contents("/f").unwrap();
        assert_eq!(device.len(), size as usize);
        assert!(device[..offset as usize].iter().all(|byte| *byte == 0));
        assert!(device[offset as usize..].iter().all(|byte| *byte == 0x55));

        // Nothing is dirty anymore: a second flush writes nothing.
        cache.flush(1, size, &remote).await.unwrap();
        assert_eq!(memory.write_count(), 3);
    }

    #[tokio::test]
    async fn test_clean_eviction_drops_pages() {
        let (cache, memory, remote) =
            setup("/f", (0..5 * PAGE_SIZE).map(|at| at as u8).collect());

        let mut out = vec![0u8; PAGE_SIZE];
        for index in 0..5u64 {
            cache
                .read(1, &mut out, index * PAGE_SIZE as u64, &remote)
                .await
                .unwrap();
        }
        assert_eq!(resident_pages(&cache).await, MAX_PAGES);
        assert!(!cache.has_orphans().await);

        // Page 0 was the LRU victim; reading it again refetches.
        assert_eq!(memory.read_count(), 5);
        cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(memory.read_count(), 6);
    }

    #[tokio::test]
    async fn test_dirty_eviction_parks_orphan() {
        let (cache, _memory, _remote) = setup("/f", Vec::new());

        for index in 0..5u64 {
            cache
                .write(1, &[index as u8; PAGE_SIZE], index * PAGE_SIZE as u64)
                .await
                .unwrap();
        }
        assert_eq!(resident_pages(&cache).await, MAX_PAGES);
        assert!(cache.has_orphans().await);

        let orphans = cache.take_orphans().await;
        assert_eq!(orphans.len(), 1);
        let orphan = &orphans[0];
        assert_eq!(orphan.key(), PageKey { id: 1, index: 0 });
        assert!(orphan.is_dirty());
        assert_eq!(orphan.contents(), &[0u8; PAGE_SIZE]);
        assert!(!cache.has_orphans().await);
    }

    #[tokio::test]
    async fn test_orphan_restored_by_write() {
        let (cache, memory, remote) = setup("/f", Vec::new());

        // Overflow the budget with dirty pages, parking page 0, then flush
        // the residents so the restore below evicts a clean victim.
        for index in 0..5u64 {
            cache
                .write(1, &[0xBB; PAGE_SIZE], index * PAGE_SIZE as u64)
                .await
                .unwrap();
        }
        assert!(cache.has_orphans().await);
        cache.flush(1, 5 * PAGE_SIZE as u64, &remote).await.unwrap();

        // Writing into the orphaned page pulls it back instead of allocating
        // a fresh zero page over it.
        cache.write(1, &[0xCC; 8], 0).await.unwrap();
        assert!(!cache.has_orphans().await);

        let mut out = vec![0u8; PAGE_SIZE];
        cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(&out[..8], &[0xCC; 8]);
        assert_eq!(&out[8..], &[0xBB; PAGE_SIZE - 8]);
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_orphan_restored_by_read() {
        let (cache, memory, remote) = setup("/f", vec![0x00; 5 * PAGE_SIZE]);

        for index in 0..5u64 {
            cache
                .write(1, &[0xDD; PAGE_SIZE], index * PAGE_SIZE as u64)
                .await
                .unwrap();
        }
        assert!(cache.has_orphans().await);
        cache.flush(1, 5 * PAGE_SIZE as u64, &remote).await.unwrap();

        // The orphan holds newer bytes than the device; a read must restore
        // it rather than fetch.
        let mut out = vec![0u8; PAGE_SIZE];
        let n = cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(out, vec![0xDD; PAGE_SIZE]);
        assert_eq!(memory.read_count(), 0);
        assert!(!cache.has_orphans().await);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_and_isolates() {
        let good = Memory::default();
        good.insert("/a", vec![0x01; PAGE_SIZE]);
        good.insert("/b", vec![0x02; PAGE_SIZE]);
        let cache = Cache::new(PAGE_SIZE, MAX_PAGES);
        let remote_a = RemoteFile::new(good.clone(), "/a");
        let remote_b = RemoteFile::new(good.clone(), "/b");

        good.fail_reads("/b", Error::Disconnected);

        let mut out = vec![0u8; PAGE_SIZE];
        cache.read(1, &mut out, 0, &remote_a).await.unwrap();
        assert_eq!(
            cache.read(2, &mut out, 0, &remote_b).await,
            Err(Error::Disconnected)
        );

        // The failed key is not wedged and other keys are untouched.
        cache.read(1, &mut out, 0, &remote_a).await.unwrap();
        good.heal("/b");
        let n = cache.read(2, &mut out, 0, &remote_b).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(out, vec![0x02; PAGE_SIZE]);
    }

    #[tokio::test]
    async fn test_fetch_failure_mid_sequence_aborts_call() {
        let (cache, memory, remote) = setup("/f", vec![0x0F; 2 * PAGE_SIZE]);

        // Cache page 0, then fail the transport and read across both pages:
        // the resident page copies, the miss aborts the whole call.
        let mut out = vec![0u8; PAGE_SIZE];
        cache.read(1, &mut out, 0, &remote).await.unwrap();
        memory.fail_reads("/f", Error::Disconnected);

        let mut out = vec![0u8; 2 * PAGE_SIZE];
        assert_eq!(
            cache.read(1, &mut out, 0, &remote).await,
            Err(Error::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_waiters_fail_together() {
        let (cache, memory, remote) = setup("/f", vec![0xAA; PAGE_SIZE]);
        memory.fail_reads("/f", Error::Disconnected);

        let mut a = vec![0u8; PAGE_SIZE];
        let mut b = vec![0u8; PAGE_SIZE];
        let (ra, rb) = tokio::join!(
            cache.read(1, &mut a, 0, &remote),
            cache.read(1, &mut b, 0, &remote),
        );
        assert_eq!(ra, Err(Error::Disconnected));
        assert_eq!(rb, Err(Error::Disconnected));

        // The failed fetch left no residue; a healed transport serves reads.
        memory.heal("/f");
        let n = cache.read(1, &mut a, 0, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_recovers() {
        let (cache, memory, remote) = setup("/f", vec![0xEE; PAGE_SIZE]);
        memory.hold_reads("/f");

        // Park a reader inside its fetch, then cancel it.
        let reader = {
            let cache = cache.clone();
            let remote = remote.clone();
            tokio::spawn(async move {
                let mut out = vec![0u8; PAGE_SIZE];
                cache.read(1, &mut out, 0, &remote).await
            })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        reader.abort();
        let _ = reader.await;

        // The next reader observes the abandoned fetch, cleans it up, and
        // completes on its own.
        memory.open_reads("/f");
        let mut out = vec![0u8; PAGE_SIZE];
        let n = cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(out, vec![0xEE; PAGE_SIZE]);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_page_dirty() {
        let (cache, memory, remote) = setup("/f", Vec::new());

        cache.write(1, &[0x77; 100], 0).await.unwrap();
        memory.fail_writes("/f", Error::Disconnected);
        assert_eq!(
            cache.flush(1, 100, &remote).await,
            Err(Error::Disconnected)
        );

        // The page stayed dirty, so a healed flush still pushes it.
        memory.heal("/f");
        cache.flush(1, 100, &remote).await.unwrap();
        assert_eq!(memory.contents("/f").unwrap(), vec![0x77; 100]);
    }

    #[tokio::test]
    async fn test_write_during_flush_redirties_page() {
        let (cache, memory, remote) = setup("/f", Vec::new());

        cache.write(1, &[0x01; 64], 0).await.unwrap();
        memory.hold_writes("/f");

        let flusher = {
            let cache = cache.clone();
            let remote = remote.clone();
            tokio::spawn(async move { cache.flush(1, 64, &remote).await })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        // The flush has snapshotted the page and is parked on the wire; a
        // write landing now must survive the flush's success.
        cache.write(1, &[0x02; 64], 0).await.unwrap();
        memory.open_writes("/f");
        flusher.await.unwrap().unwrap();

        cache.flush(1, 64, &remote).await.unwrap();
        assert_eq!(memory.contents("/f").unwrap(), vec![0x02; 64]);
        assert_eq!(memory.write_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_of_evicted_page_reconstitutes_orphan() {
        let (cache, memory, remote) = setup("/f", vec![0u8; 8 * PAGE_SIZE]);

        cache.write(1, &[0x99; 64], 0).await.unwrap();
        memory.hold_writes("/f");
        let flusher = {
            let cache = cache.clone();
            let remote = remote.clone();
            tokio::spawn(async move { cache.flush(1, 64, &remote).await })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        // The snapshot is on the wire and the page is clean; push the page
        // out of the cache, then fail the write.
        let mut out = vec![0u8; PAGE_SIZE];
        for index in 1..=4u64 {
            cache
                .read(1, &mut out, index * PAGE_SIZE as u64, &remote)
                .await
                .unwrap();
        }
        assert!(!cache.has_orphans().await);
        memory.fail_writes("/f", Error::Disconnected);
        memory.open_writes("/f");
        assert_eq!(flusher.await.unwrap(), Err(Error::Disconnected));

        // The snapshot bytes survived as an orphan.
        let orphans = cache.take_orphans().await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].key(), PageKey { id: 1, index: 0 });
        assert!(orphans[0].is_dirty());
        assert_eq!(orphans[0].contents(), &[0x99; 64]);
    }

    #[tokio::test]
    async fn test_invalidate_discards_residency_only() {
        let (cache, memory, remote) = setup("/f", vec![0x10; PAGE_SIZE]);
        cache.set_max_pages(1).await;

        // Park one orphan, then dirty another page and invalidate.
        cache.write(1, &[0x20; PAGE_SIZE], 0).await.unwrap();
        cache
            .write(1, &[0x30; PAGE_SIZE], PAGE_SIZE as u64)
            .await
            .unwrap();
        assert!(cache.has_orphans().await);
        cache.invalidate().await;

        // Resident dirty data is gone; the orphan is still drainable.
        assert_eq!(resident_pages(&cache).await, 0);
        assert!(cache.has_orphans().await);
        let mut out = vec![0u8; PAGE_SIZE];
        let n = cache.read(1, &mut out, 0, &remote).await.unwrap();
        assert_eq!(n, PAGE_SIZE);
        assert_eq!(memory.read_count(), 0); // restored from the sink
        assert_eq!(out, vec![0x20; PAGE_SIZE]);
    }

    #[tokio::test]
    async fn test_set_page_size_clears_and_rounds() {
        let (cache, memory, remote) = setup("/f", vec![0x42; 64 * 1024]);

        let mut out = vec![0u8; PAGE_SIZE];
        cache.read(1, &mut out, 0, &remote).await.unwrap();
        cache.write(1, &[1, 2, 3], 0).await.unwrap();

        cache.set_page_size(10_000).await;
        assert_eq!(cache.page_size().await, 16_384);
        assert_eq!(resident_pages(&cache).await, 0);
        assert!(!cache.has_orphans().await);

        // Fetches now run with the new geometry.
        cache.read(1, &mut out, 0, &remote).await.unwrap();
        let last = memory.ops().pop().unwrap();
        assert!(matches!(
            last,
            Op::Read {
                offset: 0,
                len: 16_384,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_set_max_pages_applies_new_budget() {
        let (cache, _memory, remote) = setup("/f", vec![0x42; 8 * PAGE_SIZE]);

        let mut out = vec![0u8; PAGE_SIZE];
        for index in 0..4u64 {
            cache
                .read(1, &mut out, index * PAGE_SIZE as u64, &remote)
                .await
                .unwrap();
        }
        assert_eq!(resident_pages(&cache).await, 4);

        cache.set_max_pages(2).await;
        assert_eq!(cache.max_pages().await, 2);
        assert_eq!(resident_pages(&cache).await, 0);

        for index in 0..4u64 {
            cache
                .read(1, &mut out, index * PAGE_SIZE as u64, &remote)
                .await
                .unwrap();
        }
        assert_eq!(resident_pages(&cache).await, 2);
    }

    #[tokio::test]
    async fn test_randomized_reads_and_writes_match_model() {
        const FILE_PAGES: usize = 16;
        const FILE_SIZE: usize = FILE_PAGES * PAGE_SIZE;
        let mut rng = StdRng::seed_from_u64(42);

        // Writes are whole pages, the normal I/O pattern: sub-page writes
        // over unfetched device bytes intentionally see zeros, which no
        // flat-file model reproduces.
        let initial: Vec<u8> = (0..FILE_SIZE).map(|_| rng.gen()).collect();
        let memory = Memory::default();
        memory.insert("/f", initial.clone());
        let remote = RemoteFile::new(memory.clone(), "/f");
        let cache = Cache::new(PAGE_SIZE, 64);
        let mut model = initial;

        for _ in 0..200 {
            if rng.gen_bool(0.5) {
                let page = rng.gen_range(0..FILE_PAGES);
                let span = rng.gen_range(1..=3.min(FILE_PAGES - page));
                let byte = rng.gen::<u8>();
                let offset = page * PAGE_SIZE;
                let len = span * PAGE_SIZE;
                cache
                    .write(1, &vec![byte; len], offset as u64)
                    .await
                    .unwrap();
                model[offset..offset + len].fill(byte);
            } else {
                let offset = rng.gen_range(0..FILE_SIZE - 1);
                let len = rng.gen_range(1..=(FILE_SIZE - offset).min(3 * PAGE_SIZE));
                let mut out = vec![0u8; len];
                let n = cache.read(1, &mut out, offset as u64, &remote).await.unwrap();
                assert_eq!(n, len);
                assert_eq!(&out[..], &model[offset..offset + len]);
            }
        }

        // After a flush the device and the model agree byte for byte.
        assert!(!cache.has_orphans().await);
        cache.flush(1, FILE_SIZE as u64, &remote).await.unwrap();
        assert_eq!(memory.contents("/f").unwrap(), model);
    }
}
