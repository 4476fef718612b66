//! The copy-on-write chunk cache standing between an original device and its
//! difference storage.
//!
//! A [`DiffArea`] carves its original device into fixed-size chunks and, on
//! the first write to a chunk after a snapshot is taken, preserves the
//! pre-image: read it from the original device, then persist it to a
//! sub-extent borrowed from [`diff_storage::DiffStorage`]. Readers of the
//! snap image consult the same chunk table to decide whether to serve from
//! the preserved copy or read through to the original.
//!
//! Preservation happens in two phases mirroring the kernel module's
//! notify-load/notify-store split (`chunk.c`): the read from the original
//! device happens synchronously inline (the original write cannot proceed
//! until the pre-image is safely copied out), while the write into
//! difference storage is hidden behind a background completion so bursts of
//! writes don't serialize on storage I/O.

use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bitflags::bitflags;
use lru::LruCache;

use blksnap_error::{Error, Result};
use block_device::{BlockDevice, SharedDevice, SECTOR_SHIFT, SECTOR_SIZE};
use diff_buffer::DiffBufferPool;
use diff_storage::{DiffStorage, DiffStore};

/// Fired once when a diff area latches its first corrupting error. Owners
/// (normally a `Snapshot`-like object outside this crate) translate it into
/// their own event type, the same decoupling [`diff_storage::EventListener`]
/// uses to keep this crate from depending on application-layer event types.
pub type CorruptionListener = Arc<dyn Fn(Error) + Send + Sync>;

bitflags! {
    /// Per-chunk lifecycle state. `empty()` is the unpreserved "NEW" state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkState: u16 {
        const IN_CACHE      = 1 << 0;
        const LOADING       = 1 << 1;
        const BUFFER_READY  = 1 << 2;
        const STORING       = 1 << 3;
        const STORE_READY   = 1 << 4;
        const DIRTY         = 1 << 5;
        const FAILED        = 1 << 6;
    }
}

struct Chunk {
    state: ChunkState,
    buffer: Option<diff_buffer::DiffBuffer>,
    store: Option<DiffStore>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            state: ChunkState::empty(),
            buffer: None,
            store: None,
        }
    }
}

fn count_by_shift(capacity_sectors: u64, shift: u32) -> u64 {
    let chunk_sectors = 1u64 << (shift - SECTOR_SHIFT);
    capacity_sectors.div_ceil(chunk_sectors)
}

/// Derive a power-of-two chunk size the same way `cbt-map` derives tracking
/// block size: start from `min_shift`, double until the chunk count fits
/// within `max_count`. The two knobs are independent — chunk granularity
/// governs COW cost, tracking granularity governs CBT map size — so the
/// doubling is done separately here rather than shared with `cbt-map`.
pub fn calculate_chunk_size(capacity_sectors: u64, min_shift: u32, max_count: usize) -> (u32, usize) {
    let mut shift = min_shift;
    let mut count = count_by_shift(capacity_sectors, shift);
    while count > max_count as u64 {
        shift <<= 1;
        count = count_by_shift(capacity_sectors, shift);
    }
    (shift, count as usize)
}

/// Bridges an original device to difference storage through a dense table of
/// fixed-size chunks.
///
/// Diff areas created with no backing [`DiffStorage`] (`diff_storage: None`)
/// run fully in memory: preserved chunks are pinned for the diff area's
/// whole lifetime and never pushed through the LRU cache, since there is
/// nowhere to reload them from once evicted. This mode exists for small
/// devices and tests; production snapshots always contribute difference
/// storage.
pub struct DiffArea<D> {
    original: SharedDevice<D>,
    chunk_shift: u32,
    chunk_count: usize,
    chunks: Vec<Mutex<Chunk>>,
    lru: Mutex<LruCache<usize, ()>>,
    diff_storage: Option<Arc<DiffStorage>>,
    buffer_pool: Arc<DiffBufferPool>,
    corrupted: Mutex<Option<Error>>,
    corruption_listener: Option<CorruptionListener>,
    inflight: Mutex<usize>,
    inflight_cv: Condvar,
    inflight_budget: usize,
}

impl<D: BlockDevice + 'static> DiffArea<D> {
    pub fn new(
        original: SharedDevice<D>,
        capacity_sectors: u64,
        chunk_min_shift: u32,
        chunk_max_count: usize,
        cache_capacity: usize,
        buffer_pool: Arc<DiffBufferPool>,
        diff_storage: Option<Arc<DiffStorage>>,
        inflight_budget: usize,
        corruption_listener: Option<CorruptionListener>,
    ) -> Arc<Self> {
        let (chunk_shift, chunk_count) =
            calculate_chunk_size(capacity_sectors, chunk_min_shift, chunk_max_count);
        let chunks = (0..chunk_count).map(|_| Mutex::new(Chunk::new())).collect();
        let cache_cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        tracing::info!(chunk_count, chunk_shift, "diff area created");
        Arc::new(Self {
            original,
            chunk_shift,
            chunk_count,
            chunks,
            lru: Mutex::new(LruCache::new(cache_cap)),
            diff_storage,
            buffer_pool,
            corrupted: Mutex::new(None),
            corruption_listener,
            inflight: Mutex::new(0),
            inflight_cv: Condvar::new(),
            inflight_budget,
        })
    }

    pub fn chunk_sectors(&self) -> u64 {
        1u64 << (self.chunk_shift - SECTOR_SHIFT)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.lock().unwrap().is_some()
    }

    fn corruption_error(&self) -> Error {
        self.corrupted.lock().unwrap().clone().unwrap_or(Error::NoData)
    }

    pub fn set_corrupted(&self, err: Error) {
        let mut guard = self.corrupted.lock().unwrap();
        if guard.is_none() {
            tracing::error!(error = %err, "diff area corrupted");
            *guard = Some(err.clone());
            if let Some(listener) = &self.corruption_listener {
                listener(err);
            }
        }
    }

    fn chunk_range(&self, sector: u64, count: u64) -> Result<(usize, usize)> {
        if count == 0 {
            return Err(Error::invalid("range must be non-empty"));
        }
        let chunk_sectors = self.chunk_sectors();
        let first = (sector / chunk_sectors) as usize;
        let last = ((sector + count - 1) / chunk_sectors) as usize;
        if last >= self.chunk_count {
            return Err(Error::invalid("range exceeds diff area"));
        }
        Ok((first, last))
    }

    fn fail_chunk(&self, chunk: &mut Chunk, err: Error) {
        if let Some(buf) = chunk.buffer.take() {
            self.buffer_pool.release(buf);
        }
        chunk.store = None;
        chunk.state = ChunkState::FAILED;
        self.set_corrupted(err);
    }

    fn inflight_inc(&self) {
        *self.inflight.lock().unwrap() += 1;
    }

    fn inflight_dec(&self) {
        *self.inflight.lock().unwrap() -= 1;
        self.inflight_cv.notify_all();
    }

    /// Block the caller while the number of in-flight background stores
    /// exceeds `inflight_budget` (write backpressure analogous to the
    /// kernel module's queue-depth throttling over `diff_storage`).
    pub fn throttling_io(&self) {
        let guard = self.inflight.lock().unwrap();
        let _unused = self
            .inflight_cv
            .wait_while(guard, |n| *n > self.inflight_budget)
            .unwrap();
    }

    fn is_preserved(&self, chunk: &Chunk) -> bool {
        if self.diff_storage.is_some() {
            chunk.state.intersects(ChunkState::STORE_READY | ChunkState::STORING)
        } else {
            chunk.state.contains(ChunkState::BUFFER_READY)
        }
    }

    /// Preserve the pre-image of every chunk overlapping
    /// `[sector, sector+count)` that has not already been preserved.
    ///
    /// The read from the original device happens before this call returns
    /// (the caller's own write must not proceed until the pre-image is
    /// safe). The write into difference storage may still be in flight on
    /// return — see [`DiffArea::throttling_io`] for backpressure on that.
    pub fn copy(self: &Arc<Self>, sector: u64, count: u64, no_wait: bool) -> Result<()> {
        if self.is_corrupted() {
            return Err(self.corruption_error());
        }
        let (first, last) = self.chunk_range(sector, count)?;
        for idx in first..=last {
            self.copy_one_chunk(idx, no_wait)?;
        }
        Ok(())
    }

    fn lock_chunk(&self, idx: usize, no_wait: bool) -> Result<MutexGuard<'_, Chunk>> {
        if no_wait {
            self.chunks[idx].try_lock().map_err(|_| Error::WouldBlock)
        } else {
            Ok(self.chunks[idx].lock().unwrap())
        }
    }

    fn copy_one_chunk(self: &Arc<Self>, idx: usize, no_wait: bool) -> Result<()> {
        let mut guard = self.lock_chunk(idx, no_wait)?;
        if guard.state.contains(ChunkState::FAILED) {
            return Err(self.corruption_error());
        }
        if self.is_preserved(&guard) {
            return Ok(());
        }

        let mut buffer = match self.buffer_pool.take() {
            Ok(b) => b,
            Err(e) => {
                self.fail_chunk(&mut guard, e.clone());
                return Err(self.corruption_error());
            }
        };
        guard.state |= ChunkState::LOADING;
        let chunk_start = idx as u64 * self.chunk_sectors();
        drop(guard);
        let read_result = self.original.read_at(chunk_start, buffer.as_mut_slice());
        let mut guard = self.chunks[idx].lock().unwrap();
        match read_result {
            Ok(()) => {
                guard.state.remove(ChunkState::LOADING);
                guard.state |= ChunkState::BUFFER_READY;
                guard.buffer = Some(buffer);
            }
            Err(e) => {
                self.buffer_pool.release(buffer);
                self.fail_chunk(&mut guard, e);
                return Err(self.corruption_error());
            }
        }
        self.schedule_store(idx, guard)
    }

    /// Persist the buffer currently attached to `idx` into difference
    /// storage (allocating a sub-extent the first time, reusing the
    /// existing one on a re-dirty so a chunk never holds more than one
    /// sub-extent). No-op, beyond marking the chunk cacheable, for diff
    /// areas with no backing storage.
    fn schedule_store(self: &Arc<Self>, idx: usize, mut guard: MutexGuard<'_, Chunk>) -> Result<()> {
        let Some(diff_storage) = self.diff_storage.clone() else {
            guard.state.remove(ChunkState::LOADING);
            drop(guard);
            return Ok(());
        };

        let store = match &guard.store {
            Some(existing) => existing.clone(),
            None => match diff_storage.get_store(self.chunk_sectors()) {
                Ok(s) => {
                    guard.store = Some(s.clone());
                    s
                }
                Err(e) => {
                    self.fail_chunk(&mut guard, e);
                    return Err(self.corruption_error());
                }
            },
        };
        guard.state.remove(ChunkState::LOADING);
        guard.state |= ChunkState::STORING;
        let bytes = guard.buffer.as_ref().expect("buffer present before store").as_slice().to_vec();
        drop(guard);

        self.inflight_inc();
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            let result = store.write_at(0, &bytes);
            this.complete_store(idx, result);
        });
        Ok(())
    }

    fn complete_store(self: &Arc<Self>, idx: usize, result: Result<()>) {
        self.inflight_dec();
        let mut guard = self.chunks[idx].lock().unwrap();
        match result {
            Ok(()) => {
                guard.state.remove(ChunkState::STORING);
                guard.state |= ChunkState::STORE_READY;
                drop(guard);
                self.schedule_caching(idx);
            }
            Err(e) => self.fail_chunk(&mut guard, e),
        }
    }

    /// Admit a newly STORE_READY chunk into the LRU cache, evicting and
    /// releasing the least-recently-used chunk's buffer if the cache is at
    /// capacity. In-memory diff areas (no backing storage) never evict:
    /// there is nowhere to reload a pre-image from.
    fn schedule_caching(&self, idx: usize) {
        if self.diff_storage.is_none() {
            return;
        }
        let mut lru = self.lru.lock().unwrap();
        let mut guard = self.chunks[idx].lock().unwrap();
        if guard.state.contains(ChunkState::IN_CACHE) {
            return;
        }
        guard.state |= ChunkState::IN_CACHE;
        drop(guard);
        if let Some((evicted, ())) = lru.push(idx, ()) {
            if evicted != idx {
                self.evict(evicted);
            }
        }
    }

    fn evict(&self, idx: usize) {
        let mut guard = self.chunks[idx].lock().unwrap();
        if guard.state.intersects(ChunkState::LOADING | ChunkState::STORING) {
            tracing::warn!(idx, "skipped eviction of chunk with in-flight I/O");
            return;
        }
        if let Some(buf) = guard.buffer.take() {
            self.buffer_pool.release(buf);
        }
        guard.state.remove(ChunkState::BUFFER_READY | ChunkState::IN_CACHE);
    }

    fn load_into_chunk<'a>(self: &'a Arc<Self>, idx: usize, mut guard: MutexGuard<'a, Chunk>) -> Result<MutexGuard<'a, Chunk>> {
        if guard.buffer.is_some() {
            return Ok(guard);
        }
        let mut buffer = self.buffer_pool.take()?;
        let from_store = guard.state.contains(ChunkState::STORE_READY);
        let store = guard.store.clone();
        drop(guard);
        let result = if from_store {
            store.expect("store present when STORE_READY").read_at(0, buffer.as_mut_slice())
        } else {
            let chunk_start = idx as u64 * self.chunk_sectors();
            self.original.read_at(chunk_start, buffer.as_mut_slice())
        };
        let mut guard = self.chunks[idx].lock().unwrap();
        match result {
            Ok(()) => {
                guard.state |= ChunkState::BUFFER_READY;
                guard.buffer = Some(buffer);
                if from_store {
                    drop(guard);
                    self.schedule_caching(idx);
                    guard = self.chunks[idx].lock().unwrap();
                }
                Ok(guard)
            }
            Err(e) => {
                self.buffer_pool.release(buffer);
                self.fail_chunk(&mut guard, e);
                Err(self.corruption_error())
            }
        }
    }

    /// Split `[sector, sector+len_bytes)` into per-chunk `(chunk_idx,
    /// offset_in_chunk_bytes, len_bytes)` segments.
    fn chunk_segments(&self, sector: u64, len_bytes: usize) -> Vec<(usize, usize, usize)> {
        let chunk_sectors = self.chunk_sectors();
        let chunk_bytes = (chunk_sectors * SECTOR_SIZE) as usize;
        let mut segments = Vec::new();
        let mut done = 0usize;
        let mut cur_sector = sector;
        while done < len_bytes {
            let idx = (cur_sector / chunk_sectors) as usize;
            let chunk_start_sector = idx as u64 * chunk_sectors;
            let offset = ((cur_sector - chunk_start_sector) * SECTOR_SIZE) as usize;
            let take = (chunk_bytes - offset).min(len_bytes - done);
            segments.push((idx, offset, take));
            done += take;
            cur_sector += (take as u64) / SECTOR_SIZE;
        }
        segments
    }

    /// Read `out.len()` bytes starting at `sector` from the snap image's
    /// point of view: preserved chunks are served from their buffer
    /// (loading it from difference storage first if it isn't cache-resident
    /// already), everything else reads through to the original device.
    pub fn image_read(self: &Arc<Self>, sector: u64, out: &mut [u8]) -> Result<()> {
        if self.is_corrupted() {
            return Err(self.corruption_error());
        }
        if out.is_empty() {
            return Ok(());
        }
        for (idx, offset, len) in self.chunk_segments(sector, out.len()) {
            if idx >= self.chunk_count {
                return Err(Error::invalid("range exceeds diff area"));
            }
            let dst_start = self.segment_dst_offset(sector, idx, offset);
            let guard = self.chunks[idx].lock().unwrap();
            if guard.state.contains(ChunkState::FAILED) {
                return Err(self.corruption_error());
            }
            if self.is_preserved(&guard) {
                let mut guard = self.load_into_chunk(idx, guard)?;
                let buf = guard.buffer.as_mut().expect("buffer loaded by load_into_chunk");
                out[dst_start..dst_start + len].copy_from_slice(&buf.as_slice()[offset..offset + len]);
            } else {
                drop(guard);
                let chunk_start = idx as u64 * self.chunk_sectors();
                let abs_sector = chunk_start + offset as u64 / SECTOR_SIZE;
                self.original.read_at(abs_sector, &mut out[dst_start..dst_start + len])?;
            }
        }
        Ok(())
    }

    /// Offset of a chunk segment's bytes within the caller's output/input
    /// buffer, given the buffer starts at `base_sector`.
    fn segment_dst_offset(&self, base_sector: u64, idx: usize, offset_in_chunk: usize) -> usize {
        let chunk_start_sector = idx as u64 * self.chunk_sectors();
        let chunk_start_bytes = chunk_start_sector * SECTOR_SIZE;
        let base_bytes = base_sector * SECTOR_SIZE;
        (chunk_start_bytes + offset_in_chunk as u64 - base_bytes) as usize
    }

    /// Write `data.len()` bytes starting at `sector`, preserving the
    /// pre-image first if this is the chunk's first write. The chunk is
    /// left `STORE_READY` (pending or complete) so subsequent reads see the
    /// new bytes immediately regardless of whether the background
    /// difference-storage write has landed yet.
    pub fn image_write(self: &Arc<Self>, sector: u64, data: &[u8]) -> Result<()> {
        if self.is_corrupted() {
            return Err(self.corruption_error());
        }
        if data.is_empty() {
            return Ok(());
        }
        for (idx, offset, len) in self.chunk_segments(sector, data.len()) {
            if idx >= self.chunk_count {
                return Err(Error::invalid("range exceeds diff area"));
            }
            let src_start = self.segment_dst_offset(sector, idx, offset);
            self.write_chunk_range(idx, offset, &data[src_start..src_start + len])?;
        }
        Ok(())
    }

    fn write_chunk_range(self: &Arc<Self>, idx: usize, offset: usize, data: &[u8]) -> Result<()> {
        let guard = self.chunks[idx].lock().unwrap();
        if guard.state.contains(ChunkState::FAILED) {
            return Err(self.corruption_error());
        }
        let mut guard = self.load_into_chunk(idx, guard)?;
        {
            let buf = guard.buffer.as_mut().expect("buffer loaded by load_into_chunk");
            buf.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        }
        guard.state |= ChunkState::DIRTY;
        self.schedule_store(idx, guard)
    }
}
