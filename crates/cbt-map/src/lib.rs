//! Double-buffered Change Block Tracking (CBT) map.
//!
//! One [`CbtMap`] is kept per original device. It survives across snapshots
//! (that is the point of incremental tracking): `take`/`release` only
//! `switch` it, they never tear it down.

use std::sync::Mutex;

use blksnap_error::{Error, Result};
use block_device::SECTOR_SHIFT;
use uuid::Uuid;

/// A single entry in the read-map or write-map: the snap-number in which the
/// block last changed, or `0` if it has never changed.
pub type SnapNumber = u8;

struct Inner {
    device_capacity: u64,
    blk_size_shift: u32,
    blk_count: usize,
    read_map: Vec<SnapNumber>,
    write_map: Vec<SnapNumber>,
    snap_number_previous: SnapNumber,
    snap_number_active: SnapNumber,
    generation_id: Uuid,
    corrupted: bool,
}

fn count_by_shift(capacity_sectors: u64, shift: u32) -> u64 {
    let blk_size_sectors = 1u64 << (shift - SECTOR_SHIFT);
    capacity_sectors.div_ceil(blk_size_sectors)
}

fn calculate_block_size(capacity_sectors: u64, min_shift: u32, max_count: usize) -> (u32, usize) {
    let mut shift = min_shift;
    let mut count = count_by_shift(capacity_sectors, shift);
    while count > max_count as u64 {
        shift <<= 1;
        count = count_by_shift(capacity_sectors, shift);
    }
    (shift, count as usize)
}

impl Inner {
    fn new(capacity_sectors: u64, min_shift: u32, max_count: usize) -> Self {
        let (blk_size_shift, blk_count) = calculate_block_size(capacity_sectors, min_shift, max_count);
        Self {
            device_capacity: capacity_sectors,
            blk_size_shift,
            blk_count,
            read_map: vec![0; blk_count],
            write_map: vec![0; blk_count],
            snap_number_previous: 0,
            snap_number_active: 1,
            generation_id: Uuid::new_v4(),
            corrupted: false,
        }
    }

    fn block_for_sector(&self, sector: u64) -> u64 {
        sector >> (self.blk_size_shift - SECTOR_SHIFT)
    }

    fn set_in(&mut self, sector_start: u64, sector_cnt: u64, snap_number: SnapNumber, write: bool) -> Result<()> {
        if self.corrupted {
            return Err(Error::invalid("cbt map is corrupted"));
        }
        if sector_cnt == 0 {
            return Ok(());
        }
        let first = self.block_for_sector(sector_start);
        let last = self.block_for_sector(sector_start + sector_cnt - 1);
        for block in first..=last {
            if block as usize >= self.blk_count {
                self.corrupted = true;
                tracing::error!(block, blk_count = self.blk_count, "cbt block index out of range");
                return Err(Error::invalid(format!(
                    "block #{block} out of range, map has {} blocks",
                    self.blk_count
                )));
            }
            let map = if write { &mut self.write_map } else { &mut self.read_map };
            if map[block as usize] < snap_number {
                map[block as usize] = snap_number;
            }
        }
        Ok(())
    }
}

/// Per-device change block tracking map. All operations are short,
/// in-memory, and protected by a single mutex (mirroring the kernel
/// module's single spinlock over both maps and the snap-numbers).
pub struct CbtMap {
    inner: Mutex<Inner>,
}

impl CbtMap {
    /// Create a CBT map sized for `capacity_sectors`, deriving the tracking
    /// block size per spec.md §4.A: start from `min_shift`, double until the
    /// resulting block count is within `max_count`.
    pub fn new(capacity_sectors: u64, min_shift: u32, max_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(capacity_sectors, min_shift, max_count)),
        }
    }

    /// Mark every block overlapping `[sector_start, sector_start+sector_cnt)`
    /// with the active snap-number in the write-map, monotonically (only if
    /// the stored value is currently smaller).
    pub fn set(&self, sector_start: u64, sector_cnt: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let active = inner.snap_number_active;
        inner.set_in(sector_start, sector_cnt, active, true)
    }

    /// As [`CbtMap::set`], but also writes the previous snap-number into the
    /// read-map over the same range. Used both when a snapshot consumer
    /// (the snap image) independently learns a block is dirty, and for
    /// `mark_dirty_blocks` on the control surface (spec.md's Open Question
    /// 1 — resolved in favor of updating both maps, per
    /// `cbt_map_mark_dirty_blocks` in the original module).
    pub fn set_both(&self, sector_start: u64, sector_cnt: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let active = inner.snap_number_active;
        inner.set_in(sector_start, sector_cnt, active, true)?;
        let previous = inner.snap_number_previous;
        inner.set_in(sector_start, sector_cnt, previous, false)
    }

    /// Copy write-map into read-map, advance the snap-number epoch. On
    /// overflow at 256, reset active to 1, zero the write-map, and draw a
    /// fresh generation UUID (invalidating prior incremental baselines).
    pub fn switch(&self) {
        let mut inner = self.inner.lock().unwrap();
        let write_map = inner.write_map.clone();
        inner.read_map.copy_from_slice(&write_map);
        inner.snap_number_previous = inner.snap_number_active;
        if inner.snap_number_active == 255 {
            // Active would become 256: reset to 1 and start a new generation.
            inner.snap_number_active = 1;
            inner.write_map.iter_mut().for_each(|b| *b = 0);
            inner.generation_id = Uuid::new_v4();
            tracing::debug!("cbt generation reset after snap-number wraparound");
        } else {
            inner.snap_number_active += 1;
        }
    }

    /// Copy `out.len()` bytes of the read-map starting at `offset` into
    /// `out`, returning the number of bytes actually copied (at most
    /// `blk_count - offset`).
    pub fn read_to_user(&self, offset: usize, out: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        if inner.corrupted {
            return Err(Error::invalid("cbt map is corrupted"));
        }
        if offset > inner.blk_count {
            return Err(Error::invalid("offset beyond cbt map"));
        }
        let real_size = out.len().min(inner.blk_count - offset);
        out[..real_size].copy_from_slice(&inner.read_map[offset..offset + real_size]);
        Ok(real_size)
    }

    /// Reallocate both maps for a new device capacity, with
    /// `previous = 0, active = 1` (a fresh incremental baseline).
    pub fn reset(&self, capacity_sectors: u64, min_shift: u32, max_count: usize) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new(capacity_sectors, min_shift, max_count);
        tracing::info!(capacity_sectors, "cbt map reset");
    }

    pub fn is_corrupted(&self) -> bool {
        self.inner.lock().unwrap().corrupted
    }

    pub fn blk_count(&self) -> usize {
        self.inner.lock().unwrap().blk_count
    }

    pub fn blk_size_shift(&self) -> u32 {
        self.inner.lock().unwrap().blk_size_shift
    }

    pub fn device_capacity(&self) -> u64 {
        self.inner.lock().unwrap().device_capacity
    }

    pub fn generation_id(&self) -> Uuid {
        self.inner.lock().unwrap().generation_id
    }

    pub fn snap_number_active(&self) -> SnapNumber {
        self.inner.lock().unwrap().snap_number_active
    }

    pub fn snap_number_previous(&self) -> SnapNumber {
        self.inner.lock().unwrap().snap_number_previous
    }

    /// Snapshot the whole read-map, for tests and small devices.
    pub fn read_map_snapshot(&self) -> Vec<SnapNumber> {
        self.inner.lock().unwrap().read_map.clone()
    }
}
