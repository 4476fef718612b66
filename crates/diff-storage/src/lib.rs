//! Pool of preallocated backing extents, handed out as sub-extents to diff
//! areas.
//!
//! Difference storage is scratch space contributed by userspace (spec.md's
//! Non-goals: it is not expected to survive a host crash). A monotonic
//! cursor walks the contributed extents in order; once an extent can't
//! satisfy a request its unused tail is discarded rather than split.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use blksnap_error::{Error, Result};
use block_device::{BlockDevice, DeviceId, SectorRange, SharedDevice};

/// Events emitted as the diff storage's free capacity crosses thresholds.
/// Owners (normally a [`Snapshot`]-like object outside this crate) drain
/// these and forward them to their own event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStorageEvent {
    LowFreeSpace { sectors_free: u64 },
    OutOfSpace,
}

pub type EventListener = Arc<dyn Fn(DiffStorageEvent) + Send + Sync>;

struct ContributedExtent {
    device_id: DeviceId,
    device: SharedDevice<Box<dyn BlockDevice>>,
    sector: u64,
    remaining: u64,
}

/// A sub-extent allocated to a caller by [`DiffStorage::get_store`].
#[derive(Clone)]
pub struct DiffStore {
    pub device_id: DeviceId,
    pub sector: u64,
    pub count: u64,
    device: SharedDevice<Box<dyn BlockDevice>>,
}

impl DiffStore {
    pub fn read_at(&self, offset_sectors: u64, buf: &mut [u8]) -> Result<()> {
        self.device.read_at(self.sector + offset_sectors, buf)
    }

    pub fn write_at(&self, offset_sectors: u64, buf: &[u8]) -> Result<()> {
        self.device.write_at(self.sector + offset_sectors, buf)
    }
}

struct State {
    extents: VecDeque<ContributedExtent>,
    capacity_total: u64,
    capacity_used: u64,
    low_water_crossed: bool,
    exhausted: bool,
}

/// Shared pool of backing extents. One `DiffStorage` may back several diff
/// areas (spec.md's Snapshot holds a single shared `DiffStorage` for all of
/// its participating devices).
pub struct DiffStorage {
    low_water_sectors: u64,
    listener: Option<EventListener>,
    state: Mutex<State>,
}

impl DiffStorage {
    pub fn new(low_water_sectors: u64, listener: Option<EventListener>) -> Self {
        Self {
            low_water_sectors,
            listener,
            state: Mutex::new(State {
                extents: VecDeque::new(),
                capacity_total: 0,
                capacity_used: 0,
                low_water_crossed: false,
                exhausted: false,
            }),
        }
    }

    fn emit(&self, event: DiffStorageEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    /// Contribute one or more ranges on `device` to the free pool.
    pub fn append(
        &self,
        device_id: DeviceId,
        device: SharedDevice<Box<dyn BlockDevice>>,
        ranges: &[SectorRange],
    ) -> Result<()> {
        if ranges.is_empty() {
            return Err(Error::invalid("append requires at least one range"));
        }
        let mut state = self.state.lock().unwrap();
        for range in ranges {
            state.capacity_total += range.count;
            state.extents.push_back(ContributedExtent {
                device_id,
                device: device.clone(),
                sector: range.sector,
                remaining: range.count,
            });
        }
        // New capacity may pull us back above the low-water threshold.
        if state.capacity_total - state.capacity_used > self.low_water_sectors {
            state.low_water_crossed = false;
        }
        state.exhausted = false;
        tracing::info!(%device_id, ranges = ranges.len(), "diff storage extents appended");
        Ok(())
    }

    /// Allocate a contiguous sub-extent of `size_sectors`. No split across
    /// extents: if the head extent can't satisfy the request, its
    /// remaining tail is discarded and the next extent is tried.
    pub fn get_store(&self, size_sectors: u64) -> Result<DiffStore> {
        if size_sectors == 0 {
            return Err(Error::invalid("get_store requires size_sectors > 0"));
        }
        let mut state = self.state.lock().unwrap();
        loop {
            let Some(front) = state.extents.front_mut() else {
                if !state.exhausted {
                    state.exhausted = true;
                    self.emit(DiffStorageEvent::OutOfSpace);
                    tracing::error!("diff storage exhausted");
                }
                return Err(Error::NoSpace);
            };
            if front.remaining < size_sectors {
                // Unused tail discarded, no splitting across extents.
                state.capacity_used += front.remaining;
                state.extents.pop_front();
                continue;
            }
            let store = DiffStore {
                device_id: front.device_id,
                sector: front.sector,
                count: size_sectors,
                device: front.device.clone(),
            };
            front.sector += size_sectors;
            front.remaining -= size_sectors;
            let remaining_after = front.remaining;
            state.capacity_used += size_sectors;
            if remaining_after == 0 {
                state.extents.pop_front();
            }

            let free = state.capacity_total.saturating_sub(state.capacity_used);
            if free < self.low_water_sectors && !state.low_water_crossed {
                state.low_water_crossed = true;
                self.emit(DiffStorageEvent::LowFreeSpace { sectors_free: free });
                tracing::warn!(sectors_free = free, "diff storage low on free space");
            }
            return Ok(store);
        }
    }

    /// Total sectors ever contributed.
    pub fn capacity_hint(&self) -> u64 {
        self.state.lock().unwrap().capacity_total
    }

    /// Sectors currently free across all remaining extents.
    pub fn free(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.capacity_total.saturating_sub(state.capacity_used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.lock().unwrap().exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device(sectors: u64) -> SharedDevice<Box<dyn BlockDevice>> {
        let boxed: Box<dyn BlockDevice> = Box::new(MemDevice::new(sectors));
        SharedDevice::new(boxed)
    }

    #[test]
    fn get_store_hands_out_contiguous_sub_extents() {
        let storage = DiffStorage::new(0, None);
        storage
            .append(DeviceId::new(8, 0), device(100), &[SectorRange::new(0, 100).unwrap()])
            .unwrap();

        let a = storage.get_store(10).unwrap();
        assert_eq!(a.sector, 0);
        let b = storage.get_store(10).unwrap();
        assert_eq!(b.sector, 10);
    }

    #[test]
    fn insufficient_tail_is_discarded_not_split() {
        let storage = DiffStorage::new(0, None);
        storage
            .append(
                DeviceId::new(8, 0),
                device(30),
                &[SectorRange::new(0, 15).unwrap(), SectorRange::new(100, 15).unwrap()],
            )
            .unwrap();

        // First extent only has 15 sectors; asking for 20 must skip to the second extent
        // entirely, discarding the first extent's unused tail.
        let store = storage.get_store(15).unwrap();
        assert_eq!(store.sector, 0);
        let store2 = storage.get_store(15).unwrap();
        assert_eq!(store2.sector, 100, "should have advanced past exhausted first extent");
    }

    #[test]
    fn exhaustion_fails_with_no_space_and_emits_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let listener: EventListener = Arc::new(move |ev| {
            if matches!(ev, DiffStorageEvent::OutOfSpace) {
                count2.fetch_add(1, Ordering::SeqCst);
            }
        });
        let storage = DiffStorage::new(0, Some(listener));
        storage
            .append(DeviceId::new(8, 0), device(10), &[SectorRange::new(0, 10).unwrap()])
            .unwrap();

        storage.get_store(10).unwrap();
        assert!(storage.get_store(1).is_err());
        assert!(storage.get_store(1).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1, "OUT_OF_SPACE is emitted exactly once");
        assert!(storage.is_exhausted());
    }

    #[test]
    fn low_water_event_fires_once_per_crossing() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let listener: EventListener = Arc::new(move |ev| {
            if matches!(ev, DiffStorageEvent::LowFreeSpace { .. }) {
                count2.fetch_add(1, Ordering::SeqCst);
            }
        });
        let storage = DiffStorage::new(5, Some(listener));
        storage
            .append(DeviceId::new(8, 0), device(10), &[SectorRange::new(0, 10).unwrap()])
            .unwrap();

        storage.get_store(1).unwrap(); // free=9, above water
        assert_eq!(count.load(Ordering::SeqCst), 0);
        storage.get_store(5).unwrap(); // free=4, crosses water
        assert_eq!(count.load(Ordering::SeqCst), 1);
        storage.get_store(1).unwrap(); // still below water, no re-emit
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
