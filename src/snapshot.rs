//! A taken (or about-to-be-taken) point-in-time view across one or more
//! tracked devices: one shared difference storage pool, one diff area and
//! one snap image per participating device, one event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use blksnap_error::{Error, Result};
use block_device::{BlockDevice, DeviceId, SectorRange, SharedDevice};
use cbt_map::CbtMap;
use diff_area::DiffArea;
use diff_buffer::DiffBufferPool;
use diff_storage::{DiffStorage, DiffStorageEvent};
use snap_image::SnapImage;
use tracker::Tracker;

use crate::config::Config;
use crate::event::{Event, EventQueue};

type DynTracker = Tracker<Box<dyn BlockDevice>>;
type DynDiffArea = DiffArea<Box<dyn BlockDevice>>;
type DynSnapImage = SnapImage<Box<dyn BlockDevice>>;

struct Participant {
    tracker: Arc<DynTracker>,
    diff_area: Arc<DynDiffArea>,
    image: Arc<DynSnapImage>,
}

pub struct Snapshot {
    pub id: Uuid,
    diff_storage: Arc<DiffStorage>,
    participants: HashMap<DeviceId, Participant>,
    taken: AtomicBool,
    pub events: Arc<EventQueue>,
}

impl Snapshot {
    /// Build a snapshot over `trackers`, each paired with its device's
    /// original capacity. Does not attach to any tracker yet — that is
    /// [`Snapshot::take`]'s job, once difference storage has been
    /// contributed via [`Snapshot::append_storage`].
    pub fn new(
        id: Uuid,
        cfg: &Config,
        trackers: Vec<(Arc<DynTracker>, SharedDevice<Box<dyn BlockDevice>>, u64)>,
        image_device_ids: &HashMap<DeviceId, DeviceId>,
    ) -> Arc<Self> {
        let events = Arc::new(EventQueue::new());
        let events_for_listener = Arc::clone(&events);
        let diff_storage = Arc::new(DiffStorage::new(
            cfg.diff_storage_low_water_sectors,
            Some(Arc::new(move |ev: DiffStorageEvent| {
                let timestamp = events_for_listener.timestamp();
                events_for_listener.push(match ev {
                    DiffStorageEvent::LowFreeSpace { sectors_free } => {
                        Event::LowFreeSpace { timestamp, sectors_free }
                    }
                    DiffStorageEvent::OutOfSpace => Event::OutOfSpace { timestamp },
                });
            })),
        ));

        let mut participants = HashMap::new();
        for (tracker, original, capacity_sectors) in trackers {
            let device_id = tracker.device_id();
            let pool_chunk_bytes = {
                let (shift, _) =
                    diff_area::calculate_chunk_size(capacity_sectors, cfg.chunk_min_shift, cfg.chunk_max_count);
                1usize << shift
            };
            let buffer_pool = Arc::new(DiffBufferPool::new(
                pool_chunk_bytes,
                cfg.diff_buffer_high_water,
                cfg.diff_buffer_hard_cap,
            ));
            let events_for_corruption = Arc::clone(&events);
            let corruption_listener: Arc<dyn Fn(Error) + Send + Sync> = Arc::new(move |err: Error| {
                let timestamp = events_for_corruption.timestamp();
                events_for_corruption.push(Event::Corrupted {
                    timestamp,
                    device_id,
                    error: err.to_string(),
                });
            });
            let diff_area = DiffArea::new(
                original,
                capacity_sectors,
                cfg.chunk_min_shift,
                cfg.chunk_max_count,
                cfg.cache_capacity,
                buffer_pool,
                Some(Arc::clone(&diff_storage)),
                cfg.inflight_budget,
                Some(corruption_listener),
            );
            let image_device_id = *image_device_ids.get(&device_id).unwrap_or(&device_id);
            let image = SnapImage::new(
                image_device_id,
                device_id,
                capacity_sectors,
                Arc::clone(&diff_area),
                Arc::clone(tracker.cbt()),
            );
            participants.insert(
                device_id,
                Participant { tracker, diff_area, image },
            );
        }

        tracing::info!(%id, devices = participants.len(), "snapshot created");
        Arc::new(Self {
            id,
            diff_storage,
            participants,
            taken: AtomicBool::new(false),
            events,
        })
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.participants.keys().copied().collect()
    }

    pub fn image_device_ids(&self) -> Vec<DeviceId> {
        self.participants.values().map(|p| p.image.device_id()).collect()
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::SeqCst)
    }

    pub fn append_storage(
        &self,
        device_id: DeviceId,
        device: SharedDevice<Box<dyn BlockDevice>>,
        ranges: &[SectorRange],
    ) -> Result<()> {
        self.diff_storage.append(device_id, device, ranges)
    }

    /// Atomically attach every participant's diff area to its tracker and
    /// close the current CBT epoch, so the blocks changed up to this moment
    /// become readable from the (now-frozen) read-map.
    pub fn take(&self) -> Result<()> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return Err(Error::busy("snapshot already taken"));
        }
        for participant in self.participants.values() {
            participant.tracker.take(Arc::clone(&participant.diff_area));
            participant.tracker.cbt().switch();
        }
        tracing::info!(id = %self.id, "snapshot taken");
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if !self.taken.swap(false, Ordering::SeqCst) {
            return Err(Error::busy("snapshot was not taken"));
        }
        for participant in self.participants.values() {
            participant.tracker.release();
            participant.image.set_ready(false);
            participant.image.shutdown();
        }
        let timestamp = self.events.timestamp();
        self.events.push(Event::Terminate { timestamp });
        tracing::info!(id = %self.id, "snapshot released");
        Ok(())
    }

    pub fn image_for(&self, device_id: DeviceId) -> Option<Arc<DynSnapImage>> {
        self.participants.get(&device_id).map(|p| Arc::clone(&p.image))
    }

    pub fn image_by_image_id(&self, image_device_id: DeviceId) -> Option<Arc<DynSnapImage>> {
        self.participants
            .values()
            .find(|p| p.image.device_id() == image_device_id)
            .map(|p| Arc::clone(&p.image))
    }

    pub fn wait_event(&self, timeout: std::time::Duration) -> Option<Event> {
        self.events.wait(timeout)
    }
}
