//! Point-in-time block device snapshots with change block tracking.
//!
//! The engine tracks devices ([`Blksnap::add`]), groups a subset of tracked
//! devices into a snapshot ([`Blksnap::create`]), accepts contributed
//! difference storage for it ([`Blksnap::append_storage`]), and then goes
//! live ([`Blksnap::take`]) by attaching each device's diff area to its
//! tracker. From that point, writes against the original devices preserve
//! their pre-image into difference storage, and each device's snap image
//! (published under its own device id) serves the frozen view.
//!
//! All mutable engine state — the device registry, the snapshot registry —
//! sits behind a single mutex, matching spec.md §9's design note that the
//! control surface is low-frequency enough not to need finer-grained
//! locking; the hot path (bios against tracked devices) never touches it.

mod config;
mod event;
mod snapshot;

pub use config::Config;
pub use event::Event;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use blksnap_error::{Error, Result};
pub use block_device::{BioOp, Bio, BlockDevice, DeviceId, SectorRange, SharedDevice};
use cbt_map::CbtMap;
use snap_image::ImageStatus;
use snapshot::Snapshot;
use tracker::Tracker;

pub use cbt_map::SnapNumber;
pub use diff_area::ChunkState;
pub use snap_image::ImageStatus as SnapImageStatus;

type DynTracker = Tracker<Box<dyn BlockDevice>>;

/// Snapshot of one tracked device's CBT map, as returned by
/// [`Blksnap::tracker_collect`] (spec.md §6's `tracker_collect`).
#[derive(Debug, Clone)]
pub struct CbtInfo {
    pub device_id: DeviceId,
    pub device_capacity: u64,
    pub blk_size_shift: u32,
    pub blk_count: usize,
    pub generation_id: Uuid,
    pub snap_number_previous: SnapNumber,
    pub snap_number_active: SnapNumber,
}

struct TrackedDevice {
    tracker: Arc<DynTracker>,
    cbt: Arc<CbtMap>,
    original: SharedDevice<Box<dyn BlockDevice>>,
    capacity_sectors: u64,
    in_snapshot: Option<Uuid>,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, TrackedDevice>,
    snapshots: HashMap<Uuid, Arc<Snapshot>>,
    next_image_minor: u32,
}

/// The snapshot engine. Cheaply cloneable; clones share the same
/// underlying registries.
#[derive(Clone)]
pub struct Blksnap {
    config: Config,
    registry: Arc<Mutex<Registry>>,
}

impl Default for Blksnap {
    fn default() -> Self {
        Self::new(Config::from_env())
    }
}

impl Blksnap {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start tracking `device`. Installs a tracker and allocates a fresh
    /// CBT map sized to the device's current capacity. Errors if the
    /// device id is already tracked.
    pub fn add(&self, device_id: DeviceId, device: Box<dyn BlockDevice>) -> Result<()> {
        let capacity_sectors = device.capacity_sectors();
        let shared = SharedDevice::new(device);
        let mut reg = self.registry.lock().unwrap();
        if reg.devices.contains_key(&device_id) {
            return Err(Error::busy(format!("device {device_id} already tracked")));
        }
        let cbt = Arc::new(CbtMap::new(capacity_sectors, self.config.cbt_min_shift, self.config.cbt_max_count));
        let tracker = Tracker::new(device_id, shared.clone(), Arc::clone(&cbt));
        reg.devices.insert(
            device_id,
            TrackedDevice { tracker, cbt, original: shared, capacity_sectors, in_snapshot: None },
        );
        tracing::info!(%device_id, "device added");
        Ok(())
    }

    /// Stop tracking `device_id`. Errors if it currently participates in a
    /// taken snapshot.
    pub fn remove(&self, device_id: DeviceId) -> Result<()> {
        let mut reg = self.registry.lock().unwrap();
        let dev = reg
            .devices
            .get(&device_id)
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))?;
        if dev.in_snapshot.is_some() {
            return Err(Error::busy(format!("device {device_id} is part of a snapshot")));
        }
        reg.devices.remove(&device_id);
        tracing::info!(%device_id, "device removed");
        Ok(())
    }

    /// Group `device_ids` into a new, not-yet-taken snapshot. Every device
    /// must already be tracked and not already committed to another
    /// snapshot.
    pub fn create(&self, device_ids: &[DeviceId]) -> Result<Uuid> {
        if device_ids.is_empty() {
            return Err(Error::invalid("create requires at least one device"));
        }
        let mut reg = self.registry.lock().unwrap();
        for device_id in device_ids {
            let dev = reg
                .devices
                .get(device_id)
                .ok_or_else(|| Error::not_found(format!("device {device_id}")))?;
            if dev.in_snapshot.is_some() {
                return Err(Error::busy(format!("device {device_id} is already part of a snapshot")));
            }
        }

        let mut trackers = Vec::new();
        let mut image_device_ids = HashMap::new();
        for device_id in device_ids {
            let dev = &reg.devices[device_id];
            trackers.push((Arc::clone(&dev.tracker), dev.original.clone(), dev.capacity_sectors));
            reg.next_image_minor += 1;
            image_device_ids.insert(*device_id, DeviceId::new(device_id.major, reg.next_image_minor));
        }

        let id = Uuid::new_v4();
        let snapshot = Snapshot::new(id, &self.config, trackers, &image_device_ids);
        for device_id in device_ids {
            reg.devices.get_mut(device_id).unwrap().in_snapshot = Some(id);
        }
        reg.snapshots.insert(id, snapshot);
        tracing::info!(%id, devices = device_ids.len(), "snapshot group created");
        Ok(id)
    }

    /// Contribute backing extents on `device` to snapshot `id`'s shared
    /// difference storage.
    pub fn append_storage(
        &self,
        id: Uuid,
        device_id: DeviceId,
        device: Box<dyn BlockDevice>,
        ranges: &[SectorRange],
    ) -> Result<()> {
        let snapshot = self.get_snapshot(id)?;
        snapshot.append_storage(device_id, SharedDevice::new(device), ranges)
    }

    /// Go live: attach every participating device's diff area to its
    /// tracker and close its current CBT epoch.
    pub fn take(&self, id: Uuid) -> Result<()> {
        self.get_snapshot(id)?.take()
    }

    /// Tear down snapshot `id`: detach trackers, shut down its snap images,
    /// and forget it. Devices become eligible for a new snapshot.
    pub fn release(&self, id: Uuid) -> Result<()> {
        let mut reg = self.registry.lock().unwrap();
        let snapshot = reg
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("snapshot {id}")))?;
        snapshot.release()?;
        for device_id in snapshot.device_ids() {
            if let Some(dev) = reg.devices.get_mut(&device_id) {
                dev.in_snapshot = None;
            }
        }
        reg.snapshots.remove(&id);
        tracing::info!(%id, "snapshot group released");
        Ok(())
    }

    pub fn collect(&self) -> Vec<Uuid> {
        self.registry.lock().unwrap().snapshots.keys().copied().collect()
    }

    pub fn collect_images(&self, id: Uuid) -> Result<Vec<DeviceId>> {
        Ok(self.get_snapshot(id)?.image_device_ids())
    }

    /// Mark `ranges` on `device_id` dirty in both CBT maps, for callers
    /// that learn about a change out-of-band (spec.md's `mark_dirty_blocks`,
    /// resolved to update both maps — see `cbt-map`'s `set_both`).
    pub fn mark_dirty_blocks(&self, device_id: DeviceId, ranges: &[SectorRange]) -> Result<()> {
        let reg = self.registry.lock().unwrap();
        let dev = reg
            .devices
            .get(&device_id)
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))?;
        for range in ranges {
            dev.cbt.set_both(range.sector, range.count)?;
        }
        Ok(())
    }

    pub fn wait_event(&self, id: Uuid, timeout: Duration) -> Result<Option<Event>> {
        Ok(self.get_snapshot(id)?.wait_event(timeout))
    }

    /// Read a window of `device_id`'s CBT read-map (spec.md §6's
    /// `tracker_read_cbt`). Returns the number of bytes actually copied,
    /// which may be less than `out.len()` at the end of the map.
    pub fn read_cbt(&self, device_id: DeviceId, offset: usize, out: &mut [u8]) -> Result<usize> {
        let reg = self.registry.lock().unwrap();
        let dev = reg
            .devices
            .get(&device_id)
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))?;
        dev.cbt.read_to_user(offset, out)
    }

    /// Describe the CBT map of every currently tracked device (spec.md §6's
    /// `tracker_collect`).
    pub fn tracker_collect(&self) -> Vec<CbtInfo> {
        let reg = self.registry.lock().unwrap();
        reg.devices
            .iter()
            .map(|(device_id, dev)| CbtInfo {
                device_id: *device_id,
                device_capacity: dev.cbt.device_capacity(),
                blk_size_shift: dev.cbt.blk_size_shift(),
                blk_count: dev.cbt.blk_count(),
                generation_id: dev.cbt.generation_id(),
                snap_number_previous: dev.cbt.snap_number_previous(),
                snap_number_active: dev.cbt.snap_number_active(),
            })
            .collect()
    }

    /// Submit a bio against a tracked device's normal I/O path.
    pub fn submit(&self, device_id: DeviceId, bio: &mut Bio) -> Result<()> {
        let tracker = {
            let reg = self.registry.lock().unwrap();
            Arc::clone(
                &reg.devices
                    .get(&device_id)
                    .ok_or_else(|| Error::not_found(format!("device {device_id}")))?
                    .tracker,
            )
        };
        tracker.submit(bio)
    }

    /// Submit a bio against a snap image published by a taken snapshot.
    pub fn submit_image(&self, id: Uuid, image_device_id: DeviceId, bio: &mut Bio) -> Result<ImageStatus> {
        let snapshot = self.get_snapshot(id)?;
        let image = snapshot
            .image_by_image_id(image_device_id)
            .ok_or_else(|| Error::not_found(format!("image device {image_device_id}")))?;
        image.submit(bio)
    }

    fn get_snapshot(&self, id: Uuid) -> Result<Arc<Snapshot>> {
        self.registry
            .lock()
            .unwrap()
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("snapshot {id}")))
    }
}

/// Install a `tracing-subscriber` `fmt` layer reading its filter from
/// `RUST_LOG`, falling back to `info`. Intended for binaries and
/// integration tests; library code never installs a global subscriber
/// itself.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDevice;

    fn engine() -> Blksnap {
        Blksnap::new(Config {
            chunk_min_shift: 12,
            cache_capacity: 16,
            ..Config::default()
        })
    }

    #[test]
    fn add_create_take_release_lifecycle() {
        let engine = engine();
        let device_id = DeviceId::new(8, 0);
        engine.add(device_id, Box::new(MemDevice::new(64))).unwrap();

        let id = engine.create(&[device_id]).unwrap();
        engine
            .append_storage(id, DeviceId::new(9, 0), Box::new(MemDevice::new(256)), &[SectorRange::new(0, 256).unwrap()])
            .unwrap();
        engine.take(id).unwrap();

        assert!(engine.remove(device_id).is_err(), "device is busy while part of a taken snapshot");

        engine.release(id).unwrap();
        assert!(engine.collect().is_empty());
        engine.remove(device_id).unwrap();
    }

    #[test]
    fn write_after_take_is_visible_through_snap_image() {
        let engine = engine();
        let device_id = DeviceId::new(8, 0);
        engine.add(device_id, Box::new(MemDevice::new(64))).unwrap();

        let mut seed = Bio::new(BioOp::Write, 0, vec![vec![0xAAu8; 512]]);
        engine.submit(device_id, &mut seed).unwrap();

        let id = engine.create(&[device_id]).unwrap();
        engine
            .append_storage(id, DeviceId::new(9, 0), Box::new(MemDevice::new(256)), &[SectorRange::new(0, 256).unwrap()])
            .unwrap();
        engine.take(id).unwrap();

        let mut overwrite = Bio::new(BioOp::Write, 0, vec![vec![0xBBu8; 512]]);
        engine.submit(device_id, &mut overwrite).unwrap();

        let image_id = engine.collect_images(id).unwrap()[0];
        let mut read = Bio::new(BioOp::Read, 0, vec![vec![0u8; 512]]);
        let mut status = engine.submit_image(id, image_id, &mut read).unwrap();
        for _ in 0..1000 {
            if read.segments[0][0] == 0xAA {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            let mut retry = Bio::new(BioOp::Read, 0, vec![vec![0u8; 512]]);
            status = engine.submit_image(id, image_id, &mut retry).unwrap();
            read = retry;
        }
        assert_eq!(status, ImageStatus::Ok);
        assert!(read.segments[0].iter().all(|&b| b == 0xAA), "snap image must keep serving the pre-snapshot bytes");
    }

    #[test]
    fn mark_dirty_blocks_updates_cbt() {
        let engine = engine();
        let device_id = DeviceId::new(8, 0);
        engine.add(device_id, Box::new(MemDevice::new(64))).unwrap();
        engine.mark_dirty_blocks(device_id, &[SectorRange::new(0, 8).unwrap()]).unwrap();
    }

    #[test]
    fn read_cbt_and_tracker_collect_reflect_tracked_devices() {
        let engine = engine();
        let device_id = DeviceId::new(8, 0);
        engine.add(device_id, Box::new(MemDevice::new(64))).unwrap();
        engine.mark_dirty_blocks(device_id, &[SectorRange::new(0, 8).unwrap()]).unwrap();

        let infos = engine.tracker_collect();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].device_id, device_id);
        assert_eq!(infos[0].snap_number_active, 1);

        let mut out = vec![0u8; infos[0].blk_count];
        let n = engine.read_cbt(device_id, 0, &mut out).unwrap();
        assert_eq!(n, infos[0].blk_count);
        assert_eq!(out[0], 0, "mark_dirty_blocks writes the previous (still zero) snap-number into the read-map");
    }

    #[test]
    fn wait_event_reports_out_of_space() {
        let engine = Blksnap::new(Config {
            chunk_min_shift: 12,
            cache_capacity: 16,
            diff_storage_low_water_sectors: 0,
            ..Config::default()
        });
        let device_id = DeviceId::new(8, 0);
        engine.add(device_id, Box::new(MemDevice::new(64))).unwrap();
        let id = engine.create(&[device_id]).unwrap();
        // Contribute far less than one chunk's worth of storage so the
        // first preserved write exhausts it immediately.
        engine
            .append_storage(id, DeviceId::new(9, 0), Box::new(MemDevice::new(4)), &[SectorRange::new(0, 4).unwrap()])
            .unwrap();
        engine.take(id).unwrap();

        let mut write = Bio::new(BioOp::Write, 0, vec![vec![1u8; 512]]);
        engine.submit(device_id, &mut write).unwrap(); // corruption is swallowed on the live path

        let event = engine.wait_event(id, Duration::from_millis(200)).unwrap();
        assert!(matches!(event, Some(Event::OutOfSpace { .. })));
    }
}
