//! The virtual block device a snapshot publishes to its consumers.
//!
//! A [`SnapImage`] exposes the original device's capacity, frozen at the
//! moment the snapshot was taken. Reads and writes against it go through
//! its [`diff_area::DiffArea`]; on a write, both the read-map and the
//! write-map of the CBT get marked, the same "update both maps" rule
//! `mark_dirty_blocks` uses, since a write against the image is, from the
//! next incremental backup's point of view, indistinguishable from a write
//! that happened through the tracker before the block was known to have
//! changed.
//!
//! Requests are accepted through a single-worker queue: one background
//! thread dequeues and services bios in submission order, the same shape
//! as the kernel module's per-image worker thread, so callers never block
//! each other waiting on the image's own I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};

use blksnap_error::{Error, Result};
use block_device::{Bio, BioOp, BlockDevice, DeviceId};
use cbt_map::CbtMap;
use diff_area::DiffArea;

/// Outcome of an image request, mirroring the kernel module's block-status
/// codes exposed to callers (spec.md §4.F): `IoError`/`NoData` are reported
/// back as statuses rather than propagated as [`Error`]s once the request
/// has been accepted, matching a block device's completion-status contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Ok,
    IoError,
    NoData,
}

struct QueuedBio {
    bio: Bio,
    respond: Box<dyn FnOnce(Bio, Result<ImageStatus>) + Send>,
}

pub struct SnapImage<D> {
    device_id: DeviceId,
    original_device_id: DeviceId,
    capacity_sectors: u64,
    diff_area: Arc<DiffArea<D>>,
    cbt: Arc<CbtMap>,
    ready: AtomicBool,
    sender: Mutex<Option<Sender<QueuedBio>>>,
}

impl<D: BlockDevice + 'static> SnapImage<D> {
    pub fn new(
        device_id: DeviceId,
        original_device_id: DeviceId,
        capacity_sectors: u64,
        diff_area: Arc<DiffArea<D>>,
        cbt: Arc<CbtMap>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<QueuedBio>();
        let image = Arc::new(Self {
            device_id,
            original_device_id,
            capacity_sectors,
            diff_area,
            cbt,
            ready: AtomicBool::new(true),
            sender: Mutex::new(Some(tx)),
        });
        let worker_image = Arc::clone(&image);
        std::thread::spawn(move || {
            for mut queued in rx {
                let result = worker_image.submit(&mut queued.bio);
                (queued.respond)(queued.bio, result);
            }
        });
        tracing::info!(device = %device_id, original = %original_device_id, "snap image published");
        image
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn original_device_id(&self) -> DeviceId {
        self.original_device_id
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Service one bio synchronously against the diff area. Exposed
    /// directly for callers who already serialize against the image
    /// themselves (and for `enqueue`'s worker thread); everyone else should
    /// use [`SnapImage::enqueue`].
    pub fn submit(&self, bio: &mut Bio) -> Result<ImageStatus> {
        if !self.is_ready() {
            return Ok(ImageStatus::IoError);
        }
        if bio.segments.len() != 1 {
            return Err(Error::invalid("snap image submit expects a single-segment bio"));
        }
        let result = match bio.op {
            BioOp::Read => self.diff_area.image_read(bio.sector, &mut bio.segments[0]),
            BioOp::Write => self
                .diff_area
                .image_write(bio.sector, &bio.segments[0])
                .and_then(|()| self.cbt.set_both(bio.sector, bio.sector_count())),
        };
        match result {
            Ok(()) => Ok(ImageStatus::Ok),
            Err(Error::NoData) => Ok(ImageStatus::NoData),
            Err(e) => {
                tracing::error!(device = %self.device_id, error = %e, "snap image request failed");
                Ok(ImageStatus::IoError)
            }
        }
    }

    /// Hand a bio to the image's worker thread; `respond` is called on the
    /// worker thread once it completes, with the bio (its segments filled
    /// in for a read) handed back.
    pub fn enqueue(
        &self,
        bio: Bio,
        respond: impl FnOnce(Bio, Result<ImageStatus>) + Send + 'static,
    ) -> Result<()> {
        let sender = self.sender.lock().unwrap();
        let sender = sender.as_ref().ok_or_else(|| Error::busy("snap image worker shut down"))?;
        sender
            .send(QueuedBio { bio, respond: Box::new(respond) })
            .map_err(|_| Error::busy("snap image worker shut down"))
    }

    /// Stop accepting new requests; in-flight ones still drain.
    pub fn shutdown(&self) {
        *self.sender.lock().unwrap() = None;
    }
}
