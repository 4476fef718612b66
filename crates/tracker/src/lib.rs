//! The bio-interception filter installed on a tracked device.
//!
//! A [`Tracker`] sits in front of a device's normal I/O path. It always
//! updates change block tracking on writes (CBT survives across snapshots),
//! and while a diff area is attached it preserves each write's pre-image
//! before letting the write reach the original device. Attaching and
//! detaching the diff area (`take`/`release`) goes through the same
//! `RwLock` that ordinary bios read-lock, so a `take`/`release` transition
//! can only complete once every bio already in flight has drained — there
//! is never a write straddling the boundary that sees a half-attached diff
//! area.

use std::sync::{Arc, RwLock};

use blksnap_error::{Error, Result};
use block_device::{BioOp, Bio, BlockDevice, DeviceId, SharedDevice};
use cbt_map::CbtMap;
use diff_area::DiffArea;

pub struct Tracker<D> {
    device_id: DeviceId,
    original: SharedDevice<D>,
    cbt: Arc<CbtMap>,
    diff_area: RwLock<Option<Arc<DiffArea<D>>>>,
}

impl<D: BlockDevice + 'static> Tracker<D> {
    pub fn new(device_id: DeviceId, original: SharedDevice<D>, cbt: Arc<CbtMap>) -> Arc<Self> {
        tracing::info!(device = %device_id, "tracker installed");
        Arc::new(Self {
            device_id,
            original,
            cbt,
            diff_area: RwLock::new(None),
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn cbt(&self) -> &Arc<CbtMap> {
        &self.cbt
    }

    pub fn is_taken(&self) -> bool {
        self.diff_area.read().unwrap().is_some()
    }

    /// Attach a diff area, draining any bio already past the read-lock
    /// before this call returns.
    pub fn take(&self, diff_area: Arc<DiffArea<D>>) {
        let mut guard = self.diff_area.write().unwrap();
        *guard = Some(diff_area);
        tracing::info!(device = %self.device_id, "tracker attached diff area");
    }

    /// Detach and return the diff area, if any, again draining in-flight
    /// bios first.
    pub fn release(&self) -> Option<Arc<DiffArea<D>>> {
        let mut guard = self.diff_area.write().unwrap();
        let prev = guard.take();
        tracing::info!(device = %self.device_id, "tracker detached diff area");
        prev
    }

    /// Run one bio through the filter pipeline:
    ///   1. take the shared (reader) side of the submit lock — NOWAIT bios
    ///      fail with `WouldBlock` immediately if it's contended rather than
    ///      blocking
    ///   2. on a write, mark the range dirty in the CBT write-map
    ///      unconditionally, whether or not a snapshot is taken
    ///   3. if a diff area is attached, preserve the pre-image
    ///   4. forward the bio to the original device
    ///   5. optionally flush if the bio asked for sync completion
    ///   6. release the submit lock (implicit: guard drops)
    ///
    /// Pre-image preservation failures other than `WouldBlock` are logged
    /// and swallowed: a corrupted diff area must never fail the live I/O
    /// path, only the backup it was trying to preserve for.
    pub fn submit(&self, bio: &mut Bio) -> Result<()> {
        if bio.segments.len() != 1 {
            return Err(Error::invalid("tracker submit expects a single-segment bio"));
        }
        let guard = if bio.nowait {
            self.diff_area.try_read().map_err(|_| Error::WouldBlock)?
        } else {
            self.diff_area.read().unwrap()
        };
        let count = bio.sector_count();

        if count > 0 && matches!(bio.op, BioOp::Write) {
            self.cbt.set(bio.sector, count)?;
            if let Some(diff_area) = guard.as_ref() {
                match diff_area.copy(bio.sector, count, bio.nowait) {
                    Ok(()) => {}
                    Err(Error::WouldBlock) => return Err(Error::WouldBlock),
                    Err(e) => tracing::warn!(
                        device = %self.device_id, error = %e,
                        "diff area preservation failed, write proceeds uncovered"
                    ),
                }
            }
        }

        match bio.op {
            BioOp::Read => self.original.read_at(bio.sector, &mut bio.segments[0])?,
            BioOp::Write => self.original.write_at(bio.sector, &bio.segments[0])?,
        }
        if bio.sync {
            self.original.flush()?;
        }
        Ok(())
    }
}
