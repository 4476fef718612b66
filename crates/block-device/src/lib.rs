//! The block device abstraction the engine reads/writes against.
//!
//! Original devices, backing devices contributed to difference storage, and
//! the in-memory test doubles used throughout the workspace's test suites
//! all implement [`BlockDevice`]. Addressing is in 512-byte sectors
//! throughout, matching the rest of the engine (CBT blocks, chunks, diff
//! storage extents are all sector-denominated).

use std::fmt;
use std::sync::{Arc, Mutex};

use blksnap_error::{Error, Result};

/// Size in bytes of one sector. Fixed at the conventional block-layer value.
pub const SECTOR_SIZE: u64 = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// A block device addressed in sectors.
///
/// Implementors are not required to be internally synchronized; callers that
/// share a device across threads wrap it (see [`SharedDevice`]).
pub trait BlockDevice: Send {
    /// Capacity of the device in sectors.
    fn capacity_sectors(&self) -> u64;

    /// Read `buf.len()` bytes starting at `sector`. `buf.len()` must be a
    /// multiple of [`SECTOR_SIZE`].
    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len()` bytes starting at `sector`. `buf.len()` must be a
    /// multiple of [`SECTOR_SIZE`].
    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

fn check_aligned_and_bounds(capacity_sectors: u64, sector: u64, len: usize) -> Result<u64> {
    if len as u64 % SECTOR_SIZE != 0 {
        return Err(Error::invalid(format!(
            "buffer length {len} is not sector-aligned"
        )));
    }
    let count = len as u64 / SECTOR_SIZE;
    let end = sector
        .checked_add(count)
        .ok_or_else(|| Error::invalid("sector range overflows"))?;
    if end > capacity_sectors {
        return Err(Error::invalid(format!(
            "sector range [{sector}, {end}) exceeds capacity {capacity_sectors}"
        )));
    }
    Ok(count)
}

/// A device identifier as exposed to the control surface: `(major, minor)`,
/// matching the difference-storage descriptors in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// A contiguous range on some device, expressed in sectors.
///
/// Used both for difference-storage descriptors (`append_storage`) and for
/// `mark_dirty_blocks` ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    pub sector: u64,
    pub count: u64,
}

impl SectorRange {
    pub fn new(sector: u64, count: u64) -> Result<Self> {
        if count == 0 {
            return Err(Error::invalid("sector-count must be > 0"));
        }
        Ok(Self { sector, count })
    }

    pub fn end(&self) -> u64 {
        self.sector + self.count
    }
}

/// The operation carried by a [`Bio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
}

/// A block-layer I/O request: an operation, a starting sector, and memory
/// segments — see the GLOSSARY in spec.md.
#[derive(Debug, Clone)]
pub struct Bio {
    pub op: BioOp,
    pub sector: u64,
    pub segments: Vec<Vec<u8>>,
    /// Submitter asked for non-blocking completion (`REQ_NOWAIT`-equivalent).
    pub nowait: bool,
    /// Submitter asked for synchronous completion (`REQ_SYNC`-equivalent).
    pub sync: bool,
}

impl Bio {
    pub fn new(op: BioOp, sector: u64, segments: Vec<Vec<u8>>) -> Self {
        Self {
            op,
            sector,
            segments,
            nowait: false,
            sync: false,
        }
    }

    pub fn nowait(mut self) -> Self {
        self.nowait = true;
        self
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Total payload length in bytes across all segments.
    pub fn len_bytes(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Total payload length in sectors. Zero-length bios are valid (e.g.
    /// flush-only) and report zero sectors.
    pub fn sector_count(&self) -> u64 {
        self.len_bytes() as u64 / SECTOR_SIZE
    }
}

/// A plain in-memory block device, used as the original device and as diff
/// storage backing in tests.
#[derive(Debug, Clone)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            data: vec![0u8; (capacity_sectors * SECTOR_SIZE) as usize],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::invalid("device length must be sector-aligned"));
        }
        Ok(Self { data })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn capacity_sectors(&self) -> u64 {
        self.data.len() as u64 / SECTOR_SIZE
    }

    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned_and_bounds(self.capacity_sectors(), sector, buf.len())?;
        let start = (sector * SECTOR_SIZE) as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        check_aligned_and_bounds(self.capacity_sectors(), sector, buf.len())?;
        let start = (sector * SECTOR_SIZE) as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A `BlockDevice` that always fails reads and/or writes past a configured
/// point, for fault-injection tests (modeled on the faulty-disk test doubles
/// used to exercise write-back-on-eviction failure paths).
#[derive(Debug, Clone)]
pub struct FaultyDevice<D> {
    inner: D,
    pub fail_reads: bool,
    pub fail_writes: bool,
}

impl<D: BlockDevice> FaultyDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            fail_reads: false,
            fail_writes: false,
        }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for FaultyDevice<D> {
    fn capacity_sectors(&self) -> u64 {
        self.inner.capacity_sectors()
    }

    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads {
            return Err(Error::io("simulated read failure"));
        }
        self.inner.read_at(sector, buf)
    }

    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(Error::io("simulated write failure"));
        }
        self.inner.write_at(sector, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn capacity_sectors(&self) -> u64 {
        (**self).capacity_sectors()
    }

    fn read_at(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(sector, buf)
    }

    fn write_at(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(sector, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Cheaply cloneable handle to a shared, lock-protected device. Trackers and
/// diff areas hold one of these for the original device so the filter path
/// and COW completion workers can both reach it.
pub struct SharedDevice<D> {
    inner: Arc<Mutex<D>>,
}

// Not `#[derive(Clone)]`: the derive macro would add a spurious `D: Clone`
// bound, but cloning only needs to bump the `Arc`'s refcount regardless of
// whether `D` itself is `Clone` (it usually isn't — `Box<dyn BlockDevice>`
// included).
impl<D> Clone for SharedDevice<D> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<D: BlockDevice> SharedDevice<D> {
    pub fn new(device: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(device)),
        }
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.inner.lock().unwrap().capacity_sectors()
    }

    pub fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().unwrap().read_at(sector, buf)
    }

    pub fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().write_at(sector, buf)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().unwrap().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let mut dev = MemDevice::new(4);
        dev.write_at(1, &[7u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        dev.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
    }

    #[test]
    fn rejects_unaligned_buffers() {
        let mut dev = MemDevice::new(4);
        let err = dev.write_at(0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn rejects_out_of_bounds() {
        let mut dev = MemDevice::new(1);
        let err = dev.read_at(0, &mut [0u8; 1024]).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn faulty_device_fails_only_when_armed() {
        let mut dev = FaultyDevice::new(MemDevice::new(1));
        dev.write_at(0, &[1u8; 512]).unwrap();
        dev.fail_writes = true;
        assert!(dev.write_at(0, &[1u8; 512]).is_err());
        assert!(dev.read_at(0, &mut [0u8; 512]).is_ok());
    }

    #[test]
    fn bio_sector_count_sums_segments() {
        let bio = Bio::new(
            BioOp::Write,
            0,
            vec![vec![0u8; 512], vec![0u8; 1024]],
        );
        assert_eq!(bio.sector_count(), 3);
    }
}
