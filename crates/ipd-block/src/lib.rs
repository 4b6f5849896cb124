#![forbid(unsafe_code)]
//! Partition and blob I/O.
//!
//! Provides the `ByteDevice` trait with a file-backed (pread/pwrite) and an
//! in-memory implementation, extent-list reads and writes on top of it, the
//! append-only blob file writer, and full-replace payload encoding.

pub mod blob;
pub mod payload;

pub use blob::BlobFileWriter;
pub use payload::{compress_bzip2, decompress_bzip2, encode_full_payload, write_full_replace};

use ipd_error::{IpdError, Result};
use ipd_types::{BlockSize, Extent};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// End of `[offset, offset + len)`, or a format error if it overflows or
/// passes `device_len`.
fn checked_range(op: &str, offset: u64, len: usize, device_len: u64) -> Result<u64> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| IpdError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(IpdError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(end)
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which does not share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    /// Open read-only. Used for partition images that must not change.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(IpdError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        checked_range("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn memory_range(
    op: &str,
    offset: u64,
    len: usize,
    device_len: usize,
) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset)
        .map_err(|_| IpdError::Format(format!("{op} offset overflows usize")))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| IpdError::Format(format!("{op} range overflows usize")))?;
    if end > device_len {
        return Err(IpdError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(start..end)
}

/// In-memory byte device with a fixed length.
#[derive(Debug, Default)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes.into_inner()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let range = memory_range("read", offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let range = memory_range("write", offset, buf.len(), bytes.len())?;
        bytes[range].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Extent I/O ──────────────────────────────────────────────────────────────

/// Byte offset and length of a real extent.
fn extent_span(extent: Extent, block_size: BlockSize) -> Result<(u64, usize)> {
    if extent.is_sparse_hole() {
        return Err(IpdError::malformed(
            extent.start_block,
            format!("sparse hole extent {extent} has no backing blocks"),
        ));
    }
    let offset = block_size
        .block_to_byte(extent.start_block)
        .ok_or_else(|| IpdError::Format(format!("extent {extent} offset overflows")))?;
    let len = block_size
        .block_to_byte(extent.num_blocks)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| IpdError::Format(format!("extent {extent} length overflows")))?;
    Ok((offset, len))
}

/// Read the blocks of `extents`, concatenated in list order.
pub fn read_extents(
    device: &dyn ByteDevice,
    extents: &[Extent],
    block_size: BlockSize,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for &extent in extents {
        let (offset, len) = extent_span(extent, block_size)?;
        checked_range("read", offset, len, device.len_bytes())?;
        let start = out.len();
        out.resize(start + len, 0);
        device.read_exact_at(offset, &mut out[start..])?;
    }
    trace!(extents = extents.len(), bytes = out.len(), "read_extents");
    Ok(out)
}

/// Write `data` across the blocks of `extents` in list order. `data` must
/// fill the extents exactly.
pub fn write_extents(
    device: &dyn ByteDevice,
    extents: &[Extent],
    block_size: BlockSize,
    data: &[u8],
) -> Result<()> {
    let mut cursor = 0_usize;
    for &extent in extents {
        let (offset, len) = extent_span(extent, block_size)?;
        let chunk = cursor
            .checked_add(len)
            .and_then(|end| data.get(cursor..end))
            .ok_or_else(|| {
                IpdError::Format(format!(
                    "data of {} bytes too short for extents ending at {extent}",
                    data.len()
                ))
            })?;
        device.write_all_at(offset, chunk)?;
        cursor += len;
    }
    if cursor != data.len() {
        return Err(IpdError::Format(format!(
            "data of {} bytes overruns extents of {cursor} bytes",
            data.len()
        )));
    }
    trace!(extents = extents.len(), bytes = cursor, "write_extents");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn memory_device_round_trips() {
        let dev = MemoryByteDevice::zeroed(4096 * 4);
        dev.write_all_at(8192, &[7_u8; 4096]).expect("write");
        let mut buf = vec![0_u8; 4096];
        dev.read_exact_at(8192, &mut buf).expect("read");
        assert_eq!(buf, vec![7_u8; 4096]);
    }

    #[test]
    fn memory_device_rejects_out_of_bounds() {
        let dev = MemoryByteDevice::zeroed(1024);
        let mut buf = [0_u8; 16];
        assert!(matches!(
            dev.read_exact_at(1020, &mut buf),
            Err(IpdError::Format(_))
        ));
        assert!(dev.write_all_at(u64::MAX, &buf).is_err());
    }

    #[test]
    fn read_extents_concatenates_in_list_order() {
        let bs = BlockSize::new(512).expect("bs");
        let dev = MemoryByteDevice::new(patterned(512 * 8));
        let data = read_extents(&dev, &[Extent::new(5, 2), Extent::new(1, 1)], bs).expect("read");
        let image = dev.snapshot();
        let mut expected = image[512 * 5..512 * 7].to_vec();
        expected.extend_from_slice(&image[512..1024]);
        assert_eq!(data, expected);
    }

    #[test]
    fn write_extents_scatters_data() {
        let bs = BlockSize::new(512).expect("bs");
        let dev = MemoryByteDevice::zeroed(512 * 4);
        let data = patterned(1024);
        write_extents(&dev, &[Extent::new(3, 1), Extent::new(0, 1)], bs, &data).expect("write");
        let image = dev.into_inner();
        assert_eq!(&image[512 * 3..], &data[..512]);
        assert_eq!(&image[..512], &data[512..]);
        assert!(image[512..512 * 3].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_extents_requires_exact_length() {
        let bs = BlockSize::new(512).expect("bs");
        let dev = MemoryByteDevice::zeroed(512 * 4);
        assert!(write_extents(&dev, &[Extent::new(0, 2)], bs, &[0_u8; 512]).is_err());
        assert!(write_extents(&dev, &[Extent::new(0, 1)], bs, &[0_u8; 1024]).is_err());
    }

    #[test]
    fn sparse_holes_cannot_be_read() {
        let bs = BlockSize::new(512).expect("bs");
        let dev = MemoryByteDevice::zeroed(512);
        let err = read_extents(&dev, &[Extent::sparse_hole(1)], bs).expect_err("hole");
        assert!(matches!(err, IpdError::MalformedInput { .. }));
    }
}
