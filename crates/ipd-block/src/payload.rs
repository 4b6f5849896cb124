//! Full-replace payload encoding.
//!
//! A full operation writes its destination blocks from blob data alone. The
//! data is bzip2-compressed and stored as REPLACE_BZ when that is strictly
//! smaller than the raw bytes, otherwise stored raw as REPLACE.

use crate::{BlobFileWriter, ByteDevice, read_extents};
use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use ipd_error::{IpdError, Result};
use ipd_types::{BlockSize, Extent, InstallOperation, OperationType};
use std::io::{Read, Write};
use tracing::trace;

pub fn compress_bzip2(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress `data`, which must expand to exactly `expected_len` bytes.
pub fn decompress_bzip2(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    BzDecoder::new(data).read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(IpdError::Format(format!(
            "bzip2 payload expanded to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Pick the payload form for `data`: `(REPLACE_BZ, compressed)` if strictly
/// smaller, else `(REPLACE, data)`.
pub fn encode_full_payload(data: Vec<u8>) -> Result<(OperationType, Vec<u8>)> {
    let compressed = compress_bzip2(&data)?;
    if compressed.len() < data.len() {
        Ok((OperationType::ReplaceBz, compressed))
    } else {
        Ok((OperationType::Replace, data))
    }
}

/// Build a full operation writing `dst_extents` with their content on
/// `new_image`, storing the payload in `blob`.
///
/// The returned operation has no source extents and its blob location set.
pub fn write_full_replace<W: Write>(
    new_image: &dyn ByteDevice,
    dst_extents: &[Extent],
    block_size: BlockSize,
    blob: &mut BlobFileWriter<W>,
) -> Result<InstallOperation> {
    let data = read_extents(new_image, dst_extents, block_size)?;
    let raw_len = data.len();
    let (op_type, payload) = encode_full_payload(data)?;
    let data_offset = blob.store_blob(&payload)?;
    let data_length = u64::try_from(payload.len())
        .map_err(|_| IpdError::Format("payload length overflows u64".to_owned()))?;
    trace!(
        op_type = %op_type,
        raw_len,
        data_offset,
        data_length,
        "full_replace_encoded"
    );
    let mut op = InstallOperation::with_extents(op_type, Vec::new(), dst_extents.to_vec());
    op.data_offset = data_offset;
    op.data_length = data_length;
    Ok(op)
}
