//! Append-only blob file writer.
//!
//! Operation payloads (REPLACE / REPLACE_BZ data) are appended to one blob
//! file through a single cursor owned by the generation run. Offsets are
//! handed out in strictly increasing order.

use ipd_error::{IpdError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::trace;

#[derive(Debug)]
pub struct BlobFileWriter<W: Write = Vec<u8>> {
    sink: W,
    offset: u64,
}

impl BlobFileWriter<Vec<u8>> {
    /// Blob held in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Vec::new())
    }
}

impl BlobFileWriter<BufWriter<File>> {
    /// Create (truncating) a blob file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> BlobFileWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink, offset: 0 }
    }

    /// Append `blob` and return the offset it was written at.
    pub fn store_blob(&mut self, blob: &[u8]) -> Result<u64> {
        let offset = self.offset;
        let len = u64::try_from(blob.len())
            .map_err(|_| IpdError::Format("blob length overflows u64".to_owned()))?;
        let next = offset
            .checked_add(len)
            .ok_or_else(|| IpdError::Format("blob file offset overflows u64".to_owned()))?;
        self.sink.write_all(blob)?;
        self.offset = next;
        trace!(offset, len, "blob_stored");
        Ok(offset)
    }

    /// Total bytes written so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.offset
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    /// Flush and return the underlying sink.
    pub fn finish(mut self) -> Result<W> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}
