#![forbid(unsafe_code)]
//! Metadata stream writer and reader.
//!
//! Inode tables, directory tables and the indirected auxiliary tables are
//! all stored as a chain of metadata blocks: up to 8192 bytes of payload,
//! compressed, preceded by a 16-bit little-endian header. The top header bit
//! marks an uncompressed block; the rest is the on-disk payload size.
//!
//! The writer hands out [`MetaRef`] cursors *before* the bytes land on disk,
//! which is what lets inode and directory serializers embed references to
//! records they are still in the middle of producing.

use sqsh_compress::Compressor;
use sqsh_error::{Result, SqshError};
use sqsh_types::{read_le_u16, MetaRef, META_BLOCK_SIZE, META_BLOCK_UNCOMPRESSED};
use std::io::Write;
use std::sync::Arc;
use tracing::trace;

// ── Writer ──────────────────────────────────────────────────────────────────

/// Streaming writer producing a chain of framed metadata blocks.
pub struct MetaWriter<W: Write> {
    target: W,
    compressor: Arc<dyn Compressor>,
    /// Payload of the block currently being filled.
    data: Vec<u8>,
    /// Bytes of framed stream emitted so far; the start offset of the block
    /// currently being filled.
    block_start: u64,
}

impl<W: Write> MetaWriter<W> {
    pub fn new(target: W, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            target,
            compressor,
            data: Vec::with_capacity(META_BLOCK_SIZE),
            block_start: 0,
        }
    }

    /// Position of the next byte that would be appended.
    ///
    /// Valid as a reference into the finished stream even though the block
    /// holding that byte has not been flushed yet.
    #[must_use]
    pub fn cursor(&self) -> MetaRef {
        MetaRef::new(self.block_start, self.data.len() as u16)
    }

    /// Total size of the framed stream written so far (flushed blocks only).
    #[must_use]
    pub fn stream_size(&self) -> u64 {
        self.block_start
    }

    /// Append bytes, flushing automatically whenever a block fills.
    pub fn append(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let room = META_BLOCK_SIZE - self.data.len();
            let take = room.min(bytes.len());
            self.data.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.data.len() == META_BLOCK_SIZE {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Emit the current block, even if partially filled. A no-op when the
    /// current block is empty.
    pub fn flush(&mut self) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }

        let payload_len = self.data.len();
        let (header, on_disk) = match self.compressor.compress(&self.data)? {
            Some(packed) => (packed.len() as u16, packed),
            None => (
                payload_len as u16 | META_BLOCK_UNCOMPRESSED,
                std::mem::take(&mut self.data),
            ),
        };

        self.target.write_all(&header.to_le_bytes())?;
        self.target.write_all(&on_disk)?;
        trace!(
            target: "sqsh::meta",
            event = "block_flush",
            payload = payload_len,
            on_disk = on_disk.len(),
            start = self.block_start
        );

        self.block_start += 2 + on_disk.len() as u64;
        self.data.clear();
        Ok(())
    }

    /// Flush any partial block and hand back the underlying target.
    pub fn finish(mut self) -> Result<W> {
        self.flush()?;
        self.target.flush()?;
        Ok(self.target)
    }
}

// ── Reader ──────────────────────────────────────────────────────────────────

/// Reader over a framed metadata stream embedded in an image.
///
/// `table_start` is the absolute image offset of the stream's first block;
/// `limit` bounds the stream so a corrupt reference cannot walk into
/// unrelated image regions.
pub struct MetaReader<'a> {
    image: &'a [u8],
    table_start: u64,
    limit: u64,
    compressor: &'a dyn Compressor,
    block: Vec<u8>,
    block_start: u64,
    pos: usize,
    loaded: bool,
}

impl<'a> MetaReader<'a> {
    pub fn new(
        image: &'a [u8],
        table_start: u64,
        limit: u64,
        compressor: &'a dyn Compressor,
    ) -> Self {
        Self {
            image,
            table_start,
            limit,
            compressor,
            block: Vec::new(),
            block_start: 0,
            pos: 0,
            loaded: false,
        }
    }

    /// Position the reader at a reference into this stream.
    pub fn seek(&mut self, reference: MetaRef) -> Result<()> {
        if !(self.loaded && self.block_start == reference.block_start()) {
            self.load_block(reference.block_start())?;
        }
        let offset = usize::from(reference.offset());
        if offset > self.block.len() {
            return Err(SqshError::format(format!(
                "metadata reference {reference} points past the block payload"
            )));
        }
        self.pos = offset;
        Ok(())
    }

    /// Current position as a reference into this stream. Only meaningful
    /// after a `seek` or read has loaded a block.
    #[must_use]
    pub fn tell(&self) -> MetaRef {
        MetaRef::new(self.block_start, self.pos as u16)
    }

    /// Read exactly `out.len()` bytes, following the block chain as needed.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if !self.loaded {
            self.load_block(0)?;
        }

        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.block.len() {
                let next = self.next_block_start()?;
                self.load_block(next)?;
            }
            let take = (out.len() - filled).min(self.block.len() - self.pos);
            if take == 0 {
                return Err(SqshError::format("metadata stream ended mid-record"));
            }
            out[filled..filled + take].copy_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0_u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let mut buf = [0_u8; 2];
        self.read_exact(&mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0_u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0_u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Stream-relative offset of the block following the current one.
    fn next_block_start(&self) -> Result<u64> {
        let header_at = self
            .table_start
            .checked_add(self.block_start)
            .ok_or_else(|| SqshError::format("metadata block offset overflow"))?;
        let header = read_le_u16(self.image, header_at as usize).map_err(SqshError::format)?;
        let on_disk = u64::from(header & !META_BLOCK_UNCOMPRESSED);
        Ok(self.block_start + 2 + on_disk)
    }

    fn load_block(&mut self, block_start: u64) -> Result<()> {
        let abs = self
            .table_start
            .checked_add(block_start)
            .ok_or_else(|| SqshError::format("metadata block offset overflow"))?;
        if abs + 2 > self.limit {
            return Err(SqshError::format(format!(
                "metadata block at {abs} lies past the stream limit {}",
                self.limit
            )));
        }

        let header = read_le_u16(self.image, abs as usize).map_err(SqshError::format)?;
        let on_disk_len = usize::from(header & !META_BLOCK_UNCOMPRESSED);
        let payload_at = abs as usize + 2;
        if abs + 2 + on_disk_len as u64 > self.limit {
            return Err(SqshError::format("metadata block truncated by stream limit"));
        }
        let on_disk = self
            .image
            .get(payload_at..payload_at + on_disk_len)
            .ok_or_else(|| SqshError::format("metadata block truncated by image end"))?;

        self.block = if header & META_BLOCK_UNCOMPRESSED != 0 {
            on_disk.to_vec()
        } else {
            self.compressor.decompress(on_disk, META_BLOCK_SIZE)?
        };
        if self.block.len() > META_BLOCK_SIZE {
            return Err(SqshError::format("metadata block payload exceeds 8 KiB"));
        }

        self.block_start = block_start;
        self.pos = 0;
        self.loaded = true;
        Ok(())
    }
}
