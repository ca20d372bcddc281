#![forbid(unsafe_code)]
//! Compressor registry.
//!
//! One uniform interface over the codecs a SquashFS image may use. Data
//! blocks, fragment blocks and metadata blocks all go through a
//! [`Compressor`]; a block that does not shrink is stored raw, which the
//! interface models by returning `None` from [`Compressor::compress`].
//!
//! gzip (zlib streams), lzma, xz and zstd are implemented. lzo and lz4 parse
//! as identifiers but report [`SqshError::UnsupportedCompressor`] on
//! instantiation, matching a build of the original tooling without those
//! libraries.

use sqsh_error::{Result, SqshError};
use sqsh_types::{push_u16, push_u32, read_le_u16, read_le_u32, BlockSize, CompressorId};
use std::io::{Read, Write};

const GZIP_DEFAULT_LEVEL: u32 = 9;
const GZIP_WINDOW: u16 = 15;
const ZSTD_DEFAULT_LEVEL: i32 = 15;
const XZ_PRESET: u32 = 6;

/// Configuration for creating a [`Compressor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressorConfig {
    pub id: CompressorId,
    pub block_size: BlockSize,
    /// gzip compression level (1..=9).
    pub gzip_level: u32,
    /// xz LZMA2 dictionary size in bytes.
    pub xz_dict_size: u32,
    /// zstd compression level (1..=22).
    pub zstd_level: i32,
}

impl CompressorConfig {
    /// Default settings for a codec at a given block size.
    #[must_use]
    pub fn new(id: CompressorId, block_size: BlockSize) -> Self {
        Self {
            id,
            block_size,
            gzip_level: GZIP_DEFAULT_LEVEL,
            xz_dict_size: block_size.get(),
            zstd_level: ZSTD_DEFAULT_LEVEL,
        }
    }

    /// Apply a `--comp-extra` style option string (`key=value,key=value`).
    pub fn apply_extra(&mut self, extra: &str) -> Result<()> {
        for item in extra.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                SqshError::ConfigInvalid(format!("malformed compressor option '{item}'"))
            })?;
            let parse = |field: &str| -> Result<u64> {
                value.parse::<u64>().map_err(|_| {
                    SqshError::ConfigInvalid(format!("{field} must be a number, got '{value}'"))
                })
            };

            match (self.id, key) {
                (CompressorId::Gzip, "level") => {
                    let level = parse("level")?;
                    if !(1..=9).contains(&level) {
                        return Err(SqshError::ConfigInvalid(
                            "gzip level must be in 1..=9".to_owned(),
                        ));
                    }
                    self.gzip_level = level as u32;
                }
                (CompressorId::Xz, "dictsize") => {
                    let size = parse("dictsize")?;
                    if size < 8192 || size > u64::from(BlockSize::MAX) {
                        return Err(SqshError::ConfigInvalid(
                            "xz dictionary size must be in 8192..=1048576".to_owned(),
                        ));
                    }
                    self.xz_dict_size = size as u32;
                }
                (CompressorId::Zstd, "level") => {
                    let level = parse("level")?;
                    if !(1..=22).contains(&level) {
                        return Err(SqshError::ConfigInvalid(
                            "zstd level must be in 1..=22".to_owned(),
                        ));
                    }
                    self.zstd_level = level as i32;
                }
                _ => {
                    return Err(SqshError::ConfigInvalid(format!(
                        "compressor {} does not take option '{key}'",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Uniform block codec interface.
///
/// Implementations are stateless per call so a single boxed instance can be
/// shared across compression workers behind an `Arc`.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    fn id(&self) -> CompressorId;

    /// Compress one block. Returns `None` when the compressed form would not
    /// be strictly smaller than the input, in which case the caller stores
    /// the block uncompressed.
    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Decompress one block of at most `max_size` uncompressed bytes.
    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>>;

    /// Serialized compressor-options payload, when any parameter differs
    /// from the codec default.
    fn options(&self) -> Option<Vec<u8>>;
}

/// Whether this build can instantiate the given codec.
#[must_use]
pub fn compressor_exists(id: CompressorId) -> bool {
    !matches!(id, CompressorId::Lzo | CompressorId::Lz4)
}

/// Instantiate the codec described by `cfg`.
pub fn create_compressor(cfg: &CompressorConfig) -> Result<Box<dyn Compressor>> {
    match cfg.id {
        CompressorId::Gzip => Ok(Box::new(GzipCompressor {
            level: cfg.gzip_level,
        })),
        CompressorId::Lzma => Ok(Box::new(LzmaCompressor)),
        CompressorId::Xz => Ok(Box::new(XzCompressor {
            dict_size: cfg.xz_dict_size,
            block_size: cfg.block_size.get(),
        })),
        CompressorId::Zstd => Ok(Box::new(ZstdCompressor {
            level: cfg.zstd_level,
        })),
        CompressorId::Lzo | CompressorId::Lz4 => Err(SqshError::UnsupportedCompressor(
            cfg.id.name().to_owned(),
        )),
    }
}

/// Parse and validate a compressor-options payload read back from an image.
pub fn parse_options(id: CompressorId, data: &[u8]) -> Result<()> {
    let check = |want: usize| -> Result<()> {
        if data.len() < want {
            return Err(SqshError::format(format!(
                "compressor options for {id} truncated: {} of {want} bytes",
                data.len()
            )));
        }
        Ok(())
    };

    match id {
        CompressorId::Gzip => {
            check(8)?;
            let level = read_le_u32(data, 0).map_err(SqshError::format)?;
            let window = read_le_u16(data, 4).map_err(SqshError::format)?;
            if !(1..=9).contains(&level) || !(8..=15).contains(&window) {
                return Err(SqshError::format("gzip options out of range"));
            }
            Ok(())
        }
        CompressorId::Xz => {
            check(8)?;
            let dict = read_le_u32(data, 0).map_err(SqshError::format)?;
            if !(8192..=BlockSize::MAX).contains(&dict) {
                return Err(SqshError::format("xz dictionary size out of range"));
            }
            Ok(())
        }
        CompressorId::Zstd => {
            check(4)?;
            let level = read_le_u32(data, 0).map_err(SqshError::format)?;
            if !(1..=22).contains(&level) {
                return Err(SqshError::format("zstd level out of range"));
            }
            Ok(())
        }
        CompressorId::Lzma => Ok(()),
        CompressorId::Lzo | CompressorId::Lz4 => {
            Err(SqshError::UnsupportedCompressor(id.name().to_owned()))
        }
    }
}

fn comp_err(err: impl std::fmt::Display) -> SqshError {
    SqshError::Compression(err.to_string())
}

fn read_limited<R: Read>(reader: R, max_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut limited = reader.take(max_size as u64 + 1);
    limited.read_to_end(&mut out).map_err(comp_err)?;
    if out.len() > max_size {
        return Err(SqshError::Compression(format!(
            "block decompresses past the {max_size}-byte limit"
        )));
    }
    Ok(out)
}

// ── gzip (zlib streams) ─────────────────────────────────────────────────────

#[derive(Debug)]
struct GzipCompressor {
    level: u32,
}

impl Compressor for GzipCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut encoder = flate2::write::ZlibEncoder::new(
            Vec::with_capacity(data.len()),
            flate2::Compression::new(self.level),
        );
        encoder.write_all(data).map_err(comp_err)?;
        let out = encoder.finish().map_err(comp_err)?;
        Ok((out.len() < data.len()).then_some(out))
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        read_limited(flate2::read::ZlibDecoder::new(data), max_size)
    }

    fn options(&self) -> Option<Vec<u8>> {
        if self.level == GZIP_DEFAULT_LEVEL {
            return None;
        }
        let mut out = Vec::with_capacity(8);
        push_u32(&mut out, self.level);
        push_u16(&mut out, GZIP_WINDOW);
        push_u16(&mut out, 0); // strategies
        Some(out)
    }
}

// ── lzma (legacy alone format) ──────────────────────────────────────────────

#[derive(Debug)]
struct LzmaCompressor;

impl LzmaCompressor {
    fn encoder_stream() -> Result<xz2::stream::Stream> {
        let opts = xz2::stream::LzmaOptions::new_preset(XZ_PRESET).map_err(comp_err)?;
        xz2::stream::Stream::new_lzma_encoder(&opts).map_err(comp_err)
    }

    fn decoder_stream() -> Result<xz2::stream::Stream> {
        xz2::stream::Stream::new_lzma_decoder(u64::MAX).map_err(comp_err)
    }
}

impl Compressor for LzmaCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Lzma
    }

    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let stream = Self::encoder_stream()?;
        let mut encoder =
            xz2::write::XzEncoder::new_stream(Vec::with_capacity(data.len()), stream);
        encoder.write_all(data).map_err(comp_err)?;
        let out = encoder.finish().map_err(comp_err)?;
        Ok((out.len() < data.len()).then_some(out))
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        let stream = Self::decoder_stream()?;
        read_limited(xz2::read::XzDecoder::new_stream(data, stream), max_size)
    }

    fn options(&self) -> Option<Vec<u8>> {
        None
    }
}

// ── xz ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct XzCompressor {
    dict_size: u32,
    block_size: u32,
}

impl XzCompressor {
    fn encoder_stream(&self) -> Result<xz2::stream::Stream> {
        let mut opts = xz2::stream::LzmaOptions::new_preset(XZ_PRESET).map_err(comp_err)?;
        opts.dict_size(self.dict_size);
        let mut filters = xz2::stream::Filters::new();
        filters.lzma2(&opts);
        xz2::stream::Stream::new_stream_encoder(&filters, xz2::stream::Check::Crc32)
            .map_err(comp_err)
    }
}

impl Compressor for XzCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Xz
    }

    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let stream = self.encoder_stream()?;
        let mut encoder =
            xz2::write::XzEncoder::new_stream(Vec::with_capacity(data.len()), stream);
        encoder.write_all(data).map_err(comp_err)?;
        let out = encoder.finish().map_err(comp_err)?;
        Ok((out.len() < data.len()).then_some(out))
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        let stream = xz2::stream::Stream::new_stream_decoder(u64::MAX, 0).map_err(comp_err)?;
        read_limited(xz2::read::XzDecoder::new_stream(data, stream), max_size)
    }

    fn options(&self) -> Option<Vec<u8>> {
        if self.dict_size == self.block_size {
            return None;
        }
        let mut out = Vec::with_capacity(8);
        push_u32(&mut out, self.dict_size);
        push_u32(&mut out, 0); // filter bitmap
        Some(out)
    }
}

// ── zstd ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ZstdCompressor {
    level: i32,
}

impl Compressor for ZstdCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let out = zstd::bulk::compress(data, self.level).map_err(comp_err)?;
        Ok((out.len() < data.len()).then_some(out))
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, max_size).map_err(comp_err)
    }

    fn options(&self) -> Option<Vec<u8>> {
        if self.level == ZSTD_DEFAULT_LEVEL {
            return None;
        }
        let mut out = Vec::with_capacity(4);
        push_u32(&mut out, self.level as u32);
        Some(out)
    }
}
