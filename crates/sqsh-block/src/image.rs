//! Append-oriented output file.
//!
//! All writes go through positioned I/O so the image offset is tracked
//! explicitly; nothing in the pipeline depends on the OS file cursor. The
//! data dedup pass may cut the most recently appended blocks back off the
//! end, which is the only non-append operation besides the final super block
//! rewrite.

use sqsh_error::{Result, SqshError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

pub struct ImageFile {
    file: File,
    position: u64,
}

impl ImageFile {
    /// Create the output image. Refuses to overwrite an existing file
    /// unless `overwrite` is set.
    pub fn create(path: &Path, overwrite: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path)?;
        debug!(target: "sqsh::image", event = "create", path = %path.display());
        Ok(Self { file, position: 0 })
    }

    /// Wrap an already open file (used by tests).
    #[must_use]
    pub fn from_file(file: File) -> Self {
        Self { file, position: 0 }
    }

    /// Current append position; equals the number of bytes written so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append bytes, returning the offset they were written at.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.position;
        self.file.write_all_at(data, offset)?;
        self.position += data.len() as u64;
        Ok(offset)
    }

    /// Cut the image back to `offset`, discarding the bytes after it.
    ///
    /// Only ever used to drop just-appended duplicate blocks, so growing is
    /// rejected.
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.position {
            return Err(SqshError::format(
                "refusing to truncate the image to a larger size",
            ));
        }
        self.file.set_len(offset)?;
        self.position = offset;
        Ok(())
    }

    /// Overwrite bytes at the very start of the image (the super block slot)
    /// without disturbing the append position.
    pub fn overwrite_start(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.position {
            return Err(SqshError::format(
                "super block rewrite extends past the written image",
            ));
        }
        self.file.write_all_at(data, 0)?;
        Ok(())
    }

    /// Pad the image with zero bytes up to a multiple of the device block
    /// size. Returns the padded size.
    pub fn pad_to_multiple(&mut self, device_block_size: u32) -> Result<u64> {
        let block = u64::from(device_block_size);
        if block == 0 {
            return Err(SqshError::ConfigInvalid(
                "device block size cannot be zero".to_owned(),
            ));
        }
        let rem = self.position % block;
        if rem != 0 {
            let pad = (block - rem) as usize;
            self.append(&vec![0_u8; pad])?;
        }
        Ok(self.position)
    }

    /// Flush file contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Hand back the underlying file.
    #[must_use]
    pub fn into_file(self) -> File {
        self.file
    }
}

impl std::io::Write for ImageFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let offset = self.position;
        self.file.write_all_at(buf, offset).map(|()| {
            self.position += buf.len() as u64;
            buf.len()
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
