//! # Shadow-File I/O
//!
//! A thin wrapper around the shadow file's descriptor providing the
//! positional reads and writes the EOT engines need. All I/O is
//! synchronous.
//!
//! ## Atomicity Assumption
//!
//! The writer updates page images, the index block, and the header with
//! plain positional writes while readers issue concurrent positional
//! reads; nothing serializes the two. The protocol tolerates torn
//! *blocks* (checksums and the twin-tick check catch them), but it does
//! assume the shadow file lives on a filesystem where an aligned
//! `page_size` write and a concurrent read of the same range do not
//! interleave at sub-sector granularity. Local filesystems satisfy
//! this; some network filesystems do not.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

/// An open shadow file plus the path it was opened at.
#[derive(Debug)]
pub struct ShadowFile {
    file: File,
    path: PathBuf,
}

impl ShadowFile {
    /// Creates (or opens, without truncating) the shadow file for the
    /// writer. The writer sets the initial length separately.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create shadow file at {:?}", path))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing shadow file read-only, for a reader.
    pub fn open_readonly(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open shadow file at {:?}", path))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the whole buffer at the given byte offset.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all_at(bytes, offset)
            .wrap_err_with(|| format!("failed to write {} bytes at {}", bytes.len(), offset))
    }

    /// Fills the whole buffer from the given byte offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .wrap_err_with(|| format!("failed to read {} bytes at {}", buf.len(), offset))
    }

    /// Like [`read_at`](Self::read_at), but reports a short file as
    /// `Ok(false)` instead of an error. A reader that races the writer
    /// extending the file sees exactly that, and must treat it as a
    /// torn read rather than an I/O failure.
    pub fn read_at_opt(&self, offset: u64, buf: &mut [u8]) -> Result<bool> {
        match self.file.read_exact_at(buf, offset) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e)
                .wrap_err_with(|| format!("failed to read {} bytes at {}", buf.len(), offset)),
        }
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to truncate shadow file to {} bytes", len))
    }

    pub fn len(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .wrap_err("failed to stat shadow file")?;
        Ok(meta.len())
    }

    /// Closes the descriptor and unlinks the file. Writer-close only.
    pub fn unlink(self) -> Result<()> {
        let Self { file, path } = self;
        drop(file);
        fs::remove_file(&path).wrap_err_with(|| format!("failed to unlink shadow file {:?}", path))
    }
}
