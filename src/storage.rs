//! Persistent storage helpers.
//!
//! - [`write_atomic`]: replace a file's contents in one step, so a crash
//!   leaves either the old or the new contents on disk.
//! - [`DiskImage`]: the sparse raw disk backing a machine.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const GIB: u64 = 1024 * 1024 * 1024;

/// Atomically replace `path` with `contents`.
///
/// Writes to a temporary file in the same directory, syncs it, then
/// renames it over the target. Parent directories are created as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A machine's raw disk image.
#[derive(Debug, Clone)]
pub struct DiskImage {
    /// Path to the disk image file.
    path: PathBuf,
    /// Size in bytes.
    size_bytes: u64,
}

/// Convert GiB to bytes, rejecting sizes that do not fit in a `u64`.
fn gib_to_bytes(size_gb: u64) -> Result<u64> {
    size_gb.checked_mul(GIB).ok_or_else(|| {
        Error::InvalidArgument(format!("disk size of {} GiB is too large", size_gb))
    })
}

impl DiskImage {
    /// Create a new sparse disk image of `size_gb` GiB.
    ///
    /// Fails if the file already exists.
    pub fn create_sparse(path: &Path, size_gb: u64) -> Result<Self> {
        if size_gb == 0 {
            return Err(Error::allocation("disk size must be at least 1 GiB"));
        }
        let size_bytes = gib_to_bytes(size_gb)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                Error::allocation(format!("failed to create disk {}: {}", path.display(), e))
            })?;

        // Seek to end and write a single byte to create sparse file
        let sized = file
            .seek(SeekFrom::Start(size_bytes - 1))
            .and_then(|_| file.write_all(&[0]))
            .and_then(|_| file.sync_all());
        if let Err(e) = sized {
            let _ = std::fs::remove_file(path);
            return Err(Error::allocation(format!(
                "failed to size disk {}: {}",
                path.display(),
                e
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
        })
    }

    /// Create a disk image from a base image, grown to at least `size_gb`.
    pub fn create_from_base(base: &Path, path: &Path, size_gb: u64) -> Result<Self> {
        if !base.is_file() {
            return Err(Error::allocation(format!(
                "base image not found: {}",
                base.display()
            )));
        }

        std::fs::copy(base, path).map_err(|e| {
            Error::allocation(format!(
                "failed to copy {} to {}: {}",
                base.display(),
                path.display(),
                e
            ))
        })?;

        let wanted = match gib_to_bytes(size_gb) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };
        let mut disk = Self::open(path)?;
        if disk.size_bytes < wanted {
            if let Err(e) = disk.grow(size_gb) {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        }
        Ok(disk)
    }

    /// Open an existing disk image.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::Storage(format!("failed to stat disk {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
        })
    }

    /// Grow the image to `size_gb` GiB. Shrinking is rejected.
    pub fn grow(&mut self, size_gb: u64) -> Result<()> {
        let new_size = gib_to_bytes(size_gb)?;
        if new_size < self.size_bytes {
            return Err(Error::InvalidArgument(format!(
                "disk size can only grow: current {} GiB, requested {} GiB",
                self.size_gb(),
                size_gb
            )));
        }

        let file = File::options().write(true).open(&self.path)?;
        file.set_len(new_size).map_err(|e| {
            Error::allocation(format!("failed to resize {}: {}", self.path.display(), e))
        })?;
        file.sync_all()?;
        self.size_bytes = new_size;
        Ok(())
    }

    /// Get the path to the disk image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the disk size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Get the disk size in GiB.
    pub fn size_gb(&self) -> u64 {
        self.size_bytes / GIB
    }
}
