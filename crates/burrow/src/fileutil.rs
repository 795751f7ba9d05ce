//! Filesystem plumbing for segment directories.
//!
//! Segment files are regular files whose names are zero-padded decimal
//! sequence numbers. Directory handles are fsynced after any create, rename
//! or removal so the directory entries themselves are durable. A `lock` file
//! gives a single process exclusive ownership of a directory.

use crate::error::{IoResultExt, Result, StoreError};
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Width of zero-padded sequence file names.
const SEQUENCE_NAME_WIDTH: usize = 8;

/// Formats a sequence number as a segment file name.
pub fn sequence_file_name(seq: u64) -> String {
    format!("{:0width$}", seq, width = SEQUENCE_NAME_WIDTH)
}

/// Lists all sequence files in `dir`, sorted by sequence number.
///
/// Non-numeric names (the lock file, temporary files) are skipped.
pub fn sequence_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).context("read segment dir")? {
        let entry = entry.context("read segment dir entry")?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(seq) = name.parse::<u64>() {
            files.push((seq, path));
        }
    }
    files.sort_by_key(|&(seq, _)| seq);
    Ok(files)
}

/// Returns the next unused sequence number and file path in `dir`.
pub fn next_sequence_file(dir: &Path) -> Result<(u64, PathBuf)> {
    let seq = match sequence_files(dir)?.last() {
        Some(&(seq, _)) => seq + 1,
        None => 0,
    };
    Ok((seq, dir.join(sequence_file_name(seq))))
}

/// Creates a file at `path` preallocated to `size` bytes of zeroes.
pub fn create_preallocated(path: &Path, size: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .context("create segment file")?;
    if size > 0 {
        file.set_len(size).context("preallocate segment file")?;
    }
    Ok(file)
}

/// Fsyncs the directory itself so entry creations and removals are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).context("open dir for sync")?;
    handle.sync_all().context("sync dir")?;
    Ok(())
}

/// Memory-maps the file at `path` read-only.
pub fn open_mmap(path: &Path) -> Result<Mmap> {
    let file = File::open(path).context("open file for mmap")?;
    // Safety: the mapping is read-only and the files mapped here are
    // immutable once written (index files are never rewritten in place).
    let mmap = unsafe { Mmap::map(&file) }.context("mmap file")?;
    Ok(mmap)
}

/// Exclusive ownership of a directory via a `lock` file.
///
/// Acquiring fails if the lock file already exists; the file is removed when
/// the guard is dropped.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// File name of the lock inside the owned directory.
    pub const LOCK_FILE: &'static str = "lock";

    /// Acquires the lock for `dir`.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::IoOp {
                op: "acquire dir lock (already locked)",
                source: e,
            }),
            Err(e) => Err(StoreError::IoOp {
                op: "acquire dir lock",
                source: e,
            }),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
