//! Numbered backing file sets
//!
//! A store component persists into a sequence of files `<base>.000`,
//! `<base>.001`, … each an append-mostly run of 8192-byte blocks. A page
//! radical maps to (file number, offset within file); files are created
//! lazily when a radical past the current end is first touched.

use crate::block::BLOCK_SIZE;
use crate::error::{Result, StoreError};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Blocks per backing file (32 MiB per file)
pub(crate) const BLOCKS_PER_FILE: u32 = 4096;

/// A sequence of numbered backing files sharing one radical namespace
pub(crate) struct FileSet {
    dir: PathBuf,
    base: String,
    files: RwLock<Vec<Arc<Mutex<File>>>>,
}

impl FileSet {
    /// Open a file set, creating the directory and discovering any files
    /// left by a previous run.
    pub(crate) fn open(dir: &Path, base: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut files = Vec::new();
        loop {
            let path = Self::file_path(dir, base, files.len() as u32);
            if !path.exists() {
                break;
            }
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            files.push(Arc::new(Mutex::new(file)));
        }
        debug!(base, existing = files.len(), "opened file set");
        Ok(FileSet {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            files: RwLock::new(files),
        })
    }

    fn file_path(dir: &Path, base: &str, index: u32) -> PathBuf {
        dir.join(format!("{base}.{index:03}"))
    }

    /// Number of pages any previous run had allocated, judged by file sizes.
    pub(crate) fn highest_radical(&self) -> Result<u32> {
        let files = self.files.read();
        let mut total = 0u64;
        for file in files.iter() {
            total += file.lock().metadata()?.len() / BLOCK_SIZE as u64;
        }
        u32::try_from(total)
            .map_err(|_| StoreError::capacity(format!("file set holds {total} blocks")))
    }

    fn file_for(&self, radical: u32) -> Result<Arc<Mutex<File>>> {
        let index = (radical / BLOCKS_PER_FILE) as usize;
        {
            let files = self.files.read();
            if let Some(file) = files.get(index) {
                return Ok(file.clone());
            }
        }
        let mut files = self.files.write();
        while files.len() <= index {
            let path = Self::file_path(&self.dir, &self.base, files.len() as u32);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            debug!(path = %path.display(), "created backing file");
            files.push(Arc::new(Mutex::new(file)));
        }
        Ok(files[index].clone())
    }

    fn offset_in_file(radical: u32) -> u64 {
        (radical % BLOCKS_PER_FILE) as u64 * BLOCK_SIZE as u64
    }

    /// Read the block at `radical` into `buf`, zero-filling past EOF.
    pub(crate) fn read_block(&self, radical: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let file = self.file_for(radical)?;
        let offset = Self::offset_in_file(radical);
        let mut guard = file.lock();
        let len = guard.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        guard.seek(SeekFrom::Start(offset))?;
        let available = ((len - offset) as usize).min(BLOCK_SIZE);
        guard.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);
        Ok(())
    }

    /// Write the block at `radical`, extending the file as needed.
    pub(crate) fn write_block(&self, radical: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        let file = self.file_for(radical)?;
        let offset = Self::offset_in_file(radical);
        let mut guard = file.lock();
        guard.seek(SeekFrom::Start(offset))?;
        guard.write_all(buf)?;
        Ok(())
    }

    /// Sync every backing file to disk.
    pub(crate) fn sync(&self) -> Result<()> {
        let files = self.files.read();
        for file in files.iter() {
            file.lock().sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_past_eof_zero_fills() {
        let dir = TempDir::new().unwrap();
        let fs = FileSet::open(dir.path(), "data").unwrap();

        let mut buf = [0xAAu8; BLOCK_SIZE];
        fs.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = FileSet::open(dir.path(), "data").unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        buf[0] = 0x42;
        buf[BLOCK_SIZE - 1] = 0x99;
        fs.write_block(5, &buf).unwrap();

        let mut read = [0u8; BLOCK_SIZE];
        fs.read_block(5, &mut read).unwrap();
        assert_eq!(read[0], 0x42);
        assert_eq!(read[BLOCK_SIZE - 1], 0x99);
    }

    #[test]
    fn test_radical_spans_files() {
        let dir = TempDir::new().unwrap();
        let fs = FileSet::open(dir.path(), "data").unwrap();

        let buf = [7u8; BLOCK_SIZE];
        fs.write_block(BLOCKS_PER_FILE + 2, &buf).unwrap();

        assert!(dir.path().join("data.001").exists());
        let mut read = [0u8; BLOCK_SIZE];
        fs.read_block(BLOCKS_PER_FILE + 2, &mut read).unwrap();
        assert_eq!(read[100], 7);
    }

    #[test]
    fn test_block_count_past_u32_is_capacity_error() {
        let dir = TempDir::new().unwrap();
        let fs = FileSet::open(dir.path(), "data").unwrap();
        fs.write_block(0, &[0u8; BLOCK_SIZE]).unwrap();

        let grown = OpenOptions::new()
            .write(true)
            .open(dir.path().join("data.000"))
            .unwrap();
        let bytes = (u32::MAX as u64 + 16) * BLOCK_SIZE as u64;
        if grown.set_len(bytes).is_err() {
            // Some filesystems refuse sparse files this large.
            return;
        }
        assert!(matches!(
            fs.highest_radical(),
            Err(StoreError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_highest_radical_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let fs = FileSet::open(dir.path(), "data").unwrap();
            let buf = [1u8; BLOCK_SIZE];
            fs.write_block(0, &buf).unwrap();
            fs.write_block(1, &buf).unwrap();
            fs.sync().unwrap();
        }
        let fs = FileSet::open(dir.path(), "data").unwrap();
        assert_eq!(fs.highest_radical().unwrap(), 2);
    }
}
