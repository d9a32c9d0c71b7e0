//! File-backed block storage

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{IndexError, Result};

use super::{check_range, BlockStorage, BLOCK_SIZE};

/// Block storage over a single preallocated file
///
/// ## Concurrency:
/// - The file handle is behind a Mutex because reads seek
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<File>,
    blocks: u64,
}

impl FileStorage {
    /// Open or create a file and size it to `blocks` blocks
    pub fn open(path: &Path, blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let wanted = blocks * BLOCK_SIZE as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStorage for FileStorage {
    fn read_blocks(&self, offset: u64, count: usize) -> Result<Vec<u8>> {
        check_range(self.blocks, offset, count as u64)?;
        let mut buf = vec![0u8; count * BLOCK_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset * BLOCK_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_blocks(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(IndexError::invalid(format!(
                "write of {} bytes is not block aligned",
                data.len()
            )));
        }
        check_range(self.blocks, offset, (data.len() / BLOCK_SIZE) as u64)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset * BLOCK_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }
}
