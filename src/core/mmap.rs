use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Create a file of `len` bytes and map it read-write, preallocating
    /// every page so later stores cannot fault on a full file system.
    pub fn create(path: &Path, len: usize) -> io::Result<Self> {
        let mut mapped = Self::create_sparse(path, len)?;
        let page = page_size();
        let slice = mapped.as_mut_slice();
        let mut offset = 0;
        while offset < len {
            slice[offset] = 0;
            offset += page;
        }
        Ok(mapped)
    }

    /// Create a file of `len` bytes and map it read-write without touching
    /// pages. Blocks are allocated lazily on first write.
    pub fn create_sparse(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mmap length must be non-zero",
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mmap length must be non-zero",
            ));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn flush_async(&self) -> io::Result<()> {
        self.map.flush_async()
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("region.map");

        let mut mapped = MmapFile::create(&path, 8192).expect("create");
        mapped.as_mut_slice()[100] = 0xAB;
        drop(mapped);

        let reopened = MmapFile::open(&path).expect("open");
        assert_eq!(reopened.len(), 8192);
        assert_eq!(reopened.as_slice()[100], 0xAB);
    }

    #[test]
    fn zero_length_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.map");
        assert!(MmapFile::create(&path, 0).is_err());
    }
}
