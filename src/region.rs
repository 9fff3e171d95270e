//! Backing-file management: create or open the database file, size it, and
//! map it shared.
//!
//! The region layer also provides the boot-time creator exclusion: the file
//! is `flock`ed exclusively for the whole create-and-initialize window, so
//! exactly one opener initializes a fresh region while later openers block
//! (up to a deadline) and then observe a fully-published header. Runtime
//! map operations never touch the file lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use memmap2::{MmapMut, MmapOptions};

/// Polling step while waiting for the creation lock.
const LOCK_RETRY_STEP: Duration = Duration::from_millis(2);

/// A contiguous, shared, writable mapping of exactly the requested size.
#[derive(Debug)]
pub struct MappedRegion {
    mmap: MmapMut,
    /// Keeps the open file description (and with it any flock) alive as
    /// long as the mapping.
    _file: File,
    path: PathBuf,
}

/// One-shot handle on the creator-exclusion lock. Consumed by
/// [`RegionLock::unlock`]; dropping it unreleased also unlocks, so an
/// error path cannot leave the file wedged.
#[derive(Debug)]
pub struct RegionLock {
    file: Option<File>,
}

impl MappedRegion {
    /// Open (or create) `path`, grow it to at least `size` bytes, and map
    /// the first `size` bytes shared and writable.
    ///
    /// Returns the region together with the held creation lock. A freshly
    /// created file reads as all zeroes. Waiting for the lock is bounded by
    /// `wait`; on expiry the error kind is [`io::ErrorKind::WouldBlock`].
    pub fn open(path: &Path, size: usize, wait: Duration) -> io::Result<(MappedRegion, RegionLock)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        lock_exclusive(&file, wait)?;
        let lock = RegionLock {
            file: Some(file.try_clone()?),
        };

        let file_len = file.metadata()?.len();
        if file_len < size as u64 {
            // set_len zero-fills, which is what a fresh region relies on
            file.set_len(size as u64)?;
        }

        // Safety: the file is at least `size` bytes long and stays open for
        // the lifetime of the mapping.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        debug!(
            "mapped {} bytes of {} (file was {} bytes)",
            size,
            path.display(),
            file_len
        );

        Ok((
            MappedRegion {
                mmap,
                _file: file,
                path: path.to_path_buf(),
            },
            lock,
        ))
    }

    /// Base of the mapping. The address is stable for the region's
    /// lifetime; all in-region references are offsets from it.
    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// msync the mapping. Needed only for durability against power loss;
    /// other processes share the same physical pages regardless.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegionLock {
    /// Release the creation lock. One-shot by move.
    pub fn unlock(mut self) -> io::Result<()> {
        self.release()
    }

    fn release(&mut self) -> io::Result<()> {
        if let Some(f) = self.file.take() {
            let rc = unsafe { libc::flock(f.as_raw_fd(), libc::LOCK_UN) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Acquire an exclusive `flock`, polling non-blocking until `wait` elapses.
fn lock_exclusive(file: &File, wait: Duration) -> io::Result<()> {
    let deadline = Instant::now() + wait;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "timed out waiting for map creation lock",
            ));
        }
        thread::sleep(LOCK_RETRY_STEP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(1);

    #[test]
    fn fresh_region_is_zero_filled_and_sized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.db");
        let (region, lock) = MappedRegion::open(&path, 4096, WAIT).unwrap();
        lock.unlock().unwrap();

        assert_eq!(region.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(region.base_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn contents_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.db");

        {
            let (region, lock) = MappedRegion::open(&path, 64, WAIT).unwrap();
            lock.unlock().unwrap();
            unsafe { *region.base_ptr().add(7) = 0xAB };
            region.flush().unwrap();
        }

        let (region, lock) = MappedRegion::open(&path, 64, WAIT).unwrap();
        lock.unlock().unwrap();
        assert_eq!(unsafe { *region.base_ptr().add(7) }, 0xAB);
    }

    #[test]
    fn creation_lock_excludes_second_opener() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.db");

        let (_region, lock) = MappedRegion::open(&path, 64, WAIT).unwrap();

        // Second opener gets a separate file description and must time out.
        let err = MappedRegion::open(&path, 64, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        lock.unlock().unwrap();
        let (_region2, lock2) = MappedRegion::open(&path, 64, WAIT).unwrap();
        lock2.unlock().unwrap();
    }

    #[test]
    fn dropping_lock_handle_releases_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.db");

        {
            let (_region, _lock) = MappedRegion::open(&path, 64, WAIT).unwrap();
            // lock dropped without unlock()
        }
        let (_region, lock) = MappedRegion::open(&path, 64, Duration::from_millis(50)).unwrap();
        lock.unlock().unwrap();
    }
}
