//! POSIX shared memory segments for the packet ring.
//!
//! Segments are plain files under /dev/shm mapped read-write, so they
//! survive process exit and can be inspected with ordinary file tools.
//! Unlinking is always an explicit operation; dropping a mapping never
//! removes the segment.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;

const SHM_DIR: &str = "/dev/shm";

fn segment_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') {
        bail!("bad segment name {:?}: must be non-empty with no '/'", name);
    }
    Ok(PathBuf::from(SHM_DIR).join(name))
}

fn map_rw(file: &File, name: &str) -> Result<MmapMut> {
    // Safety: no exclusive access is assumed; everything mutable inside the
    // mapping is an atomic or a futex word
    unsafe { MmapMut::map_mut(file) }
        .with_context(|| format!("mmap of ring segment {} failed", name))
}

/// Create (or reset) a zero-filled segment of exactly `size` bytes.
pub fn create_shm(name: &str, size: usize) -> Result<MmapMut> {
    let path = segment_path(name)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("creating ring segment {}", path.display()))?;
    file.set_len(size as u64)
        .with_context(|| format!("sizing ring segment {} to {} bytes", path.display(), size))?;
    map_rw(&file, name)
}

/// Map an existing segment in full. The file must hold at least `min_size`
/// bytes — for a ring, enough for the control block — to be worth attaching.
pub fn open_shm(name: &str, min_size: usize) -> Result<MmapMut> {
    let path = segment_path(name)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("attaching to ring segment {}", path.display()))?;
    let len = file.metadata()?.len();
    if (len as usize) < min_size {
        bail!(
            "ring segment {} holds {} bytes, need at least {}",
            path.display(),
            len,
            min_size
        );
    }
    map_rw(&file, name)
}

/// Unlink a segment. A segment that is already gone is not an error.
pub fn remove_shm(name: &str) -> Result<()> {
    let path = segment_path(name)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("unlinking ring segment {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_remove() {
        let name = "test-mmap-roundtrip";
        let _ = remove_shm(name);

        let mmap = create_shm(name, 4096).unwrap();
        assert_eq!(mmap.len(), 4096);
        assert!(mmap.iter().all(|&b| b == 0));
        drop(mmap);

        let mmap = open_shm(name, 4096).unwrap();
        assert_eq!(mmap.len(), 4096);
        drop(mmap);

        remove_shm(name).unwrap();
        assert!(open_shm(name, 4096).is_err());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        remove_shm("test-mmap-not-there").unwrap();
    }

    #[test]
    fn test_open_undersized_segment() {
        let name = "test-mmap-undersized";
        let _ = remove_shm(name);

        create_shm(name, 128).unwrap();
        let err = open_shm(name, 4096).unwrap_err();
        assert!(err.to_string().contains("need at least"));

        remove_shm(name).unwrap();
    }

    #[test]
    fn test_rejects_bad_segment_names() {
        assert!(create_shm("", 64).is_err());
        assert!(create_shm("a/b", 64).is_err());
        assert!(open_shm("nested/name", 64).is_err());
    }
}
