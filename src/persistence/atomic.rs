//! Crash-safe whole-file replacement.
//!
//! Files are replaced with the write-to-temp-then-rename pattern:
//! 1. Write to `<path>.tmp`
//! 2. fsync the temp file
//! 3. Rename over `<path>`
//! 4. fsync the parent directory
//!
//! Readers therefore see either the previous contents or the new contents,
//! never a torn write. The directory fsync is what makes the rename itself
//! survive a power loss on POSIX systems.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Replaces the contents of `path` with `bytes` atomically and durably.
///
/// Creates the parent directory if it does not exist yet.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(&parent)?;

    let tmp_path = tmp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;
    fsync_dir(&parent)
}

/// Syncs a directory so that entries created or renamed inside it are durable.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_new_file_and_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.properties");

        write_atomic(&path, b"Patient=x\n").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"Patient=x\n");
    }

    #[test]
    fn replaces_existing_contents_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.properties");

        write_atomic(&path, b"old contents that are longer").unwrap();
        write_atomic(&path, b"new").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn fails_when_parent_is_a_file() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let result = write_atomic(&blocker.join("state.properties"), b"x");
        assert!(result.is_err());
    }
}
