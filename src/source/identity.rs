//! Platform-stable file identity.
//!
//! Identity is derived only from the filesystem's own notion of "which file":
//! device + inode on Unix, volume serial + file index on Windows. Path, size
//! and modification time are never consulted since all of them are mutable
//! or reused across distinct files.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Device ID (Unix) or volume serial number (Windows)
    pub primary: u64,
    /// Inode number (Unix) or 64-bit file index (Windows)
    pub secondary: u64,
}

impl FileIdentity {
    pub fn new(primary: u64, secondary: u64) -> Self {
        Self { primary, secondary }
    }

    /// Two identities denote the same underlying file iff both components match.
    pub fn same_file(&self, other: &FileIdentity) -> bool {
        self.primary == other.primary && self.secondary == other.secondary
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.primary, self.secondary)
    }
}

/// Capability for computing the identity of an open handle.
///
/// One implementation per platform family, chosen at compile time.
pub trait FileIdentityExt {
    fn identity(&self) -> io::Result<FileIdentity>;
}

#[cfg(unix)]
impl FileIdentityExt for File {
    fn identity(&self) -> io::Result<FileIdentity> {
        use std::os::unix::fs::MetadataExt;

        let metadata = self.metadata()?;
        Ok(FileIdentity {
            primary: metadata.dev(),
            secondary: metadata.ino(),
        })
    }
}

#[cfg(windows)]
impl FileIdentityExt for File {
    fn identity(&self) -> io::Result<FileIdentity> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION,
        };

        let handle = self.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(FileIdentity {
            primary: info.dwVolumeSerialNumber as u64,
            secondary: file_index,
        })
    }
}

pub fn identity_of(file: &File) -> io::Result<FileIdentity> {
    file.identity()
}

/// Opens the path just long enough to read its identity.
pub fn identity_of_path(path: impl AsRef<Path>) -> io::Result<FileIdentity> {
    let file = File::open(path)?;
    file.identity()
}

pub fn same_file(a: &FileIdentity, b: &FileIdentity) -> bool {
    a.same_file(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_identity_of_open_handle_is_stable() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"line\n").unwrap();
        file.flush().unwrap();

        let handle = file.reopen().unwrap();
        let a = identity_of(&handle).unwrap();
        let b = identity_of(&handle).unwrap();

        assert!(same_file(&a, &b));
    }

    #[test]
    fn test_identity_survives_append() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"first\n").unwrap();
        file.flush().unwrap();
        let before = identity_of_path(file.path()).unwrap();

        file.write_all(b"second\n").unwrap();
        file.flush().unwrap();
        let after = identity_of_path(file.path()).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_replaced_file_with_reused_path_differs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old\n").unwrap();

        // Keep the old handle open so its inode cannot be recycled.
        let old_handle = File::open(&path).unwrap();
        let old = identity_of(&old_handle).unwrap();

        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "new\n").unwrap();
        let new = identity_of_path(&path).unwrap();

        assert!(!same_file(&old, &new));
    }

    #[test]
    fn test_missing_path_fails() {
        let dir = TempDir::new().unwrap();
        assert!(identity_of_path(dir.path().join("nope.log")).is_err());
    }

    #[test]
    fn test_display() {
        let id = FileIdentity::new(12, 345);
        assert_eq!(id.to_string(), "12:345");
    }
}
