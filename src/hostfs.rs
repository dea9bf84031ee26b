//! Host filesystem capability: traversal primitives consumed through a
//! narrow trait instead of calling `std::fs`/libc directly everywhere, so
//! tests can substitute an in-memory tree instead of touching a real
//! filesystem. Here the default implementation is backed by the real
//! filesystem, since the builder is meant to be usable standalone.

use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub dev: u64,
    pub inum: u64,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub atime_sec: i64,
    pub ctime_sec: i64,
    pub mtime_sec: i64,
}

pub trait HostFs {
    fn lstat(&self, path: &Path) -> Result<Stat, BuildError>;
    fn read_dir(&self, path: &Path) -> Result<Vec<String>, BuildError>;
    fn readlink(&self, path: &Path) -> Result<Vec<u8>, BuildError>;
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>, BuildError>;
    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>, BuildError>;
    fn read_xattr(&self, path: &Path, name: &str) -> Result<Vec<u8>, BuildError>;
}

pub struct StdHostFs;

impl HostFs for StdHostFs {
    fn lstat(&self, path: &Path) -> Result<Stat, BuildError> {
        let meta = fs::symlink_metadata(path).map_err(|cause| BuildError::SourceIo {
            path: path.to_path_buf(),
            cause,
        })?;
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::Regular
        } else {
            use std::os::unix::fs::FileTypeExt;
            if file_type.is_char_device() {
                FileKind::CharDevice
            } else if file_type.is_block_device() {
                FileKind::BlockDevice
            } else if file_type.is_fifo() {
                FileKind::Fifo
            } else {
                FileKind::Socket
            }
        };
        let rdev = meta.rdev();
        Ok(Stat {
            kind,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            nlink: meta.nlink() as u32,
            dev: meta.dev(),
            inum: meta.ino(),
            rdev_major: ((rdev >> 8) & 0xfff) as u32,
            rdev_minor: (rdev & 0xff) as u32,
            atime_sec: meta.atime(),
            ctime_sec: meta.ctime(),
            mtime_sec: meta.mtime(),
        })
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>, BuildError> {
        let mut names = Vec::new();
        let entries = fs::read_dir(path).map_err(|cause| BuildError::SourceIo {
            path: path.to_path_buf(),
            cause,
        })?;
        for entry in entries {
            let entry = entry.map_err(|cause| BuildError::SourceIo {
                path: path.to_path_buf(),
                cause,
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn readlink(&self, path: &Path) -> Result<Vec<u8>, BuildError> {
        use std::os::unix::ffi::OsStrExt;
        fs::read_link(path)
            .map(|p| p.as_os_str().as_bytes().to_vec())
            .map_err(|cause| BuildError::SourceIo {
                path: path.to_path_buf(),
                cause,
            })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read>, BuildError> {
        fs::File::open(path)
            .map(|f| Box::new(f) as Box<dyn Read>)
            .map_err(|cause| BuildError::SourceIo {
                path: path.to_path_buf(),
                cause,
            })
    }

    fn list_xattrs(&self, path: &Path) -> Result<Vec<String>, BuildError> {
        match raw_xattr::llistxattr(path) {
            Ok(names) => Ok(names),
            Err(cause) if cause.raw_os_error() == Some(libc::EOPNOTSUPP) => {
                Err(BuildError::HostAttrUnavailable {
                    path: path.to_path_buf(),
                    reason: "xattrs not supported".into(),
                })
            }
            Err(cause) => Err(BuildError::SourceIo {
                path: path.to_path_buf(),
                cause,
            }),
        }
    }

    fn read_xattr(&self, path: &Path, name: &str) -> Result<Vec<u8>, BuildError> {
        raw_xattr::lgetxattr(path, name).map_err(|cause| BuildError::SourceIo {
            path: path.to_path_buf(),
            cause,
        })
    }
}

/// Thin wrappers around the `llistxattr(2)`/`lgetxattr(2)` syscalls via
/// `libc`, since the standard library has no xattr support.
mod raw_xattr {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn cpath(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
    }

    pub fn llistxattr(path: &Path) -> io::Result<Vec<String>> {
        let c_path = cpath(path)?;
        let needed = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
        if needed < 0 {
            return Err(io::Error::last_os_error());
        }
        if needed == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; needed as usize];
        let written = unsafe {
            libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut i8, buf.len())
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(written as usize);
        Ok(buf
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    pub fn lgetxattr(path: &Path, name: &str) -> io::Result<Vec<u8>> {
        let c_path = cpath(path)?;
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name has a NUL byte"))?;
        let needed = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if needed < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf = vec![0u8; needed as usize];
        let written = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr() as *mut std::ffi::c_void,
                buf.len(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(written as usize);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lstat_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::File::create(&path).unwrap().write_all(b"hi").unwrap();
        let stat = StdHostFs.lstat(&path).unwrap();
        assert_eq!(stat.kind, FileKind::Regular);
        assert_eq!(stat.size, 2);
    }

    #[test]
    fn lstat_symlink_does_not_follow() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let stat = StdHostFs.lstat(&link).unwrap();
        assert_eq!(stat.kind, FileKind::Symlink);
    }

    #[test]
    fn readlink_returns_target_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/some/target", &link).unwrap();
        let bytes = StdHostFs.readlink(&link).unwrap();
        assert_eq!(bytes, b"/some/target");
    }

    #[test]
    fn no_xattrs_set_is_an_empty_list_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let names = StdHostFs.list_xattrs(&path).unwrap();
        assert!(names.is_empty());
    }
}
