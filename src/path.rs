//! Structural path classification: a path's kind (file, empty or
//! non-empty directory, creatable, invalid) is inferred from the flat
//! record list alone, by byte-wise comparison against every stored
//! path. There is no directory structure on flash to consult.

use crate::config::*;
use crate::error::{FsError, Result};
use crate::file::{self, RecordPtr};
use crate::nvm::NvmDevice;
use crate::store::{self, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// No record has ruled on the path yet; resolved to
    /// `InvalidNotFound` once the scan completes.
    Undefined,
    /// Every parent component exists; the path itself does not.
    Creatable,
    ExistsAsFile,
    ExistsAsEmptyDir,
    ExistsAsNonemptyDir,
    /// A parent component exists but is not a directory.
    InvalidNotDirs,
    /// A parent component does not exist.
    InvalidNotFound,
}

/// The outcome of classifying one path against the record list.
#[derive(Debug, Clone)]
pub struct PathInfo {
    path: [u8; PATH_MAX],
    len: usize,
    last_slash: usize,
    dirname: [u8; PATH_MAX],
    basename: [u8; PATH_MAX],
    /// Number of records whose path starts with this path's dirname.
    pub parent: usize,
    /// The record that settled the classification, when one did.
    pub witness: Option<RecordPtr>,
    pub kind: PathKind,
}

/// Index of the first differing byte of two null-terminated paths.
/// Reaching `PATH_MAX` means neither terminator was seen.
fn first_differ(p1: &[u8; PATH_MAX], p2: &[u8; PATH_MAX]) -> Result<usize> {
    let mut i = 0;
    while i < PATH_MAX {
        if p1[i] != p2[i] || p1[i] == b'\0' {
            return Ok(i);
        }
        i += 1;
    }
    Err(FsError::NameTooLong)
}

/// `path` terminates exactly where the stored path does, and the
/// shared last byte is a regular name byte on both sides.
fn exists_as_file(stored: &[u8; PATH_MAX], path: &[u8; PATH_MAX], i: usize) -> bool {
    i > 0
        && stored[i - 1] != b'/'
        && stored[i - 1] != b'\0'
        && stored[i] == b'\0'
        && path[i - 1] != b'/'
        && path[i - 1] != b'\0'
        && path[i] == b'\0'
}

/// Either both paths end with a slash at the divergence point, or the
/// stored path is `path` plus a single trailing slash.
fn exists_as_empty_dir(stored: &[u8; PATH_MAX], path: &[u8; PATH_MAX], i: usize) -> bool {
    let c0 = i > 0
        && stored[i - 1] == b'/'
        && stored[i] == b'\0'
        && path[i - 1] == b'/'
        && path[i] == b'\0';
    let c1 = i > 0
        && i < PATH_MAX - 1
        && stored[i - 1] != b'/'
        && stored[i - 1] != b'\0'
        && stored[i] == b'/'
        && stored[i + 1] == b'\0'
        && path[i - 1] != b'/'
        && path[i - 1] != b'\0'
        && path[i] == b'\0';
    c0 || c1
}

/// The stored path continues past a slash where `path` terminated:
/// the record is a child of `path`.
fn exists_as_nonempty_dir(stored: &[u8; PATH_MAX], path: &[u8; PATH_MAX], i: usize) -> bool {
    let c0 = i > 0
        && stored[i - 1] == b'/'
        && stored[i] != b'/'
        && stored[i] != b'\0'
        && path[i - 1] == b'/'
        && path[i] == b'\0';
    let c1 = i > 0
        && i < PATH_MAX - 1
        && stored[i - 1] != b'/'
        && stored[i - 1] != b'\0'
        && stored[i] == b'/'
        && stored[i + 1] != b'/'
        && stored[i + 1] != b'\0'
        && path[i - 1] != b'/'
        && path[i - 1] != b'\0'
        && path[i] == b'\0';
    c0 || c1
}

/// `path` continues with a component where the stored path terminated
/// mid-name: one of `path`'s parents exists as a file.
fn invalid_because_not_dirs(stored: &[u8; PATH_MAX], path: &[u8; PATH_MAX], i: usize) -> bool {
    i > 0
        && i < PATH_MAX - 1
        && stored[i - 1] != b'/'
        && stored[i - 1] != b'\0'
        && stored[i] == b'\0'
        && path[i - 1] != b'/'
        && path[i - 1] != b'\0'
        && path[i] == b'/'
        && path[i + 1] != b'/'
        && path[i + 1] != b'\0'
}

/// Byte-wise prefix equality over at most `n` bytes, stopping at a
/// null terminator like `strncmp`.
fn prefix_eq(a: &[u8], b: &[u8], n: usize) -> bool {
    for i in 0..n {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        if x != y {
            return false;
        }
        if x == 0 {
            return true;
        }
    }
    true
}

impl PathInfo {
    fn init(path: &str) -> Result<Self> {
        let bytes = path.as_bytes();
        if bytes.is_empty() || bytes[0] != b'/' {
            return Err(FsError::InvalidArgument);
        }
        if bytes.len() >= PATH_MAX {
            return Err(FsError::NameTooLong);
        }

        let mut info = PathInfo {
            path: [0u8; PATH_MAX],
            len: bytes.len(),
            last_slash: 0,
            dirname: [0u8; PATH_MAX],
            basename: [0u8; PATH_MAX],
            parent: 0,
            witness: None,
            kind: PathKind::Undefined,
        };
        info.path[..bytes.len()].copy_from_slice(bytes);

        // A trailing slash does not count: "/a/b/" has its last slash
        // at the same place as "/a/b".
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'/' && i + 1 < bytes.len() {
                info.last_slash = i;
            }
        }

        // dirname: everything up to and including the last slash.
        info.dirname[..=info.last_slash].copy_from_slice(&bytes[..=info.last_slash]);

        // basename: the component after the last slash, "/" for root.
        if path == "/" {
            info.basename[0] = b'/';
        } else {
            let mut j = 0;
            for &b in &bytes[info.last_slash + 1..] {
                if b == b'/' {
                    break;
                }
                info.basename[j] = b;
                j += 1;
            }
        }

        Ok(info)
    }

    /// Classifies a single path against the record list.
    pub(crate) fn classify(
        device: &impl NvmDevice,
        window: &Window,
        path: &str,
    ) -> Result<Self> {
        let mut infos = [Self::init(path)?];
        classify_records(device, window, &mut infos)?;
        let [info] = infos;
        Ok(info)
    }

    /// Classifies two paths in a single pass over the record list.
    pub(crate) fn classify2(
        device: &impl NvmDevice,
        window: &Window,
        first: &str,
        second: &str,
    ) -> Result<(Self, Self)> {
        let mut infos = [Self::init(first)?, Self::init(second)?];
        classify_records(device, window, &mut infos)?;
        let [a, b] = infos;
        Ok((a, b))
    }

    pub fn path_str(&self) -> &str {
        core::str::from_utf8(&self.path[..self.len]).unwrap_or("")
    }

    pub fn dirname_str(&self) -> &str {
        core::str::from_utf8(&self.dirname[..=self.last_slash]).unwrap_or("")
    }

    pub fn basename_str(&self) -> &str {
        let end = self.basename.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.basename[..end]).unwrap_or("")
    }

    pub fn ends_with_slash(&self) -> bool {
        self.len > 0 && self.path[self.len - 1] == b'/'
    }

    pub fn dirname_is_root(&self) -> bool {
        self.last_slash == 0
    }

    /// Appends a trailing slash when the path lacks one, as the
    /// directory predicates require.
    pub(crate) fn push_slash(&mut self) -> Result<()> {
        if self.ends_with_slash() {
            return Ok(());
        }
        if self.len == PATH_MAX - 1 {
            return Err(FsError::NameTooLong);
        }
        self.path[self.len] = b'/';
        self.len += 1;
        Ok(())
    }
}

/// Walks the record list once, settling the kind, witness and parent
/// count of every path in `infos`.
fn classify_records(
    device: &impl NvmDevice,
    window: &Window,
    infos: &mut [PathInfo],
) -> Result<()> {
    let mut cursor = store::head(device, window).map_err(FsError::Io)?;

    if cursor.is_none() {
        // No witness exists: only a direct child of the root is
        // creatable in an empty file system.
        for info in infos.iter_mut() {
            if info.dirname_is_root() {
                info.kind = PathKind::Creatable;
            } else {
                info.kind = PathKind::InvalidNotFound;
            }
        }
        return Ok(());
    }

    while let Some(record) = cursor {
        let stored = file::read_path(device, record).map_err(FsError::Io)?;

        for info in infos.iter_mut() {
            if prefix_eq(&stored, &info.path, info.last_slash) {
                info.parent += 1;
            }
            if info.kind != PathKind::Undefined && info.kind != PathKind::Creatable {
                continue;
            }

            let i = first_differ(&stored, &info.path)?;
            if exists_as_file(&stored, &info.path, i) {
                info.kind = PathKind::ExistsAsFile;
                info.witness = Some(record);
            } else if exists_as_empty_dir(&stored, &info.path, i) {
                info.push_slash()?;
                info.kind = PathKind::ExistsAsEmptyDir;
                info.witness = Some(record);
            } else if exists_as_nonempty_dir(&stored, &info.path, i) {
                info.push_slash()?;
                info.kind = PathKind::ExistsAsNonemptyDir;
                info.witness = Some(record);
            } else if invalid_because_not_dirs(&stored, &info.path, i) {
                info.kind = PathKind::InvalidNotDirs;
                info.witness = Some(record);
            } else if prefix_eq(&stored, &info.path, info.last_slash + 1) {
                info.kind = PathKind::Creatable;
                info.witness = Some(record);
            }
        }

        cursor = store::next_of(device, record).map_err(FsError::Io)?;
    }

    for info in infos.iter_mut() {
        if info.kind == PathKind::Undefined {
            info.kind = PathKind::InvalidNotFound;
            info.witness = None;
        }
    }

    Ok(())
}
