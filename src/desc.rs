//! The process-wide table of open descriptors. The table owns the
//! descriptor state and hands out opaque handles; after a compaction
//! it rewrites every record pointer that moved.

use crate::config::*;
use crate::error::{FsError, Result};
use crate::file::RecordPtr;
use crate::fs::OpenFlags;
use crate::store::Window;

/// Sentinel record address of the virtual info file, excluded from
/// every range-based rewrite.
pub(crate) const VIRTUAL_RECORD: RecordPtr = usize::MAX;

/// An open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(pub(crate) usize);

/// An open directory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirFd(pub(crate) usize);

#[derive(Debug, Clone)]
pub(crate) struct FileDesc {
    pub record: RecordPtr,
    pub pos: u64,
    pub flags: OpenFlags,
}

#[derive(Debug, Clone)]
pub(crate) struct DirDesc {
    /// The record the next readdir resumes from; `None` once the
    /// chain is exhausted.
    pub cursor: Option<RecordPtr>,
    /// Directory prefix with a trailing slash.
    pub dirname: [u8; PATH_MAX],
}

#[derive(Debug, Clone, Default)]
pub(crate) enum DescSlot {
    #[default]
    Free,
    File(FileDesc),
    Dir(DirDesc),
}

#[derive(Debug)]
pub(crate) struct DescTable {
    slots: [DescSlot; MAX_OPEN_DESC],
}

impl DescTable {
    pub(crate) fn new() -> Self {
        DescTable {
            slots: Default::default(),
        }
    }

    fn alloc(&mut self, desc: DescSlot) -> Result<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, DescSlot::Free) {
                *slot = desc;
                return Ok(i);
            }
        }
        Err(FsError::TooManyOpen)
    }

    pub(crate) fn track_file(&mut self, desc: FileDesc) -> Result<Fd> {
        self.alloc(DescSlot::File(desc)).map(Fd)
    }

    pub(crate) fn track_dir(&mut self, desc: DirDesc) -> Result<DirFd> {
        self.alloc(DescSlot::Dir(desc)).map(DirFd)
    }

    pub(crate) fn file(&self, fd: Fd) -> Result<&FileDesc> {
        match self.slots.get(fd.0) {
            Some(DescSlot::File(desc)) => Ok(desc),
            _ => Err(FsError::BadDescriptor),
        }
    }

    pub(crate) fn file_mut(&mut self, fd: Fd) -> Result<&mut FileDesc> {
        match self.slots.get_mut(fd.0) {
            Some(DescSlot::File(desc)) => Ok(desc),
            _ => Err(FsError::BadDescriptor),
        }
    }

    pub(crate) fn dir_mut(&mut self, fd: DirFd) -> Result<&mut DirDesc> {
        match self.slots.get_mut(fd.0) {
            Some(DescSlot::Dir(desc)) => Ok(desc),
            _ => Err(FsError::BadDescriptor),
        }
    }

    pub(crate) fn untrack_file(&mut self, fd: Fd) -> Result<()> {
        self.file(fd)?;
        self.slots[fd.0] = DescSlot::Free;
        Ok(())
    }

    pub(crate) fn untrack_dir(&mut self, fd: DirFd) -> Result<()> {
        match self.slots.get(fd.0) {
            Some(DescSlot::Dir(_)) => {
                self.slots[fd.0] = DescSlot::Free;
                Ok(())
            }
            _ => Err(FsError::BadDescriptor),
        }
    }

    /// Frees every descriptor whose record lies inside the mount
    /// window. The virtual-file descriptor stays open.
    pub(crate) fn untrack_all(&mut self, window: &Window) {
        for slot in self.slots.iter_mut() {
            let record = match slot {
                DescSlot::File(desc) => desc.record,
                DescSlot::Dir(desc) => match desc.cursor {
                    Some(record) => record,
                    None => continue,
                },
                DescSlot::Free => continue,
            };
            if record != VIRTUAL_RECORD && window.contains(record) {
                *slot = DescSlot::Free;
            }
        }
    }

    /// Rewrites record pointers after the removal of `removed`:
    /// descriptors on the removed record are closed, descriptors on a
    /// shifted record move down by the removed span.
    pub(crate) fn patch(&mut self, window: &Window, removed: RecordPtr, reserved: usize) {
        for slot in self.slots.iter_mut() {
            let record = match slot {
                DescSlot::File(desc) => desc.record,
                DescSlot::Dir(desc) => match desc.cursor {
                    Some(record) => record,
                    None => continue,
                },
                DescSlot::Free => continue,
            };
            if record == VIRTUAL_RECORD || !window.contains(record) {
                continue;
            }
            if record == removed {
                *slot = DescSlot::Free;
            } else if record > removed {
                match slot {
                    DescSlot::File(desc) => desc.record = record - reserved,
                    DescSlot::Dir(desc) => desc.cursor = Some(record - reserved),
                    DescSlot::Free => {}
                }
            }
        }
    }
}
