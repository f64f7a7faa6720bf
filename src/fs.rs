//! The POSIX-flavored facade over the record store. Every entry point
//! validates the mount structure, resolves paths through the
//! classifier, and flushes the page buffer at each externally visible
//! commit point.

use std::io::SeekFrom;
use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::PageBuffer;
use crate::config::*;
use crate::desc::{DescTable, DirDesc, DirFd, Fd, FileDesc, VIRTUAL_RECORD};
use crate::error::{FsError, NvmError, Result};
use crate::exec::{self, ExecCtx, ExecEnv, UserSyscalls};
use crate::file::{self, RecordPtr, HEADER_SIZE};
use crate::flash;
use crate::nvm::NvmDevice;
use crate::path::{PathInfo, PathKind};
use crate::store::{self, Window};

bitflags! {
    /// The supported subset of open(2) flags. Read-only is the empty
    /// set, mirroring `O_RDONLY == 0`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITE_ONLY = 0x0001;
        const READ_WRITE = 0x0002;
        const CREATE     = 0x0040;
        const EXCLUSIVE  = 0x0080;
        const APPEND     = 0x0400;
    }
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags::empty();

    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::WRITE_ONLY) || self.contains(OpenFlags::READ_WRITE)
    }

    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::WRITE_ONLY.union(OpenFlags::READ_WRITE))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

/// Projection of record metadata into a POSIX-like stat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// The record's flash offset stands in for an inode number.
    pub ino: u64,
    pub kind: FileKind,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
}

/// Set-user-ID bits are ignored by exec on this file system.
pub const ST_NOSUID: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub flag: u64,
    pub namemax: u64,
}

/// Copies the base name component of a path, ignoring any trailing
/// slash; the root's base name is `/`.
fn basename_of(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// The component of `path` starting at `start`: up to a terminator
/// (exclusive) or a slash (inclusive, marking a directory entry).
fn component_of(path: &[u8; PATH_MAX], start: usize) -> Result<&[u8]> {
    for j in start..PATH_MAX {
        if path[j] == b'\0' {
            return Ok(&path[start..j]);
        }
        if path[j] == b'/' {
            return Ok(&path[start..=j]);
        }
    }
    Err(FsError::NameTooLong)
}

fn witness(info: &PathInfo) -> Result<RecordPtr> {
    info.witness.ok_or(FsError::Io(NvmError::BrokenLink))
}

/// A mounted execute-in-place file system over a contiguous window of
/// flash pages.
#[derive(Debug)]
pub struct Xipfs<D: NvmDevice> {
    device: Arc<D>,
    magic: u32,
    mount_path: String,
    window: Window,
    buffer: PageBuffer,
    descs: DescTable,
    /// Execution lock: nested exec is forbidden.
    exec_lock: bool,
}

impl<D: NvmDevice> Xipfs<D> {
    /// Builds a file system instance over `page_count` pages starting
    /// at `first_page`. The flash content is left untouched; call
    /// [`Xipfs::format`] or [`Xipfs::mount`] next.
    pub fn new(
        device: Arc<D>,
        mount_path: &str,
        first_page: usize,
        page_count: usize,
    ) -> Result<Self> {
        if mount_path.is_empty() || mount_path.len() >= PATH_MAX {
            return Err(FsError::InvalidArgument);
        }
        let fs = Xipfs {
            device,
            magic: MAGIC,
            mount_path: mount_path.into(),
            window: Window {
                first_page,
                page_count,
            },
            buffer: PageBuffer::new(),
            descs: DescTable::new(),
            exec_lock: false,
        };
        fs.check_mount()?;
        Ok(fs)
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Serialized form of the in-RAM mount structure, as streamed by
    /// the virtual info file.
    pub fn info_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + PATH_MAX);
        buf.extend_from_slice(&self.magic.to_ne_bytes());
        buf.extend_from_slice(&(self.window.first_page as u32).to_ne_bytes());
        buf.extend_from_slice(&(self.window.page_count as u32).to_ne_bytes());
        buf.extend_from_slice(&(PAGE_SIZE as u32).to_ne_bytes());
        let mut path = [0u8; PATH_MAX];
        path[..self.mount_path.len()].copy_from_slice(self.mount_path.as_bytes());
        buf.extend_from_slice(&path);
        buf
    }

    /// Validates the mount structure. Runs on every entry point: the
    /// magic guards against a caller handing over clobbered memory,
    /// the geometry against a device that shrank underneath us.
    fn check_mount(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(FsError::Fault);
        }
        if self.window.page_count == 0 {
            return Err(FsError::InvalidArgument);
        }
        if self.window.first_page + self.window.page_count > self.device.num_pages() {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    fn check_path_len(path: &str) -> Result<()> {
        if path.len() >= PATH_MAX {
            return Err(FsError::NameTooLong);
        }
        Ok(())
    }

    /// Checks whether the record's stored path equals `expected`.
    fn record_path_is(&self, record: RecordPtr, expected: &str) -> Result<bool> {
        let stored = file::read_path(&*self.device, record)?;
        Ok(stored[..expected.len()] == *expected.as_bytes()
            && stored[expected.len()] == b'\0')
    }

    /// Removes a record: flush the buffer, compact the store, drop the
    /// buffer association, and rewrite every open descriptor the shift
    /// invalidated.
    fn sync_remove(&mut self, victim: RecordPtr) -> Result<()> {
        self.buffer.flush(&*self.device)?;
        let reserved = file::read_reserved(&*self.device, victim)?;
        store::remove(&*self.device, victim)?;
        self.buffer.reset();
        self.descs.patch(&self.window, victim, reserved);
        Ok(())
    }

    /*
     * Operations on mounted file systems
     */

    /// Erases every page of the mount window and closes every
    /// descriptor of this mount.
    pub fn format(&mut self) -> Result<()> {
        self.check_mount()?;
        store::format(&*self.device, &self.window)?;
        self.buffer.reset();
        self.descs.untrack_all(&self.window);
        log::info!("formatted {} pages at page {}", self.window.page_count, self.window.first_page);
        Ok(())
    }

    /// Verifies the integrity of the on-flash state: the record chain
    /// must be walkable and every byte past the tail must be erased.
    /// A failure means the store needs a format.
    pub fn mount(&mut self) -> Result<()> {
        self.check_mount()?;

        let first_free = match store::tail_next(&*self.device, &self.window) {
            Ok(addr) => Some(addr),
            // An exactly-full store has no bytes past the tail.
            Err(NvmError::Full) => None,
            Err(err) => return Err(FsError::Io(err)),
        };
        if let Some(first_free) = first_free {
            let first = flash::page_of(first_free);
            let last = self.window.first_page + self.window.page_count;
            for page in first..last {
                if !flash::is_erased_page(&*self.device, page).map_err(FsError::Io)? {
                    log::warn!("dirty page {} past the tail", page);
                    return Err(FsError::Io(NvmError::BrokenLink));
                }
            }
        }

        log::info!("mounted {} at page {}", self.mount_path, self.window.first_page);
        Ok(())
    }

    /// Closes every descriptor of this mount.
    pub fn umount(&mut self) -> Result<()> {
        self.check_mount()?;
        self.descs.untrack_all(&self.window);
        Ok(())
    }

    pub fn statvfs(&mut self) -> Result<StatVfs> {
        self.check_mount()?;
        let free = store::free_pages(&*self.device, &self.window)?;
        Ok(StatVfs {
            bsize: PAGE_SIZE as u64,
            frsize: PAGE_SIZE as u64,
            blocks: self.window.page_count as u64,
            bfree: free as u64,
            bavail: free as u64,
            flag: ST_NOSUID,
            namemax: PATH_MAX as u64,
        })
    }

    /*
     * Operations on open files
     */

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        Self::check_path_len(path)?;

        if basename_of(path) == INFOS_FILE_NAME {
            if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                return Err(FsError::Exists);
            }
            if flags.writable() || flags.contains(OpenFlags::APPEND) {
                return Err(FsError::AccessDenied);
            }
            return self.descs.track_file(FileDesc {
                record: VIRTUAL_RECORD,
                pos: 0,
                flags,
            });
        }

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        let record = match info.kind {
            PathKind::ExistsAsFile => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(FsError::Exists);
                }
                witness(&info)?
            }
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(FsError::IsDirectory)
            }
            PathKind::InvalidNotDirs => return Err(FsError::NotDirectory),
            PathKind::InvalidNotFound | PathKind::Undefined => return Err(FsError::NotFound),
            PathKind::Creatable => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(FsError::NotFound);
                }
                if info.ends_with_slash() {
                    return Err(FsError::IsDirectory);
                }
                // An empty-directory placeholder occupying the parent
                // slot gives way to its first real child.
                if let Some(candidate) = info.witness {
                    if !info.dirname_is_root()
                        && self.record_path_is(candidate, info.dirname_str())?
                    {
                        self.sync_remove(candidate)?;
                    }
                }
                store::new_file(&*self.device, &mut self.buffer, &self.window, path, 0, false)?
            }
        };

        let pos = if flags.contains(OpenFlags::APPEND) {
            file::get_size(&*self.device, record)?
        } else {
            0
        };
        self.descs.track_file(FileDesc { record, pos, flags })
    }

    pub fn read(&mut self, fd: Fd, dest: &mut [u8]) -> Result<usize> {
        self.check_mount()?;
        let desc = self.descs.file(fd)?.clone();
        if !desc.flags.readable() {
            return Err(FsError::AccessDenied);
        }

        if desc.record == VIRTUAL_RECORD {
            let info = self.info_bytes();
            let mut pos = desc.pos as usize;
            let mut n = 0;
            while n < dest.len() && pos < info.len() {
                dest[n] = info[pos];
                n += 1;
                pos += 1;
            }
            self.descs.file_mut(fd)?.pos = pos as u64;
            return Ok(n);
        }

        let size = file::get_size(&*self.device, desc.record)?;
        let mut pos = desc.pos;
        let mut n = 0;
        while n < dest.len() && pos < size {
            dest[n] = file::read_byte(&*self.device, &mut self.buffer, desc.record, pos)?;
            n += 1;
            pos += 1;
        }
        self.descs.file_mut(fd)?.pos = pos;
        Ok(n)
    }

    /// Writes at the descriptor position, stopping short at the
    /// record's payload capacity rather than failing.
    pub fn write(&mut self, fd: Fd, src: &[u8]) -> Result<usize> {
        self.check_mount()?;
        let desc = self.descs.file(fd)?.clone();
        if !desc.flags.writable() {
            return Err(FsError::AccessDenied);
        }
        if desc.record == VIRTUAL_RECORD {
            return Err(FsError::BadDescriptor);
        }

        let max_pos = file::max_pos(&*self.device, desc.record)?;
        let mut pos = desc.pos;
        let mut n = 0;
        while n < src.len() && pos < max_pos {
            file::write_byte(&*self.device, &mut self.buffer, desc.record, pos, src[n])?;
            n += 1;
            pos += 1;
        }
        self.descs.file_mut(fd)?.pos = pos;
        Ok(n)
    }

    pub fn lseek(&mut self, fd: Fd, seek: SeekFrom) -> Result<u64> {
        self.check_mount()?;
        let desc = self.descs.file(fd)?.clone();

        let (max_pos, size) = if desc.record == VIRTUAL_RECORD {
            let len = self.info_bytes().len() as u64;
            (len, len)
        } else {
            (
                file::max_pos(&*self.device, desc.record)?,
                file::get_size(&*self.device, desc.record)?,
            )
        };

        let new_pos = match seek {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => desc.pos as i128 + delta as i128,
            SeekFrom::End(delta) => desc.pos.max(size) as i128 + delta as i128,
        };
        if new_pos < 0 || new_pos > max_pos as i128 {
            return Err(FsError::InvalidArgument);
        }
        let new_pos = new_pos as u64;

        if desc.pos > size && new_pos < desc.pos {
            // Seeking back over an extended region commits the old
            // position as the file size.
            file::set_size(&*self.device, &mut self.buffer, desc.record, desc.pos)?;
        }
        self.descs.file_mut(fd)?.pos = new_pos;
        Ok(new_pos)
    }

    /// Commits the descriptor position as the file size without
    /// closing the descriptor.
    pub fn fsync(&mut self, fd: Fd) -> Result<()> {
        self.check_mount()?;
        let desc = self.descs.file(fd)?.clone();
        if !desc.flags.writable() {
            return Err(FsError::AccessDenied);
        }
        if desc.record == VIRTUAL_RECORD {
            return Err(FsError::BadDescriptor);
        }
        file::set_size(&*self.device, &mut self.buffer, desc.record, desc.pos)?;
        Ok(())
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.check_mount()?;
        let desc = self.descs.file(fd)?.clone();
        if desc.record != VIRTUAL_RECORD {
            let size = file::get_size(&*self.device, desc.record)?;
            if size < desc.pos {
                file::set_size(&*self.device, &mut self.buffer, desc.record, desc.pos)?;
            }
        }
        self.descs.untrack_file(fd)
    }

    pub fn fstat(&mut self, fd: Fd) -> Result<Stat> {
        self.check_mount()?;
        let desc = self.descs.file(fd)?.clone();
        if desc.record == VIRTUAL_RECORD {
            return Err(FsError::BadDescriptor);
        }

        let size = file::get_size(&*self.device, desc.record)?;
        let reserved = file::read_reserved(&*self.device, desc.record)?;
        Ok(Stat {
            ino: desc.record as u64,
            kind: FileKind::Regular,
            nlink: 1,
            size: size.max(desc.pos),
            blksize: PAGE_SIZE as u32,
            blocks: (reserved / PAGE_SIZE) as u64,
        })
    }

    pub fn stat(&mut self, path: &str) -> Result<Stat> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        Self::check_path_len(path)?;

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::ExistsAsFile
            | PathKind::ExistsAsEmptyDir
            | PathKind::ExistsAsNonemptyDir => {}
            PathKind::InvalidNotDirs => return Err(FsError::NotDirectory),
            _ => return Err(FsError::NotFound),
        }
        let record = witness(&info)?;

        let kind = match info.kind {
            PathKind::ExistsAsFile => FileKind::Regular,
            _ => FileKind::Directory,
        };
        let size = match kind {
            FileKind::Regular => file::get_size(&*self.device, record)?,
            FileKind::Directory => 0,
        };
        let reserved = file::read_reserved(&*self.device, record)?;
        Ok(Stat {
            ino: record as u64,
            kind,
            nlink: 1,
            size,
            blksize: PAGE_SIZE as u32,
            blocks: (reserved / PAGE_SIZE) as u64,
        })
    }

    /*
     * Operations on open directories
     */

    pub fn opendir(&mut self, path: &str) -> Result<DirFd> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        Self::check_path_len(path)?;

        let mut dirname = [0u8; PATH_MAX];
        if path == "/" {
            // The root is always present, even on an empty store.
            let cursor = store::head(&*self.device, &self.window)?;
            dirname[0] = b'/';
            return self.descs.track_dir(DirDesc { cursor, dirname });
        }

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {}
            PathKind::ExistsAsFile | PathKind::InvalidNotDirs => {
                return Err(FsError::NotDirectory)
            }
            _ => return Err(FsError::NotFound),
        }

        // The classifier appended the trailing slash the prefix
        // comparisons in readdir rely on.
        let resolved = info.path_str().as_bytes();
        dirname[..resolved.len()].copy_from_slice(resolved);
        let cursor = store::head(&*self.device, &self.window)?;
        self.descs.track_dir(DirDesc { cursor, dirname })
    }

    /// Checks whether a record before `record` in the chain maps to
    /// the same directory entry, which happens when several files
    /// share a child directory.
    fn already_listed(&self, record: RecordPtr, prefix_len: usize) -> Result<bool> {
        let target = file::read_path(&*self.device, record)?;
        let component = component_of(&target, prefix_len)?;

        let mut cursor = store::head(&*self.device, &self.window)?;
        while let Some(current) = cursor {
            if current == record {
                break;
            }
            let path = file::read_path(&*self.device, current)?;
            if path[..prefix_len] == target[..prefix_len]
                && component_of(&path, prefix_len)? == component
            {
                return Ok(true);
            }
            cursor = store::next_of(&*self.device, current)?;
        }
        Ok(false)
    }

    /// Yields the next directory entry, or `None` at the end. Child
    /// directories carry a trailing slash.
    pub fn readdir(&mut self, fd: DirFd) -> Result<Option<String>> {
        self.check_mount()?;
        let desc = self.descs.dir_mut(fd)?.clone();

        let mut cursor = desc.cursor;
        while let Some(record) = cursor {
            let stored = file::read_path(&*self.device, record)?;

            let mut i = 0;
            while i < PATH_MAX {
                if stored[i] != desc.dirname[i] || desc.dirname[i] == b'\0' || stored[i] == b'\0'
                {
                    break;
                }
                i += 1;
            }
            if i == PATH_MAX {
                return Err(FsError::NameTooLong);
            }

            if desc.dirname[i] == b'\0' && stored[i] != b'\0' {
                let start = if stored[i] == b'/' { i + 1 } else { i };
                if !self.already_listed(record, start)? {
                    let name = String::from_utf8(component_of(&stored, start)?.to_vec())
                        .map_err(|_| FsError::Io(NvmError::BadPathChar))?;
                    let next = store::next_of(&*self.device, record)?;
                    self.descs.dir_mut(fd)?.cursor = next;
                    return Ok(Some(name));
                }
            }

            cursor = store::next_of(&*self.device, record)?;
            self.descs.dir_mut(fd)?.cursor = cursor;
        }

        Ok(None)
    }

    pub fn closedir(&mut self, fd: DirFd) -> Result<()> {
        self.check_mount()?;
        self.descs.untrack_dir(fd)
    }

    /*
     * Operations on the namespace
     */

    /// Re-materializes a directory as a placeholder record when its
    /// last child went away.
    fn rematerialize_parent(&mut self, info: &PathInfo, removed: usize) -> Result<()> {
        if info.parent == removed && !info.dirname_is_root() {
            store::new_file(
                &*self.device,
                &mut self.buffer,
                &self.window,
                info.dirname_str(),
                0,
                false,
            )?;
        }
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        if path == "/" {
            return Err(FsError::IsDirectory);
        }
        Self::check_path_len(path)?;

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::ExistsAsFile => {}
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(FsError::IsDirectory)
            }
            PathKind::InvalidNotDirs => return Err(FsError::NotDirectory),
            _ => return Err(FsError::NotFound),
        }

        self.sync_remove(witness(&info)?)?;
        self.rematerialize_parent(&info, 1)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        if path == "/" {
            return Err(FsError::Exists);
        }
        Self::check_path_len(path)?;

        let mut info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::Creatable => {}
            PathKind::ExistsAsFile
            | PathKind::ExistsAsEmptyDir
            | PathKind::ExistsAsNonemptyDir => return Err(FsError::Exists),
            PathKind::InvalidNotDirs => return Err(FsError::NotDirectory),
            _ => return Err(FsError::NotFound),
        }
        info.push_slash()?;

        // The parent's own placeholder gives way to its first child.
        if let Some(candidate) = info.witness {
            if self.record_path_is(candidate, info.dirname_str())? {
                self.sync_remove(candidate)?;
            }
        }
        store::new_file(
            &*self.device,
            &mut self.buffer,
            &self.window,
            info.path_str(),
            0,
            false,
        )?;
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        if path == "/" {
            return Err(FsError::Busy);
        }
        Self::check_path_len(path)?;
        if path.ends_with('.') {
            return Err(FsError::InvalidArgument);
        }

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::ExistsAsEmptyDir => {}
            PathKind::ExistsAsFile | PathKind::InvalidNotDirs => {
                return Err(FsError::NotDirectory)
            }
            PathKind::ExistsAsNonemptyDir => return Err(FsError::NotEmpty),
            _ => return Err(FsError::NotFound),
        }

        self.sync_remove(witness(&info)?)?;
        self.rematerialize_parent(&info, 1)
    }

    /// Removes the placeholder of the directory the target moved
    /// into, when that directory was empty before the rename.
    fn evict_target_placeholder(&mut self, to: &PathInfo) -> Result<()> {
        if let Some(candidate) = to.witness {
            if self.record_path_is(candidate, to.dirname_str())? {
                self.sync_remove(candidate)?;
            }
        }
        Ok(())
    }

    /// Re-materializes the source's parent directory after a rename
    /// moved its last entry somewhere else.
    fn rematerialize_source_parent(
        &mut self,
        from: &PathInfo,
        to: &PathInfo,
        renamed: usize,
    ) -> Result<()> {
        if from.dirname_str() != to.dirname_str() {
            self.rematerialize_parent(from, renamed)?;
        }
        Ok(())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.check_mount()?;
        if from.is_empty() || to.is_empty() {
            return Err(FsError::NotFound);
        }
        Self::check_path_len(from)?;
        Self::check_path_len(to)?;

        let (from_info, mut to_info) =
            PathInfo::classify2(&*self.device, &self.window, from, to)?;

        match from_info.kind {
            PathKind::ExistsAsFile => match to_info.kind {
                PathKind::ExistsAsFile => {
                    if from_info.witness == to_info.witness {
                        return Ok(());
                    }
                    // Evict the target record first, then re-resolve:
                    // the compaction may have moved the source.
                    self.sync_remove(witness(&to_info)?)?;
                    let from_info = PathInfo::classify(&*self.device, &self.window, from)?;
                    file::rename(
                        &*self.device,
                        &mut self.buffer,
                        witness(&from_info)?,
                        to_info.path_str(),
                    )?;
                    self.rematerialize_source_parent(&from_info, &to_info, 1)
                }
                PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                    Err(FsError::IsDirectory)
                }
                PathKind::InvalidNotDirs => Err(FsError::NotDirectory),
                PathKind::InvalidNotFound | PathKind::Undefined => Err(FsError::NotFound),
                PathKind::Creatable => {
                    if to_info.ends_with_slash() {
                        return Err(FsError::NotDirectory);
                    }
                    file::rename(
                        &*self.device,
                        &mut self.buffer,
                        witness(&from_info)?,
                        to_info.path_str(),
                    )?;
                    self.rematerialize_source_parent(&from_info, &to_info, 1)?;
                    self.evict_target_placeholder(&to_info)
                }
            },
            PathKind::ExistsAsEmptyDir => match to_info.kind {
                PathKind::ExistsAsFile => Err(FsError::NotDirectory),
                PathKind::ExistsAsEmptyDir => {
                    if from_info.witness == to_info.witness {
                        return Ok(());
                    }
                    self.sync_remove(witness(&to_info)?)?;
                    let from_info = PathInfo::classify(&*self.device, &self.window, from)?;
                    file::rename(
                        &*self.device,
                        &mut self.buffer,
                        witness(&from_info)?,
                        to_info.path_str(),
                    )?;
                    self.rematerialize_source_parent(&from_info, &to_info, 1)
                }
                PathKind::ExistsAsNonemptyDir => Err(FsError::NotEmpty),
                PathKind::InvalidNotDirs => Err(FsError::NotDirectory),
                PathKind::InvalidNotFound | PathKind::Undefined => Err(FsError::NotFound),
                PathKind::Creatable => {
                    to_info.push_slash()?;
                    if to_info.path_str().starts_with(from_info.path_str()) {
                        // A directory cannot become its own subdirectory.
                        return Err(FsError::InvalidArgument);
                    }
                    file::rename(
                        &*self.device,
                        &mut self.buffer,
                        witness(&from_info)?,
                        to_info.path_str(),
                    )?;
                    self.rematerialize_source_parent(&from_info, &to_info, 1)?;
                    self.evict_target_placeholder(&to_info)
                }
            },
            PathKind::ExistsAsNonemptyDir => match to_info.kind {
                PathKind::ExistsAsFile => Err(FsError::NotDirectory),
                PathKind::ExistsAsEmptyDir => {
                    if to_info.path_str().starts_with(from_info.path_str()) {
                        return Err(FsError::InvalidArgument);
                    }
                    self.sync_remove(witness(&to_info)?)?;
                    let from_info = PathInfo::classify(&*self.device, &self.window, from)?;
                    let renamed = store::rename_all(
                        &*self.device,
                        &mut self.buffer,
                        &self.window,
                        from_info.path_str(),
                        to_info.path_str(),
                    )?;
                    self.rematerialize_source_parent(&from_info, &to_info, renamed)
                }
                PathKind::ExistsAsNonemptyDir => Err(FsError::NotEmpty),
                PathKind::InvalidNotDirs => Err(FsError::NotDirectory),
                PathKind::InvalidNotFound | PathKind::Undefined => Err(FsError::NotFound),
                PathKind::Creatable => {
                    to_info.push_slash()?;
                    if to_info.path_str().starts_with(from_info.path_str()) {
                        return Err(FsError::InvalidArgument);
                    }
                    let renamed = store::rename_all(
                        &*self.device,
                        &mut self.buffer,
                        &self.window,
                        from_info.path_str(),
                        to_info.path_str(),
                    )?;
                    self.rematerialize_source_parent(&from_info, &to_info, renamed)?;
                    self.evict_target_placeholder(&to_info)
                }
            },
            PathKind::InvalidNotDirs => Err(FsError::NotDirectory),
            _ => Err(FsError::NotFound),
        }
    }

    /*
     * xipfs-specific operations
     */

    /// Creates a file with `size` bytes of reserved payload capacity,
    /// optionally executable. Unlike open-with-create, the payload
    /// span is sized up front so a binary can be copied in place.
    pub fn new_file(&mut self, path: &str, size: u32, exec: bool) -> Result<()> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        if path == "/" {
            return Err(FsError::IsDirectory);
        }
        Self::check_path_len(path)?;

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::Creatable => {}
            PathKind::ExistsAsFile => return Err(FsError::Exists),
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(FsError::IsDirectory)
            }
            PathKind::InvalidNotDirs => return Err(FsError::NotDirectory),
            _ => return Err(FsError::NotFound),
        }
        if info.ends_with_slash() {
            return Err(FsError::IsDirectory);
        }

        if let Some(candidate) = info.witness {
            if !info.dirname_is_root() && self.record_path_is(candidate, info.dirname_str())? {
                self.sync_remove(candidate)?;
            }
        }
        store::new_file(&*self.device, &mut self.buffer, &self.window, path, size, exec)?;
        Ok(())
    }

    /// Launches the position-independent binary stored at `path`
    /// under the execution lock and returns its exit status.
    pub fn exec(
        &mut self,
        path: &str,
        argv: &[&str],
        env: &mut dyn ExecEnv,
        syscalls: &UserSyscalls,
    ) -> Result<i32> {
        self.check_mount()?;
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        if path == "/" {
            return Err(FsError::IsDirectory);
        }
        Self::check_path_len(path)?;

        let info = PathInfo::classify(&*self.device, &self.window, path)?;
        match info.kind {
            PathKind::ExistsAsFile => {}
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(FsError::IsDirectory)
            }
            PathKind::InvalidNotDirs => return Err(FsError::NotDirectory),
            _ => return Err(FsError::NotFound),
        }
        let record = witness(&info)?;

        match file::read_exec(&*self.device, record)? {
            1 => {}
            0 => return Err(FsError::AccessDenied),
            _ => return Err(FsError::InvalidArgument),
        }

        if self.exec_lock {
            return Err(FsError::Busy);
        }

        let size = file::get_size(&*self.device, record)?;
        let reserved = file::read_reserved(&*self.device, record)?;
        let mut ctx = ExecCtx::new(record + HEADER_SIZE, size, record + reserved, argv, syscalls);

        self.exec_lock = true;
        let status = exec::run(env, &mut ctx);
        ctx.cleanup();
        self.exec_lock = false;

        status.map_err(FsError::Io)
    }
}
