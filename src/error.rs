use thiserror::Error;

/// Low-level storage errors raised by the flash, buffer, record and
/// store layers. They indicate hardware failure, pre-existing
/// corruption, or exhausted capacity.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmError {
    #[error("path is empty")]
    EmptyPath,
    #[error("invalid character in path")]
    BadPathChar,
    #[error("path is not null-terminated")]
    UnterminatedPath,
    #[error("record is not page-aligned")]
    Unaligned,
    #[error("record lies outside the flash address space")]
    OutOfNvm,
    #[error("record improperly linked to its successor")]
    BrokenLink,
    #[error("offset exceeds the maximum position")]
    MaxOffset,
    #[error("flash controller failed to verify")]
    VerifyFailed,
    #[error("bad magic number")]
    BadMagic,
    #[error("bad page number")]
    BadPageNumber,
    #[error("file system full")]
    Full,
    #[error("file already exists")]
    Exists,
    #[error("wrong permission bits")]
    BadPerm,
    #[error("insufficient space")]
    NoSpace,
    #[error("failed to set the text protection region")]
    TextRegion,
    #[error("failed to set the data protection region")]
    DataRegion,
    #[error("failed to set the stack protection region")]
    StackRegion,
    #[error("failed to enable memory protection")]
    EnableProtection,
    #[error("failed to disable memory protection")]
    DisableProtection,
}

pub type NvmResult<T> = core::result::Result<T, NvmError>;

/// Errors surfaced by the file system facade, mirroring the POSIX
/// errno a VFS shim would report.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("permission denied")]
    AccessDenied,
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("resource busy")]
    Busy,
    #[error("quota exceeded")]
    Quota,
    #[error("file exists")]
    Exists,
    #[error("bad mount structure")]
    Fault,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("storage failure: {0}")]
    Io(NvmError),
    #[error("is a directory")]
    IsDirectory,
    #[error("name too long")]
    NameTooLong,
    #[error("too many open descriptors")]
    TooManyOpen,
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("directory not empty")]
    NotEmpty,
}

pub type Result<T> = core::result::Result<T, FsError>;

impl From<NvmError> for FsError {
    fn from(err: NvmError) -> Self {
        match err {
            // Path validation failures never touch flash.
            NvmError::EmptyPath | NvmError::BadPathChar | NvmError::UnterminatedPath => {
                FsError::InvalidArgument
            }
            // Capacity exhaustion is reported as a quota error.
            NvmError::Full | NvmError::NoSpace => FsError::Quota,
            _ => FsError::Io(err),
        }
    }
}

impl FsError {
    /// Projects the error onto the system errno value a VFS boundary
    /// would return (negated by convention at the caller site).
    pub fn errno(&self) -> i32 {
        match self {
            FsError::AccessDenied => libc::EACCES,
            FsError::BadDescriptor => libc::EBADF,
            FsError::Busy => libc::EBUSY,
            FsError::Quota => libc::EDQUOT,
            FsError::Exists => libc::EEXIST,
            FsError::Fault => libc::EFAULT,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::TooManyOpen => libc::ENFILE,
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
        }
    }
}
