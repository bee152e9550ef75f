//! VFS error types.
//!
//! Every failure in the repository, the mount tree and the physical
//! backends is reported as a [`VfsError`]. [`VfsError::kind`] collapses
//! host I/O errors onto the same POSIX-style taxonomy so callers can
//! match on one enum.

use std::io;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found (ENOENT).
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists (EEXIST).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A path component is not a directory (ENOTDIR).
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file (EISDIR).
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Write attempted against a read-only mount (EROFS).
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    /// Permission denied (EACCES/EPERM).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The backend lacks the requested operation (ENOSYS).
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Malformed argument, mount flags or path (EINVAL).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Rename across physical roots (EXDEV).
    #[error("cross-device link: {0}")]
    CrossDevice(String),

    /// Unknown filesystem type (ENODEV).
    #[error("no such filesystem type: {0}")]
    NoDevice(String),

    /// Resource still in use (EBUSY).
    #[error("resource busy: {0}")]
    Busy(String),

    /// Directory not empty (ENOTEMPTY).
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Backend-internal corruption or a lower-layer gap (EIO).
    #[error("I/O failure: {0}")]
    Corrupt(String),

    /// Host I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error classification shared by [`VfsError`] and host errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum VfsErrorKind {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    ReadOnly,
    PermissionDenied,
    NotSupported,
    InvalidArgument,
    CrossDevice,
    NoDevice,
    Busy,
    DirectoryNotEmpty,
    Io,
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a ReadOnly error.
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotSupported error.
    pub fn not_supported(op: impl Into<String>) -> Self {
        Self::NotSupported(op.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a CrossDevice error.
    pub fn cross_device(path: impl Into<String>) -> Self {
        Self::CrossDevice(path.into())
    }

    /// Create a NoDevice error.
    pub fn no_device(fs: impl Into<String>) -> Self {
        Self::NoDevice(fs.into())
    }

    /// Create a Busy error.
    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy(what.into())
    }

    /// Create a Corrupt error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> VfsErrorKind {
        match self {
            VfsError::NotFound(_) => VfsErrorKind::NotFound,
            VfsError::AlreadyExists(_) => VfsErrorKind::AlreadyExists,
            VfsError::NotADirectory(_) => VfsErrorKind::NotADirectory,
            VfsError::IsADirectory(_) => VfsErrorKind::IsADirectory,
            VfsError::ReadOnly(_) => VfsErrorKind::ReadOnly,
            VfsError::PermissionDenied(_) => VfsErrorKind::PermissionDenied,
            VfsError::NotSupported(_) => VfsErrorKind::NotSupported,
            VfsError::InvalidArgument(_) => VfsErrorKind::InvalidArgument,
            VfsError::CrossDevice(_) => VfsErrorKind::CrossDevice,
            VfsError::NoDevice(_) => VfsErrorKind::NoDevice,
            VfsError::Busy(_) => VfsErrorKind::Busy,
            VfsError::DirectoryNotEmpty(_) => VfsErrorKind::DirectoryNotEmpty,
            VfsError::Corrupt(_) => VfsErrorKind::Io,
            VfsError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => VfsErrorKind::NotFound,
                io::ErrorKind::AlreadyExists => VfsErrorKind::AlreadyExists,
                io::ErrorKind::NotADirectory => VfsErrorKind::NotADirectory,
                io::ErrorKind::IsADirectory => VfsErrorKind::IsADirectory,
                io::ErrorKind::ReadOnlyFilesystem => VfsErrorKind::ReadOnly,
                io::ErrorKind::PermissionDenied => VfsErrorKind::PermissionDenied,
                io::ErrorKind::Unsupported => VfsErrorKind::NotSupported,
                io::ErrorKind::InvalidInput => VfsErrorKind::InvalidArgument,
                io::ErrorKind::CrossesDevices => VfsErrorKind::CrossDevice,
                io::ErrorKind::ResourceBusy => VfsErrorKind::Busy,
                io::ErrorKind::DirectoryNotEmpty => VfsErrorKind::DirectoryNotEmpty,
                _ => VfsErrorKind::Io,
            },
        }
    }

    /// Returns true if this error means "no such entry".
    pub fn is_not_found(&self) -> bool {
        self.kind() == VfsErrorKind::NotFound
    }
}

impl From<zip::result::ZipError> for VfsError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(e) => VfsError::Io(e),
            zip::result::ZipError::FileNotFound => VfsError::not_found("zip entry"),
            other => VfsError::corrupt(other.to_string()),
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::ReadOnly(msg) => io::Error::new(io::ErrorKind::ReadOnlyFilesystem, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotSupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            VfsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::CrossDevice(msg) => io::Error::new(io::ErrorKind::CrossesDevices, msg),
            VfsError::NoDevice(msg) => io::Error::other(format!("no such filesystem: {msg}")),
            VfsError::Busy(msg) => io::Error::new(io::ErrorKind::ResourceBusy, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::Corrupt(msg) => io::Error::other(msg),
            VfsError::Io(e) => e,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
