//! Filesystem backends.
//!
//! Backends implement [`FileSystemHandler`](crate::fstypes::FileSystemHandler)
//! for different storage types.

pub mod stdio;
pub mod zip;

pub use self::stdio::StdioFs;
pub use self::zip::ZipFs;
