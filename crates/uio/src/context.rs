//! Process-wide setup: the registry of filesystem types.

use std::sync::Arc;
use tracing::warn;

use crate::backends::{StdioFs, ZipFs};
use crate::fstypes::{FileSystemHandler, FileSystemId, FileSystemRegistry};
use crate::repository::Repository;

/// Entry point to the library.
///
/// Holds the filesystem registry shared by every repository opened from
/// it. Cloning shares the registry.
#[derive(Debug, Clone)]
pub struct Uio {
    registry: Arc<FileSystemRegistry>,
}

impl Uio {
    /// A context with the built-in `stdio` and `zip` filesystems.
    pub fn init() -> Self {
        let registry = Arc::new(FileSystemRegistry::new());
        let defaults: [(FileSystemId, &str, Arc<dyn FileSystemHandler>); 2] = [
            (FileSystemId::STDIO, "stdio", Arc::new(StdioFs::new())),
            (FileSystemId::ZIP, "zip", Arc::new(ZipFs::new())),
        ];
        for (id, name, handler) in defaults {
            if let Err(e) = registry.register(Some(id), name, handler) {
                warn!(fs = name, error = %e, "could not register default filesystem");
            }
        }
        Self { registry }
    }

    /// Unregister every filesystem. Fails with `Busy` while a repository
    /// still has one of them mounted; the remaining ones stay registered.
    pub fn uninit(self) -> crate::error::VfsResult<()> {
        for (id, _) in self.registry.list() {
            self.registry.unregister(id)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<FileSystemRegistry> {
        &self.registry
    }

    /// A new empty repository.
    pub fn open_repository(&self) -> Repository {
        Repository::open(Arc::clone(&self.registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VfsErrorKind;
    use crate::repository::MountRequest;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_registered() {
        let uio = Uio::init();
        let list = uio.registry().list();
        assert_eq!(
            list,
            vec![
                (FileSystemId::STDIO, "stdio".to_string()),
                (FileSystemId::ZIP, "zip".to_string()),
            ]
        );
        assert_eq!(uio.registry().lookup("ZIP"), Some(FileSystemId::ZIP));
    }

    #[test]
    fn test_uninit_busy_while_mounted() {
        let tmp = TempDir::new().unwrap();
        let uio = Uio::init();
        let repo = uio.open_repository();
        repo.mount_dir(
            "/",
            MountRequest::new(FileSystemId::STDIO).in_path(tmp.path().to_str().unwrap()),
        )
        .unwrap();

        let err = uio.clone().uninit().unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::Busy);

        repo.close();
        uio.uninit().unwrap();
    }
}
