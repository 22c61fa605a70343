/*!
Mirror-directory remote store (NFS share, removable disk, second volume).
*/

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{RemoteResult, RemoteStore};

/// Remote store that copies artifacts into a directory tree
///
/// Objects are written to `<key>.partial` and renamed into place, so a
/// reader of the mirror never sees a half-copied artifact.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    name: String,
}

impl DirectoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            name: "directory".to_string(),
        }
    }

    /// Register under a custom provider name, e.g. to mirror to two disks
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn ensure_parent_dir(path: &Path) -> RemoteResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".partial");
        PathBuf::from(name)
    }

    fn uri(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    fn provider(&self) -> String {
        self.name.clone()
    }

    async fn upload_file(&self, local: &Path, key: &str) -> RemoteResult<String> {
        let dest = self.resolve_path(key);
        Self::ensure_parent_dir(&dest).await?;

        let partial = Self::partial_path(&dest);
        let copied = fs::copy(local, &partial).await;
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        fs::rename(&partial, &dest).await?;

        debug!(dest = %dest.display(), bytes, "Copied artifact to mirror directory");
        Ok(Self::uri(&dest))
    }

    async fn upload_bytes(&self, data: Vec<u8>, key: &str) -> RemoteResult<String> {
        let dest = self.resolve_path(key);
        Self::ensure_parent_dir(&dest).await?;

        let partial = Self::partial_path(&dest);
        fs::write(&partial, &data).await?;
        fs::rename(&partial, &dest).await?;
        Ok(Self::uri(&dest))
    }

    async fn exists(&self, key: &str) -> RemoteResult<bool> {
        Ok(fs::try_exists(self.resolve_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> RemoteResult<()> {
        match fs::remove_file(self.resolve_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
