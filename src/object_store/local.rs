use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio_util::io::ReaderStream;

use super::{ByteStream, ObjectStore, ObjectStoreError};
use crate::storage::models::StorageType;

/// Local filesystem object store. Also the staging area for every upload.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key to a path under the root, refusing anything that could escape it.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<(), ObjectStoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// A sibling name to write to before renaming into place, so a failed
    /// write never leaves a partial object under the real key.
    fn temp_path(path: &Path, tag: &str) -> PathBuf {
        path.with_extension(format!("{tag}-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn rename_into_place(tmp: &Path, path: &Path) -> Result<(), ObjectStoreError> {
        if let Err(e) = tokio::fs::rename(tmp, path).await {
            let _ = tokio::fs::remove_file(tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Make `new_key` a hard link to the bytes of `existing_key`.
    ///
    /// Any independent copy already at `new_key` is replaced atomically, so
    /// readers see either the old copy or the shared bytes, never a gap.
    /// Fails (leaving `new_key` untouched) when the link cannot be created,
    /// e.g. across devices.
    pub async fn link(&self, existing_key: &str, new_key: &str) -> Result<(), ObjectStoreError> {
        let source = self.object_path(existing_key)?;
        let target = self.object_path(new_key)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(ObjectStoreError::NotFound(existing_key.to_string()));
        }
        Self::ensure_parent(&target).await?;

        let tmp = Self::temp_path(&target, "link");
        tokio::fs::hard_link(&source, &tmp).await?;
        Self::rename_into_place(&tmp, &target).await
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key)?;
        Self::ensure_parent(&path).await?;
        let tmp = Self::temp_path(&path, "part");
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Self::rename_into_place(&tmp, &path).await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key)?;
        if path == source {
            return Ok(());
        }
        Self::ensure_parent(&path).await?;
        let tmp = Self::temp_path(&path, "part");
        if let Err(e) = tokio::fs::copy(source, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Self::rename_into_place(&tmp, &path).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let path = self.object_path(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::pin(ReaderStream::new(file).map_err(ObjectStoreError::from)))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn signed_url(&self, key: &str, _ttl: Duration) -> Result<String, ObjectStoreError> {
        let path = self.object_path(key)?;
        Ok(path.to_string_lossy().into_owned())
    }
}
