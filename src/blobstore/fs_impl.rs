use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{BlobStat, BlobStore};
use crate::error::StoreError;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default)]
    pub dir: PathBuf,
}

impl FsConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.dir.as_os_str().is_empty() {
            return Err(StoreError::config("missing dir"));
        }
        Ok(())
    }
}

/// Stores every blob as a single file inside the configured directory.
#[derive(Debug, Default)]
pub struct FsBlobStore {
    dir: Option<PathBuf>,
}

impl FsBlobStore {
    /// Maps `id` to a file directly inside the store directory.
    ///
    /// Anything but a single plain path component is rejected, so ids can
    /// never address files outside of the directory.
    fn blob_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.dir.as_ref().ok_or(StoreError::Uninitialized)?;

        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(dir.join(name)),
            _ => Err(StoreError::InvalidKey(id.into())),
        }
    }
}

fn map_not_found(err: io::Error, id: &str) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(format!("blob {id}"))
    } else {
        err.into()
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn init(&mut self, config: &[u8]) -> Result<(), StoreError> {
        let config: FsConfig = serde_json::from_slice(config).map_err(StoreError::config)?;
        config.validate()?;

        fs::create_dir_all(&config.dir).await.inspect_err(|err| {
            tracing::error!(dir = %config.dir.display(), error = %err, "failed to create directory");
        })?;
        tracing::info!(store = "fs", dir = %config.dir.display(), "config loaded");

        self.dir = Some(config.dir);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stat(&self, id: &str) -> Result<BlobStat, StoreError> {
        let path = self.blob_path(id)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|err| map_not_found(err, id))?;

        Ok(BlobStat {
            size: metadata.len(),
        })
    }

    async fn get(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, StoreError> {
        let path = self.blob_path(id)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| map_not_found(err, id))?;

        let copied = tokio::io::copy(&mut file, sink).await.inspect_err(|err| {
            tracing::error!(image_id = id, path = %path.display(), error = %err, "failed to copy image data to output stream");
        })?;
        sink.flush().await?;

        Ok(copied)
    }

    async fn put(
        &self,
        id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError> {
        let path = self.blob_path(id)?;
        let mut file = fs::File::create(&path).await.inspect_err(|err| {
            tracing::error!(image_id = id, path = %path.display(), error = %err, "failed to create image file");
        })?;

        let copied = tokio::io::copy(source, &mut file).await.inspect_err(|err| {
            tracing::error!(image_id = id, path = %path.display(), error = %err, "failed to write image file");
        })?;
        file.flush().await?;

        Ok(copied)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.blob_path(id)?;
        match fs::remove_file(&path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                tracing::error!(image_id = id, path = %path.display(), error = %err, "failed to remove image");
                Err(err.into())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::blobstore::check_blob_store;

    async fn init_store(dir: &Path) -> FsBlobStore {
        let config = serde_json::to_vec(&FsConfig { dir: dir.into() }).unwrap();
        let mut store = FsBlobStore::default();
        store.init(&config).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_fs_blobstore() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = init_store(&tempdir.path().join("images")).await;

        check_blob_store(&store).await;

        store.put("on-disk", &mut &b"abc"[..]).await.unwrap();
        let on_disk = std::fs::read(tempdir.path().join("images").join("on-disk")).unwrap();
        assert_eq!(on_disk, b"abc");
    }

    #[rstest]
    #[case(b"not json".as_slice())]
    #[case(b"{}".as_slice())]
    #[case(br#"{"dir": ""}"#.as_slice())]
    #[case(br#"{"dir": 5}"#.as_slice())]
    #[tokio::test]
    async fn rejects_invalid_config(#[case] config: &[u8]) {
        let mut store = FsBlobStore::default();
        let err = store.init(config).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)), "{err:?}");
    }

    #[tokio::test]
    async fn uninitialized_store_errors() {
        let store = FsBlobStore::default();
        let err = store.stat("image").await.unwrap_err();
        assert!(matches!(err, StoreError::Uninitialized), "{err:?}");
    }

    #[rstest]
    #[case("../escape")]
    #[case("nested/id")]
    #[case("/etc/passwd")]
    #[case("..")]
    #[case("")]
    #[tokio::test]
    async fn rejects_ids_outside_of_dir(#[case] id: &str) {
        let tempdir = tempfile::tempdir().unwrap();
        let store = init_store(tempdir.path()).await;

        let err = store.put(id, &mut &b"abc"[..]).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)), "{err:?}");
        let err = store.delete(id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)), "{err:?}");
    }
}
