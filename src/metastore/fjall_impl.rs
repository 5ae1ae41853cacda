use std::path::PathBuf;

use fjall::{PersistMode, TransactionalKeyspace, TransactionalPartitionHandle};
use serde::{Deserialize, Serialize};

use super::MetadataStore;
use crate::error::StoreError;
use crate::image::{Image, ImageType};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FjallConfig {
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub partition: String,
}

impl FjallConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::config("empty path"));
        }
        if self.partition.is_empty() {
            return Err(StoreError::config("empty partition"));
        }
        let valid_name = self
            .partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(StoreError::Config(format!(
                "invalid partition name {:?}",
                self.partition
            )));
        }
        Ok(())
    }
}

struct Database {
    keyspace: TransactionalKeyspace,
    /// image id -> postcard encoded `Image`
    images: TransactionalPartitionHandle,
    /// image source -> image id
    sources: TransactionalPartitionHandle,
}

/// Persists records in an embedded fjall keyspace.
#[derive(Default)]
pub struct FjallMetadataStore {
    db: Option<Database>,
}

impl core::fmt::Debug for FjallMetadataStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FjallMetadataStore")
            .field("initialized", &self.db.is_some())
            .finish()
    }
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound(format!("image {id}"))
}

impl FjallMetadataStore {
    fn db(&self) -> Result<&Database, StoreError> {
        self.db.as_ref().ok_or(StoreError::Uninitialized)
    }

    fn read_image(&self, id: &str) -> Result<Image, StoreError> {
        let db = self.db()?;
        let value = db.images.get(id)?.ok_or_else(|| not_found(id))?;
        Ok(postcard::from_bytes(&value)?)
    }
}

#[async_trait::async_trait]
impl MetadataStore for FjallMetadataStore {
    async fn init(&mut self, config: &[u8]) -> Result<(), StoreError> {
        let config: FjallConfig = serde_json::from_slice(config).map_err(StoreError::config)?;
        config.validate()?;

        let keyspace = fjall::Config::new(&config.path)
            .open_transactional()
            .inspect_err(|err| {
                tracing::error!(path = %config.path.display(), error = %err, "failed to open keyspace");
            })?;
        let images = keyspace.open_partition(&config.partition, Default::default())?;
        let sources =
            keyspace.open_partition(&format!("{}_sources", config.partition), Default::default())?;
        tracing::info!(store = "fjall", path = %config.path.display(), partition = %config.partition, "config loaded");

        self.db = Some(Database {
            keyspace,
            images,
            sources,
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        let db = self.db()?;
        db.keyspace.persist(PersistMode::SyncAll).inspect_err(|err| {
            tracing::error!(error = %err, "failed to persist keyspace");
        })?;
        Ok(())
    }

    async fn list(&self, image_type: Option<ImageType>) -> Result<Vec<Image>, StoreError> {
        let db = self.db()?;
        let read_tx = db.keyspace.read_tx();

        let mut images = vec![];
        for kv in read_tx.iter(&db.images) {
            let (key, value) = kv?;
            let image: Image = postcard::from_bytes(&value).inspect_err(|err| {
                tracing::error!(key = %String::from_utf8_lossy(&key), error = %err, "failed to decode image");
            })?;
            if image_type.map_or(true, |ty| image.image_type == ty) {
                images.push(image);
            }
        }
        Ok(images)
    }

    async fn get_by_id(&self, id: &str) -> Result<Image, StoreError> {
        self.read_image(id)
    }

    async fn get_by_source(&self, source: &str) -> Result<Image, StoreError> {
        let db = self.db()?;
        let missing = || StoreError::NotFound(format!("image with source {source:?}"));

        if source.is_empty() {
            return Err(missing());
        }
        let id = db.sources.get(source)?.ok_or_else(missing)?;
        let id = String::from_utf8_lossy(&id);

        self.read_image(&id).map_err(|err| match err {
            StoreError::NotFound(_) => missing(),
            err => err,
        })
    }

    async fn put(&self, image: &Image) -> Result<(), StoreError> {
        let db = self.db()?;
        let value = postcard::to_stdvec(image)?;

        let mut write_tx = db.keyspace.write_tx()?;
        if let Some(previous) = write_tx.get(&db.images, &image.id)? {
            let previous: Image = postcard::from_bytes(&previous)?;
            if previous.source != image.source && !previous.source.is_empty() {
                write_tx.remove(&db.sources, previous.source.as_bytes());
            }
        }
        write_tx.insert(&db.images, image.id.as_bytes(), value);
        if !image.source.is_empty() {
            write_tx.insert(&db.sources, image.source.as_bytes(), image.id.as_bytes());
        }
        write_tx.commit()?.map_err(|_| StoreError::Conflict)?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let db = self.db()?;

        let mut write_tx = db.keyspace.write_tx()?;
        let value = write_tx.get(&db.images, id)?.ok_or_else(|| not_found(id))?;
        let image: Image = postcard::from_bytes(&value)?;

        write_tx.remove(&db.images, id.as_bytes());
        if !image.source.is_empty() {
            let indexed = write_tx.get(&db.sources, image.source.as_bytes())?;
            if indexed.as_deref() == Some(id.as_bytes()) {
                write_tx.remove(&db.sources, image.source.as_bytes());
            }
        }
        write_tx.commit()?.map_err(|_| StoreError::Conflict)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::metastore::check_metadata_store;

    fn config_for(path: &std::path::Path) -> Vec<u8> {
        serde_json::to_vec(&FjallConfig {
            path: path.into(),
            partition: "images".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fjall_metastore() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut store = FjallMetadataStore::default();
        store.init(&config_for(tempdir.path())).await.unwrap();

        check_metadata_store(&store).await;

        store.shutdown().await.unwrap();
    }

    #[rstest]
    #[case(b"[]".as_slice())]
    #[case(br#"{"partition": "images"}"#.as_slice())]
    #[case(br#"{"path": "/tmp/db"}"#.as_slice())]
    #[case(br#"{"path": "/tmp/db", "partition": "no spaces"}"#.as_slice())]
    #[tokio::test]
    async fn rejects_invalid_config(#[case] config: &[u8]) {
        let mut store = FjallMetadataStore::default();
        let err = store.init(config).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)), "{err:?}");
    }

    #[tokio::test]
    async fn uninitialized_store_errors() {
        let store = FjallMetadataStore::default();
        let err = store.list(None).await.unwrap_err();
        assert!(matches!(err, StoreError::Uninitialized), "{err:?}");
    }
}
