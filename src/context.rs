//! Startup wiring: picks the configured backends from the registries,
//! initializes them and builds the [`Fetcher`] on top.

use std::sync::Arc;
use std::time::Duration;

use crate::blobstore::BlobStore;
use crate::config::Config;
use crate::error::StoreError;
use crate::fetcher::{Fetcher, DEFAULT_MONITOR_INTERVAL};
use crate::metastore::MetadataStore;
use crate::registry::{self, Registry};

#[derive(Clone)]
pub struct Context {
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub fetcher: Fetcher,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates the stores named in `config` from the built-in backends.
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        Self::with_registries(
            config,
            &registry::blob_stores(),
            &registry::metadata_stores(),
        )
        .await
    }

    pub async fn with_registries(
        config: &Config,
        blob_stores: &Registry<dyn BlobStore>,
        metadata_stores: &Registry<dyn MetadataStore>,
    ) -> Result<Self, StoreError> {
        let store_type = &config.image_store_type;
        let store_config = serde_json::to_vec(&config.image_store_config).map_err(StoreError::config)?;
        let mut blobs = blob_stores.new_store(store_type).inspect_err(|err| {
            tracing::error!(store_type, error = %err, "failed to create image store");
        })?;
        blobs.init(&store_config).await.inspect_err(|err| {
            tracing::error!(store_type, error = %err, "failed to initialize image store");
        })?;

        let store_type = &config.metadata_store_type;
        let store_config =
            serde_json::to_vec(&config.metadata_store_config).map_err(StoreError::config)?;
        let mut metadata = metadata_stores.new_store(store_type).inspect_err(|err| {
            tracing::error!(store_type, error = %err, "failed to create metadata store");
        })?;
        metadata.init(&store_config).await.inspect_err(|err| {
            tracing::error!(store_type, error = %err, "failed to initialize metadata store");
        })?;

        Ok(Self::from_stores(
            blobs.into(),
            metadata.into(),
            config.monitor_interval(),
        ))
    }

    /// Wraps already initialized stores.
    pub fn from_stores(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        monitor_interval: Duration,
    ) -> Self {
        let fetcher =
            Fetcher::new(blobs.clone(), metadata.clone()).with_monitor_interval(monitor_interval);
        Self {
            blobs,
            metadata,
            fetcher,
        }
    }

    /// An ephemeral context keeping everything in memory.
    pub fn in_memory() -> Self {
        Self::from_stores(
            Arc::new(crate::blobstore::MemBlobStore::default()),
            Arc::new(crate::metastore::MemMetadataStore::default()),
            DEFAULT_MONITOR_INTERVAL,
        )
    }

    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let blobs = self.blobs.shutdown().await;
        let metadata = self.metadata.shutdown().await;
        blobs.and(metadata)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::image::{ImageStatus, ImageType};

    #[tokio::test]
    async fn builds_configured_stores() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = Config {
            image_store_config: json!({ "dir": tempdir.path().join("images") }),
            metadata_store_config: json!({
                "path": tempdir.path().join("metadata"),
                "partition": "images",
            }),
            ..Default::default()
        };

        let ctx = Context::new(&config).await.unwrap();
        let image = ctx
            .fetcher
            .receive(&mut &b"0123456789"[..], None, "kvm", "")
            .await
            .unwrap();
        assert_eq!(image.status, ImageStatus::Complete);
        assert_eq!(ctx.blobs.stat(&image.id).await.unwrap().size, 10);
        assert_eq!(ctx.metadata.list(Some(ImageType::Kvm)).await.unwrap(), vec![image]);

        ctx.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_backends_fail() {
        let config = Config {
            image_store_type: "riakcs".into(),
            ..Default::default()
        };
        let err = Context::new(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownBackend(_)), "{err:?}");

        let config = Config {
            image_store_type: "memory".into(),
            metadata_store_type: "etcd".into(),
            ..Default::default()
        };
        let err = Context::new(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownBackend(_)), "{err:?}");
    }

    #[tokio::test]
    async fn invalid_store_config_fails() {
        // `fs` without a `dir`
        let config = Config {
            metadata_store_type: "memory".into(),
            ..Default::default()
        };
        let err = Context::new(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)), "{err:?}");
    }

    #[tokio::test]
    async fn memory_backends_need_no_config() {
        let config = Config {
            image_store_type: "memory".into(),
            metadata_store_type: "memory".into(),
            ..Default::default()
        };
        let ctx = Context::new(&config).await.unwrap();
        assert!(ctx.metadata.list(None).await.unwrap().is_empty());
        ctx.shutdown().await.unwrap();
    }
}
