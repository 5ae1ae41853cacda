//! Uploads and remote downloads of images.
//!
//! Both paths share one transfer protocol: mark the record as downloading,
//! copy the bytes into the blob store while a monitor task periodically
//! publishes the current size, then record the true final size and the
//! terminal status.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::blobstore::BlobStore;
use crate::error::StoreError;
use crate::image::{Image, ImageType, TransitionError, ValidationError};
use crate::metastore::MetadataStore;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to request image")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response status {0}")]
    Status(reqwest::StatusCode),

    #[error("failed to store image content")]
    Store(#[source] StoreError),

    #[error("failed to persist image metadata")]
    Metadata(#[source] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to persist image metadata")]
    Metadata(#[source] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The transfer failed; `image` is the record as finalized with `Error` status.
    #[error("transfer of image {} failed", .image.id)]
    Transfer {
        image: Box<Image>,
        #[source]
        source: TransferError,
    },
}

pub type InputStream<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

#[derive(Clone)]
pub struct Fetcher {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    client: reqwest::Client,
    monitor_interval: Duration,
    creating: Arc<SourceLocks>,
}

/// Per-source locks around the lookup-then-create step of `fetch`, so
/// concurrent requests for one source resolve to a single record.
#[derive(Debug, Default)]
struct SourceLocks(std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>);

impl SourceLocks {
    fn acquire(&self, source: &str) -> Arc<Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(source.to_owned()).or_default().clone()
    }

    /// Forgets the lock of `source` unless another fetch still holds it.
    fn release(&self, source: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and `lock` itself
        if Arc::strong_count(&lock) == 2 {
            locks.remove(source);
        }
    }
}

impl core::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fetcher")
            .field("monitor_interval", &self.monitor_interval)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            blobs,
            metadata,
            client: reqwest::Client::new(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            creating: Default::default(),
        }
    }

    pub fn with_monitor_interval(mut self, monitor_interval: Duration) -> Self {
        self.monitor_interval = monitor_interval;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Stores an image from `input`, returning once the transfer finished.
    ///
    /// A failed transfer is reported as [`FetchError::Transfer`], carrying the
    /// record that was persisted with `Error` status.
    pub async fn receive(
        &self,
        input: InputStream<'_>,
        declared_length: Option<u64>,
        image_type: &str,
        comment: &str,
    ) -> Result<Image, FetchError> {
        let image_type: ImageType = image_type.parse()?;

        let mut image = Image::new("", image_type, comment);
        self.persist(&image).await?;

        let result = self.transfer(&mut image, input, declared_length).await;
        self.finish(image, result).await
    }

    /// Starts downloading `source` in the background.
    ///
    /// Returns the new `Pending` record right away. If a record for `source`
    /// already exists, in whatever status, it is returned unchanged and no
    /// download is started; delete it first to download again.
    pub async fn fetch(
        &self,
        source: &str,
        image_type: &str,
        comment: &str,
    ) -> Result<Image, FetchError> {
        if source.is_empty() {
            return Err(ValidationError::MissingSource.into());
        }
        let image_type: ImageType = image_type.parse()?;

        let lock = self.creating.acquire(source);
        let result = {
            let _creating = lock.lock().await;
            self.lookup_or_start(source, image_type, comment).await
        };
        self.creating.release(source, lock);
        result
    }

    async fn lookup_or_start(
        &self,
        source: &str,
        image_type: ImageType,
        comment: &str,
    ) -> Result<Image, FetchError> {
        match self.metadata.get_by_source(source).await {
            Ok(existing) => return Ok(existing),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(FetchError::Metadata(err)),
        }

        let image = Image::new(source, image_type, comment);
        self.persist(&image).await?;

        tracing::info!(image_id = %image.id, source, "starting image download");
        tokio::spawn(self.clone().download(image.clone()));

        Ok(image)
    }

    async fn download(self, mut image: Image) {
        let result = match self.request(&image.source).await {
            Ok(response) => {
                let expected_size = response.content_length();
                let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
                let mut body = StreamReader::new(Box::pin(body));

                self.transfer(&mut image, &mut body, expected_size).await
            }
            Err(err) => Err(err),
        };

        match self.finish(image, result).await {
            Ok(image) => {
                tracing::info!(image_id = %image.id, size = image.size, "image download complete");
            }
            Err(err) => {
                tracing::error!(error = &err as &dyn std::error::Error, "image download failed");
            }
        }
    }

    async fn request(&self, source: &str) -> Result<reqwest::Response, TransferError> {
        let response = self.client.get(source).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(source, %status, "unexpected response status");
            return Err(TransferError::Status(status));
        }
        Ok(response)
    }

    /// Copies `input` into the blob store while keeping the persisted size current.
    async fn transfer(
        &self,
        image: &mut Image,
        input: InputStream<'_>,
        expected_size: Option<u64>,
    ) -> Result<(), TransferError> {
        image.set_downloading(expected_size)?;
        self.metadata
            .put(image)
            .await
            .map_err(TransferError::Metadata)?;

        let stop = CancellationToken::new();
        let monitor = tokio::spawn(self.clone().monitor(image.clone(), stop.clone()));

        let copied = self.blobs.put(&image.id, input).await;

        // the monitor must be gone before the final size is written
        stop.cancel();
        if let Err(err) = monitor.await {
            tracing::error!(image_id = %image.id, error = %err, "progress monitor failed");
        }

        let refreshed = self.refresh_size(image).await;
        let size = match copied {
            Ok(size) => size,
            Err(err) => {
                tracing::error!(image_id = %image.id, error = %err, "failed to store image content");
                return Err(TransferError::Store(err));
            }
        };
        tracing::debug!(image_id = %image.id, size, "image content stored");

        match refreshed {
            // the copy itself succeeded, so its byte count is the final size
            Err(TransferError::Store(err)) => {
                tracing::warn!(image_id = %image.id, error = %err, "failed to stat stored image, using copied size");
                image.update_size(size)?;
                self.metadata
                    .put(image)
                    .await
                    .map_err(TransferError::Metadata)
            }
            refreshed => refreshed,
        }
    }

    async fn monitor(self, mut image: Image, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,
                _ = interval.tick() => match self.refresh_size(&mut image).await {
                    Ok(()) => {}
                    // nothing has been written yet
                    Err(TransferError::Store(err)) if err.is_not_found() => {}
                    Err(err) => {
                        tracing::warn!(image_id = %image.id, error = %err, "failed to update image size");
                    }
                },
            }
        }
    }

    async fn refresh_size(&self, image: &mut Image) -> Result<(), TransferError> {
        let stat = self
            .blobs
            .stat(&image.id)
            .await
            .map_err(TransferError::Store)?;
        image.update_size(stat.size)?;
        self.metadata
            .put(image)
            .await
            .map_err(TransferError::Metadata)
    }

    /// Persists the terminal status matching `result`.
    async fn finish(
        &self,
        mut image: Image,
        result: Result<(), TransferError>,
    ) -> Result<Image, FetchError> {
        image.set_finished(result.is_err())?;
        let persisted = self.persist(&image).await;

        match result {
            Ok(()) => persisted.map(|()| image),
            Err(source) => Err(FetchError::Transfer {
                image: Box::new(image),
                source,
            }),
        }
    }

    async fn persist(&self, image: &Image) -> Result<(), FetchError> {
        self.metadata.put(image).await.map_err(|err| {
            tracing::error!(image_id = %image.id, status = %image.status, error = %err, "failed to persist image");
            FetchError::Metadata(err)
        })
    }
}
