use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StoreError;

pub mod fs_impl;
pub mod mem_impl;

pub use fs_impl::FsBlobStore;
pub use mem_impl::MemBlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
}

/// Raw image content, keyed by image id.
///
/// Stores are created uninitialized by the registry and become usable once
/// [`BlobStore::init`] succeeded. A `put` that is still running must be
/// observable through `stat`, so progress can be sampled while bytes move.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Parses the backend specific JSON `config` and sets up its resources.
    async fn init(&mut self, config: &[u8]) -> Result<(), StoreError>;

    async fn shutdown(&self) -> Result<(), StoreError>;

    async fn stat(&self, id: &str) -> Result<BlobStat, StoreError>;

    /// Streams the full content of `id` into `sink`, returning the number of bytes written.
    async fn get(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, StoreError>;

    /// Writes everything from `source` as the content of `id`, replacing any previous content.
    async fn put(
        &self,
        id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError>;

    /// Removes the content of `id`. Deleting an absent blob succeeds.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Behavior every [`BlobStore`] backend has to agree on.
#[cfg(test)]
pub(crate) async fn check_blob_store(store: &dyn BlobStore) {
    let contents = b"testdatatestdatatestdata!";

    let err = store.stat("missing").await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    let err = store.get("missing", &mut Vec::<u8>::new()).await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    let written = store.put("image", &mut &contents[..]).await.unwrap();
    assert_eq!(written, 25);
    assert_eq!(store.stat("image").await.unwrap().size, 25);

    let mut out: Vec<u8> = Vec::new();
    assert_eq!(store.get("image", &mut out).await.unwrap(), 25);
    assert_eq!(out, contents);

    // overwrites replace, never append
    store.put("image", &mut &b"short"[..]).await.unwrap();
    assert_eq!(store.stat("image").await.unwrap().size, 5);

    store.delete("image").await.unwrap();
    assert!(store.stat("image").await.unwrap_err().is_not_found());
    store.delete("image").await.unwrap();
}
