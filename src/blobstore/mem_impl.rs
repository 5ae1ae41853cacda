use core::fmt;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{BlobStat, BlobStore};
use crate::error::StoreError;

const READ_BUF: usize = 64 * 1024;

/// Keeps all blobs in memory. Any config is accepted.
#[derive(Default)]
pub struct MemBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl fmt::Debug for MemBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blobs = self.read();
        let mut map = f.debug_map();
        for (id, blob) in blobs.iter() {
            map.entry(id, &blob.len());
        }
        map.finish()
    }
}

impl MemBlobStore {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(id: &str) -> StoreError {
        StoreError::NotFound(format!("blob {id}"))
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    async fn init(&mut self, _config: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stat(&self, id: &str) -> Result<BlobStat, StoreError> {
        let blobs = self.read();
        let blob = blobs.get(id).ok_or_else(|| Self::not_found(id))?;
        Ok(BlobStat {
            size: blob.len() as u64,
        })
    }

    async fn get(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, StoreError> {
        let contents = self.read().get(id).cloned();
        let contents = contents.ok_or_else(|| Self::not_found(id))?;

        sink.write_all(&contents).await?;
        sink.flush().await?;
        Ok(contents.len() as u64)
    }

    async fn put(
        &self,
        id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError> {
        self.write().insert(id.into(), Vec::new());

        // appended chunk by chunk, so `stat` can observe progress
        let mut buf = vec![0; READ_BUF];
        let mut written = 0;
        loop {
            let read = source.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            self.write()
                .entry(id.into())
                .or_default()
                .extend_from_slice(&buf[..read]);
            written += read as u64;
        }

        Ok(written)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::check_blob_store;

    #[tokio::test]
    async fn test_mem_blobstore() {
        let mut store = MemBlobStore::default();
        store.init(b"null").await.unwrap();

        check_blob_store(&store).await;

        store.put("a", &mut &b"abc"[..]).await.unwrap();
        assert_eq!(format!("{store:?}"), r#"{"a": 3}"#);
    }
}
