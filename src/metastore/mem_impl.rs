use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::MetadataStore;
use crate::error::StoreError;
use crate::image::{Image, ImageType};

#[derive(Debug, Default)]
struct Records {
    images: HashMap<String, Image>,
    sources: HashMap<String, String>,
}

/// Keeps all records in memory. Any config is accepted.
#[derive(Debug, Default)]
pub struct MemMetadataStore {
    records: RwLock<Records>,
}

impl MemMetadataStore {
    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Records {
    fn unindex(&mut self, image: &Image) {
        if self.sources.get(&image.source) == Some(&image.id) {
            self.sources.remove(&image.source);
        }
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemMetadataStore {
    async fn init(&mut self, _config: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list(&self, image_type: Option<ImageType>) -> Result<Vec<Image>, StoreError> {
        let records = self.read();
        let mut images: Vec<_> = records
            .images
            .values()
            .filter(|image| image_type.map_or(true, |ty| image.image_type == ty))
            .cloned()
            .collect();
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    async fn get_by_id(&self, id: &str) -> Result<Image, StoreError> {
        self.read()
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("image {id}")))
    }

    async fn get_by_source(&self, source: &str) -> Result<Image, StoreError> {
        let records = self.read();
        records
            .sources
            .get(source)
            .and_then(|id| records.images.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("image with source {source:?}")))
    }

    async fn put(&self, image: &Image) -> Result<(), StoreError> {
        let mut records = self.write();
        if let Some(previous) = records.images.insert(image.id.clone(), image.clone()) {
            records.unindex(&previous);
        }
        if !image.source.is_empty() {
            records
                .sources
                .insert(image.source.clone(), image.id.clone());
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.write();
        let image = records
            .images
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("image {id}")))?;
        records.unindex(&image);
        Ok(())
    }
}
