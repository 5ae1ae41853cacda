use crate::error::StoreError;
use crate::image::{Image, ImageType};

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::FjallMetadataStore;
pub use mem_impl::MemMetadataStore;

/// Image records, keyed by id and additionally indexed by source.
///
/// Lookups of unknown ids or sources fail with [`StoreError::NotFound`].
/// Uploads carry an empty source and are never found by source.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Parses the backend specific JSON `config` and sets up its resources.
    async fn init(&mut self, config: &[u8]) -> Result<(), StoreError>;

    async fn shutdown(&self) -> Result<(), StoreError>;

    /// Lists all records, or only the ones of `image_type`.
    async fn list(&self, image_type: Option<ImageType>) -> Result<Vec<Image>, StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Image, StoreError>;

    async fn get_by_source(&self, source: &str) -> Result<Image, StoreError>;

    /// Inserts or replaces the record with the id of `image`.
    async fn put(&self, image: &Image) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Behavior every [`MetadataStore`] backend has to agree on.
#[cfg(test)]
pub(crate) async fn check_metadata_store(store: &dyn MetadataStore) {
    assert!(store.list(None).await.unwrap().is_empty());
    assert!(store.get_by_id("missing").await.unwrap_err().is_not_found());
    assert!(store.get_by_source("http://x/img").await.unwrap_err().is_not_found());
    assert!(store.delete("missing").await.unwrap_err().is_not_found());

    let mut kvm = Image::new("http://x/img", ImageType::Kvm, "a comment");
    kvm.set_downloading(Some(25)).unwrap();
    kvm.update_size(10).unwrap();
    let upload = Image::new("", ImageType::Container, "");
    store.put(&kvm).await.unwrap();
    store.put(&upload).await.unwrap();

    // round-trips every field
    assert_eq!(store.get_by_id(&kvm.id).await.unwrap(), kvm);
    assert_eq!(store.get_by_source("http://x/img").await.unwrap(), kvm);
    assert!(store.get_by_source("").await.unwrap_err().is_not_found());

    let mut all = store.list(None).await.unwrap();
    all.sort_by(|a, b| a.id.cmp(&b.id));
    let mut expected = vec![kvm.clone(), upload.clone()];
    expected.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(all, expected);
    assert_eq!(store.list(Some(ImageType::Kvm)).await.unwrap(), vec![kvm.clone()]);
    assert_eq!(
        store.list(Some(ImageType::Container)).await.unwrap(),
        vec![upload.clone()]
    );

    // upserts replace the previous record
    kvm.update_size(25).unwrap();
    kvm.set_finished(false).unwrap();
    store.put(&kvm).await.unwrap();
    assert_eq!(store.get_by_id(&kvm.id).await.unwrap(), kvm);
    assert_eq!(store.list(None).await.unwrap().len(), 2);

    store.delete(&kvm.id).await.unwrap();
    assert!(store.get_by_id(&kvm.id).await.unwrap_err().is_not_found());
    assert!(store.get_by_source("http://x/img").await.unwrap_err().is_not_found());
    assert_eq!(store.list(None).await.unwrap(), vec![upload]);
    assert!(store.delete(&kvm.id).await.unwrap_err().is_not_found());
}
