//! Name based construction of store backends.
//!
//! Registries are filled once at startup and only read afterwards. New
//! backends are added to [`blob_stores`] or [`metadata_stores`] without
//! touching the code that picks a backend by name.

use std::collections::BTreeMap;

use crate::blobstore::{BlobStore, FsBlobStore, MemBlobStore};
use crate::error::StoreError;
use crate::metastore::{FjallMetadataStore, MemMetadataStore, MetadataStore};

pub type Constructor<S> = Box<dyn Fn() -> Box<S> + Send + Sync>;

pub struct Registry<S: ?Sized> {
    constructors: BTreeMap<String, Constructor<S>>,
}

impl<S: ?Sized> Default for Registry<S> {
    fn default() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }
}

impl<S: ?Sized> core::fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

impl<S: ?Sized> Registry<S> {
    /// Registers `constructor` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Box<S> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
        self
    }

    /// Creates a new, uninitialized store of the backend registered as `name`.
    pub fn new_store(&self, name: &str) -> Result<Box<S>, StoreError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| StoreError::UnknownBackend(name.into()))?;
        Ok(constructor())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

/// All built-in blob store backends.
pub fn blob_stores() -> Registry<dyn BlobStore> {
    let mut registry: Registry<dyn BlobStore> = Registry::default();
    registry
        .register("fs", || Box::new(FsBlobStore::default()))
        .register("memory", || Box::new(MemBlobStore::default()));
    registry
}

/// All built-in metadata store backends.
pub fn metadata_stores() -> Registry<dyn MetadataStore> {
    let mut registry: Registry<dyn MetadataStore> = Registry::default();
    registry
        .register("fjall", || Box::new(FjallMetadataStore::default()))
        .register("memory", || Box::new(MemMetadataStore::default()));
    registry
}
