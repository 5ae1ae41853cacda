pub mod blobstore;
pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod image;
pub mod metastore;
pub mod registry;

pub use context::Context;
pub use error::StoreError;
pub use image::{Image, ImageStatus, ImageType};
