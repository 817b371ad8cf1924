//! Object-store access
//!
//! A provider-neutral backend seam, the S3-compatible implementation,
//! and the datastore layer adding metadata and size-memoization
//! bookkeeping on top of raw object operations.

pub mod backend;
pub mod credentials;
pub mod datastore;
pub mod s3;

pub use backend::{ListPage, MemoryBackend, StoreBackend};
pub use credentials::StoreCredentials;
pub use datastore::DataStore;
pub use s3::S3Backend;
