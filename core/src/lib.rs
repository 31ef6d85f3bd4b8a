//! Local-first storage and sync core for haunts: places, the visits made to
//! them and the dishes eaten there, persisted in SQLite or redb and pushed to
//! a remote service in the background.

pub mod backend;
pub mod backup;
pub mod error;
pub mod models;
pub mod repo;
pub mod schema;
pub mod sync;

pub use backend::{BackendKind, StorageBackend, StoreLocation, open_backend};
pub use error::StoreError;
pub use repo::{Repository, SharedRepository};
