//! Object metadata and the two-phase upload workflow.
//!
//! Creating an object writes its metadata and a single-use upload session; the bytes
//! arrive later through [`UploadSessionManager::upload`]. Objects are found again by
//! `(owner, filename)` through the owner index kept on each user record.

pub mod objects;
pub mod uploads;

pub use objects::{CatalogError, ObjectCatalog, ReconcileReport};
pub use uploads::{UploadError, UploadSessionManager};
