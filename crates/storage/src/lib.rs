pub mod backend;
pub mod error;
mod local;
mod models;
mod path;

pub use crate::backend::{Backend, Blob, BoxAsyncRead};
pub use crate::local::{LocalTree, PARTIAL_SUFFIX};
pub use crate::models::{ClientId, FINGERPRINT_METADATA_KEY, Fingerprint, LocalEntry, RemoteEntry, WRITER_METADATA_KEY};
pub use crate::path::{to_key, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn Backend + Send + Sync>;
