//! Project environments: encrypted entries, redaction and system environment loading

mod models;
mod redact;
mod repository;
mod store;

pub use models::{AttachedEnvironment, Environment, EnvironmentEntry, SlugOrId, StoredEntry};
pub use redact::redact;
pub use repository::{EnvironmentRepository, InMemoryEnvironmentRepository};
pub use store::{EnvironmentEntries, UpsertEntry};
