use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A named key/value collection scoped to a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entry as held by the repository; `value` is ciphertext
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub environment_id: Uuid,
    pub name: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entry as returned by the store: decrypted, or redacted for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    pub environment_id: Uuid,
    pub name: String,
    pub value: String,
    /// Redacted values are display-only and cannot be written back
    #[serde(default)]
    pub redacted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identifies an environment by id or by slug
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlugOrId {
    Id(Uuid),
    Slug(String),
}

impl SlugOrId {
    /// Parse as an id when the value is a UUID, otherwise treat it as a slug
    pub fn parse(value: &str) -> Self {
        match Uuid::parse_str(value) {
            Ok(id) => SlugOrId::Id(id),
            Err(_) => SlugOrId::Slug(value.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SlugOrId::Id(id) => id.is_nil(),
            SlugOrId::Slug(slug) => slug.is_empty(),
        }
    }
}

impl fmt::Display for SlugOrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlugOrId::Id(id) => write!(f, "{}", id),
            SlugOrId::Slug(slug) => write!(f, "{}", slug),
        }
    }
}

/// Environment attached to a toolset, restricted to the system-provided variables
#[derive(Debug, Clone)]
pub struct AttachedEnvironment {
    pub environment_id: Option<Uuid>,
    pub system_variables: Vec<String>,
}
