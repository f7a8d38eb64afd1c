//! Encrypted environment entries with redacted reads

use super::models::{EnvironmentEntry, SlugOrId, StoredEntry};
use super::redact::redact;
use super::repository::EnvironmentRepository;
use crate::encryption::EncryptionClient;
use crate::error::{GatewayError, Result};
use crate::toolconfig::CaseInsensitiveEnv;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Values ready to be written to an environment.
///
/// Redacted entries are refused so display artifacts never overwrite real secrets.
#[derive(Debug, Clone)]
pub struct UpsertEntry {
    pub name: String,
    pub value: String,
}

impl TryFrom<EnvironmentEntry> for UpsertEntry {
    type Error = GatewayError;

    fn try_from(entry: EnvironmentEntry) -> Result<Self> {
        if entry.redacted {
            return Err(GatewayError::bad_request(format!(
                "entry {} holds a redacted value and cannot be written back",
                entry.name
            )));
        }
        Ok(Self {
            name: entry.name,
            value: entry.value,
        })
    }
}

/// All access to environment entries goes through this type so that values
/// are encrypted on write and decrypted or redacted on read.
#[derive(Clone)]
pub struct EnvironmentEntries {
    repo: Arc<dyn EnvironmentRepository>,
    enc: EncryptionClient,
}

impl EnvironmentEntries {
    pub fn new(repo: Arc<dyn EnvironmentRepository>, enc: EncryptionClient) -> Self {
        Self { repo, enc }
    }

    /// Decrypted entries of an environment as a plain map
    pub async fn load(&self, project_id: Uuid, env: &SlugOrId) -> Result<HashMap<String, String>> {
        if env.is_empty() {
            return Err(GatewayError::bad_request("environment id or slug is required"));
        }

        let environment_id = match env {
            SlugOrId::Id(id) => *id,
            SlugOrId::Slug(slug) => {
                self.repo
                    .get_environment_by_slug(project_id, slug)
                    .await?
                    .ok_or_else(|| GatewayError::not_found(format!("environment not found: {}", slug)))?
                    .id
            }
        };

        self.load_map(project_id, environment_id).await
    }

    /// Entries of the environment linked to a tool source; empty when unlinked
    pub async fn load_source_env(
        &self,
        project_id: Uuid,
        source_kind: &str,
        source_slug: &str,
    ) -> Result<HashMap<String, String>> {
        match self
            .repo
            .environment_for_source(project_id, source_kind, source_slug)
            .await?
        {
            Some(environment_id) => self.load_map(project_id, environment_id).await,
            None => Ok(HashMap::new()),
        }
    }

    /// Entries of the environment linked to a toolset; empty when unlinked
    pub async fn load_toolset_env(&self, project_id: Uuid, toolset_id: Uuid) -> Result<HashMap<String, String>> {
        match self.repo.environment_for_toolset(project_id, toolset_id).await? {
            Some(environment_id) => self.load_map(project_id, environment_id).await,
            None => Ok(HashMap::new()),
        }
    }

    /// System-provided variables of the environment attached to a toolset
    pub async fn load_attached_env(&self, project_id: Uuid, toolset_id: Uuid) -> Result<HashMap<String, String>> {
        let Some(attached) = self.repo.attached_environment(project_id, toolset_id).await? else {
            return Ok(HashMap::new());
        };
        let Some(environment_id) = attached.environment_id else {
            return Ok(HashMap::new());
        };
        if attached.system_variables.is_empty() {
            return Ok(HashMap::new());
        }

        let mut values = self.load_map(project_id, environment_id).await?;
        values.retain(|name, _| attached.system_variables.iter().any(|v| v == name));
        Ok(values)
    }

    /// Merge source, toolset and attached environments; later layers win
    pub async fn load_system_env(
        &self,
        project_id: Uuid,
        toolset_id: Uuid,
        source_kind: &str,
        source_slug: &str,
    ) -> Result<CaseInsensitiveEnv> {
        let source_env = self.load_source_env(project_id, source_kind, source_slug).await?;
        let toolset_env = self.load_toolset_env(project_id, toolset_id).await?;
        let attached_env = self.load_attached_env(project_id, toolset_id).await?;

        let mut system_env = CaseInsensitiveEnv::new();
        for layer in [source_env, toolset_env, attached_env] {
            for (key, value) in layer {
                system_env.set(key, value);
            }
        }

        debug!(
            project_id = %project_id,
            toolset_id = %toolset_id,
            entries = system_env.len(),
            "loaded system environment"
        );
        Ok(system_env)
    }

    pub async fn list_entries(
        &self,
        project_id: Uuid,
        environment_id: Uuid,
        redacted: bool,
    ) -> Result<Vec<EnvironmentEntry>> {
        let stored = self.repo.list_entries(project_id, environment_id).await?;
        stored
            .into_iter()
            .map(|entry| {
                let value = self.enc.decrypt(&entry.value).map_err(|e| {
                    GatewayError::encryption(format!("decrypt entry {}: {}", entry.name, e))
                })?;
                Ok(Self::to_entry(entry, value, redacted))
            })
            .collect()
    }

    /// Encrypt and store new entries, returning them redacted
    pub async fn create_entries(
        &self,
        project_id: Uuid,
        environment_id: Uuid,
        names: &[String],
        values: &[String],
    ) -> Result<Vec<EnvironmentEntry>> {
        if names.len() != values.len() {
            return Err(GatewayError::bad_request("names and values must have the same length"));
        }

        let mut sealed = Vec::with_capacity(values.len());
        let mut originals = HashMap::with_capacity(values.len());
        for (name, value) in names.iter().zip(values) {
            let encrypted = self.enc.encrypt(value).map_err(|e| {
                GatewayError::encryption(format!("failed to encrypt value for entry {}: {}", name, e))
            })?;
            sealed.push(encrypted);
            originals.insert(name.clone(), value.clone());
        }

        let created = self
            .repo
            .create_entries(project_id, environment_id, names, &sealed)
            .await?;

        Ok(created
            .into_iter()
            .map(|entry| {
                let original = originals.get(&entry.name).cloned().unwrap_or_default();
                Self::to_entry(entry, original, true)
            })
            .collect())
    }

    pub async fn update_entry(&self, project_id: Uuid, environment_id: Uuid, entry: UpsertEntry) -> Result<()> {
        let encrypted = self.enc.encrypt(&entry.value)?;
        self.repo
            .upsert_entry(project_id, environment_id, &entry.name, &encrypted)
            .await?;
        Ok(())
    }

    pub async fn delete_entry(&self, project_id: Uuid, environment_id: Uuid, name: &str) -> Result<()> {
        self.repo.delete_entry(project_id, environment_id, name).await
    }

    async fn load_map(&self, project_id: Uuid, environment_id: Uuid) -> Result<HashMap<String, String>> {
        Ok(self
            .list_entries(project_id, environment_id, false)
            .await?
            .into_iter()
            .map(|entry| (entry.name, entry.value))
            .collect())
    }

    fn to_entry(stored: StoredEntry, value: String, redacted: bool) -> EnvironmentEntry {
        EnvironmentEntry {
            environment_id: stored.environment_id,
            name: stored.name,
            value: if redacted { redact(&value) } else { value },
            redacted,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::{AttachedEnvironment, InMemoryEnvironmentRepository};

    async fn setup() -> (Arc<InMemoryEnvironmentRepository>, EnvironmentEntries, Uuid) {
        let repo = Arc::new(InMemoryEnvironmentRepository::new());
        let store = EnvironmentEntries::new(repo.clone(), EncryptionClient::from_seed("test"));
        (repo, store, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_create_returns_redacted_and_stores_ciphertext() {
        let (repo, store, project) = setup().await;
        let env = repo.create_environment(project, "Prod", "Production").await;

        let created = store
            .create_entries(project, env.id, &["API_KEY".into()], &["sk-live-123".into()])
            .await
            .unwrap();
        assert_eq!(created[0].value, "sk-*****");
        assert!(created[0].redacted);

        let stored = repo.list_entries(project, env.id).await.unwrap();
        assert_ne!(stored[0].value, "sk-live-123");

        let loaded = store.load(project, &SlugOrId::Slug("prod".into())).await.unwrap();
        assert_eq!(loaded.get("API_KEY").map(String::as_str), Some("sk-live-123"));
    }

    #[tokio::test]
    async fn test_redacted_entries_cannot_be_written_back() {
        let (repo, store, project) = setup().await;
        let env = repo.create_environment(project, "dev", "Dev").await;
        store
            .update_entry(project, env.id, UpsertEntry { name: "TOKEN".into(), value: "abcdef".into() })
            .await
            .unwrap();

        let listed = store.list_entries(project, env.id, true).await.unwrap();
        assert!(UpsertEntry::try_from(listed[0].clone()).is_err());

        let plain = store.list_entries(project, env.id, false).await.unwrap();
        assert_eq!(UpsertEntry::try_from(plain[0].clone()).unwrap().value, "abcdef");
    }

    #[tokio::test]
    async fn test_system_env_layering() {
        let (repo, store, project) = setup().await;
        let toolset = Uuid::new_v4();

        let source = repo.create_environment(project, "source", "Source").await;
        let toolset_env = repo.create_environment(project, "toolset", "Toolset").await;
        let attached = repo.create_environment(project, "default", "Default").await;

        store
            .create_entries(project, source.id, &["A".into(), "B".into()], &["source-a".into(), "source-b".into()])
            .await
            .unwrap();
        store
            .create_entries(project, toolset_env.id, &["b".into(), "C".into()], &["toolset-b".into(), "toolset-c".into()])
            .await
            .unwrap();
        store
            .create_entries(project, attached.id, &["C".into(), "HIDDEN".into()], &["attached-c".into(), "nope".into()])
            .await
            .unwrap();

        repo.link_source(project, "http", "petstore", source.id).await;
        repo.link_toolset(project, toolset, toolset_env.id).await;
        repo.attach(
            project,
            toolset,
            AttachedEnvironment { environment_id: Some(attached.id), system_variables: vec!["C".into()] },
        )
        .await;

        let env = store.load_system_env(project, toolset, "http", "petstore").await.unwrap();
        assert_eq!(env.get("A"), "source-a");
        assert_eq!(env.get("B"), "toolset-b");
        assert_eq!(env.get("C"), "attached-c");
        assert!(!env.contains("HIDDEN"));
    }

    #[tokio::test]
    async fn test_missing_environment_slug() {
        let (_repo, store, project) = setup().await;
        let err = store.load(project, &SlugOrId::Slug("nope".into())).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
        assert!(store.load(project, &SlugOrId::Slug(String::new())).await.is_err());
    }
}
