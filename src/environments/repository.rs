use super::models::{AttachedEnvironment, Environment, StoredEntry};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage boundary for environments and their encrypted entries
#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    async fn get_environment(&self, project_id: Uuid, environment_id: Uuid) -> Result<Option<Environment>>;

    /// Slugs are matched lower-cased
    async fn get_environment_by_slug(&self, project_id: Uuid, slug: &str) -> Result<Option<Environment>>;

    async fn list_entries(&self, project_id: Uuid, environment_id: Uuid) -> Result<Vec<StoredEntry>>;

    async fn create_entries(
        &self,
        project_id: Uuid,
        environment_id: Uuid,
        names: &[String],
        values: &[String],
    ) -> Result<Vec<StoredEntry>>;

    async fn upsert_entry(&self, project_id: Uuid, environment_id: Uuid, name: &str, value: &str) -> Result<StoredEntry>;

    async fn delete_entry(&self, project_id: Uuid, environment_id: Uuid, name: &str) -> Result<()>;

    /// Environment linked to a tool source (e.g. an OpenAPI document)
    async fn environment_for_source(&self, project_id: Uuid, source_kind: &str, source_slug: &str) -> Result<Option<Uuid>>;

    async fn environment_for_toolset(&self, project_id: Uuid, toolset_id: Uuid) -> Result<Option<Uuid>>;

    /// Environment attached to a toolset's published server
    async fn attached_environment(&self, project_id: Uuid, toolset_id: Uuid) -> Result<Option<AttachedEnvironment>>;
}

#[derive(Default)]
struct InMemoryState {
    environments: HashMap<Uuid, Environment>,
    entries: HashMap<Uuid, Vec<StoredEntry>>,
    source_links: HashMap<(Uuid, String, String), Uuid>,
    toolset_links: HashMap<(Uuid, Uuid), Uuid>,
    attachments: HashMap<(Uuid, Uuid), AttachedEnvironment>,
}

/// Repository backed by process memory
#[derive(Default)]
pub struct InMemoryEnvironmentRepository {
    state: RwLock<InMemoryState>,
}

impl InMemoryEnvironmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_environment(&self, project_id: Uuid, slug: &str, name: &str) -> Environment {
        let now = Utc::now();
        let environment = Environment {
            id: Uuid::new_v4(),
            project_id,
            slug: slug.to_lowercase(),
            name: name.to_string(),
            description: None,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.write().await;
        state.environments.insert(environment.id, environment.clone());
        state.entries.insert(environment.id, Vec::new());
        environment
    }

    pub async fn link_source(&self, project_id: Uuid, source_kind: &str, source_slug: &str, environment_id: Uuid) {
        self.state.write().await.source_links.insert(
            (project_id, source_kind.to_string(), source_slug.to_string()),
            environment_id,
        );
    }

    pub async fn link_toolset(&self, project_id: Uuid, toolset_id: Uuid, environment_id: Uuid) {
        self.state
            .write()
            .await
            .toolset_links
            .insert((project_id, toolset_id), environment_id);
    }

    pub async fn attach(&self, project_id: Uuid, toolset_id: Uuid, attached: AttachedEnvironment) {
        self.state
            .write()
            .await
            .attachments
            .insert((project_id, toolset_id), attached);
    }

    fn owned(state: &InMemoryState, project_id: Uuid, environment_id: Uuid) -> Result<()> {
        match state.environments.get(&environment_id) {
            Some(env) if env.project_id == project_id => Ok(()),
            _ => Err(GatewayError::not_found(format!("environment {} not found", environment_id))),
        }
    }
}

#[async_trait]
impl EnvironmentRepository for InMemoryEnvironmentRepository {
    async fn get_environment(&self, project_id: Uuid, environment_id: Uuid) -> Result<Option<Environment>> {
        let state = self.state.read().await;
        Ok(state
            .environments
            .get(&environment_id)
            .filter(|env| env.project_id == project_id)
            .cloned())
    }

    async fn get_environment_by_slug(&self, project_id: Uuid, slug: &str) -> Result<Option<Environment>> {
        let slug = slug.to_lowercase();
        let state = self.state.read().await;
        Ok(state
            .environments
            .values()
            .find(|env| env.project_id == project_id && env.slug == slug)
            .cloned())
    }

    async fn list_entries(&self, project_id: Uuid, environment_id: Uuid) -> Result<Vec<StoredEntry>> {
        let state = self.state.read().await;
        Self::owned(&state, project_id, environment_id)?;
        let mut entries = state.entries.get(&environment_id).cloned().unwrap_or_default();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_entries(
        &self,
        project_id: Uuid,
        environment_id: Uuid,
        names: &[String],
        values: &[String],
    ) -> Result<Vec<StoredEntry>> {
        if names.len() != values.len() {
            return Err(GatewayError::bad_request("names and values must have the same length"));
        }
        let mut state = self.state.write().await;
        Self::owned(&state, project_id, environment_id)?;

        let now = Utc::now();
        let created: Vec<StoredEntry> = names
            .iter()
            .zip(values)
            .map(|(name, value)| StoredEntry {
                environment_id,
                name: name.clone(),
                value: value.clone(),
                created_at: now,
                updated_at: now,
            })
            .collect();

        let entries = state.entries.entry(environment_id).or_default();
        for entry in &created {
            entries.retain(|e| e.name != entry.name);
            entries.push(entry.clone());
        }
        Ok(created)
    }

    async fn upsert_entry(&self, project_id: Uuid, environment_id: Uuid, name: &str, value: &str) -> Result<StoredEntry> {
        let mut state = self.state.write().await;
        Self::owned(&state, project_id, environment_id)?;

        let now = Utc::now();
        let entries = state.entries.entry(environment_id).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
            existing.value = value.to_string();
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let entry = StoredEntry {
            environment_id,
            name: name.to_string(),
            value: value.to_string(),
            created_at: now,
            updated_at: now,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn delete_entry(&self, project_id: Uuid, environment_id: Uuid, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::owned(&state, project_id, environment_id)?;
        if let Some(entries) = state.entries.get_mut(&environment_id) {
            entries.retain(|e| e.name != name);
        }
        Ok(())
    }

    async fn environment_for_source(&self, project_id: Uuid, source_kind: &str, source_slug: &str) -> Result<Option<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .source_links
            .get(&(project_id, source_kind.to_string(), source_slug.to_string()))
            .copied())
    }

    async fn environment_for_toolset(&self, project_id: Uuid, toolset_id: Uuid) -> Result<Option<Uuid>> {
        let state = self.state.read().await;
        Ok(state.toolset_links.get(&(project_id, toolset_id)).copied())
    }

    async fn attached_environment(&self, project_id: Uuid, toolset_id: Uuid) -> Result<Option<AttachedEnvironment>> {
        let state = self.state.read().await;
        Ok(state.attachments.get(&(project_id, toolset_id)).cloned())
    }
}
