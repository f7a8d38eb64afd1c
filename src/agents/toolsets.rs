//! Toolset lookup for agent runs

use crate::error::Result;
use crate::toolconfig::ToolCallPlan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A named bundle of tools with its default environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub default_environment_slug: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolCallPlan>,
}

/// Storage boundary for toolsets
#[async_trait]
pub trait ToolsetRepository: Send + Sync {
    async fn get_toolset(&self, project_id: Uuid, slug: &str) -> Result<Option<Toolset>>;
}

/// Repository backed by process memory
#[derive(Default)]
pub struct InMemoryToolsetRepository {
    toolsets: RwLock<HashMap<(Uuid, String), Toolset>>,
}

impl InMemoryToolsetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, toolset: Toolset) {
        self.toolsets
            .write()
            .await
            .insert((toolset.project_id, toolset.slug.to_lowercase()), toolset);
    }
}

#[async_trait]
impl ToolsetRepository for InMemoryToolsetRepository {
    async fn get_toolset(&self, project_id: Uuid, slug: &str) -> Result<Option<Toolset>> {
        Ok(self
            .toolsets
            .read()
            .await
            .get(&(project_id, slug.to_lowercase()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_is_project_scoped_and_case_insensitive() {
        let repo = InMemoryToolsetRepository::new();
        let project_id = Uuid::new_v4();
        repo.insert(Toolset {
            id: Uuid::new_v4(),
            project_id,
            slug: "Petstore".into(),
            name: "Petstore".into(),
            default_environment_slug: Some("prod".into()),
            tools: vec![],
        })
        .await;

        assert!(repo.get_toolset(project_id, "petstore").await.unwrap().is_some());
        assert!(repo.get_toolset(Uuid::new_v4(), "petstore").await.unwrap().is_none());
    }
}
