//! Database query functions for the `agent_definitions` table.

use anyhow::{Context, Result};
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{AgentCapabilities, AgentDefinition, AgentRuntime, RequiredEnvVar};

#[derive(Debug, Clone)]
pub struct NewAgentDefinition {
    pub display_name: String,
    pub docker_image: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub required_env_vars: Vec<RequiredEnvVar>,
    pub capabilities: AgentCapabilities,
    pub runtime: AgentRuntime,
}

pub async fn insert(pool: &SqlitePool, new: &NewAgentDefinition) -> Result<AgentDefinition> {
    let id = Uuid::new_v4();
    sqlx::query_as::<_, AgentDefinition>(
        "INSERT INTO agent_definitions (id, display_name, docker_image, command, args, required_env_vars, capabilities, runtime) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(&new.display_name)
    .bind(&new.docker_image)
    .bind(&new.command)
    .bind(Json(&new.args))
    .bind(Json(&new.required_env_vars))
    .bind(Json(new.capabilities))
    .bind(new.runtime)
    .fetch_one(pool)
    .await
    .context("failed to insert agent definition")
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<AgentDefinition>> {
    sqlx::query_as::<_, AgentDefinition>("SELECT * FROM agent_definitions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent definition")
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<AgentDefinition>> {
    sqlx::query_as::<_, AgentDefinition>("SELECT * FROM agent_definitions ORDER BY display_name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list agent definitions")
}

/// Returns the subset of `ids` that do not exist, for the Pipeline Expander's
/// "validate every reference before any insert" rule (SPEC_FULL.md §4.3).
pub async fn missing_ids(pool: &SqlitePool, ids: &[Uuid]) -> Result<Vec<Uuid>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(",");
    let sql = format!("SELECT id FROM agent_definitions WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, (Uuid,)>(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    let existing: Vec<(Uuid,)> = query
        .fetch_all(pool)
        .await
        .context("failed to check agent definition existence")?;
    let existing: std::collections::HashSet<Uuid> = existing.into_iter().map(|(id,)| id).collect();
    Ok(ids.iter().filter(|id| !existing.contains(id)).copied().collect())
}
