//! Database query functions for the `templates` table (SPEC_FULL.md §4.3).

use anyhow::{Context, Result};
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{PipelineStep, Template};

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub title_template: String,
    pub prompt_template: String,
    pub pipeline_steps: Option<Vec<PipelineStep>>,
    pub default_agent_definition_id: Option<Uuid>,
    pub max_retries: i32,
}

pub async fn insert(pool: &SqlitePool, new: &NewTemplate) -> Result<Template> {
    let id = Uuid::new_v4();
    sqlx::query_as::<_, Template>(
        "INSERT INTO templates (id, name, title_template, prompt_template, pipeline_steps, default_agent_definition_id, max_retries) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(&new.name)
    .bind(&new.title_template)
    .bind(&new.prompt_template)
    .bind(new.pipeline_steps.as_ref().map(Json))
    .bind(new.default_agent_definition_id)
    .bind(new.max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert template")
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Template>> {
    sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch template")
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Template>> {
    sqlx::query_as::<_, Template>("SELECT * FROM templates ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list templates")
}
