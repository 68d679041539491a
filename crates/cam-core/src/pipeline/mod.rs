//! Pipeline Expander (SPEC_FULL.md §4.3).
//!
//! Grounded on `plan/service.rs::create_plan_from_toml`'s "collect missing
//! references, bail before any insert, otherwise insert everything in one
//! transaction" shape. Steps are declared order; a step with no
//! `parallelAgents` is one task, a step with `parallelAgents` fans out to one
//! task per node with a shared `dependsOn` fan-in barrier into the next step.

use cam_db::models::{Task, TaskSource, Template};
use cam_db::queries::agent_definitions;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{CamError, Result};
use crate::events::{event_type, EventBus};

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub repo_url: String,
    pub base_branch: String,
    pub work_branch_stem: String,
    pub group_id: Option<String>,
    pub default_agent_definition_id: Option<Uuid>,
}

/// Expand `template` (must be a pipeline template) into an ordered set of
/// tasks sharing one `groupId`.
pub async fn expand(
    pool: &SqlitePool,
    bus: &EventBus,
    template: &Template,
    request: &PipelineRequest,
) -> Result<Vec<Task>> {
    let Some(steps) = template.pipeline_steps.as_ref().map(|j| &j.0) else {
        return Err(CamError::InvalidInput(format!(
            "template {} is not a pipeline template",
            template.id
        )));
    };
    if steps.len() < 2 {
        return Err(CamError::InvalidInput(
            "pipeline templates require at least 2 steps".into(),
        ));
    }

    // Resolve every step/node's agent definition id up front, in the order
    // node > step > template default > creation request default.
    let mut referenced_ids = Vec::new();
    let mut resolved_steps: Vec<Vec<(String, Option<Uuid>)>> = Vec::new();
    for step in steps {
        let mut nodes = Vec::new();
        if step.parallel_agents.is_empty() {
            let agent_id = step
                .agent_definition_id
                .or(template.default_agent_definition_id)
                .or(request.default_agent_definition_id);
            if let Some(id) = agent_id {
                referenced_ids.push(id);
            }
            nodes.push((step.title.clone(), agent_id));
        } else {
            for node in &step.parallel_agents {
                let agent_id = node
                    .agent_definition_id
                    .or(step.agent_definition_id)
                    .or(template.default_agent_definition_id)
                    .or(request.default_agent_definition_id);
                if let Some(id) = agent_id {
                    referenced_ids.push(id);
                }
                let title = node.title.clone().unwrap_or_else(|| step.title.clone());
                nodes.push((title, agent_id));
            }
        }
        resolved_steps.push(nodes);
    }

    // Validate every referenced id exists before any insert.
    let missing = agent_definitions::missing_ids(pool, &referenced_ids).await?;
    if let Some(first_missing) = missing.first() {
        return Err(CamError::not_found("agentDefinition", first_missing));
    }

    let group_id = request
        .group_id
        .clone()
        .unwrap_or_else(|| format!("pipeline/{}", Uuid::new_v4()));

    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;
    let mut inserted = Vec::new();
    let mut previous_step_ids: Vec<Uuid> = Vec::new();

    for (step, nodes) in steps.iter().zip(resolved_steps.iter()) {
        let mut this_step_ids = Vec::new();
        for (title, agent_id) in nodes {
            // A missing agent_id here means no default resolved anywhere in
            // the chain; treat it the same as an unresolved reference.
            let agent_id = agent_id.ok_or_else(|| {
                CamError::InvalidInput(format!(
                    "step {:?} has no agentDefinitionId and no default was supplied",
                    step.title
                ))
            })?;

            let id = Uuid::new_v4();
            let work_branch = format!("{}/{}", request.work_branch_stem, id);
            let task = sqlx::query_as::<_, Task>(
                "INSERT INTO tasks (id, title, description, agent_definition_id, repo_url, \
                                     base_branch, work_branch, status, source, max_retries, depends_on, group_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'draft', ?, ?, ?, ?) \
                 RETURNING *",
            )
            .bind(id)
            .bind(title)
            .bind(&step.description)
            .bind(agent_id)
            .bind(&request.repo_url)
            .bind(&request.base_branch)
            .bind(&work_branch)
            .bind(TaskSource::Scheduler)
            .bind(template.max_retries)
            .bind(Json(&previous_step_ids))
            .bind(&group_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;

            this_step_ids.push(task.id);
            inserted.push(task);
        }
        previous_step_ids = this_step_ids;
    }

    tx.commit().await.map_err(anyhow::Error::from)?;

    bus.emit(
        pool,
        event_type::PIPELINE_EXPANDED,
        None,
        serde_json::json!({"groupId": group_id, "taskCount": inserted.len()}),
    )
    .await?;

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cam_db::models::{ParallelAgentNode, PipelineStep};

    fn step(title: &str, agent: Option<Uuid>, parallel: Vec<ParallelAgentNode>) -> PipelineStep {
        PipelineStep {
            title: title.to_string(),
            description: String::new(),
            agent_definition_id: agent,
            input_files: vec![],
            input_condition: None,
            parallel_agents: parallel,
        }
    }

    #[test]
    fn single_node_step_has_no_siblings() {
        let s = step("plan", Some(Uuid::nil()), vec![]);
        assert!(s.parallel_agents.is_empty());
    }

    #[test]
    fn parallel_step_fans_out_per_node() {
        let nodes = vec![
            ParallelAgentNode { agent_definition_id: Some(Uuid::nil()), title: Some("a".into()) },
            ParallelAgentNode { agent_definition_id: Some(Uuid::nil()), title: Some("b".into()) },
        ];
        let s = step("review", None, nodes);
        assert_eq!(s.parallel_agents.len(), 2);
    }
}
