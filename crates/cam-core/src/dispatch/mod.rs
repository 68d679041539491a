//! Dispatcher: the claim protocol of SPEC_FULL.md §4.2.
//!
//! Grounded on the teacher's orchestrator claim/rollback pattern
//! (`orchestrator/mod.rs`), reworked from an in-process spawn loop into a
//! single `next_task` call answering one `GET /api/workers/:id/next-task`
//! request.

use cam_db::models::{AgentDefinition, Task, TaskStatus, WorkerStatus};
use cam_db::queries::{agent_definitions, tasks as task_db, workers as worker_db};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::adapters::SecretResolver;
use crate::error::Result;
use crate::events::{event_type, EventBus};

/// A claimed unit of work, handed back to the worker that called
/// `next_task`.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub agent_definition: AgentDefinition,
    pub env: HashMap<String, String>,
}

enum Readiness {
    Ready,
    Pending,
    Blocked,
}

fn classify_readiness(dep_statuses: &[(uuid::Uuid, TaskStatus)], dep_count: usize) -> Readiness {
    if dep_statuses.len() < dep_count {
        return Readiness::Blocked; // a dependency id no longer exists
    }
    if dep_statuses
        .iter()
        .any(|(_, s)| matches!(s, TaskStatus::Failed | TaskStatus::Cancelled))
    {
        return Readiness::Blocked;
    }
    if dep_statuses.iter().all(|(_, s)| *s == TaskStatus::Completed) {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

/// Runs the full claim algorithm for one worker request. Returns `Ok(None)`
/// when there is nothing to claim (worker not idle, or no candidate reaches
/// the claim step), never an error for that case.
pub async fn next_task(
    pool: &SqlitePool,
    bus: &EventBus,
    worker_id: &str,
    secrets: &dyn SecretResolver,
) -> Result<Option<ClaimedTask>> {
    // Step 1: load worker, require idle.
    let worker = match worker_db::get_worker(pool, worker_id).await? {
        Some(w) if w.status == WorkerStatus::Idle => w,
        _ => return Ok(None),
    };

    // Step 2-3: candidate window, ordered and capped.
    let supported = if worker.supported_agent_ids.0.is_empty() {
        None
    } else {
        Some(worker.supported_agent_ids.0.as_slice())
    };
    let candidates = task_db::list_dispatch_candidates(pool, supported).await?;

    for candidate in candidates {
        // Step 4: dependency readiness.
        let dep_ids = &candidate.depends_on.0;
        let dep_statuses = task_db::get_statuses(pool, dep_ids).await?;
        match classify_readiness(&dep_statuses, dep_ids.len()) {
            Readiness::Blocked => {
                let now = Utc::now();
                if task_db::dependency_blocked(
                    pool,
                    candidate.id,
                    candidate.status,
                    "one or more dependencies failed, were cancelled, or no longer exist",
                    now,
                )
                .await?
                .is_some()
                {
                    bus.emit(
                        pool,
                        event_type::TASK_DEPENDENCY_BLOCKED,
                        None,
                        json!({"taskId": candidate.id}),
                    )
                    .await?;
                }
                continue;
            }
            Readiness::Pending => {
                if candidate.status == TaskStatus::Queued {
                    let _ = task_db::demote_task(pool, candidate.id).await?;
                }
                continue;
            }
            Readiness::Ready => {}
        }

        // Step 5: claim the task.
        let now = Utc::now();
        let Some(claimed) =
            task_db::claim_task(pool, candidate.id, candidate.status, worker_id, now).await?
        else {
            continue; // lost the race to another worker
        };

        // Step 6: bind the worker.
        if worker_db::bind_task(pool, worker_id, claimed.id).await? == 0 {
            // Another concurrent call already bound this worker; roll the task back.
            task_db::rollback_claim(pool, claimed.id).await?;
            continue;
        }

        // Step 7: resolve AgentDefinition.
        let Some(agent_definition) =
            agent_definitions::get(pool, claimed.agent_definition_id).await?
        else {
            task_db::finish_fail(pool, claimed.id, Utc::now()).await?;
            worker_db::release_task(pool, worker_id, WorkerStatus::Idle, Some(false)).await?;
            bus.emit(
                pool,
                event_type::TASK_FAILED,
                None,
                json!({"taskId": claimed.id, "reason": "agent_definition_not_found"}),
            )
            .await?;
            continue;
        };

        // Step 8: resolve environment through the SecretResolver (worker-
        // reported env first, core process env as fallback). No per-worker
        // env values are tracked yet, so `worker_env` is empty for now and
        // every lookup falls through to the resolver's process-env branch.
        let worker_env = HashMap::new();
        let env = resolve_env(&agent_definition, &claimed, secrets, &worker_env).await;

        bus.emit(
            pool,
            event_type::TASK_STARTED,
            None,
            json!({"taskId": claimed.id, "workerId": worker_id}),
        )
        .await?;

        return Ok(Some(ClaimedTask {
            task: claimed,
            agent_definition,
            env,
        }));
    }

    Ok(None)
}

async fn resolve_env(
    agent_definition: &AgentDefinition,
    _task: &Task,
    secrets: &dyn SecretResolver,
    worker_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for required in &agent_definition.required_env_vars.0 {
        if let Some(value) = secrets.resolve(worker_env, &required.name).await {
            env.insert(required.name.clone(), value);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn readiness_blocked_on_missing_dependency() {
        let id = Uuid::new_v4();
        let statuses = vec![(id, TaskStatus::Completed)];
        assert!(matches!(classify_readiness(&statuses, 2), Readiness::Blocked));
    }

    #[test]
    fn readiness_blocked_on_failed_dependency() {
        let id = Uuid::new_v4();
        let statuses = vec![(id, TaskStatus::Failed)];
        assert!(matches!(classify_readiness(&statuses, 1), Readiness::Blocked));
    }

    #[test]
    fn readiness_pending_on_running_dependency() {
        let id = Uuid::new_v4();
        let statuses = vec![(id, TaskStatus::Running)];
        assert!(matches!(classify_readiness(&statuses, 1), Readiness::Pending));
    }

    #[test]
    fn readiness_ready_when_all_completed() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let statuses = vec![(a, TaskStatus::Completed), (b, TaskStatus::Completed)];
        assert!(matches!(classify_readiness(&statuses, 2), Readiness::Ready));
    }

    #[test]
    fn readiness_ready_with_no_dependencies() {
        let statuses: Vec<(Uuid, TaskStatus)> = vec![];
        assert!(matches!(classify_readiness(&statuses, 0), Readiness::Ready));
    }
}
