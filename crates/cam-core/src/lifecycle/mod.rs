//! Task Lifecycle: the state machine transitions of SPEC_FULL.md §4.1.
//!
//! Every function here is a thin wrapper: validate preconditions, issue the
//! CAS write via `cam_db::queries::tasks`, and emit the matching
//! `SystemEvent` through the [`EventBus`] once the write lands. A `0` rows
//! result from the CAS means the row moved under us; that is surfaced as
//! [`CamError::StateConflict`], never retried silently.

use cam_db::models::{Task, TaskStatus};
use cam_db::queries::tasks as db;
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{CamError, Result};
use crate::events::{event_type, EventBus};

/// `draft -> queued`.
pub async fn publish(pool: &SqlitePool, bus: &EventBus, task_id: Uuid) -> Result<Task> {
    let now = Utc::now();
    let task = db::publish_task(pool, task_id, now)
        .await?
        .ok_or_else(|| CamError::state_conflict(task_id, "not draft", "draft"))?;

    bus.emit(
        pool,
        event_type::TASK_PUBLISHED,
        None,
        json!({"taskId": task_id, "previousStatus": "draft"}),
    )
    .await?;

    Ok(task)
}

/// `queued -> waiting`, because a dependency is not yet satisfied.
pub async fn demote(pool: &SqlitePool, bus: &EventBus, task_id: Uuid) -> Result<()> {
    let rows = db::demote_task(pool, task_id).await?;
    if rows == 0 {
        return Ok(()); // already waiting or moved on; demote is not user-facing, so this is a no-op
    }
    bus.emit(
        pool,
        event_type::TASK_WAITING,
        None,
        json!({"taskId": task_id, "previousStatus": "queued"}),
    )
    .await?;
    Ok(())
}

/// `waiting -> queued`, because every dependency reached `completed`.
pub async fn promote(pool: &SqlitePool, bus: &EventBus, task_id: Uuid) -> Result<()> {
    let now = Utc::now();
    let rows = db::promote_task(pool, task_id, now).await?;
    if rows == 0 {
        return Ok(());
    }
    bus.emit(
        pool,
        event_type::TASK_PROMOTED,
        None,
        json!({"taskId": task_id, "previousStatus": "waiting"}),
    )
    .await?;
    Ok(())
}

/// `running -> completed` or `running -> awaiting_review`; `to` is decided by
/// the caller from the AgentDefinition's review policy.
pub async fn finish_success(
    pool: &SqlitePool,
    bus: &EventBus,
    task_id: Uuid,
    to: TaskStatus,
    summary: Option<&str>,
    pr_url: Option<&str>,
) -> Result<Task> {
    debug_assert!(matches!(to, TaskStatus::Completed | TaskStatus::AwaitingReview));
    let now = Utc::now();
    let task = db::finish_success(pool, task_id, to, summary, pr_url, now)
        .await?
        .ok_or_else(|| CamError::state_conflict(task_id, "not running", "running"))?;

    let event = if to == TaskStatus::AwaitingReview {
        event_type::TASK_AWAITING_REVIEW
    } else {
        event_type::TASK_COMPLETED
    };
    bus.emit(
        pool,
        event,
        None,
        json!({"taskId": task_id, "previousStatus": "running"}),
    )
    .await?;

    Ok(task)
}

/// `running -> failed`.
pub async fn finish_fail(pool: &SqlitePool, bus: &EventBus, task_id: Uuid) -> Result<Task> {
    let now = Utc::now();
    let task = db::finish_fail(pool, task_id, now)
        .await?
        .ok_or_else(|| CamError::state_conflict(task_id, "not running", "running"))?;

    bus.emit(
        pool,
        event_type::TASK_FAILED,
        None,
        json!({"taskId": task_id, "previousStatus": "running"}),
    )
    .await?;

    Ok(task)
}

/// **cancel**: any non-terminal status -> `cancelled`. Idempotent: cancelling
/// an already-terminal task is a no-op success, matching the PATCH sink rule
/// in SPEC_FULL.md §6.1.
pub async fn cancel(
    pool: &SqlitePool,
    bus: &EventBus,
    task_id: Uuid,
    reason: Option<&str>,
    cascade_from: Option<Uuid>,
) -> Result<Option<Task>> {
    let task = db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| CamError::not_found("task", task_id))?;

    if task.status.is_terminal() {
        return Ok(None);
    }

    let now = Utc::now();
    let cancelled = db::cancel_task(pool, task_id, task.status, now)
        .await?
        .ok_or_else(|| CamError::state_conflict(task_id, task.status.to_string(), "non-terminal"))?;

    let mut payload = json!({
        "taskId": task_id,
        "previousStatus": task.status,
        "reason": reason,
    });
    if let Some(from) = cascade_from {
        payload["cascadeFromTaskId"] = json!(from);
    }
    bus.emit(pool, event_type::TASK_CANCELLED, None, payload).await?;

    cascade_cancel(pool, bus, task_id).await?;

    Ok(Some(cancelled))
}

/// Cancels every reachable downstream task that is still `queued` or
/// `waiting`. Running/terminal downstreams are left untouched.
async fn cascade_cancel(pool: &SqlitePool, bus: &EventBus, root_id: Uuid) -> Result<()> {
    let mut frontier = vec![root_id];
    while let Some(id) = frontier.pop() {
        let dependents = db::get_dependents(pool, id).await?;
        for dependent in dependents {
            if matches!(dependent.status, TaskStatus::Queued | TaskStatus::Waiting) {
                let now = Utc::now();
                if let Some(_cancelled) =
                    db::cancel_task(pool, dependent.id, dependent.status, now).await?
                {
                    bus.emit(
                        pool,
                        event_type::TASK_CANCELLED,
                        None,
                        json!({
                            "taskId": dependent.id,
                            "previousStatus": dependent.status,
                            "cascadeFromTaskId": root_id,
                        }),
                    )
                    .await?;
                    frontier.push(dependent.id);
                }
            }
        }
    }
    Ok(())
}

/// `awaiting_review -> completed`.
pub async fn review_approve(pool: &SqlitePool, bus: &EventBus, task_id: Uuid) -> Result<Task> {
    let now = Utc::now();
    let task = db::review_approve(pool, task_id, now)
        .await?
        .ok_or_else(|| CamError::state_conflict(task_id, "not awaiting_review", "awaiting_review"))?;

    bus.emit(
        pool,
        event_type::TASK_REVIEW_APPROVED,
        None,
        json!({"taskId": task_id, "previousStatus": "awaiting_review"}),
    )
    .await?;

    Ok(task)
}

/// `awaiting_review -> queued` (retry) or `awaiting_review -> failed`
/// (retries exhausted), per the `retryCount < maxRetries` guard.
pub async fn review_reject(
    pool: &SqlitePool,
    bus: &EventBus,
    task_id: Uuid,
    feedback: &str,
) -> Result<Task> {
    if feedback.trim().is_empty() {
        return Err(CamError::InvalidInput("feedback is required to reject a review".into()));
    }

    let task = db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| CamError::not_found("task", task_id))?;
    if task.status != TaskStatus::AwaitingReview {
        return Err(CamError::state_conflict(task_id, task.status.to_string(), "awaiting_review"));
    }

    let now = Utc::now();
    if task.retry_count < task.max_retries {
        let task = db::review_reject_retry(pool, task_id, feedback, now)
            .await?
            .ok_or_else(|| CamError::state_conflict(task_id, "awaiting_review", "awaiting_review"))?;
        bus.emit(
            pool,
            event_type::TASK_REVIEW_REJECTED,
            None,
            json!({"taskId": task_id, "previousStatus": "awaiting_review", "feedback": feedback}),
        )
        .await?;
        Ok(task)
    } else {
        let task = db::review_reject_final(pool, task_id, feedback, now)
            .await?
            .ok_or_else(|| CamError::state_conflict(task_id, "awaiting_review", "awaiting_review"))?;
        bus.emit(
            pool,
            event_type::TASK_REVIEW_REJECTED_MAX_RETRIES,
            None,
            json!({"taskId": task_id, "previousStatus": "awaiting_review", "feedback": feedback}),
        )
        .await?;
        Ok(task)
    }
}

/// **rerun**: any terminal status -> `queued`.
pub async fn rerun(
    pool: &SqlitePool,
    bus: &EventBus,
    task_id: Uuid,
    feedback: Option<&str>,
) -> Result<Task> {
    let task = db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| CamError::not_found("task", task_id))?;
    if !task.status.is_terminal() {
        return Err(CamError::state_conflict(task_id, task.status.to_string(), "terminal"));
    }

    let now = Utc::now();
    let task = db::rerun_task(pool, task_id, task.status, feedback, now)
        .await?
        .ok_or_else(|| CamError::state_conflict(task_id, "terminal", "terminal"))?;

    bus.emit(
        pool,
        event_type::TASK_RERUN_REQUESTED,
        None,
        json!({"taskId": task_id, "feedback": feedback}),
    )
    .await?;

    Ok(task)
}

/// **restart-from(fromTaskId)**: computes the dependency closure downstream
/// of `from_task_id` within `group_id` and resets it per SPEC_FULL.md §4.1.
pub async fn restart_from(
    pool: &SqlitePool,
    bus: &EventBus,
    group_id: &str,
    from_task_id: Uuid,
) -> Result<Vec<Uuid>> {
    let group_tasks = db::list_tasks_for_group(pool, group_id).await?;
    let by_id: std::collections::HashMap<Uuid, &Task> =
        group_tasks.iter().map(|t| (t.id, t)).collect();

    if !by_id.contains_key(&from_task_id) {
        return Err(CamError::not_found("task", from_task_id));
    }

    // Downstream closure via forward edges (dependsOn), restricted to the group.
    let mut closure = std::collections::HashSet::new();
    let mut frontier = vec![from_task_id];
    closure.insert(from_task_id);
    while let Some(id) = frontier.pop() {
        for task in &group_tasks {
            if task.depends_on.0.contains(&id) && closure.insert(task.id) {
                frontier.push(task.id);
            }
        }
    }

    let running_task_ids: Vec<Uuid> = closure
        .iter()
        .filter(|id| by_id.get(*id).map(|t| t.status == TaskStatus::Running).unwrap_or(false))
        .copied()
        .collect();
    if !running_task_ids.is_empty() {
        return Err(CamError::state_conflict_with_running_tasks(
            group_id,
            "running",
            "non-running",
            running_task_ids,
        ));
    }

    let now = Utc::now();
    let mut restarted = Vec::new();
    for id in &closure {
        let task = by_id[id];
        let bump_retry = task.status.is_terminal() || task.status == TaskStatus::AwaitingReview;

        if *id == from_task_id {
            let deps_satisfied = task
                .depends_on
                .0
                .iter()
                .all(|dep_id| by_id.get(dep_id).map(|d| d.status == TaskStatus::Completed).unwrap_or(true));
            if deps_satisfied {
                db::restart_to_queued(pool, *id, task.status, bump_retry, now).await?;
            } else {
                db::restart_to_waiting(pool, *id, task.status, bump_retry).await?;
            }
        } else {
            db::restart_to_waiting(pool, *id, task.status, bump_retry).await?;
        }
        restarted.push(*id);
    }

    bus.emit(
        pool,
        event_type::TASK_GROUP_RESTART_FROM,
        None,
        json!({"groupId": group_id, "fromTaskId": from_task_id, "restarted": restarted}),
    )
    .await?;

    Ok(restarted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_reject_requires_nonempty_feedback() {
        // Exercised at the handler boundary; this just documents the guard's
        // shape without needing a database.
        let feedback = "   ";
        assert!(feedback.trim().is_empty());
    }
}
