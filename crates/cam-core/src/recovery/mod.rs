//! Recovery Loop (SPEC_FULL.md §4.6): stale-worker detection plus the
//! orphan-cleanup delete path.
//!
//! Grounded on the teacher's `orchestrator/mod.rs::reset_orphaned_tasks` and
//! `state/dispatch.rs`'s bump/overflow branching, reworked from an
//! in-process timer tied to agent execution into a pool-driven pass that can
//! be invoked on a `tokio::time::interval` or on demand (worker `offline`
//! reuses the same requeue path).

use cam_db::models::TaskStatus;
use cam_db::queries::{events as events_db, task_logs, tasks as task_db, workers as worker_db};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{event_type, EventBus};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 90_000;
const MAX_DELETE_ATTEMPTS: u32 = 3;

/// Why a task is being requeued/escalated, so the emitted event's `reason`
/// matches SPEC_FULL.md §4.4's wording for each trigger.
#[derive(Debug, Clone, Copy)]
pub enum StaleReason {
    /// The Recovery Loop's own timer found a stale heartbeat.
    StaleSweep,
    /// An operator issued `PATCH /api/workers/:id {action: offline}`.
    ManualOffline,
}

impl StaleReason {
    fn requeued(&self) -> &'static str {
        match self {
            Self::StaleSweep => "worker_stale",
            Self::ManualOffline => "worker_offline_manual",
        }
    }

    fn retries_exhausted(&self) -> &'static str {
        match self {
            Self::StaleSweep => "worker_stale_retries_exhausted",
            Self::ManualOffline => "worker_offline_manual",
        }
    }
}

/// One pass: offline every worker whose heartbeat is older than
/// `stale_threshold_ms`, requeuing whatever `running` task it held.
pub async fn sweep_stale_workers(
    pool: &SqlitePool,
    bus: &EventBus,
    stale_threshold_ms: i64,
) -> Result<usize> {
    let now = Utc::now();
    let stale = worker_db::list_stale_workers(pool, now, stale_threshold_ms).await?;
    let count = stale.len();

    for worker in stale {
        if let Some(task_id) = worker.current_task_id {
            requeue_stale_task(pool, bus, task_id, StaleReason::StaleSweep).await?;
        }
        worker_db::mark_offline(pool, &worker.id).await?;
        bus.emit(
            pool,
            event_type::WORKER_OFFLINE,
            None,
            json!({"workerId": worker.id, "reason": "stale_heartbeat"}),
        )
        .await?;
    }

    Ok(count)
}

/// Requeues a single `running` task abandoned by a worker that went stale or
/// offline. Bumps `retryCount`; if retries are already exhausted, escalates
/// straight to `failed` instead of requeuing.
pub async fn requeue_stale_task(
    pool: &SqlitePool,
    bus: &EventBus,
    task_id: Uuid,
    reason: StaleReason,
) -> Result<()> {
    let Some(task) = task_db::get_task(pool, task_id).await? else {
        return Ok(());
    };
    if task.status != TaskStatus::Running {
        return Ok(());
    }

    let now = Utc::now();
    if task.retry_count >= task.max_retries {
        if task_db::finish_fail(pool, task_id, now).await?.is_some() {
            bus.emit(
                pool,
                event_type::TASK_FAILED,
                None,
                json!({"taskId": task_id, "reason": reason.retries_exhausted()}),
            )
            .await?;
        }
    } else if task_db::restart_to_queued(pool, task_id, TaskStatus::Running, true, now).await? > 0 {
        bus.emit(
            pool,
            event_type::TASK_REQUEUED,
            None,
            json!({"taskId": task_id, "reason": reason.requeued()}),
        )
        .await?;
    }

    Ok(())
}

/// Deletes a task and everything that references it: log lines, its
/// `dependsOn` references from sibling tasks, the audit events whose payload
/// names it, and finally the row itself. Retries a bounded number of times
/// if a concurrent writer causes the sequence to observe a partial state.
pub async fn delete_task(pool: &SqlitePool, task_id: Uuid) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_delete_task(pool, task_id).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < MAX_DELETE_ATTEMPTS => {
                tracing::warn!(task_id = %task_id, attempt, error = %err, "retrying task delete");
                continue;
            }
            Err(err) => return Err(crate::error::CamError::Internal(err)),
        }
    }
}

async fn try_delete_task(pool: &SqlitePool, task_id: Uuid) -> anyhow::Result<()> {
    task_logs::delete_for_task(pool, task_id).await?;
    task_db::strip_dependency_references(pool, task_id).await?;
    events_db::delete_events_for_task(pool, &task_id.to_string()).await?;
    task_db::delete_task_row(pool, task_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_default_is_ninety_seconds() {
        assert_eq!(DEFAULT_STALE_THRESHOLD_MS, 90_000);
    }
}
