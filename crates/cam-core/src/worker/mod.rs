//! Worker Registry: registration, heartbeat, and manual lifecycle controls
//! (SPEC_FULL.md §4.4).
//!
//! Grounded on the same CAS idiom as `lifecycle`, applied to `workers` instead
//! of `tasks`. `offline` additionally triggers the same re-queue/bump/overflow
//! policy as the Recovery Loop (`crate::recovery`), since a worker going
//! offline while holding a task is indistinguishable from that worker going
//! stale.

use cam_db::models::{Worker, WorkerMode, WorkerStatus};
use cam_db::queries::workers as db;
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{CamError, Result};
use crate::events::{event_type, EventBus};
use crate::recovery::{requeue_stale_task, StaleReason};

pub struct Registration {
    pub id: String,
    pub name: String,
    pub supported_agent_ids: Vec<Uuid>,
    pub max_concurrent: i32,
    pub mode: WorkerMode,
    pub reported_env_vars: Vec<String>,
}

/// Register or re-register a worker. Re-registration refreshes capability
/// metadata without disturbing `status`/`currentTaskId`/counters.
pub async fn register(pool: &SqlitePool, bus: &EventBus, registration: Registration) -> Result<Worker> {
    let now = Utc::now();
    let worker = db::upsert_worker(
        pool,
        &db::NewWorker {
            id: registration.id,
            name: registration.name,
            supported_agent_ids: registration.supported_agent_ids,
            max_concurrent: registration.max_concurrent,
            mode: registration.mode,
            reported_env_vars: registration.reported_env_vars,
        },
        now,
    )
    .await?;

    bus.emit(
        pool,
        event_type::WORKER_REGISTERED,
        None,
        json!({"workerId": worker.id}),
    )
    .await?;

    Ok(worker)
}

/// Unconditional heartbeat refresh; never fails for a missing worker beyond
/// reporting 0 rows affected, since the caller already knows its own id.
pub async fn heartbeat(pool: &SqlitePool, worker_id: &str) -> Result<()> {
    let now = Utc::now();
    let rows = db::heartbeat(pool, worker_id, now).await?;
    if rows == 0 {
        return Err(CamError::not_found("worker", worker_id));
    }
    Ok(())
}

/// `idle|busy -> draining`: the worker keeps finishing its current task (if
/// any) but is no longer offered new ones.
pub async fn drain(pool: &SqlitePool, bus: &EventBus, worker_id: &str) -> Result<()> {
    let worker = db::get_worker(pool, worker_id)
        .await?
        .ok_or_else(|| CamError::not_found("worker", worker_id))?;
    if matches!(worker.status, WorkerStatus::Offline) {
        return Err(CamError::state_conflict(worker_id, "offline", "idle or busy"));
    }
    db::set_status(pool, worker_id, worker.status, WorkerStatus::Draining).await?;
    bus.emit(
        pool,
        event_type::WORKER_DRAINING,
        None,
        json!({"workerId": worker_id}),
    )
    .await?;
    Ok(())
}

/// `-> idle`: reverses `drain`, or brings a freshly registered worker into
/// service.
pub async fn activate(pool: &SqlitePool, bus: &EventBus, worker_id: &str) -> Result<()> {
    let worker = db::get_worker(pool, worker_id)
        .await?
        .ok_or_else(|| CamError::not_found("worker", worker_id))?;
    db::set_status(pool, worker_id, worker.status, WorkerStatus::Idle).await?;
    bus.emit(
        pool,
        event_type::WORKER_ACTIVATED,
        None,
        json!({"workerId": worker_id}),
    )
    .await?;
    Ok(())
}

/// `-> offline`: clears `currentTaskId` and immediately re-queues any
/// `running` scheduler task this worker was holding, using the same
/// bump/overflow policy the Recovery Loop applies to stale workers.
pub async fn offline(pool: &SqlitePool, bus: &EventBus, worker_id: &str) -> Result<()> {
    let worker = db::get_worker(pool, worker_id)
        .await?
        .ok_or_else(|| CamError::not_found("worker", worker_id))?;

    if let Some(task_id) = worker.current_task_id {
        requeue_stale_task(pool, bus, task_id, StaleReason::ManualOffline).await?;
    }

    db::mark_offline(pool, worker_id).await?;
    bus.emit(
        pool,
        event_type::WORKER_OFFLINE,
        None,
        json!({"workerId": worker_id}),
    )
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, worker_id: &str) -> Result<Worker> {
    db::get_worker(pool, worker_id)
        .await?
        .ok_or_else(|| CamError::not_found("worker", worker_id))
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Worker>> {
    Ok(db::list_workers(pool).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_carries_capability_metadata() {
        let registration = Registration {
            id: "w1".into(),
            name: "worker-1".into(),
            supported_agent_ids: vec![Uuid::nil()],
            max_concurrent: 1,
            mode: WorkerMode::Task,
            reported_env_vars: vec!["GITHUB_TOKEN".into()],
        };
        assert_eq!(registration.supported_agent_ids.len(), 1);
    }
}
