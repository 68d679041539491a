//! Database query functions for the `system_events` audit log (SPEC_FULL.md §4.5).

use anyhow::{Context, Result};
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::models::SystemEvent;

/// Append one event to the audit log. Insertion order is the authoritative
/// replay order (SPEC_FULL.md §4.5, §5 ordering guarantee).
pub async fn insert_event(
    pool: &SqlitePool,
    event_type: &str,
    actor: Option<&str>,
    payload: &serde_json::Value,
) -> Result<SystemEvent> {
    sqlx::query_as::<_, SystemEvent>(
        "INSERT INTO system_events (event_type, actor, payload) VALUES (?, ?, ?) RETURNING *",
    )
    .bind(event_type)
    .bind(actor)
    .bind(Json(payload))
    .fetch_one(pool)
    .await
    .context("failed to append system event")
}

/// Filter used by `GET /api/events` / `GET /api/events/stream`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Matches event types with this dotted prefix, e.g. `"task."`.
    pub type_prefix: Option<String>,
    pub task_id: Option<String>,
    pub group_id: Option<String>,
    pub since_id: Option<i64>,
    pub limit: i64,
}

pub async fn list_events(pool: &SqlitePool, filter: &EventFilter) -> Result<Vec<SystemEvent>> {
    let limit = if filter.limit > 0 { filter.limit } else { 200 };

    let events = match (&filter.type_prefix, &filter.task_id, &filter.group_id, filter.since_id) {
        (None, None, None, None) => {
            sqlx::query_as::<_, SystemEvent>("SELECT * FROM system_events ORDER BY id ASC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await
        }
        (Some(prefix), None, None, None) => sqlx::query_as::<_, SystemEvent>(
            "SELECT * FROM system_events WHERE event_type LIKE ? ORDER BY id ASC LIMIT ?",
        )
        .bind(format!("{prefix}%"))
        .bind(limit)
        .fetch_all(pool)
        .await,
        (None, Some(task_id), None, None) => sqlx::query_as::<_, SystemEvent>(
            "SELECT * FROM system_events WHERE json_extract(payload, '$.taskId') = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await,
        (None, None, Some(group_id), None) => sqlx::query_as::<_, SystemEvent>(
            "SELECT * FROM system_events WHERE json_extract(payload, '$.groupId') = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(group_id)
        .bind(limit)
        .fetch_all(pool)
        .await,
        (None, None, None, Some(since_id)) => sqlx::query_as::<_, SystemEvent>(
            "SELECT * FROM system_events WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(since_id)
        .bind(limit)
        .fetch_all(pool)
        .await,
        (Some(prefix), Some(task_id), None, None) => sqlx::query_as::<_, SystemEvent>(
            "SELECT * FROM system_events WHERE event_type LIKE ? AND json_extract(payload, '$.taskId') = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(format!("{prefix}%"))
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await,
        _ => {
            // Combinations beyond the common cases above fall back to an
            // unfiltered tail; the HTTP layer only ever constructs the shapes
            // handled explicitly.
            sqlx::query_as::<_, SystemEvent>("SELECT * FROM system_events ORDER BY id ASC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    };

    events.context("failed to list system events")
}

/// Events whose payload references `task_id`, deleted as part of the delete
/// cascade for a task (SPEC_FULL.md §4.6).
pub async fn delete_events_for_task(pool: &SqlitePool, task_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM system_events WHERE json_extract(payload, '$.taskId') = ?")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete task events")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_filter_default_limit_is_applied_by_caller() {
        let filter = EventFilter::default();
        assert_eq!(filter.limit, 0);
    }
}
