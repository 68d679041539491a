use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task, per the state machine in SPEC_FULL.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Queued,
    Waiting,
    Running,
    AwaitingReview,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are monotonic: nothing but `rerun`/`restart-from` leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::AwaitingReview => "awaiting_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "queued" => Ok(Self::Queued),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// Whether a task is under Dispatcher control or was inserted purely as a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Scheduler,
    Terminal,
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduler => "scheduler",
            Self::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskSource {
    type Err = TaskSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(Self::Scheduler),
            "terminal" => Ok(Self::Terminal),
            other => Err(TaskSourceParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSourceParseError(pub String);

impl fmt::Display for TaskSourceParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task source: {:?}", self.0)
    }
}

impl std::error::Error for TaskSourceParseError {}

/// Worker availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "draining" => Ok(Self::Draining),
            "offline" => Ok(Self::Offline),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

/// How a worker process is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Daemon,
    Task,
    Unknown,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Daemon => "daemon",
            Self::Task => "task",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerMode {
    type Err = WorkerModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daemon" => Ok(Self::Daemon),
            "task" => Ok(Self::Task),
            "unknown" => Ok(Self::Unknown),
            other => Err(WorkerModeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerModeParseError(pub String);

impl fmt::Display for WorkerModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker mode: {:?}", self.0)
    }
}

impl std::error::Error for WorkerModeParseError {}

impl Default for WorkerMode {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Where an agent definition's command actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRuntime {
    Native,
    Wsl,
}

impl fmt::Display for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Native => "native",
            Self::Wsl => "wsl",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRuntime {
    type Err = AgentRuntimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            "wsl" => Ok(Self::Wsl),
            other => Err(AgentRuntimeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRuntimeParseError(pub String);

impl fmt::Display for AgentRuntimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent runtime: {:?}", self.0)
    }
}

impl std::error::Error for AgentRuntimeParseError {}

impl Default for AgentRuntime {
    fn default() -> Self {
        Self::Native
    }
}

// ---------------------------------------------------------------------------
// JSON-column payload types
// ---------------------------------------------------------------------------

/// One entry of an [`AgentDefinition`]'s `requiredEnvVars`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredEnvVar {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
}

fn default_true() -> bool {
    true
}

/// Capability flags advertised by an [`AgentDefinition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub non_interactive: bool,
    #[serde(default)]
    pub auto_git_commit: bool,
    #[serde(default)]
    pub output_summary: bool,
    #[serde(default)]
    pub prompt_from_file: bool,
}

/// One node of a pipeline template step's `parallelAgents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelAgentNode {
    pub agent_definition_id: Option<Uuid>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One declared step of a [`PipelineTemplate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub agent_definition_id: Option<Uuid>,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub input_condition: Option<String>,
    #[serde(default)]
    pub parallel_agents: Vec<ParallelAgentNode>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An `agent_definitions` row: the executable contract for a coding agent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: Uuid,
    pub display_name: String,
    pub docker_image: Option<String>,
    pub command: String,
    pub args: Json<Vec<String>>,
    pub required_env_vars: Json<Vec<RequiredEnvVar>>,
    pub capabilities: Json<AgentCapabilities>,
    pub runtime: AgentRuntime,
    pub created_at: DateTime<Utc>,
}

/// A `workers` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub supported_agent_ids: Json<Vec<Uuid>>,
    pub max_concurrent: i32,
    pub mode: WorkerMode,
    pub status: WorkerStatus,
    pub current_task_id: Option<Uuid>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub reported_env_vars: Json<Vec<String>>,
    pub total_tasks_completed: i64,
    pub total_tasks_failed: i64,
    pub uptime_since: DateTime<Utc>,
}

/// A `templates` row. A plain task template has `pipeline_steps = None`; a
/// pipeline template has `Some(steps)` with `steps.len() >= 2`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub title_template: String,
    pub prompt_template: String,
    pub pipeline_steps: Option<Json<Vec<PipelineStep>>>,
    pub default_agent_definition_id: Option<Uuid>,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn is_pipeline(&self) -> bool {
        self.pipeline_steps.is_some()
    }
}

/// A `tasks` row: one unit of work executed by one agent invocation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub agent_definition_id: Uuid,
    pub repo_url: String,
    pub base_branch: String,
    pub work_branch: String,
    pub work_dir: Option<String>,
    pub status: TaskStatus,
    pub source: TaskSource,
    pub retry_count: i32,
    pub max_retries: i32,
    pub depends_on: Json<Vec<Uuid>>,
    pub group_id: Option<String>,
    pub assigned_worker_id: Option<String>,
    pub pr_url: Option<String>,
    pub summary: Option<String>,
    pub log_file_url: Option<String>,
    pub feedback: Option<String>,
    pub review_comment: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A `task_logs` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: Uuid,
    pub line: String,
    pub recorded_at: DateTime<Utc>,
}

/// A `system_events` row: the audit trail for every state transition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub event_type: String,
    pub actor: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        for (s, variant) in [
            ("draft", TaskStatus::Draft),
            ("queued", TaskStatus::Queued),
            ("waiting", TaskStatus::Waiting),
            ("running", TaskStatus::Running),
            ("awaiting_review", TaskStatus::AwaitingReview),
            ("completed", TaskStatus::Completed),
            ("failed", TaskStatus::Failed),
            ("cancelled", TaskStatus::Cancelled),
        ] {
            assert_eq!(TaskStatus::from_str(s).unwrap(), variant);
            assert_eq!(variant.to_string(), s);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!(TaskStatus::from_str("nonexistent").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Draft.is_terminal());
        assert!(!TaskStatus::AwaitingReview.is_terminal());
    }

    #[test]
    fn task_source_roundtrip() {
        assert_eq!(TaskSource::from_str("scheduler").unwrap(), TaskSource::Scheduler);
        assert_eq!(TaskSource::from_str("terminal").unwrap(), TaskSource::Terminal);
        assert_eq!(TaskSource::Scheduler.to_string(), "scheduler");
        assert!(TaskSource::from_str("bogus").is_err());
    }

    #[test]
    fn worker_status_roundtrip() {
        for (s, variant) in [
            ("idle", WorkerStatus::Idle),
            ("busy", WorkerStatus::Busy),
            ("draining", WorkerStatus::Draining),
            ("offline", WorkerStatus::Offline),
        ] {
            assert_eq!(WorkerStatus::from_str(s).unwrap(), variant);
            assert_eq!(variant.to_string(), s);
        }
        assert!(WorkerStatus::from_str("?").is_err());
    }

    #[test]
    fn worker_mode_roundtrip() {
        assert_eq!(WorkerMode::from_str("daemon").unwrap(), WorkerMode::Daemon);
        assert_eq!(WorkerMode::from_str("task").unwrap(), WorkerMode::Task);
        assert_eq!(WorkerMode::from_str("unknown").unwrap(), WorkerMode::Unknown);
        assert!(WorkerMode::from_str("?").is_err());
    }

    #[test]
    fn agent_runtime_roundtrip() {
        assert_eq!(AgentRuntime::from_str("native").unwrap(), AgentRuntime::Native);
        assert_eq!(AgentRuntime::from_str("wsl").unwrap(), AgentRuntime::Wsl);
        assert!(AgentRuntime::from_str("?").is_err());
    }

    #[test]
    fn required_env_var_defaults() {
        let v: RequiredEnvVar = serde_json::from_str(r#"{"name":"API_KEY"}"#).unwrap();
        assert_eq!(v.name, "API_KEY");
        assert!(v.required);
        assert!(!v.sensitive);
    }

    #[test]
    fn template_is_pipeline() {
        let mut t = Template {
            id: Uuid::nil(),
            name: "n".into(),
            title_template: "t".into(),
            prompt_template: "p".into(),
            pipeline_steps: None,
            default_agent_definition_id: None,
            max_retries: 2,
            created_at: Utc::now(),
        };
        assert!(!t.is_pipeline());
        t.pipeline_steps = Some(Json(vec![]));
        assert!(t.is_pipeline());
    }
}
