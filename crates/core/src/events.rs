use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::JobStatus;

/// Event type tags carried by outbox rows and bus envelopes.
pub mod event_types {
    pub const JOB_SUBMITTED: &str = "job.submitted";
    pub const JOB_ASSIGNED: &str = "job.assigned";
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const JOB_CANCELLED: &str = "job.cancelled";
    pub const JOB_RETRIED: &str = "job.retried";
    pub const AGENT_SCALE_UP: &str = "agent.scale_up";
    pub const AGENT_DRAIN: &str = "agent.drain";
    pub const AGENT_RETIRED: &str = "agent.retired";
}

/// Envelope written to the outbox and published on the bus. The `event_id`
/// lets idempotent consumers deduplicate redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub entity_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, entity_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            entity_id,
            occurred_at: Utc::now(),
            data,
        }
    }
}

/// Progress event published by a worker on `crawl.progress`. Sequence
/// numbers are monotonic per job; stale or duplicate deliveries are dropped
/// against the job's stored cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub seq: i64,
    pub phase: String,
    pub urls_processed: i32,
    pub urls_successful: i32,
    pub urls_failed: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Per-URL result carried in the terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerUrlResult {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal event published by a worker on `crawl.result`; ends the job's
/// progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub job_id: Uuid,
    pub seq: i64,
    pub outcome: WorkerOutcome,
    #[serde(default)]
    pub results: Vec<WorkerUrlResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event pushed to a subscribed client by the progress fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEvent {
    Progress(ProgressEvent),
    Terminal(TerminalNotice),
}

impl PushEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PushEvent::Terminal(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalNotice {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub urls_processed: i32,
    pub urls_successful: i32,
    pub urls_failed: i32,
    pub total_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Membership change consumed from `classroom.events` to keep the local
/// authorization mirror current.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassroomEvent {
    MemberAdded { group_id: Uuid, user_id: Uuid },
    MemberRemoved { group_id: Uuid, user_id: Uuid },
}

/// Account change consumed from `user.events`; plan changes trigger a quota
/// resync from the upstream user service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UserEvent {
    PlanChanged { user_id: Uuid },
    QuotaOverrideCleared { user_id: Uuid },
}
