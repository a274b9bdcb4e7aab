use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

// Custom enum types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
            // Failed is terminal only once retries are exhausted; the
            // scheduler decides that, so it is not terminal here.
    }
}

// Declaration order matters: dispatch sorts `ORDER BY priority DESC`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq, PartialOrd, Ord)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "worker_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    HttpClient,
    HeadlessBrowser,
    MobileBridge,
    Intelligent,
    Universal,
}

/// Worker kind as requested at submission; `Auto` is resolved during
/// admission and never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestedWorkerKind {
    Auto,
    HttpClient,
    HeadlessBrowser,
    MobileBridge,
    Intelligent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "agent_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Draining,
    Unhealthy,
    Retired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "participant_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Collaborator,
    Viewer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "access_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Private,
    Group,
    Assignment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Enterprise,
}

/// Authenticated caller identity, injected by the front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: UserRole,
    pub tier: SubscriptionTier,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

// Crawl job model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CrawlJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub assignment_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub urls: Vec<String>,
    pub prompt: String,
    pub max_pages: Option<i32>,
    pub worker_kind: WorkerKind,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub access_level: AccessLevel,
    pub assigned_agent_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub extraction_strategy: Option<serde_json::Value>,
    pub navigation_plan: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub last_seen_seq: i64,
    pub urls_processed: i32,
    pub urls_successful: i32,
    pub urls_failed: i32,
    pub total_bytes: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    /// Units never handed to a worker; this is what a refund returns.
    pub fn unprocessed_units(&self) -> i64 {
        (self.urls.len() as i64 - self.urls_processed as i64).max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCrawlJob {
    pub user_id: Uuid,
    pub assignment_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub urls: Vec<String>,
    pub prompt: String,
    pub max_pages: Option<i32>,
    pub worker_kind: WorkerKind,
    pub priority: JobPriority,
    pub access_level: AccessLevel,
    pub template_id: Option<Uuid>,
    pub extraction_strategy: Option<serde_json::Value>,
    pub navigation_plan: Option<serde_json::Value>,
    pub max_retries: i32,
}

// Per-URL result rows, written once when the terminal event lands
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CrawlResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub url: String,
    pub success: bool,
    pub http_status: Option<i32>,
    pub content_size: Option<i64>,
    pub content_hash: Option<String>,
    pub extracted: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCrawlResult {
    pub job_id: Uuid,
    pub url: String,
    pub success: bool,
    pub http_status: Option<i32>,
    pub content_size: Option<i64>,
    pub content_hash: Option<String>,
    pub extracted: Option<serde_json::Value>,
    pub error: Option<String>,
}

// Agent pool slot
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub instance_id: String,
    pub owner_user_id: Option<Uuid>,
    pub worker_kind: WorkerKind,
    pub status: AgentStatus,
    pub endpoint: String,
    pub max_concurrent: i32,
    pub current_job_count: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub health_message: Option<String>,
    pub jobs_succeeded: i64,
    pub jobs_failed: i64,
    pub auto_scaled: bool,
    pub scheduled_for_removal_at: Option<DateTime<Utc>>,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent <= 0 {
            return 1.0;
        }
        self.current_job_count as f64 / self.max_concurrent as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgent {
    pub instance_id: String,
    pub owner_user_id: Option<Uuid>,
    pub worker_kind: WorkerKind,
    pub endpoint: String,
    pub max_concurrent: i32,
    pub auto_scaled: bool,
}

// Auto-scaling policy, one row per (user, worker kind)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScalingPolicy {
    pub id: Uuid,
    pub user_id: Uuid,
    pub worker_kind: WorkerKind,
    pub min_agents: i32,
    pub max_agents: i32,
    pub target_agents: i32,
    pub auto_scaling_enabled: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_secs: i64,
    pub scale_down_cooldown_secs: i64,
    pub max_hourly_cost: f64,
    pub pause_when_limit_reached: bool,
    pub last_scale_up_at: Option<DateTime<Utc>>,
    pub last_scale_down_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Per-user quota ledger snapshot
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaSnapshot {
    pub user_id: Uuid,
    pub quota_limit: i64,
    pub quota_used: i64,
    pub reset_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub source: String,
    pub override_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    pub fn remaining(&self) -> i64 {
        (self.quota_limit - self.quota_used).max(0)
    }
}

// Outbox row, co-written with every externally visible state change
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_type: String,
    pub entity_id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dead_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Participant {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub watching: bool,
    pub last_viewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// Reusable extraction specs, matched to URLs by domain pattern
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub domain_pattern: String,
    pub version: i32,
    pub active: bool,
    pub extraction: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NavigationStrategy {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub active: bool,
    pub plan: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// Group membership mirror, maintained from classroom.events
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

// Ingress DTOs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub urls: Vec<String>,
    pub prompt: String,
    pub template_id: Option<Uuid>,
    pub navigation_strategy_id: Option<Uuid>,
    pub worker_kind: Option<RequestedWorkerKind>,
    pub assignment_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub access_level: Option<AccessLevel>,
    pub priority: Option<JobPriority>,
    pub max_pages: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub total_bytes: i64,
    pub results: Vec<CrawlResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithResults {
    #[serde(flatten)]
    pub job: CrawlJob,
    pub results: ResultsSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn unprocessed_units_never_go_negative() {
        let mut job = CrawlJob {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            assignment_id: None,
            group_id: None,
            conversation_id: None,
            urls: vec!["https://a.test/x".into(), "https://a.test/y".into()],
            prompt: "extract".into(),
            max_pages: None,
            worker_kind: WorkerKind::HttpClient,
            priority: JobPriority::Normal,
            status: JobStatus::Running,
            access_level: AccessLevel::Private,
            assigned_agent_id: None,
            template_id: None,
            extraction_strategy: None,
            navigation_plan: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            cancel_requested_at: None,
            last_seen_seq: 0,
            urls_processed: 1,
            urls_successful: 1,
            urls_failed: 0,
            total_bytes: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: Utc::now(),
            version: 0,
            deleted_at: None,
        };
        assert_eq!(job.unprocessed_units(), 1);

        job.urls_processed = 5;
        assert_eq!(job.unprocessed_units(), 0);
    }

    #[test]
    fn quota_remaining_is_clamped() {
        let snapshot = QuotaSnapshot {
            user_id: Uuid::new_v4(),
            quota_limit: 10,
            quota_used: 10,
            reset_at: None,
            synced_at: None,
            source: "upstream".into(),
            override_active: false,
            updated_at: Utc::now(),
        };
        assert_eq!(snapshot.remaining(), 0);
    }

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(JobPriority::Urgent > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn agent_load_ratio_handles_zero_capacity() {
        let agent = Agent {
            id: Uuid::new_v4(),
            instance_id: "crawler-1".into(),
            owner_user_id: None,
            worker_kind: WorkerKind::Universal,
            status: AgentStatus::Available,
            endpoint: "http://crawler-1:9000".into(),
            max_concurrent: 0,
            current_job_count: 0,
            last_heartbeat: Utc::now(),
            health_message: None,
            jobs_succeeded: 0,
            jobs_failed: 0,
            auto_scaled: false,
            scheduled_for_removal_at: None,
            last_assigned_at: None,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(agent.load_ratio(), 1.0);
    }
}
