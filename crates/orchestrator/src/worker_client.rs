use crawlhub_core::bus::{topics, EventBus};
use crawlhub_core::events::ResultEvent;
use crawlhub_core::{Agent, AppError, CrawlJob, WorkerClientConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Body POSTed to an agent's submission endpoint; the agent answers with an
/// acceptance status only, results come back over the bus.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    job_id: Uuid,
    user_id: Uuid,
    urls: &'a [String],
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    navigation_plan: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_pages: Option<i32>,
}

/// Outbound protocol adapter for the crawler worker fleet.
#[derive(Clone)]
pub struct CrawlWorkerClient {
    http: reqwest::Client,
    bus: Arc<dyn EventBus>,
    cfg: WorkerClientConfig,
}

impl CrawlWorkerClient {
    pub fn new(bus: Arc<dyn EventBus>, cfg: WorkerClientConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout))
            .build()?;
        Ok(Self { http, bus, cfg })
    }

    /// Fire-and-forget hand-off. Acceptance only means the worker took the
    /// job; Assigned → Running happens on its first progress event.
    pub async fn submit(&self, agent: &Agent, job: &CrawlJob) -> Result<(), AppError> {
        let url = format!("{}/crawl/submit", agent.endpoint.trim_end_matches('/'));
        let body = SubmitBody {
            job_id: job.id,
            user_id: job.user_id,
            urls: &job.urls,
            prompt: &job.prompt,
            navigation_plan: job.navigation_plan.as_ref(),
            max_pages: job.max_pages,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::WorkerUnavailable(format!("submit to {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::WorkerUnavailable(format!(
                "agent {} refused job {}: HTTP {}",
                agent.instance_id,
                job.id,
                response.status()
            )));
        }

        debug!(job_id = %job.id, agent = %agent.instance_id, "job handed off");
        Ok(())
    }

    /// Best-effort cancel; the engine does not wait on the response body.
    pub async fn cancel(&self, agent: &Agent, job_id: Uuid) {
        let url = format!(
            "{}/crawl/cancel/{}",
            agent.endpoint.trim_end_matches('/'),
            job_id
        );
        match self.http.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(%job_id, agent = %agent.instance_id, "cancel delivered");
            }
            Ok(response) => {
                warn!(%job_id, "cancel refused by {}: HTTP {}", agent.instance_id, response.status());
            }
            Err(e) => warn!(%job_id, "cancel to {} failed: {}", agent.instance_id, e),
        }
    }

    pub async fn health(&self, agent: &Agent) -> bool {
        let url = format!("{}/health", agent.endpoint.trim_end_matches('/'));
        matches!(self.http.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    /// Synchronous variant for small test crawls: subscribe for the terminal
    /// event first, submit, then block until it arrives or the deadline
    /// passes. Production paths never use this.
    pub async fn submit_and_wait(
        &self,
        agent: &Agent,
        job: &CrawlJob,
    ) -> Result<ResultEvent, AppError> {
        let mut subscription = self.bus.subscribe(topics::CRAWL_RESULT).await?;
        self.submit(agent, job).await?;

        let deadline = Duration::from_secs(self.cfg.sync_crawl_deadline_secs);
        let job_key = job.id.to_string();

        let wait = async {
            while let Some(message) = subscription.recv().await {
                if message.key != job_key {
                    continue;
                }
                match serde_json::from_value::<ResultEvent>(message.payload) {
                    Ok(event) => return Ok(event),
                    Err(e) => warn!(job_id = %job.id, "malformed terminal event: {}", e),
                }
            }
            Err(AppError::Bus(crawlhub_core::bus::BusError::Closed))
        };

        match timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "job {} produced no terminal event within {}s",
                job.id, self.cfg.sync_crawl_deadline_secs
            ))),
        }
    }
}
