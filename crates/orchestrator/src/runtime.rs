use crawlhub_core::bus::EventBus;
use crawlhub_core::cache::CacheLayer;
use crawlhub_core::{AppError, Config};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admission::AdmissionService;
use crate::autoscaler::AutoScaler;
use crate::bridge::OutboxBridge;
use crate::consumer::BusConsumer;
use crate::dispatcher::Dispatcher;
use crate::fanout::ProgressFanout;
use crate::policy::DomainPolicy;
use crate::pool::AgentPool;
use crate::quota::QuotaLedger;
use crate::scheduler::Scheduler;
use crate::service::JobService;
use crate::worker_client::CrawlWorkerClient;

/// Wires every component of the orchestration core and owns the background
/// loops. Each loop is an independent long-lived task reacting to one
/// cancellation token.
pub struct Engine<C: CacheLayer + 'static> {
    pool: Arc<AgentPool>,
    service: JobService<C>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    autoscaler: Arc<AutoScaler>,
    bridge: OutboxBridge,
    consumer: BusConsumer<C>,
    health_interval: Duration,
}

impl<C: CacheLayer + 'static> Engine<C> {
    pub fn new(
        cfg: &Config,
        db: PgPool,
        cache: Arc<C>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self, AppError> {
        let pool = Arc::new(AgentPool::new(db.clone(), cfg.engine.clone()));
        let worker = Arc::new(CrawlWorkerClient::new(
            Arc::clone(&bus),
            cfg.worker.clone(),
        )?);
        let ledger = Arc::new(QuotaLedger::new(
            db.clone(),
            Arc::clone(&cache),
            cfg.quota.clone(),
        )?);
        let fanout = Arc::new(ProgressFanout::default());

        let admission = Arc::new(AdmissionService::new(
            db.clone(),
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&pool),
            DomainPolicy::new(&cfg.policy),
            cfg.engine.clone(),
            cfg.quota.clone(),
        ));

        let service = JobService::new(
            db.clone(),
            cfg.engine.clone(),
            Arc::clone(&admission),
            Arc::clone(&worker),
            Arc::clone(&fanout),
        );

        let dispatcher = Dispatcher::new(
            db.clone(),
            cfg.engine.clone(),
            Arc::clone(&pool),
            Arc::clone(&worker),
        );
        let scheduler = Scheduler::new(db.clone(), cfg.engine.clone());
        let autoscaler = Arc::new(AutoScaler::new(
            db.clone(),
            cfg.engine.clone(),
            Arc::clone(&pool),
        ));
        let bridge = OutboxBridge::new(db.clone(), Arc::clone(&bus), cfg.engine.clone());
        let consumer = BusConsumer::new(
            db,
            cfg.engine.clone(),
            bus,
            Arc::clone(&fanout),
            Arc::clone(&ledger),
        );

        Ok(Self {
            pool,
            service,
            dispatcher,
            scheduler,
            autoscaler,
            bridge,
            consumer,
            health_interval: Duration::from_secs(cfg.engine.health_interval_secs),
        })
    }

    /// Ingress facade handed to the front door.
    pub fn job_service(&self) -> JobService<C> {
        self.service.clone()
    }

    /// Agent registration/heartbeat surface handed to the worker ingress.
    pub fn agent_pool(&self) -> Arc<AgentPool> {
        Arc::clone(&self.pool)
    }

    /// Spawn every background responsibility. The returned handles finish
    /// once the token is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.dispatcher.run(shutdown.clone())));
        handles.push(tokio::spawn(self.scheduler.run(shutdown.clone())));
        handles.push(tokio::spawn(self.bridge.run(shutdown.clone())));
        handles.push(tokio::spawn(
            Arc::clone(&self.autoscaler).run(shutdown.clone()),
        ));

        let consumer = self.consumer;
        let consumer_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = consumer.run(consumer_shutdown).await {
                error!("bus consumer exited with error: {}", e);
            }
        }));

        let pool = self.pool;
        let health_interval = self.health_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(health_interval);
            info!("health loop started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.tick().await {
                            error!("health tick failed: {}", e);
                        }
                    }
                }
            }
            info!("health loop stopped");
        }));

        handles
    }
}
