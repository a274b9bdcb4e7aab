use crawlhub_core::events::{ProgressEvent, PushEvent, TerminalNotice};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Bounded per-subscriber queue. Progress events are droppable under
/// pressure (oldest first); terminal events are always delivered and close
/// the stream.
#[derive(Clone)]
struct PushQueue {
    inner: Arc<Mutex<VecDeque<PushEvent>>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl PushQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            capacity,
        }
    }

    fn push_progress(&self, event: PushEvent) {
        let mut queue = self.inner.lock().expect("fanout queue poisoned");
        if queue.len() >= self.capacity {
            // Shed the oldest progress event; terminal events are kept.
            if let Some(idx) = queue.iter().position(|e| !e.is_terminal()) {
                queue.remove(idx);
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn push_terminal(&self, event: PushEvent) {
        let mut queue = self.inner.lock().expect("fanout queue poisoned");
        queue.push_back(event);
        drop(queue);
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<PushEvent> {
        self.inner.lock().expect("fanout queue poisoned").pop_front()
    }

    fn is_drained(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            && self.inner.lock().expect("fanout queue poisoned").is_empty()
    }
}

/// Receiving half handed to a subscribed client. Yields progress events and
/// ends after the terminal event.
pub struct PushStream {
    queue: PushQueue,
}

impl PushStream {
    pub async fn recv(&mut self) -> Option<PushEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.is_drained() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

struct JobSubscriber {
    user_id: Uuid,
    queue: PushQueue,
}

/// Routes selected bus events to real-time subscribers keyed by job.
pub struct ProgressFanout {
    subscribers: RwLock<HashMap<Uuid, Vec<JobSubscriber>>>,
    queue_capacity: usize,
}

impl Default for ProgressFanout {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ProgressFanout {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    pub async fn subscribe(&self, job_id: Uuid, user_id: Uuid) -> PushStream {
        let queue = PushQueue::new(self.queue_capacity);
        let stream = PushStream {
            queue: queue.clone(),
        };
        self.subscribers
            .write()
            .await
            .entry(job_id)
            .or_default()
            .push(JobSubscriber { user_id, queue });
        debug!(%job_id, %user_id, "subscriber attached");
        stream
    }

    pub async fn publish_progress(&self, event: &ProgressEvent) {
        let subscribers = self.subscribers.read().await;
        if let Some(list) = subscribers.get(&event.job_id) {
            for subscriber in list {
                subscriber
                    .queue
                    .push_progress(PushEvent::Progress(event.clone()));
            }
        }
    }

    /// Terminal delivery happens only after the result rows are persisted;
    /// the job's subscription list is dropped afterwards.
    pub async fn publish_terminal(&self, notice: &TerminalNotice) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.remove(&notice.job_id) {
            for subscriber in list {
                subscriber
                    .queue
                    .push_terminal(PushEvent::Terminal(notice.clone()));
                debug!(job_id = %notice.job_id, user_id = %subscriber.user_id, "terminal event delivered");
            }
        }
    }

    pub async fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.subscribers
            .read()
            .await
            .get(&job_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlhub_core::JobStatus;

    fn progress(job_id: Uuid, seq: i64) -> ProgressEvent {
        ProgressEvent {
            job_id,
            seq,
            phase: "crawling".to_string(),
            urls_processed: seq as i32,
            urls_successful: seq as i32,
            urls_failed: 0,
            message: None,
        }
    }

    fn terminal(job_id: Uuid) -> TerminalNotice {
        TerminalNotice {
            job_id,
            status: JobStatus::Completed,
            urls_processed: 10,
            urls_successful: 10,
            urls_failed: 0,
            total_bytes: 1024,
            error: None,
        }
    }

    #[tokio::test]
    async fn delivers_progress_then_terminal_and_closes() {
        let fanout = ProgressFanout::new(8);
        let job_id = Uuid::new_v4();
        let mut stream = fanout.subscribe(job_id, Uuid::new_v4()).await;

        fanout.publish_progress(&progress(job_id, 1)).await;
        fanout.publish_terminal(&terminal(job_id)).await;

        assert!(matches!(
            stream.recv().await,
            Some(PushEvent::Progress(p)) if p.seq == 1
        ));
        assert!(matches!(stream.recv().await, Some(PushEvent::Terminal(_))));
        assert!(stream.recv().await.is_none());
        assert_eq!(fanout.subscriber_count(job_id).await, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_progress_never_terminal() {
        let fanout = ProgressFanout::new(2);
        let job_id = Uuid::new_v4();
        let mut stream = fanout.subscribe(job_id, Uuid::new_v4()).await;

        fanout.publish_progress(&progress(job_id, 1)).await;
        fanout.publish_progress(&progress(job_id, 2)).await;
        fanout.publish_progress(&progress(job_id, 3)).await;
        fanout.publish_terminal(&terminal(job_id)).await;

        // seq 1 was shed; 2 and 3 survive, terminal always arrives
        assert!(matches!(
            stream.recv().await,
            Some(PushEvent::Progress(p)) if p.seq == 2
        ));
        assert!(matches!(
            stream.recv().await,
            Some(PushEvent::Progress(p)) if p.seq == 3
        ));
        assert!(matches!(stream.recv().await, Some(PushEvent::Terminal(_))));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn events_for_other_jobs_are_not_delivered() {
        let fanout = ProgressFanout::new(8);
        let job_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut stream = fanout.subscribe(job_id, Uuid::new_v4()).await;

        fanout.publish_progress(&progress(other, 1)).await;
        fanout.publish_terminal(&terminal(job_id)).await;

        assert!(matches!(stream.recv().await, Some(PushEvent::Terminal(_))));
    }
}
