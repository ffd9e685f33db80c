// src/fanout/delivery.rs
//
// Outgoing webhook deliveries. Jobs land on a bounded queue and a small
// worker pool drains it; the notification path never waits on a slow
// downstream. A stream (service, event type, broadcaster) never has two
// deliveries in flight at once, so each downstream sees its events in
// arrival order.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{MAX_DELIVERY_ATTEMPTS, OUTGOING_SIGNATURE_HEADER};
use crate::fanout::envelope::Envelope;
use crate::ingress::signature_for;
use crate::repositories::RuntimeStatsRepository;

type StreamKey = (Uuid, String, String);

#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub service_account_id: Uuid,
    pub url: String,
    pub envelope: Envelope,
}

impl DeliveryJob {
    pub fn new(service_account_id: Uuid, url: String, envelope: Envelope) -> Self {
        Self {
            service_account_id,
            url,
            envelope,
        }
    }

    fn stream_key(&self) -> StreamKey {
        let broadcaster = self
            .envelope
            .event
            .get("broadcaster_user_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        (
            self.service_account_id,
            self.envelope.event_type.clone(),
            broadcaster,
        )
    }
}

struct Inner {
    jobs: VecDeque<DeliveryJob>,
    /// Streams with a delivery in flight; their queued jobs wait.
    in_flight: HashSet<StreamKey>,
}

pub struct DeliveryQueue {
    capacity: usize,
    signing_secret: String,
    request_timeout: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, signing_secret: String, request_timeout: Duration) -> Self {
        Self {
            capacity,
            signing_secret,
            request_timeout,
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                in_flight: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, job: DeliveryJob) {
        {
            let mut inner = self.inner.lock().await;
            if inner.jobs.len() >= self.capacity {
                // Shed the oldest job for the same stream; failing that,
                // the global oldest goes.
                let key = job.stream_key();
                let victim = inner
                    .jobs
                    .iter()
                    .position(|queued| queued.stream_key() == key)
                    .unwrap_or(0);
                let dropped = inner.jobs.remove(victim);
                warn!(
                    service = ?dropped.as_ref().map(|j| j.service_account_id),
                    "webhook delivery queue full; dropped oldest job"
                );
            }
            inner.jobs.push_back(job);
        }
        self.notify.notify_one();
    }

    /// Take the oldest job whose stream has nothing in flight, leasing its
    /// stream until `complete` is called.
    pub async fn pop(&self) -> DeliveryJob {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let next = inner
                    .jobs
                    .iter()
                    .position(|job| !inner.in_flight.contains(&job.stream_key()));
                if let Some(idx) = next {
                    let job = inner.jobs.remove(idx).expect("index valid under lock");
                    inner.in_flight.insert(job.stream_key());
                    return job;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release the stream lease taken by `pop`.
    pub async fn complete(&self, job: &DeliveryJob) {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&job.stream_key());
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// Best-effort drain used at shutdown; gives up at the deadline.
    pub async fn wait_until_empty(&self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, async {
            loop {
                {
                    let inner = self.inner.lock().await;
                    if inner.jobs.is_empty() && inner.in_flight.is_empty() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
    }
}

/// Spawn the webhook delivery worker pool.
pub fn spawn_delivery_workers(
    queue: Arc<DeliveryQueue>,
    stats: Arc<dyn RuntimeStatsRepository>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let http = reqwest::Client::builder()
        .timeout(queue.request_timeout)
        .build()
        .expect("reqwest client");

    (0..workers)
        .map(|worker_id| {
            let queue = queue.clone();
            let stats = stats.clone();
            let http = http.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        job = queue.pop() => job,
                        _ = shutdown.changed() => {
                            debug!("delivery worker {worker_id} stopping");
                            return;
                        }
                    };
                    deliver_job(&http, &queue.signing_secret, &stats, &job).await;
                    queue.complete(&job).await;
                }
            })
        })
        .collect()
}

async fn deliver_job(
    http: &reqwest::Client,
    signing_secret: &str,
    stats: &Arc<dyn RuntimeStatsRepository>,
    job: &DeliveryJob,
) {
    let body = job.envelope.to_json_string();
    let signature = signature_for(signing_secret, &[body.as_bytes()]);

    let mut backoff = Duration::from_millis(250);
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        let result = http
            .post(&job.url)
            .header("Content-Type", "application/json")
            .header(OUTGOING_SIGNATURE_HEADER, &signature)
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                if let Err(e) = stats.record_webhook_event(job.service_account_id).await {
                    debug!("Skipping webhook stats update: {e}");
                }
                return;
            }
            Ok(resp) if resp.status().is_client_error() => {
                // 4xx is the downstream telling us no; retrying won't help.
                warn!(
                    service = %job.service_account_id,
                    status = %resp.status(),
                    url = %job.url,
                    "webhook delivery rejected"
                );
                if let Err(e) = stats.record_webhook_failure(job.service_account_id).await {
                    debug!("Skipping webhook stats update: {e}");
                }
                return;
            }
            Ok(resp) => {
                warn!(
                    service = %job.service_account_id,
                    status = %resp.status(),
                    attempt,
                    "webhook delivery failed upstream"
                );
            }
            Err(e) => {
                warn!(
                    service = %job.service_account_id,
                    attempt,
                    "webhook delivery network error: {e}"
                );
            }
        }

        if attempt < MAX_DELIVERY_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    if let Err(e) = stats.record_webhook_failure(job.service_account_id).await {
        debug!("Skipping webhook stats update: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(service: Uuid, event_type: &str, broadcaster: &str, id: &str) -> DeliveryJob {
        DeliveryJob::new(
            service,
            "https://svc.example/hook".into(),
            Envelope::for_notification(
                id,
                event_type,
                json!({"broadcaster_user_id": broadcaster}),
            ),
        )
    }

    #[tokio::test]
    async fn queue_is_fifo_per_stream() {
        let queue = DeliveryQueue::new(8, "secret".into(), Duration::from_secs(5));
        let service = Uuid::new_v4();
        queue.push(job(service, "channel.follow", "1", "m1")).await;
        queue.push(job(service, "channel.follow", "1", "m2")).await;

        let first = queue.pop().await;
        assert_eq!(first.envelope.id, "m1");
        queue.complete(&first).await;
        let second = queue.pop().await;
        assert_eq!(second.envelope.id, "m2");
    }

    #[tokio::test]
    async fn in_flight_stream_blocks_its_later_jobs_but_not_others() {
        let queue = DeliveryQueue::new(8, "secret".into(), Duration::from_secs(5));
        let service = Uuid::new_v4();
        queue.push(job(service, "channel.follow", "1", "m1")).await;
        queue.push(job(service, "channel.follow", "1", "m2")).await;
        queue.push(job(service, "channel.cheer", "1", "m3")).await;

        let first = queue.pop().await;
        assert_eq!(first.envelope.id, "m1");
        // m2 shares m1's stream and must wait; m3 is free.
        let second = queue.pop().await;
        assert_eq!(second.envelope.id, "m3");

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.pop()).await;
        assert!(blocked.is_err(), "same-stream job must wait for the lease");

        queue.complete(&first).await;
        let third = queue.pop().await;
        assert_eq!(third.envelope.id, "m2");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_job_for_same_stream() {
        let queue = DeliveryQueue::new(2, "secret".into(), Duration::from_secs(5));
        let service = Uuid::new_v4();
        queue.push(job(service, "channel.follow", "1", "m1")).await;
        queue.push(job(service, "channel.cheer", "1", "m2")).await;
        // Same (service, type, broadcaster) as m1; m1 is the victim.
        queue.push(job(service, "channel.follow", "1", "m3")).await;

        assert_eq!(queue.len().await, 2);
        let a = queue.pop().await;
        assert_eq!(a.envelope.id, "m2");
        queue.complete(&a).await;
        let b = queue.pop().await;
        assert_eq!(b.envelope.id, "m3");
    }

    #[tokio::test]
    async fn overflow_without_matching_stream_drops_global_oldest() {
        let queue = DeliveryQueue::new(2, "secret".into(), Duration::from_secs(5));
        let service = Uuid::new_v4();
        queue.push(job(service, "channel.follow", "1", "m1")).await;
        queue.push(job(service, "channel.cheer", "1", "m2")).await;
        queue.push(job(service, "channel.raid", "1", "m3")).await;

        let a = queue.pop().await;
        assert_eq!(a.envelope.id, "m2");
        queue.complete(&a).await;
        let b = queue.pop().await;
        assert_eq!(b.envelope.id, "m3");
    }
}
