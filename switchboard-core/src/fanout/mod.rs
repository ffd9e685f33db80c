// src/fanout/mod.rs
//
// Downstream delivery: per-service WebSocket connections with bounded
// outboxes, plus a worker pool for outgoing webhook POSTs. Neither path may
// block the notification route.

pub mod delivery;
pub mod envelope;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::FANOUT_QUEUE_DEPTH;
use crate::models::{DeliveryRoute, Interest};
use crate::repositories::RuntimeStatsRepository;

use delivery::{DeliveryJob, DeliveryQueue};
use envelope::Envelope;

/// One accepted /ws/events connection. The route task owns the socket and
/// drains this outbox; the hub only ever pushes frames.
pub struct ServiceSocket {
    pub id: Uuid,
    pub service_account_id: Uuid,
    outbox: Mutex<VecDeque<String>>,
    notify: Notify,
    dropped_frames: AtomicU64,
    closed: AtomicBool,
}

impl ServiceSocket {
    fn new(service_account_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_account_id,
            outbox: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped_frames: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a frame, dropping the oldest one when the outbox is full. The
    /// connection stays alive either way.
    pub async fn push_frame(&self, frame: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut outbox = self.outbox.lock().await;
            if outbox.len() >= FANOUT_QUEUE_DEPTH {
                outbox.pop_front();
                let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    socket = %self.id,
                    dropped,
                    "fan-out outbox full; dropped oldest frame"
                );
            }
            outbox.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Await the next frame to write. Returns None once the socket is
    /// closed and the outbox is drained.
    pub async fn next_frame(&self) -> Option<String> {
        loop {
            {
                let mut outbox = self.outbox.lock().await;
                if let Some(frame) = outbox.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // Stores a permit for a reader that has not parked yet.
        self.notify.notify_one();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

pub struct FanoutHub {
    connections: DashMap<Uuid, Vec<Arc<ServiceSocket>>>,
    delivery: Arc<DeliveryQueue>,
    stats: Arc<dyn RuntimeStatsRepository>,
}

impl FanoutHub {
    pub fn new(delivery: Arc<DeliveryQueue>, stats: Arc<dyn RuntimeStatsRepository>) -> Self {
        Self {
            connections: DashMap::new(),
            delivery,
            stats,
        }
    }

    pub fn delivery_queue(&self) -> Arc<DeliveryQueue> {
        self.delivery.clone()
    }

    pub async fn connect(&self, service_account_id: Uuid) -> Arc<ServiceSocket> {
        let socket = Arc::new(ServiceSocket::new(service_account_id));
        self.connections
            .entry(service_account_id)
            .or_default()
            .push(socket.clone());
        if let Err(e) = self.stats.record_ws_connect(service_account_id).await {
            debug!("Skipping ws-connect stats update: {e}");
        }
        socket
    }

    pub async fn disconnect(&self, socket: &Arc<ServiceSocket>) {
        socket.close();
        let mut drop_entry = false;
        if let Some(mut sockets) = self.connections.get_mut(&socket.service_account_id) {
            sockets.retain(|s| s.id != socket.id);
            drop_entry = sockets.is_empty();
        }
        if drop_entry {
            self.connections
                .remove_if(&socket.service_account_id, |_, sockets| sockets.is_empty());
        }
        if let Err(e) = self.stats.record_ws_disconnect(socket.service_account_id).await {
            debug!("Skipping ws-disconnect stats update: {e}");
        }
    }

    pub fn active_connections(&self, service_account_id: Uuid) -> usize {
        self.connections
            .get(&service_account_id)
            .map(|sockets| sockets.len())
            .unwrap_or(0)
    }

    /// Hand one matched envelope to one interest, on its own transport.
    pub async fn deliver(&self, interest: &Interest, envelope: &Envelope) {
        match &interest.route {
            DeliveryRoute::Ws => {
                self.publish_ws(interest.service_account_id, envelope).await;
            }
            DeliveryRoute::Webhook { url } => {
                self.delivery
                    .push(DeliveryJob::new(
                        interest.service_account_id,
                        url.clone(),
                        envelope.clone(),
                    ))
                    .await;
            }
        }
    }

    async fn publish_ws(&self, service_account_id: Uuid, envelope: &Envelope) {
        let sockets: Vec<Arc<ServiceSocket>> = match self.connections.get(&service_account_id) {
            Some(entry) => entry.clone(),
            None => return,
        };
        let frame = envelope.to_json_string();
        for socket in &sockets {
            socket.push_frame(frame.clone()).await;
        }
        if let Err(e) = self.stats.record_ws_event(service_account_id).await {
            debug!("Skipping ws-event stats update: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DELIVERY_QUEUE_DEPTH, WEBHOOK_DELIVERY_TIMEOUT};
    use crate::models::DeliveryRoute;
    use crate::repositories::RuntimeStatsRepository;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    struct NullStats;

    #[async_trait]
    impl RuntimeStatsRepository for NullStats {
        async fn record_ws_connect(&self, _: Uuid) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn record_ws_disconnect(&self, _: Uuid) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn record_ws_event(&self, _: Uuid) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn record_webhook_event(&self, _: Uuid) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn record_webhook_failure(&self, _: Uuid) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn record_api_request(&self, _: Uuid) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn reset_connection_counts(&self) -> Result<(), crate::Error> {
            Ok(())
        }
    }

    fn hub() -> FanoutHub {
        let queue = Arc::new(DeliveryQueue::new(
            DELIVERY_QUEUE_DEPTH,
            "test-signing-secret".into(),
            WEBHOOK_DELIVERY_TIMEOUT,
        ));
        FanoutHub::new(queue, Arc::new(NullStats))
    }

    fn ws_interest(service: Uuid) -> Interest {
        let now = Utc::now();
        Interest {
            id: Uuid::new_v4(),
            service_account_id: service,
            bot_account_id: Uuid::new_v4(),
            event_type: "channel.follow".into(),
            broadcaster_user_id: "123".into(),
            route: DeliveryRoute::Ws,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: now,
        }
    }

    #[tokio::test]
    async fn delivered_frames_reach_every_connection_in_order() {
        let hub = hub();
        let service = Uuid::new_v4();
        let a = hub.connect(service).await;
        let b = hub.connect(service).await;
        assert_eq!(hub.active_connections(service), 2);

        let interest = ws_interest(service);
        for n in 0..3 {
            let env = Envelope::for_notification(&format!("m{n}"), "channel.follow", json!({}));
            hub.deliver(&interest, &env).await;
        }
        for socket in [&a, &b] {
            for n in 0..3 {
                let frame = socket.next_frame().await.unwrap();
                assert!(frame.contains(&format!("\"m{n}\"")));
            }
        }
    }

    #[tokio::test]
    async fn outbox_overflow_drops_oldest_and_keeps_connection() {
        let hub = hub();
        let service = Uuid::new_v4();
        let socket = hub.connect(service).await;
        let interest = ws_interest(service);

        for n in 0..(FANOUT_QUEUE_DEPTH + 5) {
            let env = Envelope::for_notification(&format!("m{n}"), "channel.follow", json!({}));
            hub.deliver(&interest, &env).await;
        }
        assert_eq!(socket.dropped_frames(), 5);
        // Frames m0..m4 were shed; the first one visible is m5.
        let frame = socket.next_frame().await.unwrap();
        assert!(frame.contains("\"m5\""));
    }

    #[tokio::test]
    async fn disconnect_removes_socket_and_ends_frame_stream() {
        let hub = hub();
        let service = Uuid::new_v4();
        let socket = hub.connect(service).await;
        hub.disconnect(&socket).await;
        assert_eq!(hub.active_connections(service), 0);
        assert!(socket.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn delivery_for_unconnected_service_is_a_noop() {
        let hub = hub();
        let interest = ws_interest(Uuid::new_v4());
        let env = Envelope::for_notification("m1", "channel.follow", json!({}));
        hub.deliver(&interest, &env).await;
    }
}
