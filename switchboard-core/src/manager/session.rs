// src/manager/session.rs
//
// The single upstream Twitch EventSub WebSocket. One task owns the
// connection; frames are classified and handed to the SubscriptionManager.
// Reconnects follow exponential backoff with jitter; a session_reconnect
// frame hands over to the URL Twitch provides.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::config::{WS_BACKOFF_CAP, WS_DEFAULT_KEEPALIVE};
use crate::dedupe::Freshness;
use crate::Error;

use super::SubscriptionManager;

#[derive(Debug, Deserialize)]
struct FrameMetadata {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    message_type: String,
}

#[derive(Debug, Deserialize)]
struct Frame {
    metadata: FrameMetadata,
    #[serde(default)]
    payload: Value,
}

enum SessionEnd {
    /// Remote closed or errored; reconnect with backoff. Carries whether a
    /// welcome was seen on this connection (which resets the backoff).
    Lost { welcomed: bool },
    /// Twitch asked us to move; connect there without backoff.
    Reconnect(String),
    /// Shutdown signal observed.
    Stopped,
}

/// Drive the upstream session until shutdown. Spawned once at boot.
pub async fn run_session_loop(
    manager: Arc<SubscriptionManager>,
    ws_url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut target_url = ws_url.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_single_connection(&manager, &target_url, &mut shutdown).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Reconnect(url)) => {
                info!("Following EventSub session_reconnect");
                target_url = url;
                continue;
            }
            Ok(SessionEnd::Lost { welcomed }) => {
                if welcomed {
                    attempt = 0;
                }
                target_url = ws_url.clone();
            }
            Err(e) => {
                error!("EventSub session error: {e}");
                target_url = ws_url.clone();
            }
        }

        // The session is gone; WS-bound subscriptions are stale until the
        // next welcome re-ensures them.
        manager.set_session_id(None).await;

        attempt = attempt.saturating_add(1);
        let delay = backoff_delay(attempt);
        debug!("Reconnecting to EventSub in {delay:?} (attempt {attempt})");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    manager.set_session_id(None).await;
    info!("EventSub session loop stopped");
}

async fn run_single_connection(
    manager: &Arc<SubscriptionManager>,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, Error> {
    let (mut ws, _resp) = connect_async(url).await?;
    info!("Connected to EventSub at {url}");

    // Until the welcome advertises a keepalive interval, use the default.
    let mut keepalive_deadline = deadline_for(WS_DEFAULT_KEEPALIVE);
    let mut welcomed = false;

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(SessionEnd::Stopped),
            frame = tokio::time::timeout(keepalive_deadline, ws.next()) => frame,
        };

        let msg = match frame {
            Err(_) => {
                warn!("EventSub keepalive deadline missed; reconnecting");
                return Ok(SessionEnd::Lost { welcomed });
            }
            Ok(None) => return Ok(SessionEnd::Lost { welcomed }),
            Ok(Some(Err(e))) => {
                warn!("EventSub read error: {e}");
                return Ok(SessionEnd::Lost { welcomed });
            }
            Ok(Some(Ok(msg))) => msg,
        };

        if msg.is_close() {
            return Ok(SessionEnd::Lost { welcomed });
        }
        let Message::Text(text) = msg else {
            continue; // ping/pong handled by tungstenite
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable EventSub frame: {e}");
                continue;
            }
        };

        match frame.metadata.message_type.as_str() {
            "session_welcome" => {
                let session_id = frame
                    .payload
                    .get("session")
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(secs) = frame
                    .payload
                    .get("session")
                    .and_then(|s| s.get("keepalive_timeout_seconds"))
                    .and_then(Value::as_u64)
                {
                    keepalive_deadline = deadline_for(Duration::from_secs(secs));
                }
                info!(session_id = %session_id, "EventSub session established");
                welcomed = true;
                manager.set_session_id(Some(session_id)).await;
                if let Err(e) = manager.reconcile().await {
                    warn!("Reconcile after welcome failed: {e}");
                }
                manager.ensure_all().await;
            }
            "session_keepalive" => {
                debug!("EventSub keepalive");
            }
            "session_reconnect" => {
                let reconnect_url = frame
                    .payload
                    .get("session")
                    .and_then(|s| s.get("reconnect_url"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match reconnect_url {
                    Some(url) => return Ok(SessionEnd::Reconnect(url)),
                    None => continue,
                }
            }
            "notification" => {
                // A rotating session can replay in-flight messages; the
                // shared window drops the duplicates.
                if manager.message_dedupe.observe(&frame.metadata.message_id)
                    == Freshness::Duplicate
                {
                    debug!(
                        message_id = %frame.metadata.message_id,
                        "Dropping duplicate EventSub notification"
                    );
                    continue;
                }
                manager.route(&frame.payload, &frame.metadata.message_id).await;
            }
            "revocation" => {
                manager.handle_revocation(&frame.payload).await;
            }
            other => {
                debug!("Unrecognized EventSub message_type={other}");
            }
        }
    }
}

/// Idle longer than 1.5x the advertised keepalive means the session is dead.
fn deadline_for(keepalive: Duration) -> Duration {
    keepalive + keepalive / 2
}

fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.clamp(1, 6) - 1;
    let base = Duration::from_secs(1u64 << shift).min(WS_BACKOFF_CAP);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
    (base + jitter).min(WS_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_parse_metadata_and_payload() {
        let raw = r#"{
            "metadata": {"message_id": "m1", "message_type": "session_welcome",
                         "message_timestamp": "2024-01-01T00:00:00Z"},
            "payload": {"session": {"id": "s-1", "keepalive_timeout_seconds": 10}}
        }"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.metadata.message_type, "session_welcome");
        assert_eq!(frame.metadata.message_id, "m1");
        assert_eq!(
            frame.payload["session"]["keepalive_timeout_seconds"],
            serde_json::json!(10)
        );
    }

    #[test]
    fn frames_tolerate_missing_payload() {
        let raw = r#"{"metadata": {"message_type": "session_keepalive"}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.metadata.message_type, "session_keepalive");
        assert!(frame.payload.is_null());
        assert!(frame.metadata.message_id.is_empty());
    }

    #[test]
    fn keepalive_deadline_is_one_and_a_half_times() {
        assert_eq!(
            deadline_for(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn backoff_is_capped_with_jitter() {
        for attempt in 1..12 {
            let delay = backoff_delay(attempt);
            assert!(delay <= WS_BACKOFF_CAP);
            assert!(delay >= Duration::from_secs(1));
        }
    }
}
