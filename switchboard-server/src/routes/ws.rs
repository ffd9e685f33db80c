// src/routes/ws.rs
//
// Service-facing event WebSocket. Authentication happens before the
// upgrade: a single-use ws_token from /v1/ws-token, or (legacy) client
// credentials in the query string.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use switchboard_core::secrets::verify_secret;

use crate::context::BridgeContext;
use crate::routes::ApiError;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    ws_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

pub async fn ws_events(
    State(ctx): State<Arc<BridgeContext>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let service_id = authenticate(&ctx, &query).await?;
    info!(service = %service_id, "Accepted /ws/events connection");
    Ok(upgrade.on_upgrade(move |socket| serve_events(ctx, service_id, socket)))
}

async fn authenticate(ctx: &Arc<BridgeContext>, query: &WsQuery) -> Result<Uuid, ApiError> {
    use switchboard_core::Error;

    let token = query
        .ws_token
        .as_deref()
        .map(str::trim)
        // Browser clients have been seen sending the literal strings.
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("undefined") && !t.eq_ignore_ascii_case("null"));

    let service_id = if let Some(token) = token {
        ctx.ws_tokens.consume(token).map_err(ApiError)?
    } else if let (Some(client_id), Some(client_secret)) =
        (query.client_id.as_deref(), query.client_secret.as_deref())
    {
        let service = ctx
            .services
            .get_by_client_id(client_id.trim())
            .await
            .map_err(ApiError)?
            .ok_or(ApiError(Error::InvalidServiceCredentials))?;
        if !verify_secret(client_secret, &service.client_secret_hash) {
            return Err(ApiError(Error::InvalidServiceCredentials));
        }
        service.id
    } else {
        return Err(ApiError(Error::InvalidToken));
    };

    let service = ctx
        .services
        .get(service_id)
        .await
        .map_err(ApiError)?
        .ok_or(ApiError(Error::InvalidServiceCredentials))?;
    if !service.enabled {
        return Err(ApiError(Error::InvalidServiceCredentials));
    }
    Ok(service.id)
}

async fn serve_events(ctx: Arc<BridgeContext>, service_id: Uuid, socket: WebSocket) {
    let connection = ctx.fanout.connect(service_id).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = connection.next_frame() => {
                match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    // Inbound frames are proxy keepalives; drop them.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    ctx.fanout.disconnect(&connection).await;
    debug!(service = %service_id, "Closed /ws/events connection");
}
