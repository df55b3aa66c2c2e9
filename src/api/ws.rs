//! Websocket push of event-bus traffic to operator dashboards.
//!
//! Auth rides the query string (`?token=...`) because browsers cannot set
//! headers on a WebSocket upgrade.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::events::GatewayEvent;

use super::admin::verify_token;
use super::Ctx;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    State(ctx): State<Ctx>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let open = ctx.config.server.dev_mode && ctx.config.server.jwt_secret.is_empty();
    let authorized = open
        || query
            .token
            .as_deref()
            .map(|token| verify_token(&ctx.config.server.jwt_secret, token))
            .unwrap_or(false);
    if !authorized {
        return (StatusCode::FORBIDDEN, "token missing or invalid").into_response();
    }
    let rx = ctx.bus.subscribe();
    ws.on_upgrade(move |socket| push_events(socket, rx))
}

async fn push_events(socket: WebSocket, mut rx: broadcast::Receiver<GatewayEvent>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "websocket subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    debug!("websocket subscriber disconnected");
}
