use crate::hub::InsightHub;
use aoc_core::insight_contracts::{parse_client_frame, ClientFrame};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs one observer connection from open to close.
pub async fn handle_socket(hub: Arc<InsightHub>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(hub.config().queue_capacity);
    let write_timeout = hub.config().write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
        let _ = ws_sender.close().await;
    });

    let (client, mut evicted) = hub.register(tx).await;
    let conn_id = client.conn_id.clone();
    info!(event = "connection_open", conn_id = %conn_id, remote = %remote);
    hub.send_to(&conn_id, &hub.init_envelope()).await;

    let mut reason = "disconnect";
    loop {
        tokio::select! {
            _ = evicted.changed() => {
                reason = "evicted";
                break;
            }
            next = ws_receiver.next() => {
                let msg = match next {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %conn_id, error = %err);
                        reason = "read_error";
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => apply_frame(&hub, &conn_id, &text).await,
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => apply_frame(&hub, &conn_id, &text).await,
                        Err(_) => debug!(event = "frame_dropped", conn_id = %conn_id, reason = "binary"),
                    },
                    Message::Close(_) => {
                        info!(event = "client_close", conn_id = %conn_id);
                        reason = "close";
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    hub.unregister(&conn_id, reason).await;
    drop(client);
    let _ = write_task.await;
}

/// Applies one inbound frame. Unusable frames are logged and ignored.
pub async fn apply_frame(hub: &InsightHub, conn_id: &str, raw: &str) {
    match parse_client_frame(raw) {
        ClientFrame::Subscribe(topic) => {
            hub.subscribe(conn_id, topic).await;
        }
        ClientFrame::Unsubscribe(topic) => {
            hub.unsubscribe(conn_id, &topic).await;
        }
        ClientFrame::Dropped(rejection) => {
            debug!(event = "frame_dropped", conn_id = %conn_id, reason = %rejection);
        }
    }
}
