//! Downstream WebSocket broadcast of analytics messages.

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pairs_analytics::{
    AnalyticsError, AnalyticsSnapshot, Bar, HealthReport, PairKey, analytics::SpreadAlert,
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Message sent to downstream clients, serialised as JSON tagged by `type`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Welcome {
        message: &'a str,
        timestamp: DateTime<Utc>,
    },
    Snapshot {
        snapshot: &'a AnalyticsSnapshot,
    },
    NotReady {
        pair: &'a PairKey,
        kind: &'static str,
        error: String,
    },
    Alert {
        pair: &'a PairKey,
        alert: &'a SpreadAlert,
    },
    Bar {
        bar: &'a Bar,
    },
    Health {
        health: &'a HealthReport,
    },
}

impl<'a> ServerMessage<'a> {
    pub fn not_ready(pair: &'a PairKey, error: &AnalyticsError) -> Self {
        Self::NotReady {
            pair,
            kind: error.kind(),
            error: error.to_string(),
        }
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(error) => {
                warn!(%error, "failed to serialise server message");
                None
            }
        }
    }
}

/// Serialise and publish `message` to every connected client.
pub fn publish(tx: &broadcast::Sender<String>, message: &ServerMessage<'_>) {
    if let Some(json) = message.to_json() {
        // No receivers simply means no connected clients
        let _ = tx.send(json);
    }
}

/// Accept downstream WebSocket clients until the listener fails.
pub async fn start_websocket_server(
    addr: SocketAddr,
    tx: Arc<broadcast::Sender<String>>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "WebSocket server bound");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "new WebSocket connection");
        tokio::spawn(handle_client(stream, peer_addr, Arc::clone(&tx)));
    }
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tx: Arc<broadcast::Sender<String>>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            error!(%peer_addr, %error, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = tx.subscribe();

    let welcome = ServerMessage::Welcome {
        message: "Connected to pairs-analytics feed",
        timestamp: Utc::now(),
    };
    if let Some(json) = welcome.to_json() {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer_addr, skipped, "client lagged, skipped messages");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(%peer_addr, "broadcast channel closed");
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    debug!(%peer_addr, %text, "ignoring client text message");
                }
                Err(error) => {
                    error!(%peer_addr, %error, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(%peer_addr, "WebSocket connection closed");
}
