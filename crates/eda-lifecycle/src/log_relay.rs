// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container log relay.
//!
//! Log forwarding runs detached from the worker that started the container;
//! a failing relay only loses log lines, never affects the lifecycle.

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::container::LogStream;

/// One relayed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFrame {
    /// Owning activation.
    pub activation_id: i64,
    /// Instance that produced the line.
    pub instance_id: i64,
    /// The line, without trailing newline.
    pub line: String,
    /// When the relay saw the line.
    pub timestamp: DateTime<Utc>,
}

/// Destination for container output.
pub trait LogSink: Send + Sync {
    /// Forward `lines` in the background until the stream ends.
    fn attach(&self, activation_id: i64, instance_id: i64, lines: LogStream) -> JoinHandle<()>;
}

/// Emits container output as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn attach(&self, activation_id: i64, instance_id: i64, lines: LogStream) -> JoinHandle<()> {
        tokio::spawn(forward_to_tracing(activation_id, instance_id, lines))
    }
}

async fn forward_to_tracing(activation_id: i64, instance_id: i64, mut lines: LogStream) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => info!(
                target: "eda_lifecycle::container_output",
                activation_id,
                instance_id,
                "{}",
                line
            ),
            Err(e) => {
                debug!(activation_id, instance_id, error = %e, "Log stream ended with error");
                break;
            }
        }
    }
}

/// Sends container output to the websocket log endpoint.
#[derive(Debug, Clone)]
pub struct WebsocketLogSink {
    base_url: String,
}

impl WebsocketLogSink {
    /// Relay to `{base_url}/activations/{id}/logs`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Endpoint for one activation.
    pub fn endpoint(&self, activation_id: i64) -> String {
        format!("{}/activations/{}/logs", self.base_url, activation_id)
    }
}

impl LogSink for WebsocketLogSink {
    fn attach(&self, activation_id: i64, instance_id: i64, lines: LogStream) -> JoinHandle<()> {
        let url = self.endpoint(activation_id);
        tokio::spawn(async move {
            let (mut socket, _) = match connect_async(url.as_str()).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        activation_id,
                        url = %url,
                        error = %e,
                        "Log relay unreachable, logging container output locally"
                    );
                    forward_to_tracing(activation_id, instance_id, lines).await;
                    return;
                }
            };

            let mut lines = lines;
            while let Some(line) = lines.next().await {
                let Ok(line) = line else { break };
                let frame = LogFrame {
                    activation_id,
                    instance_id,
                    line,
                    timestamp: Utc::now(),
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(activation_id, error = %e, "Failed to encode log frame");
                        continue;
                    }
                };
                if let Err(e) = socket.send(Message::Text(text)).await {
                    warn!(activation_id, error = %e, "Log relay connection lost");
                    return;
                }
            }

            let _ = socket.close(None).await;
            debug!(activation_id, instance_id, "Log relay finished");
        })
    }
}
