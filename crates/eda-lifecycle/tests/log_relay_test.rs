// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log relay tests against a local websocket server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eda_lifecycle::container::{LogStream, RuntimeError};
use eda_lifecycle::log_relay::{LogFrame, LogSink, WebsocketLogSink};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

fn lines(lines: &[&str]) -> LogStream {
    let items: Vec<Result<String, RuntimeError>> = lines.iter().map(|l| Ok(l.to_string())).collect();
    futures::stream::iter(items).boxed()
}

#[tokio::test]
async fn test_lines_are_relayed_as_json_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let path = Arc::new(Mutex::new(None::<String>));

    let seen_path = path.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *seen_path.lock().unwrap() = Some(req.uri().path().to_string());
            Ok(resp)
        };
        let mut socket = tokio_tungstenite::accept_hdr_async(stream, record_path)
            .await
            .unwrap();

        let mut frames = Vec::new();
        while let Some(Ok(msg)) = socket.next().await {
            if msg.is_close() {
                break;
            }
            if msg.is_text() {
                let frame: LogFrame = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
                frames.push(frame);
            }
        }
        frames
    });

    let sink = WebsocketLogSink::new(format!("ws://{addr}"));
    let relay = sink.attach(7, 42, lines(&["rulebook loaded", "rule fired"]));
    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay finished")
        .unwrap();

    let frames = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .unwrap();

    assert_eq!(path.lock().unwrap().as_deref(), Some("/activations/7/logs"));
    let text: Vec<&str> = frames.iter().map(|f| f.line.as_str()).collect();
    assert_eq!(text, vec!["rulebook loaded", "rule fired"]);
    assert!(frames.iter().all(|f| f.activation_id == 7 && f.instance_id == 42));
}

#[tokio::test]
async fn test_unreachable_relay_falls_back_to_local_logging() {
    // Reserve a port, then free it so nothing listens there.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sink = WebsocketLogSink::new(format!("ws://{addr}"));
    let relay = sink.attach(1, 1, lines(&["still logged"]));

    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay gave up")
        .unwrap();
}
