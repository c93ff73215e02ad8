//! WebSocket-Backend für gehostete Realtime-Dienste (Phoenix-Protokoll)
//!
//! Verwaltet die WebSocket-Verbindung zum Realtime-Dienst:
//! - Channel-Beitritt mit Presence-Key und `self: false`
//! - Broadcast, Presence track/untrack
//! - `presence_state` / `presence_diff` Auswertung
//! - Heartbeat-Keeping

use super::realtime::{
    parse_presence_map, ChannelEvent, ChannelStatus, JoinOptions, PresenceState, RealtimeBackend,
    RealtimeChannel, Subscription,
};
use super::SignalingError;
use crate::config::SignalingConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// WIRE FRAME
// ============================================================================

/// Ein Phoenix-Frame (JSON-Serializer v1)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

const JOIN_REF: &str = "1";

// ============================================================================
// BACKEND
// ============================================================================

/// Realtime-Backend über WebSocket
#[derive(Debug, Clone)]
pub struct PhoenixBackend {
    endpoint: String,
    api_key: Option<String>,
    heartbeat_interval: Duration,
}

impl PhoenixBackend {
    pub fn new(endpoint: String, api_key: Option<String>, heartbeat_interval: Duration) -> Self {
        Self {
            endpoint,
            api_key,
            heartbeat_interval,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.api_key.clone(),
            config.heartbeat_interval(),
        )
    }

    /// Baut die WebSocket-URL (`http(s)` wird zu `ws(s)`)
    fn socket_url(&self) -> Result<Url, SignalingError> {
        let base = self.endpoint.trim_end_matches('/').replacen("http", "ws", 1);
        let mut url = Url::parse(&format!("{}/realtime/v1/websocket", base))
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(key) = &self.api_key {
                query.append_pair("apikey", key);
            }
            query.append_pair("vsn", "1.0.0");
        }
        Ok(url)
    }
}

#[async_trait]
impl RealtimeBackend for PhoenixBackend {
    async fn join(&self, options: JoinOptions) -> Result<Subscription, SignalingError> {
        let url = self.socket_url()?;
        tracing::info!("Connecting to realtime service: {}", url.host_str().unwrap_or(""));

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let topic = format!("realtime:{}", options.topic);
        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let presence = Arc::new(Mutex::new(PresenceState::new()));

        // Write-Task
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Read-Task
        let read_topic = topic.clone();
        let read_presence = Arc::clone(&presence);
        let read_events = event_tx.clone();
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PhoenixFrame>(&text) {
                        Ok(frame) => {
                            if frame.topic != read_topic {
                                continue;
                            }
                            for event in handle_frame(frame, &read_presence) {
                                let _ = read_events.send(event);
                            }
                        }
                        Err(e) => tracing::warn!("Unparseable realtime frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = read_events.send(ChannelEvent::Status(ChannelStatus::ChannelError(
                            e.to_string(),
                        )));
                        return;
                    }
                    _ => {}
                }
            }
            let _ = read_events.send(ChannelEvent::Status(ChannelStatus::Closed));
        });

        let channel = PhoenixChannel {
            topic: topic.clone(),
            tx: tx.clone(),
            next_ref: AtomicU64::new(2),
            presence,
            tasks: Mutex::new(vec![write_task, read_task]),
        };

        // Heartbeat-Task
        let heartbeat_tx = tx.clone();
        let interval = self.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut counter: u64 = 0;
            loop {
                ticker.tick().await;
                counter += 1;
                let frame = PhoenixFrame {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    msg_ref: Some(format!("hb-{}", counter)),
                    join_ref: None,
                };
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if heartbeat_tx.send(text).await.is_err() {
                    tracing::debug!("Heartbeat: socket gone, stopping heartbeat task");
                    break;
                }
            }
        });
        channel.tasks.lock().push(heartbeat_task);

        // Beitritt senden
        let mut join_payload = json!({
            "config": {
                "broadcast": { "self": options.broadcast_self, "ack": false },
                "presence": { "key": options.presence_key },
            }
        });
        if let (Some(key), Some(obj)) = (&self.api_key, join_payload.as_object_mut()) {
            obj.insert("access_token".to_string(), Value::String(key.clone()));
        }
        channel
            .push_frame("phx_join", join_payload, JOIN_REF.to_string())
            .await?;

        Ok(Subscription {
            channel: Arc::new(channel),
            events: event_rx,
        })
    }
}

/// Übersetzt einen Frame in Channel-Events
fn handle_frame(frame: PhoenixFrame, presence: &Mutex<PresenceState>) -> Vec<ChannelEvent> {
    match frame.event.as_str() {
        "phx_reply" if frame.msg_ref.as_deref() == Some(JOIN_REF) => {
            let status = frame.payload.get("status").and_then(Value::as_str);
            if status == Some("ok") {
                vec![ChannelEvent::Status(ChannelStatus::Subscribed)]
            } else {
                let reason = frame
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.payload.to_string());
                vec![ChannelEvent::Status(ChannelStatus::ChannelError(reason))]
            }
        }
        "phx_reply" => Vec::new(),
        "phx_error" => vec![ChannelEvent::Status(ChannelStatus::ChannelError(
            "channel crashed".to_string(),
        ))],
        "phx_close" => vec![ChannelEvent::Status(ChannelStatus::Closed)],
        "broadcast" => {
            let event = frame
                .payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let payload = frame.payload.get("payload").cloned().unwrap_or(Value::Null);
            vec![ChannelEvent::Broadcast { event, payload }]
        }
        "presence_state" => presence.lock().sync(parse_presence_map(&frame.payload)),
        "presence_diff" => {
            let joins = parse_presence_map(frame.payload.get("joins").unwrap_or(&Value::Null));
            let leaves = parse_presence_map(frame.payload.get("leaves").unwrap_or(&Value::Null));
            presence.lock().diff(joins, leaves)
        }
        "system" => {
            tracing::debug!("Realtime system message: {}", frame.payload);
            Vec::new()
        }
        other => {
            tracing::trace!("Ignoring realtime event {}", other);
            Vec::new()
        }
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

struct PhoenixChannel {
    topic: String,
    tx: mpsc::Sender<String>,
    next_ref: AtomicU64,
    presence: Arc<Mutex<PresenceState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PhoenixChannel {
    async fn push(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        let msg_ref = self.next_ref.fetch_add(1, Ordering::Relaxed).to_string();
        self.push_frame(event, payload, msg_ref).await
    }

    async fn push_frame(
        &self,
        event: &str,
        payload: Value,
        msg_ref: String,
    ) -> Result<(), SignalingError> {
        let frame = PhoenixFrame {
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
            msg_ref: Some(msg_ref),
            join_ref: Some(JOIN_REF.to_string()),
        };
        let text = serde_json::to_string(&frame)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl RealtimeChannel for PhoenixChannel {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        self.push(
            "broadcast",
            json!({ "type": "broadcast", "event": event, "payload": payload }),
        )
        .await
    }

    async fn track(&self, meta: Value) -> Result<(), SignalingError> {
        self.push(
            "presence",
            json!({ "type": "presence", "event": "track", "payload": meta }),
        )
        .await
    }

    async fn untrack(&self) -> Result<(), SignalingError> {
        self.push("presence", json!({ "type": "presence", "event": "untrack" }))
            .await
    }

    fn presence_state(&self) -> HashMap<String, Vec<Value>> {
        self.presence.lock().snapshot()
    }

    async fn unsubscribe(&self) -> Result<(), SignalingError> {
        let result = self.push("phx_leave", json!({})).await;
        // Dem Write-Task kurz Zeit geben, das phx_leave abzusetzen
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.presence.lock().clear();
        result
    }
}

impl Drop for PhoenixChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
