//! Realtime change feed over the Phoenix channel protocol
//!
//! Each subscription owns one WebSocket connection with a writer task fed by
//! an mpsc channel and a reader task that dispatches row changes and sends
//! heartbeats on a fixed period. When the reader stops, the handle is marked
//! closed.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{BackendError, ChangeCallback, ChangeEvent, ChangeKind, EventMask, SubscriptionHandle};

/// A message sent or received over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: ChannelEvent,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub message_ref: Value,
}

/// Phoenix and Realtime events this client knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEvent {
    PostgresChanges,
    /// Legacy per-table events
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,

    #[serde(rename = "phx_join")]
    PhoenixJoin,
    #[serde(rename = "phx_leave")]
    PhoenixLeave,
    #[serde(rename = "phx_reply")]
    PhoenixReply,
    #[serde(rename = "phx_error")]
    PhoenixError,
    #[serde(rename = "phx_close")]
    PhoenixClose,

    Heartbeat,
    System,
    #[serde(other)]
    Other,
}

struct ActiveChannel {
    topic: String,
    socket: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub(crate) struct RealtimeApi {
    url: String,
    key: String,
    heartbeat_interval: Duration,
    channels: Arc<Mutex<HashMap<String, ActiveChannel>>>,
}

impl RealtimeApi {
    pub(crate) fn new(url: &str, key: &str, heartbeat_interval: Duration) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            heartbeat_interval,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// WebSocket endpoint derived from the project URL
    pub(crate) fn socket_url(&self) -> Result<Url, BackendError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| BackendError::new(format!("invalid realtime URL: {}", e)))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            s => return Err(BackendError::new(format!("Unsupported URL scheme: {}", s))),
        };
        url.set_scheme(scheme)
            .map_err(|_| BackendError::new("failed to set realtime URL scheme"))?;
        let mut url = url
            .join("/realtime/v1/websocket")
            .map_err(|e| BackendError::new(format!("invalid realtime URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub(crate) async fn subscribe(
        &self,
        table: &str,
        events: EventMask,
        access_token: Option<String>,
        callback: ChangeCallback,
    ) -> Result<SubscriptionHandle, BackendError> {
        let url = self.socket_url()?;
        let topic = format!("realtime:public:{}", table);
        info!("Opening realtime channel {}", topic);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BackendError::network(format!("WebSocket connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();
        let (socket_tx, mut socket_rx) = mpsc::channel::<Message>(100);

        let writer_topic = topic.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = socket_rx.recv().await {
                trace!("Sending on {}: {:?}", writer_topic, message);
                if let Err(e) = write.send(message).await {
                    error!("WebSocket send error on {}: {}", writer_topic, e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Writer for {} finished", writer_topic);
        });

        let join = RealtimeMessage {
            topic: topic.clone(),
            event: ChannelEvent::PhoenixJoin,
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": events.as_str(), "schema": "public", "table": table }
                    ]
                },
                "access_token": access_token,
            }),
            message_ref: json!("1"),
        };
        send_json(&socket_tx, &join).await?;

        let (handle, closed_tx) = SubscriptionHandle::new(Uuid::new_v4().to_string(), topic.clone());
        let reader_topic = topic.clone();
        let heartbeat_tx = socket_tx.clone();
        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        heartbeat.reset();
        let reader = tokio::spawn(async move {
            let mut heartbeat_ref: u64 = 1;
            loop {
                tokio::select! {
                    msg_result = read.next() => {
                        match msg_result {
                            Some(Ok(Message::Text(text))) => {
                                dispatch(&reader_topic, &text, events, &callback);
                            }
                            Some(Ok(msg)) if msg.is_close() => {
                                debug!("Realtime socket for {} closed by server", reader_topic);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("Realtime read error on {}: {}", reader_topic, e);
                                break;
                            }
                            None => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        heartbeat_ref += 1;
                        let beat = RealtimeMessage {
                            topic: "phoenix".to_string(),
                            event: ChannelEvent::Heartbeat,
                            payload: json!({}),
                            message_ref: json!(heartbeat_ref.to_string()),
                        };
                        if send_json(&heartbeat_tx, &beat).await.is_err() {
                            warn!("Heartbeat failed on {}, assuming connection lost", reader_topic);
                            break;
                        }
                    }
                }
            }
            debug!("Reader for {} finished", reader_topic);
            let _ = closed_tx.send(true);
        });

        self.channels.lock().await.insert(
            handle.id.clone(),
            ActiveChannel {
                topic,
                socket: socket_tx,
                reader,
                writer,
            },
        );

        Ok(handle)
    }

    pub(crate) async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError> {
        let channel = self
            .channels
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| BackendError::new(format!("unknown subscription {}", handle.id)))?;

        channel.reader.abort();
        let leave = RealtimeMessage {
            topic: channel.topic.clone(),
            event: ChannelEvent::PhoenixLeave,
            payload: json!({}),
            message_ref: Value::Null,
        };
        let sent = send_json(&channel.socket, &leave).await;
        // Dropping the last sender ends the writer, which closes the socket.
        drop(channel.socket);
        if let Err(e) = channel.writer.await {
            warn!("Realtime writer for {} ended abnormally: {}", channel.topic, e);
        }
        info!("Closed realtime channel {}", channel.topic);
        sent
    }
}

async fn send_json(
    socket: &mpsc::Sender<Message>,
    message: &RealtimeMessage,
) -> Result<(), BackendError> {
    let text = serde_json::to_string(message)
        .map_err(|e| BackendError::new(format!("failed to encode realtime message: {}", e)))?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| BackendError::network(format!("realtime socket unavailable: {}", e)))
}

fn dispatch(topic: &str, text: &str, events: EventMask, callback: &ChangeCallback) {
    let message = match serde_json::from_str::<RealtimeMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            error!("Failed to parse realtime message: {}. Raw: {}", e, text);
            return;
        }
    };
    if message.topic != topic {
        trace!("Ignoring message for topic {}", message.topic);
        return;
    }

    let data = match message.event {
        ChannelEvent::PostgresChanges => message.payload.get("data"),
        ChannelEvent::Insert | ChannelEvent::Update | ChannelEvent::Delete => Some(&message.payload),
        ChannelEvent::PhoenixError | ChannelEvent::PhoenixClose => {
            warn!("Channel {} reported {:?}: {}", topic, message.event, message.payload);
            return;
        }
        ChannelEvent::PhoenixReply => {
            debug!("Reply on {}: {}", topic, message.payload);
            return;
        }
        _ => return,
    };

    match data.and_then(parse_change) {
        Some(change) if events.matches(change.kind) => callback(change),
        Some(_) => {}
        None => warn!("Unrecognized change payload on {}: {}", topic, message.payload),
    }
}

fn parse_change(data: &Value) -> Option<ChangeEvent> {
    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .and_then(ChangeKind::parse)?;
    let text = |key: &str| data.get(key).and_then(Value::as_str).map(String::from);
    let row = |key: &str| data.get(key).filter(|v| !v.is_null()).cloned();

    Some(ChangeEvent {
        kind,
        schema: text("schema").unwrap_or_else(|| "public".to_string()),
        table: text("table").unwrap_or_default(),
        record: row("record"),
        old_record: row("old_record"),
        commit_timestamp: text("commit_timestamp"),
    })
}
