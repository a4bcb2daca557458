//! WebSocket push fabric.
//!
//! Two named channels (`whales`, `trades`) each hold a set of subscriber
//! queues behind one mutex. Broadcasts stamp a process-wide monotonic
//! `_broadcast_id`, serialize once, and send to a snapshot of the set so the
//! lock is never held across I/O. A failed send ejects the subscriber:
//! delivery is at-most-once per subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use chrono::SecondsFormat;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};

use super::server::AppState;
use crate::core::indexer::InsertedTrade;
use crate::core::whales::WhaleTrade;

pub const WHALES_CHANNEL: &str = "whales";
pub const TRADES_CHANNEL: &str = "trades";

type SubscriberId = u64;
type Subscribers = HashMap<SubscriberId, mpsc::UnboundedSender<String>>;

pub struct ConnectionManager {
    channels: Mutex<HashMap<String, Subscribers>>,
    next_subscriber: AtomicU64,
    broadcast_count: AtomicU64,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl ConnectionManager {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(WHALES_CHANNEL.to_string(), Subscribers::new());
        channels.insert(TRADES_CHANNEL.to_string(), Subscribers::new());
        Self {
            channels: Mutex::new(channels),
            next_subscriber: AtomicU64::new(1),
            broadcast_count: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber on `channel` and queues the welcome envelope.
    /// The returned receiver is the subscriber's outbound stream; dropping it
    /// marks the subscriber dead on the next broadcast.
    pub async fn connect(&self, channel: &str) -> (SubscriberId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let welcome = serde_json::json!({
            "type": "connected",
            "channel": channel,
            "message": format!("Connected to {channel} channel"),
            "timestamp": now_iso(),
        });
        let _ = tx.send(welcome.to_string());

        let mut channels = self.channels.lock().await;
        channels.entry(channel.to_string()).or_default().insert(id, tx);
        let total: usize = channels.values().map(|subs| subs.len()).sum();
        tracing::info!("Client connected to channel '{channel}', total connections: {total}");
        (id, rx)
    }

    pub async fn disconnect(&self, channel: &str, id: SubscriberId) {
        let mut channels = self.channels.lock().await;
        if let Some(subs) = channels.get_mut(channel) {
            subs.remove(&id);
        }
        let total: usize = channels.values().map(|subs| subs.len()).sum();
        tracing::info!("Client disconnected from channel '{channel}', total connections: {total}");
    }

    /// Broadcasts `message` on `channel`, stamping `_broadcast_id` and
    /// `_broadcast_time`. Subscribers whose send fails are removed.
    pub async fn broadcast(&self, channel: &str, mut message: serde_json::Value) {
        let broadcast_id = self.broadcast_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(obj) = message.as_object_mut() {
            obj.insert("_broadcast_id".into(), serde_json::json!(broadcast_id));
            obj.insert("_broadcast_time".into(), serde_json::json!(now_iso()));
        }
        let payload = message.to_string();

        let snapshot: Vec<(SubscriberId, mpsc::UnboundedSender<String>)> = {
            let channels = self.channels.lock().await;
            match channels.get(channel) {
                Some(subs) => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(payload.clone()).is_err() {
                tracing::warn!("Failed to send to subscriber {id} on '{channel}', removing");
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut channels = self.channels.lock().await;
            if let Some(subs) = channels.get_mut(channel) {
                for id in dead {
                    subs.remove(&id);
                }
            }
        }
    }

    pub async fn broadcast_whale_alert(&self, whale: &WhaleTrade) {
        self.broadcast(
            WHALES_CHANNEL,
            serde_json::json!({
                "type": "whale_alert",
                "data": {
                    "tx_hash": whale.tx_hash,
                    "market_slug": whale.market_slug,
                    "question": whale.question,
                    "side": whale.side,
                    "outcome": whale.outcome,
                    "price": whale.price,
                    "size": whale.size,
                    "usd_value": whale.usd_value,
                    "trader": whale.trader,
                    "timestamp": whale.timestamp,
                },
            }),
        )
        .await;
    }

    pub async fn broadcast_trade(&self, trade: &InsertedTrade) {
        self.broadcast(
            TRADES_CHANNEL,
            serde_json::json!({
                "type": "new_trade",
                "data": trade,
            }),
        )
        .await;
    }

    pub async fn status(&self) -> serde_json::Value {
        let channels = self.channels.lock().await;
        let connections: HashMap<&str, usize> = channels
            .iter()
            .map(|(name, subs)| (name.as_str(), subs.len()))
            .collect();
        let total: usize = connections.values().sum();
        serde_json::json!({
            "channels": channels.keys().collect::<Vec<_>>(),
            "connections": connections,
            "total_connections": total,
            "messages_sent": self.broadcast_count.load(Ordering::SeqCst),
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// WebSocket endpoints
// ---------------------------------------------------------------------------

pub async fn ws_whales(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.ws.clone(), WHALES_CHANNEL))
}

pub async fn ws_trades(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.ws.clone(), TRADES_CHANNEL))
}

pub async fn ws_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.ws.status().await)
}

/// Pumps broadcasts out and answers the two inbound control frames
/// (`"ping"` → `"pong"`, `"status"` → status JSON) until either side closes.
async fn handle_socket(socket: WebSocket, manager: Arc<ConnectionManager>, channel: &'static str) {
    let (id, mut outbound) = manager.connect(channel).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match text.as_str() {
                        "ping" => {
                            if sink.send(Message::Text("pong".into())).await.is_err() {
                                break;
                            }
                        }
                        "status" => {
                            let status = manager.status().await;
                            if sink.send(Message::Text(status.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        _ => {}
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    manager.disconnect(channel, id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcast_id(raw: &str) -> u64 {
        let value: serde_json::Value = serde_json::from_str(raw).unwrap();
        value["_broadcast_id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn broadcasts_are_totally_ordered_per_channel() {
        let manager = ConnectionManager::new();
        let (_id1, mut rx1) = manager.connect(WHALES_CHANNEL).await;
        let (_id2, mut rx2) = manager.connect(WHALES_CHANNEL).await;

        // Welcome envelopes come first, without broadcast ids.
        let welcome: serde_json::Value =
            serde_json::from_str(&rx1.recv().await.unwrap()).unwrap();
        assert_eq!(welcome["type"], "connected");
        rx2.recv().await.unwrap();

        for label in ["A", "B", "C"] {
            manager
                .broadcast(WHALES_CHANNEL, serde_json::json!({ "label": label }))
                .await;
        }

        for rx in [&mut rx1, &mut rx2] {
            let ids: Vec<u64> = [
                rx.recv().await.unwrap(),
                rx.recv().await.unwrap(),
                rx.recv().await.unwrap(),
            ]
            .iter()
            .map(|raw| broadcast_id(raw))
            .collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_ejected_and_others_still_receive() {
        let manager = ConnectionManager::new();
        let (_id1, mut rx1) = manager.connect(WHALES_CHANNEL).await;
        let (_id2, mut rx2) = manager.connect(WHALES_CHANNEL).await;
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();

        manager
            .broadcast(WHALES_CHANNEL, serde_json::json!({ "label": "A" }))
            .await;
        manager
            .broadcast(WHALES_CHANNEL, serde_json::json!({ "label": "B" }))
            .await;

        // Subscriber 1's transport dies between B and C.
        drop(rx1);
        manager
            .broadcast(WHALES_CHANNEL, serde_json::json!({ "label": "C" }))
            .await;

        let labels: Vec<String> = [
            rx2.recv().await.unwrap(),
            rx2.recv().await.unwrap(),
            rx2.recv().await.unwrap(),
        ]
        .iter()
        .map(|raw| {
            let value: serde_json::Value = serde_json::from_str(raw).unwrap();
            value["label"].as_str().unwrap().to_string()
        })
        .collect();
        assert_eq!(labels, vec!["A", "B", "C"]);

        let status = manager.status().await;
        assert_eq!(status["connections"]["whales"], 1);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let manager = ConnectionManager::new();
        let (_id, mut whale_rx) = manager.connect(WHALES_CHANNEL).await;
        whale_rx.recv().await.unwrap();

        manager
            .broadcast(TRADES_CHANNEL, serde_json::json!({ "label": "T" }))
            .await;
        manager
            .broadcast(WHALES_CHANNEL, serde_json::json!({ "label": "W" }))
            .await;

        let raw = whale_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["label"], "W");
        // The broadcast id is process-wide, so the whales message is #2.
        assert_eq!(value["_broadcast_id"], 2);
    }
}
