//! Broadcast hub
//!
//! Keeps the set of connected observers and fans every server message out to
//! all of them. Each observer owns a bounded outbound queue; a send that fails
//! (queue full or receiver gone) removes that observer without affecting the
//! others. Connects and removals keep the global viewer count in step.

use crate::config::TierId;
use crate::metrics::{timestamp_ms, SharedStats, TierSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Messages pushed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Periodic snapshot of every tier
    #[serde(rename_all = "camelCase")]
    Performance {
        per_stream: BTreeMap<TierId, TierSnapshot>,
        timestamp: i64,
    },
    /// Point latency update on segment arrival
    Latency {
        latency: u64,
        boundary: u64,
        quality: TierId,
        timestamp: i64,
    },
    /// Reply to a client ping
    Pong {
        timestamp: i64,
        client: Option<String>,
    },
}

/// Messages accepted from observers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        client: Option<String>,
    },
}

pub type ObserverId = Uuid;

struct Observer {
    role: String,
    tx: mpsc::Sender<String>,
}

pub struct BroadcastHub {
    observers: Mutex<HashMap<ObserverId, Observer>>,
    stats: SharedStats,
}

impl BroadcastHub {
    pub fn new(stats: SharedStats) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            stats,
        }
    }

    /// Register an observer and count it as a viewer
    pub async fn connect(&self, role: &str, tx: mpsc::Sender<String>) -> ObserverId {
        let id = Uuid::new_v4();
        self.observers.lock().await.insert(
            id,
            Observer {
                role: role.to_string(),
                tx,
            },
        );
        let viewers = self.stats.write().await.viewer_connected();
        debug!(observer = %id, role, viewers, "observer connected");
        id
    }

    /// Remove an observer; the viewer count drops only if it was still registered
    pub async fn disconnect(&self, id: ObserverId) -> bool {
        let removed = self.observers.lock().await.remove(&id);
        match removed {
            Some(observer) => {
                let viewers = self.stats.write().await.viewer_disconnected();
                debug!(observer = %id, role = %observer.role, viewers, "observer disconnected");
                true
            }
            None => false,
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.lock().await.len()
    }

    /// Send to every observer, dropping those that cannot take the message
    ///
    /// Returns the number of observers that received it.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast");
                return 0;
            }
        };

        let (delivered, dropped) = {
            let mut observers = self.observers.lock().await;
            let mut failed = Vec::new();
            for (id, observer) in observers.iter() {
                if let Err(e) = observer.tx.try_send(text.clone()) {
                    let reason = match e {
                        TrySendError::Full(_) => "queue full",
                        TrySendError::Closed(_) => "closed",
                    };
                    debug!(observer = %id, role = %observer.role, reason, "dropping observer");
                    failed.push(*id);
                }
            }
            for id in &failed {
                observers.remove(id);
            }
            (observers.len(), failed.len())
        };

        if dropped > 0 {
            let mut stats = self.stats.write().await;
            for _ in 0..dropped {
                stats.viewer_disconnected();
            }
        }
        delivered
    }

    /// Send to one observer; a failure removes it like a failed broadcast
    pub async fn send_to(&self, id: ObserverId, message: &ServerMessage) -> bool {
        let Ok(text) = serde_json::to_string(message) else {
            return false;
        };
        let sent = {
            let observers = self.observers.lock().await;
            match observers.get(&id) {
                Some(observer) => observer.tx.try_send(text).is_ok(),
                None => return false,
            }
        };
        if !sent {
            self.disconnect(id).await;
        }
        sent
    }

    /// Answer an inbound text frame; unknown or malformed frames are ignored
    pub fn handle_client_text(text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ping { client }) => Some(ServerMessage::Pong {
                timestamp: timestamp_ms(),
                client,
            }),
            Err(e) => {
                debug!(error = %e, "ignoring client message");
                None
            }
        }
    }
}
