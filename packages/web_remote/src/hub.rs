//! Frontend Hub
//!
//! Owns the connected control-panel sessions. Passthrough frames are queued
//! to every session; a session whose queue is closed is dropped without
//! affecting delivery to the others.
//!
//! Presence is state rather than a stream of events: each session holds a
//! latest-value slot for the presence frame next to its bounded queue, so a
//! full queue can never strand a front end on an outdated instance list.
//! Slots carry the registry version they were computed from and a session
//! never receives a snapshot older than one it has already seen.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, warn};

use crate::metrics::RelayMetrics;
use crate::protocol::presence_frame;
use crate::registry::{InstanceRegistry, PresenceTable, Snapshot};

/// Default per-session outbound queue length.
pub const DEFAULT_SESSION_QUEUE: usize = 100;

struct SessionEntry {
    tx: mpsc::Sender<String>,
    presence: watch::Sender<String>,
    /// Highest registry version delivered to this session.
    seen_version: u64,
}

/// A connected front end, as handed to its socket task.
pub struct Session {
    pub id: String,
    rx: mpsc::Receiver<String>,
    presence: watch::Receiver<String>,
}

impl Session {
    /// Next frame for the front end. A pending presence update is handed
    /// out before queued passthrough frames. Returns `None` once the hub
    /// has dropped the session and the queue is drained.
    pub async fn recv(&mut self) -> Option<String> {
        if let Some(frame) = self.take_presence() {
            return Some(frame);
        }

        let presence_changed = tokio::select! {
            biased;
            changed = self.presence.changed() => changed.is_ok(),
            frame = self.rx.recv() => return frame,
        };

        if presence_changed {
            Some(self.presence.borrow_and_update().clone())
        } else {
            self.rx.recv().await
        }
    }

    /// Non-blocking [`Session::recv`].
    pub fn try_recv(&mut self) -> Option<String> {
        self.take_presence().or_else(|| self.rx.try_recv().ok())
    }

    fn take_presence(&mut self) -> Option<String> {
        if self.presence.has_changed().unwrap_or(false) {
            Some(self.presence.borrow_and_update().clone())
        } else {
            None
        }
    }
}

pub struct FrontendHub {
    registry: Arc<InstanceRegistry>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    queue_capacity: usize,
    metrics: Arc<RelayMetrics>,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

fn deliver(id: &str, tx: &mpsc::Sender<String>, frame: &str, metrics: &RelayMetrics) -> Delivery {
    match tx.try_send(frame.to_string()) {
        Ok(()) => {
            metrics.frame_sent();
            Delivery::Sent
        }
        Err(TrySendError::Full(_)) => {
            warn!(session = %id, "session queue full, dropping frame");
            metrics.frame_dropped();
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => {
            debug!(session = %id, "session closed, removing");
            metrics.session_failed();
            Delivery::Closed
        }
    }
}

/// Replace the session's presence slot. Never blocks and never drops.
fn publish_presence(id: &str, entry: &SessionEntry, frame: &str, metrics: &RelayMetrics) -> Delivery {
    if entry.presence.is_closed() || entry.tx.is_closed() {
        debug!(session = %id, "session closed, removing");
        metrics.session_failed();
        return Delivery::Closed;
    }
    entry.presence.send_replace(frame.to_string());
    metrics.frame_sent();
    Delivery::Sent
}

impl FrontendHub {
    pub fn new(registry: Arc<InstanceRegistry>, queue_capacity: usize, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Register a new session and hand it the current presence frame.
    pub async fn connect(&self) -> Session {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (presence_tx, presence_rx) = watch::channel(String::new());
        let id = uuid::Uuid::new_v4().to_string();

        let mut sessions = self.sessions.lock().await;
        let snapshot = self.registry.snapshot().await;
        match presence_frame(&snapshot.records) {
            Ok(frame) => {
                presence_tx.send_replace(frame);
                self.metrics.frame_sent();
            }
            Err(e) => error!("Failed to encode presence frame: {}", e),
        }
        sessions.insert(
            id.clone(),
            SessionEntry {
                tx,
                presence: presence_tx,
                seen_version: snapshot.version,
            },
        );
        self.metrics.session_opened();

        Session {
            id,
            rx,
            presence: presence_rx,
        }
    }

    pub async fn disconnect(&self, id: &str) {
        if self.sessions.lock().await.remove(id).is_some() {
            self.metrics.session_closed();
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Apply a registry mutation and broadcast the resulting snapshot.
    pub async fn apply_presence<R>(&self, f: impl FnOnce(&mut PresenceTable) -> R) -> R {
        let (result, snapshot) = self.registry.update(f).await;
        self.deliver_presence(&snapshot, false).await;
        result
    }

    /// Send the current presence frame to every session.
    pub async fn broadcast_instances(&self) {
        let snapshot = self.registry.snapshot().await;
        self.deliver_presence(&snapshot, true).await;
    }

    /// Forward a raw instance frame to every session.
    pub async fn broadcast_passthrough(&self, raw: &str) {
        self.metrics.passthrough();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|id, entry| !matches!(deliver(id, &entry.tx, raw, &self.metrics), Delivery::Closed));
        self.account_removed(before - sessions.len());
    }

    /// Deliver `snapshot` to sessions that have not seen it yet. With
    /// `force`, sessions already at this version get it again; older
    /// snapshots are never delivered.
    async fn deliver_presence(&self, snapshot: &Snapshot, force: bool) {
        let frame = match presence_frame(&snapshot.records) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode presence frame: {}", e);
                return;
            }
        };

        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let fresh = snapshot.version > entry.seen_version
                || (force && snapshot.version == entry.seen_version);
            if !fresh {
                return true;
            }
            match publish_presence(id, entry, &frame, &self.metrics) {
                Delivery::Sent => {
                    entry.seen_version = snapshot.version;
                    true
                }
                Delivery::Dropped => true,
                Delivery::Closed => false,
            }
        });
        self.account_removed(before - sessions.len());
        debug!(version = snapshot.version, instances = snapshot.records.len(), "presence broadcast");
    }

    fn account_removed(&self, removed: usize) {
        for _ in 0..removed {
            self.metrics.session_closed();
        }
    }
}
