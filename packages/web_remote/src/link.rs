//! Outbound Link
//!
//! One supervisor task per configured instance URL. Each slot dials out,
//! forwards command payloads, feeds announcements into the registry and
//! everything else to the front ends, and redials with exponential backoff
//! after a failure or close.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::hub::FrontendHub;
use crate::metrics::RelayMetrics;
use crate::protocol::{LinkFrame, Transport, classify_link_frame, parse_announcement};
use crate::registry::Source;

/// Commands buffered per connected link before sends are dropped.
const LINK_QUEUE: usize = 64;

/// Reconnect delays: `base`, `2·base`, `4·base`, … never above `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Disconnected { retry_in_ms: u64 },
    Connecting,
    Connected,
}

/// Point-in-time view of a slot, for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub url: String,
    #[serde(flatten)]
    pub state: LinkState,
    pub instance: Option<String>,
}

/// Lifecycle events of one link connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Frame(String),
    Closed,
}

/// A configured target URL. The slot outlives individual connections.
pub struct LinkSlot {
    url: String,
    /// Instance id most recently announced on the current connection.
    announced: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    state: Mutex<LinkState>,
}

impl LinkSlot {
    pub fn new(url: String) -> Self {
        Self {
            url,
            announced: Mutex::new(None),
            outbound: Mutex::new(None),
            state: Mutex::new(LinkState::Disconnected { retry_in_ms: 0 }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announced(&self) -> Option<String> {
        self.announced.lock().await.clone()
    }

    /// Replace the announced instance, returning the previous one.
    pub async fn set_announced(&self, instance: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.announced.lock().await, instance)
    }

    pub async fn attach(&self, tx: mpsc::Sender<String>) {
        *self.outbound.lock().await = Some(tx);
    }

    pub async fn detach(&self) {
        self.outbound.lock().await.take();
    }

    pub async fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub async fn state(&self) -> LinkState {
        self.state.lock().await.clone()
    }

    async fn set_state(&self, state: LinkState) {
        *self.state.lock().await = state;
    }

    pub async fn status(&self) -> LinkStatus {
        LinkStatus {
            url: self.url.clone(),
            state: self.state().await,
            instance: self.announced().await,
        }
    }

    /// Queue `payload` for the live connection. Returns false (and drops the
    /// payload) when there is none.
    pub async fn send(&self, payload: &str) -> bool {
        let outbound = self.outbound.lock().await;
        let Some(tx) = outbound.as_ref() else {
            debug!(url = %self.url, "link not connected, dropping command");
            return false;
        };
        match tx.try_send(payload.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(url = %self.url, "link queue full, dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub struct LinkManager {
    slots: Vec<Arc<LinkSlot>>,
    hub: Arc<FrontendHub>,
    metrics: Arc<RelayMetrics>,
    config: LinkConfig,
}

impl LinkManager {
    pub fn new(config: LinkConfig, hub: Arc<FrontendHub>, metrics: Arc<RelayMetrics>) -> Self {
        let slots = config
            .urls
            .iter()
            .map(|url| Arc::new(LinkSlot::new(url.clone())))
            .collect();
        Self {
            slots,
            hub,
            metrics,
            config,
        }
    }

    pub fn slots(&self) -> &[Arc<LinkSlot>] {
        &self.slots
    }

    pub async fn connected_count(&self) -> usize {
        let mut n = 0;
        for slot in &self.slots {
            if slot.is_connected().await {
                n += 1;
            }
        }
        n
    }

    pub async fn statuses(&self) -> Vec<LinkStatus> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            out.push(slot.status().await);
        }
        out
    }

    /// Spawn one supervisor per slot. Tasks exit when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.slots.is_empty() {
            debug!("no outbound links configured");
        }
        self.slots
            .iter()
            .map(|slot| {
                let manager = self.clone();
                let slot = slot.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { manager.supervise(slot, cancel).await })
            })
            .collect()
    }

    async fn supervise(&self, slot: Arc<LinkSlot>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            slot.set_state(LinkState::Connecting).await;
            debug!(url = %slot.url(), "connecting to instance");

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio_tungstenite::connect_async(slot.url()) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    if self.config.reset_backoff_on_connect {
                        backoff.reset();
                    }
                    self.run_connection(&slot, ws, &cancel).await;
                }
                Err(e) => {
                    warn!(url = %slot.url(), error = %e, "link connect failed");
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            slot.set_state(LinkState::Disconnected {
                retry_in_ms: delay.as_millis() as u64,
            })
            .await;
            info!(url = %slot.url(), delay_ms = delay.as_millis() as u64, "link down, retrying");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        slot.set_state(LinkState::Disconnected { retry_in_ms: 0 }).await;
        debug!(url = %slot.url(), "link supervisor stopped");
    }

    async fn run_connection(
        &self,
        slot: &LinkSlot,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        cancel: &CancellationToken,
    ) {
        let (mut ws_write, mut ws_read) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(LINK_QUEUE);

        self.handle_event(slot, LinkEvent::Opened).await;
        slot.attach(tx).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = ws_write.send(Message::Close(None)).await {
                        debug!(url = %slot.url(), error = %e, "link close");
                    }
                    break;
                }
                Some(payload) = rx.recv() => {
                    if let Err(e) = ws_write.send(Message::Text(payload.into())).await {
                        warn!(url = %slot.url(), error = %e, "link send failed");
                        break;
                    }
                }
                msg = ws_read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_event(slot, LinkEvent::Frame(text.as_str().to_owned())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(url = %slot.url(), error = %e, "link read failed");
                        break;
                    }
                }
            }
        }

        slot.detach().await;
        self.handle_event(slot, LinkEvent::Closed).await;
    }

    /// Apply one connection event to the registry and the front ends.
    pub async fn handle_event(&self, slot: &LinkSlot, event: LinkEvent) {
        let source = Source::Link(slot.url().to_string());

        match event {
            LinkEvent::Opened => {
                slot.set_announced(None).await;
                slot.set_state(LinkState::Connected).await;
                self.metrics.link_connected();
                info!(url = %slot.url(), "link connected");
            }
            LinkEvent::Frame(text) => match classify_link_frame(&text) {
                LinkFrame::Announcement(body) => {
                    let record = match parse_announcement(body, Transport::Link) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(url = %slot.url(), error = %e, "ignoring announcement");
                            return;
                        }
                    };
                    let id = record.instance().to_string();
                    let previous = slot.set_announced(Some(id.clone())).await;
                    self.hub
                        .apply_presence(|table| {
                            if let Some(prev) = previous.as_deref().filter(|p| *p != id) {
                                table.depart(prev, &source);
                            }
                            table.upsert(record, source);
                        })
                        .await;
                    info!(url = %slot.url(), instance = %id, "instance announced");
                }
                LinkFrame::Passthrough(raw) => self.hub.broadcast_passthrough(raw).await,
            },
            LinkEvent::Closed => {
                self.metrics.link_disconnected();
                if let Some(id) = slot.set_announced(None).await {
                    self.hub.apply_presence(|table| table.depart(&id, &source)).await;
                }
                info!(url = %slot.url(), "link closed");
            }
        }
    }
}
