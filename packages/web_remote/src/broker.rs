//! Broker Link
//!
//! Single MQTT client. Commands go out on the send topic; the receive topic
//! and per-instance `status/<id>/log` topics are forwarded to the front ends
//! and `status/<id>` topics drive broker-sourced presence.
//!
//! A status body names its instance; the `<id>` topic segment only addresses
//! the publisher. The link remembers which instance each status topic last
//! announced so an empty status on that topic withdraws the right record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::hub::FrontendHub;
use crate::protocol::{FrameError, TopicKind, classify_topic, parse_status};
use crate::registry::Source;
use crate::router::CommandSink;

/// Requests buffered between the client handle and the event loop.
const CLIENT_CAPACITY: usize = 64;

pub struct BrokerLink {
    client: AsyncClient,
    config: BrokerConfig,
    connected: AtomicBool,
    /// Status topic id -> instance its last status announced.
    announced: Mutex<HashMap<String, String>>,
}

impl BrokerLink {
    /// Build the client. Nothing touches the network until the returned
    /// event loop is driven by [`BrokerLink::run`].
    pub fn new(config: BrokerConfig) -> (Arc<Self>, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let link = Arc::new(Self {
            client,
            config,
            connected: AtomicBool::new(false),
            announced: Mutex::new(HashMap::new()),
        });
        (link, eventloop)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Publish if connected, otherwise drop. At-most-once either way.
    pub fn publish(&self, topic: &str, payload: &str) -> bool {
        if !self.is_connected() {
            debug!(topic = %topic, "broker not connected, dropping publish");
            return false;
        }
        match self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
        {
            Ok(()) => true,
            Err(e) => {
                warn!(topic = %topic, error = %e, "broker publish failed");
                false
            }
        }
    }

    /// Drive the MQTT event loop until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        mut eventloop: EventLoop,
        hub: Arc<FrontendHub>,
        cancel: CancellationToken,
    ) {
        info!(host = %self.config.host, port = self.config.port, "starting broker link");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::Relaxed);
                    info!(host = %self.config.host, "connected to broker");
                    self.subscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(&hub, &publish.topic, &publish.payload)
                        .await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::Relaxed);
                    warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::Relaxed) {
                        warn!(error = %e, "broker connection lost");
                    } else {
                        debug!(error = %e, "broker connect failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }

        self.connected.store(false, Ordering::Relaxed);
        debug!("broker link stopped");
    }

    fn subscribe(&self) {
        for topic in [&self.config.status_topic, &self.config.receive_topic] {
            match self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => info!(topic = %topic, "subscribed"),
                Err(e) => error!(topic = %topic, error = %e, "subscribe failed"),
            }
        }
    }

    /// Dispatch one inbound publish.
    pub async fn handle_publish(&self, hub: &FrontendHub, topic: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);

        match classify_topic(topic, &self.config.receive_topic) {
            TopicKind::Receive => hub.broadcast_passthrough(&text).await,
            TopicKind::Log(id) => {
                debug!(instance = %id, "instance log line");
                hub.broadcast_passthrough(&text).await;
            }
            TopicKind::Status(id) => self.handle_status(hub, id, &text).await,
            TopicKind::Unexpected => {
                warn!(topic = %topic, "unexpected broker topic");
            }
        }
    }

    async fn handle_status(&self, hub: &FrontendHub, topic_id: &str, text: &str) {
        if text.is_empty() || topic_id.trim().is_empty() {
            let instance = self
                .announced
                .lock()
                .await
                .remove(topic_id)
                .unwrap_or_else(|| topic_id.to_string());
            let changed = hub
                .apply_presence(|table| table.depart(&instance, &Source::Broker))
                .await;
            if changed {
                info!(topic_id = %topic_id, instance = %instance, "instance left broker");
            }
            return;
        }

        let record = match parse_status(text) {
            Ok(record) => record,
            Err(FrameError::Json(e)) => {
                error!(topic_id = %topic_id, error = %e, "failed to parse instance status");
                return;
            }
            Err(e) => {
                warn!(topic_id = %topic_id, error = %e, "ignoring instance status");
                return;
            }
        };

        let instance = record.instance().to_string();
        let previous = self
            .announced
            .lock()
            .await
            .insert(topic_id.to_string(), instance.clone());

        hub.apply_presence(|table| {
            if let Some(prev) = previous.as_deref().filter(|p| *p != instance) {
                table.depart(prev, &Source::Broker);
            }
            table.upsert(record, Source::Broker);
        })
        .await;
        debug!(topic_id = %topic_id, instance = %instance, "broker status");
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "broker disconnect");
        }
    }
}

impl CommandSink for BrokerLink {
    fn deliver(&self, payload: &str) -> bool {
        self.publish(&self.config.send_topic, payload)
    }
}
