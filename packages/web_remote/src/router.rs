//! Command Router
//!
//! Canonicalises front-end commands and delivers them to the broker and the
//! outbound links. The broker always gets one publish; a link is skipped
//! when the instance it announced is also reachable through the broker.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::link::LinkSlot;
use crate::metrics::RelayMetrics;
use crate::registry::InstanceRegistry;

/// Something that takes a canonical command payload.
pub trait CommandSink: Send + Sync {
    /// Deliver `payload`; returns false when it was dropped.
    fn deliver(&self, payload: &str) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("command is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("command batch is empty")]
    EmptyBatch,
}

/// What happened to one routed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    pub payload: String,
    pub broker_published: bool,
    pub link_sends: usize,
    pub link_skips: usize,
}

/// Turn a command or command array into newline-joined JSON, one command
/// per line. When `default_instance` is set, commands without an
/// `instance` field get it injected.
pub fn canonicalize(raw: &str, default_instance: Option<&str>) -> Result<String, RouteError> {
    let parsed: Value = serde_json::from_str(raw)?;
    let mut commands = match parsed {
        Value::Array(items) => items,
        single => vec![single],
    };
    if commands.is_empty() {
        return Err(RouteError::EmptyBatch);
    }

    if let Some(instance) = default_instance {
        for command in commands.iter_mut() {
            if let Value::Object(map) = command {
                map.entry("instance")
                    .or_insert_with(|| Value::String(instance.to_string()));
            }
        }
    }

    let lines = commands
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

pub struct CommandRouter {
    registry: Arc<InstanceRegistry>,
    links: Vec<Arc<LinkSlot>>,
    broker: Option<Arc<dyn CommandSink>>,
    metrics: Arc<RelayMetrics>,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        links: Vec<Arc<LinkSlot>>,
        broker: Option<Arc<dyn CommandSink>>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            links,
            broker,
            metrics,
        }
    }

    /// Route one front-end message. Unparseable messages are logged and
    /// dropped whole.
    pub async fn route(
        &self,
        raw: &str,
        default_instance: Option<&str>,
    ) -> Result<RouteOutcome, RouteError> {
        let payload = match canonicalize(raw, default_instance) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping front-end message");
                self.metrics.command_rejected();
                return Err(e);
            }
        };
        self.metrics.command_routed();

        let mut outcome = RouteOutcome::default();

        if let Some(broker) = &self.broker {
            outcome.broker_published = broker.deliver(&payload);
            if outcome.broker_published {
                self.metrics.broker_published();
            }
        }

        for slot in &self.links {
            if let Some(instance) = slot.announced().await {
                if self.registry.via_broker(&instance).await {
                    debug!(url = %slot.url(), instance = %instance, "instance reachable via broker, skipping link");
                    self.metrics.link_skipped();
                    outcome.link_skips += 1;
                    continue;
                }
            }
            if slot.send(&payload).await {
                self.metrics.link_sent();
                outcome.link_sends += 1;
            }
        }

        outcome.payload = payload;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Transport, parse_announcement};
    use crate::registry::Source;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<String>>,
    }

    impl CommandSink for RecordingSink {
        fn deliver(&self, payload: &str) -> bool {
            self.payloads.lock().unwrap().push(payload.to_string());
            true
        }
    }

    fn record(id: &str) -> crate::protocol::InstanceRecord {
        parse_announcement(&format!(r#"{{"instance":"{id}"}}"#), Transport::Broker).unwrap()
    }

    async fn connected_slot(url: &str) -> (Arc<LinkSlot>, mpsc::Receiver<String>) {
        let slot = Arc::new(LinkSlot::new(url.to_string()));
        let (tx, rx) = mpsc::channel(8);
        slot.attach(tx).await;
        (slot, rx)
    }

    #[test]
    fn canonicalize_array_is_one_object_per_line() {
        let payload = canonicalize(r#"[{"a":1},{"b":2}]"#, None).unwrap();
        assert_eq!(payload, "{\"a\":1}\n{\"b\":2}");
    }

    #[test]
    fn canonicalize_single_object_strips_whitespace_and_keeps_order() {
        let payload = canonicalize(r#"{ "protocol": "NEC", "address": 32, "command": 16 }"#, None).unwrap();
        assert_eq!(payload, r#"{"protocol":"NEC","address":32,"command":16}"#);
    }

    #[test]
    fn canonicalize_injects_missing_instance_only() {
        let payload = canonicalize(r#"[{"a":1},{"a":2,"instance":"tv"}]"#, Some("den")).unwrap();
        assert_eq!(payload, "{\"a\":1,\"instance\":\"den\"}\n{\"a\":2,\"instance\":\"tv\"}");
    }

    #[test]
    fn canonicalize_rejects_garbage_and_empty_batches() {
        assert!(matches!(canonicalize("{oops", None), Err(RouteError::Json(_))));
        assert!(matches!(canonicalize("[]", None), Err(RouteError::EmptyBatch)));
    }

    #[tokio::test]
    async fn parse_failure_delivers_nothing() {
        let registry = Arc::new(InstanceRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let (slot, mut rx) = connected_slot("ws://a").await;
        let router = CommandRouter::new(
            registry,
            vec![slot],
            Some(sink.clone()),
            Arc::new(RelayMetrics::new()),
        );

        assert!(router.route("[{\"a\":1},", None).await.is_err());
        assert!(sink.payloads.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broker_and_unidentified_links_both_receive() {
        let registry = Arc::new(InstanceRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let (slot, mut rx) = connected_slot("ws://a").await;
        let router = CommandRouter::new(
            registry,
            vec![slot],
            Some(sink.clone()),
            Arc::new(RelayMetrics::new()),
        );

        let outcome = router.route(r#"[{"a":1},{"b":2}]"#, None).await.unwrap();
        assert!(outcome.broker_published);
        assert_eq!(outcome.link_sends, 1);
        assert_eq!(sink.payloads.lock().unwrap()[0], "{\"a\":1}\n{\"b\":2}");
        assert_eq!(rx.recv().await.unwrap(), "{\"a\":1}\n{\"b\":2}");
    }

    #[tokio::test]
    async fn link_skipped_when_instance_known_via_broker() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.upsert(record("X"), Source::Broker).await;
        registry
            .upsert(record("X"), Source::Link("ws://a".to_string()))
            .await;

        let sink = Arc::new(RecordingSink::default());
        let (slot, mut rx) = connected_slot("ws://a").await;
        slot.set_announced(Some("X".to_string())).await;
        let (other, mut other_rx) = connected_slot("ws://b").await;
        other.set_announced(Some("Y".to_string())).await;

        let router = CommandRouter::new(
            registry,
            vec![slot, other],
            Some(sink.clone()),
            Arc::new(RelayMetrics::new()),
        );

        let outcome = router.route(r#"{"cmd":"power"}"#, None).await.unwrap();
        assert!(outcome.broker_published);
        assert_eq!(outcome.link_skips, 1);
        assert_eq!(outcome.link_sends, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(other_rx.recv().await.unwrap(), r#"{"cmd":"power"}"#);
    }

    #[tokio::test]
    async fn disconnected_link_drops_silently() {
        let registry = Arc::new(InstanceRegistry::new());
        let slot = Arc::new(LinkSlot::new("ws://down".to_string()));
        let router = CommandRouter::new(registry, vec![slot], None, Arc::new(RelayMetrics::new()));

        let outcome = router.route(r#"{"cmd":"mute"}"#, None).await.unwrap();
        assert!(!outcome.broker_published);
        assert_eq!(outcome.link_sends, 0);
    }
}
