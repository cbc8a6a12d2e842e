//! Instance Registry
//!
//! In-memory presence table shared by both transport adapters and the
//! frontend hub. One record per instance id; the latest announcement from
//! any transport replaces the previous record wholesale.
//!
//! Each record also remembers which sources currently vouch for it (link
//! slots by URL, and/or the broker). A transport-driven departure withdraws
//! one source and only drops the record once no source is left.

use std::collections::{BTreeMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::{InstanceRecord, Transport};

/// Where a presence announcement came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// Outbound link slot, keyed by its target URL.
    Link(String),
    Broker,
}

impl Source {
    fn transport(&self) -> Transport {
        match self {
            Source::Link(_) => Transport::Link,
            Source::Broker => Transport::Broker,
        }
    }
}

/// Registry contents at a given version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Bumped on every effective mutation.
    pub version: u64,
    /// Records ordered by instance id.
    pub records: Vec<InstanceRecord>,
}

#[derive(Debug)]
struct Entry {
    record: InstanceRecord,
    links: HashSet<String>,
    broker: bool,
}

impl Entry {
    fn unsourced(&self) -> bool {
        !self.broker && self.links.is_empty()
    }
}

/// The table behind the registry lock. Mutations happen through
/// [`InstanceRegistry::update`].
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: BTreeMap<String, Entry>,
    version: u64,
}

impl PresenceTable {
    /// Insert or replace the record for `record.instance()`.
    pub fn upsert(&mut self, mut record: InstanceRecord, source: Source) {
        record.transport = source.transport();
        let id = record.instance().to_string();

        let entry = self.entries.entry(id).or_insert_with(|| Entry {
            record: record.clone(),
            links: HashSet::new(),
            broker: false,
        });
        entry.record = record;
        match source {
            Source::Link(url) => {
                entry.links.insert(url);
            }
            Source::Broker => entry.broker = true,
        }
        self.version += 1;
    }

    /// Withdraw `source` from `id`. Returns true if anything changed.
    pub fn depart(&mut self, id: &str, source: &Source) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };

        let withdrawn = match source {
            Source::Link(url) => entry.links.remove(url),
            Source::Broker => std::mem::replace(&mut entry.broker, false),
        };
        if !withdrawn {
            return false;
        }

        if entry.unsourced() {
            self.entries.remove(id);
            debug!(instance = %id, "instance no longer reachable");
        }
        self.version += 1;
        true
    }

    /// Drop `id` regardless of which sources vouch for it.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&InstanceRecord> {
        self.entries.get(id).map(|e| &e.record)
    }

    /// Whether the broker currently reports `id` as present.
    pub fn via_broker(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| e.broker)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            records: self.entries.values().map(|e| e.record.clone()).collect(),
        }
    }
}

/// Lock-guarded presence table.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    table: RwLock<PresenceTable>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under the write lock and return its result together with the
    /// snapshot taken before the lock is released.
    pub async fn update<R>(&self, f: impl FnOnce(&mut PresenceTable) -> R) -> (R, Snapshot) {
        let mut table = self.table.write().await;
        let result = f(&mut table);
        (result, table.snapshot())
    }

    pub async fn upsert(&self, record: InstanceRecord, source: Source) -> Snapshot {
        self.update(|t| t.upsert(record, source)).await.1
    }

    pub async fn depart(&self, id: &str, source: &Source) -> Snapshot {
        self.update(|t| t.depart(id, source)).await.1
    }

    pub async fn remove(&self, id: &str) -> Snapshot {
        self.update(|t| t.remove(id)).await.1
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.table.read().await.snapshot()
    }

    pub async fn via_broker(&self, id: &str) -> bool {
        self.table.read().await.via_broker(id)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_announcement;

    fn record(json: &str) -> InstanceRecord {
        parse_announcement(json, Transport::Link).unwrap()
    }

    fn link(url: &str) -> Source {
        Source::Link(url.to_string())
    }

    #[tokio::test]
    async fn latest_announcement_wins_across_transports() {
        let registry = InstanceRegistry::new();

        registry
            .upsert(record(r#"{"instance":"den","hostname":"old"}"#), Source::Broker)
            .await;
        let snapshot = registry
            .upsert(record(r#"{"instance":"den","description":"new"}"#), link("ws://a"))
            .await;

        assert_eq!(snapshot.records.len(), 1);
        let den = &snapshot.records[0];
        assert_eq!(den.transport, Transport::Link);
        assert_eq!(den.field("description").unwrap(), "new");
        // Full replace: the broker's hostname is gone.
        assert!(den.hostname().is_none());
    }

    #[tokio::test]
    async fn depart_unknown_instance_is_a_noop() {
        let registry = InstanceRegistry::new();
        let before = registry.snapshot().await;
        let after = registry.depart("ghost", &Source::Broker).await;
        assert_eq!(before, after);
        assert!(after.records.is_empty());
    }

    #[tokio::test]
    async fn record_survives_until_last_source_departs() {
        let registry = InstanceRegistry::new();
        registry.upsert(record(r#"{"instance":"den"}"#), Source::Broker).await;
        registry.upsert(record(r#"{"instance":"den"}"#), link("ws://a")).await;
        assert!(registry.via_broker("den").await);

        let snapshot = registry.depart("den", &link("ws://a")).await;
        assert_eq!(snapshot.records.len(), 1);

        let snapshot = registry.depart("den", &Source::Broker).await;
        assert!(snapshot.records.is_empty());
        assert!(!registry.via_broker("den").await);
    }

    #[tokio::test]
    async fn broker_departure_keeps_link_presence() {
        let registry = InstanceRegistry::new();
        registry.upsert(record(r#"{"instance":"den"}"#), link("ws://a")).await;
        registry.upsert(record(r#"{"instance":"den"}"#), Source::Broker).await;

        let snapshot = registry.depart("den", &Source::Broker).await;
        assert_eq!(snapshot.records.len(), 1);
        assert!(!registry.via_broker("den").await);
    }

    #[tokio::test]
    async fn remove_ignores_sources() {
        let registry = InstanceRegistry::new();
        registry.upsert(record(r#"{"instance":"den"}"#), Source::Broker).await;
        registry.upsert(record(r#"{"instance":"den"}"#), link("ws://a")).await;

        let snapshot = registry.remove("den").await;
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn version_only_moves_on_change() {
        let registry = InstanceRegistry::new();
        let v0 = registry.snapshot().await.version;
        let v1 = registry
            .upsert(record(r#"{"instance":"a"}"#), Source::Broker)
            .await
            .version;
        assert!(v1 > v0);

        let v2 = registry.depart("a", &link("ws://never")).await.version;
        assert_eq!(v1, v2);
        let v3 = registry.remove("missing").await.version;
        assert_eq!(v2, v3);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_id() {
        let registry = InstanceRegistry::new();
        for id in ["kitchen", "attic", "den"] {
            registry
                .upsert(record(&format!(r#"{{"instance":"{id}"}}"#)), Source::Broker)
                .await;
        }
        let ids: Vec<_> = registry
            .snapshot()
            .await
            .records
            .into_iter()
            .map(|r| r.instance().to_string())
            .collect();
        assert_eq!(ids, ["attic", "den", "kitchen"]);
    }

    #[test]
    fn interleaved_events_keep_one_record_per_id() {
        let mut table = PresenceTable::default();
        let events: &[(&str, Source, bool)] = &[
            ("a", Source::Broker, true),
            ("a", link("ws://1"), true),
            ("b", link("ws://1"), true),
            ("a", Source::Broker, false),
            ("b", link("ws://2"), true),
            ("a", link("ws://1"), false),
            ("b", link("ws://1"), false),
            ("a", Source::Broker, true),
        ];

        for (id, source, announce) in events {
            if *announce {
                table.upsert(record(&format!(r#"{{"instance":"{id}"}}"#)), source.clone());
            } else {
                table.depart(id, source);
            }
            let snapshot = table.snapshot();
            let mut ids: Vec<_> = snapshot.records.iter().map(|r| r.instance().to_string()).collect();
            let total = ids.len();
            ids.dedup();
            assert_eq!(ids.len(), total);
        }

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("a").unwrap().transport, Transport::Broker);
        assert_eq!(table.get("b").unwrap().transport, Transport::Link);
    }
}
