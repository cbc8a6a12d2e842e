//! Relay metrics for observability
//!
//! Lock-free counters updated by the hub, router and transport adapters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Front-end sessions
    /// Currently connected front ends
    pub active_sessions: AtomicU64,
    /// Front ends connected since start
    pub total_sessions: AtomicU64,

    // Commands
    /// Command messages accepted by the router
    pub commands_routed: AtomicU64,
    /// Command messages dropped because they did not parse
    pub commands_rejected: AtomicU64,
    /// Publishes to the broker send topic
    pub broker_publishes: AtomicU64,
    /// Sends to outbound links
    pub link_sends: AtomicU64,
    /// Link sends skipped because the broker already reaches the instance
    pub link_skips: AtomicU64,

    // Front-end delivery
    /// Log/status frames forwarded from instances
    pub passthrough_frames: AtomicU64,
    /// Frames queued to front-end sessions
    pub frames_sent: AtomicU64,
    /// Frames dropped because a session queue was full
    pub frames_dropped: AtomicU64,
    /// Sessions removed after a failed delivery
    pub session_failures: AtomicU64,

    // Links
    pub link_connects: AtomicU64,
    pub link_disconnects: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_routed(&self) {
        self.commands_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_published(&self) {
        self.broker_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_sent(&self) {
        self.link_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_skipped(&self) {
        self.link_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passthrough(&self) {
        self.passthrough_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_connected(&self) {
        self.link_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_disconnected(&self) {
        self.link_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total: self.total_sessions.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                routed: self.commands_routed.load(Ordering::Relaxed),
                rejected: self.commands_rejected.load(Ordering::Relaxed),
                broker_publishes: self.broker_publishes.load(Ordering::Relaxed),
                link_sends: self.link_sends.load(Ordering::Relaxed),
                link_skips: self.link_skips.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                passthrough: self.passthrough_frames.load(Ordering::Relaxed),
                sent: self.frames_sent.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                failed_sessions: self.session_failures.load(Ordering::Relaxed),
            },
            links: LinkMetrics {
                connects: self.link_connects.load(Ordering::Relaxed),
                disconnects: self.link_disconnects.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub commands: CommandMetrics,
    pub frames: FrameMetrics,
    pub links: LinkMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetrics {
    pub routed: u64,
    pub rejected: u64,
    pub broker_publishes: u64,
    pub link_sends: u64,
    pub link_skips: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub passthrough: u64,
    pub sent: u64,
    pub dropped: u64,
    pub failed_sessions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub connects: u64,
    pub disconnects: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub instances: u64,
    pub sessions: u64,
    pub transports: TransportHealth,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportHealth {
    pub links_configured: u64,
    pub links_connected: u64,
    pub broker_configured: bool,
    pub broker_connected: bool,
}

impl TransportHealth {
    /// Degraded when something is configured but nothing is reachable.
    pub fn is_degraded(&self) -> bool {
        let configured = self.links_configured > 0 || self.broker_configured;
        let up = self.links_connected > 0 || self.broker_connected;
        configured && !up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tracking() {
        let metrics = RelayMetrics::new();

        metrics.session_opened();
        metrics.session_opened();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_sessions.load(Ordering::Relaxed), 2);

        metrics.session_closed();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_sessions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = RelayMetrics::new();
        metrics.session_opened();
        metrics.command_routed();
        metrics.link_skipped();
        metrics.frame_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.active, 1);
        assert_eq!(snapshot.commands.routed, 1);
        assert_eq!(snapshot.commands.link_skips, 1);
        assert_eq!(snapshot.frames.dropped, 1);
    }

    #[test]
    fn test_transport_health() {
        let mut health = TransportHealth {
            links_configured: 0,
            links_connected: 0,
            broker_configured: false,
            broker_connected: false,
        };
        assert!(!health.is_degraded());

        health.links_configured = 2;
        assert!(health.is_degraded());

        health.broker_configured = true;
        health.broker_connected = true;
        assert!(!health.is_degraded());
    }
}
