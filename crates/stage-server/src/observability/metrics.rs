//! Registry metrics for health reporting and the Prometheus exporter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Point-in-time metric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub stages: usize,
    pub participants: usize,
    pub connections: usize,
}

/// Shared counters for stages, participants and connections.
///
/// Updated by the actors and the connection layer; mirrored into the
/// `metrics` recorder so the `/metrics` endpoint reflects them.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    stages: AtomicUsize,
    participants: AtomicUsize,
    connections: AtomicUsize,
}

impl RegistryMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stage_created(&self) {
        let value = self.stages.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("stage_active_stages").set(to_f64(value));
    }

    pub fn stage_deleted(&self) {
        let value = self.stages.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::gauge!("stage_active_stages").set(to_f64(value));
    }

    pub fn participant_joined(&self) {
        let value = self.participants.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("stage_active_participants").set(to_f64(value));
    }

    pub fn participant_left(&self) {
        let value = self
            .participants
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        metrics::gauge!("stage_active_participants").set(to_f64(value));
    }

    pub fn connection_opened(&self) {
        let value = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("stage_active_connections").set(to_f64(value));
        metrics::counter!("stage_connections_total").increment(1);
    }

    pub fn connection_closed(&self) {
        let value = self
            .connections
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        metrics::gauge!("stage_active_connections").set(to_f64(value));
    }

    pub fn message_processed(&self) {
        metrics::counter!("stage_signaling_messages_total").increment(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stages: self.stages.load(Ordering::SeqCst),
            participants: self.participants.load(Ordering::SeqCst),
            connections: self.connections.load(Ordering::SeqCst),
        }
    }
}

#[allow(clippy::cast_precision_loss)] // gauge counts stay far below 2^52
fn to_f64(value: usize) -> f64 {
    value as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tracks_counters() {
        let metrics = RegistryMetrics::new();

        metrics.stage_created();
        metrics.participant_joined();
        metrics.participant_joined();
        metrics.connection_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages, 1);
        assert_eq!(snapshot.participants, 2);
        assert_eq!(snapshot.connections, 1);

        metrics.participant_left();
        metrics.connection_closed();
        metrics.stage_deleted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages, 0);
        assert_eq!(snapshot.participants, 1);
        assert_eq!(snapshot.connections, 0);
    }
}
