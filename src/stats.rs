//! Broker occupancy counters and the gauge sink they are published to.

use serde::Serialize;
use std::collections::HashMap;

/// Snapshot of the broker's occupancy, totaled and per scheduler class.
///
/// Every decrement inside the broker is guarded by the removal of the entry
/// that justified the matching increment, so the counters never underflow
/// even when timers race a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Evaluations eligible for dispatch across all ready queues.
    pub total_ready: usize,
    /// Deliveries awaiting ack or nack.
    pub total_unacked: usize,
    /// Evaluations parked behind another evaluation of the same job.
    pub total_blocked: usize,
    /// Evaluations held by a relative wait or an absolute deadline.
    pub total_waiting: usize,
    /// Ready/unacked split per scheduler class.
    pub by_scheduler: HashMap<String, SchedulerStats>,
}

/// Per-class occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ready: usize,
    pub unacked: usize,
}

/// Destination for periodically published broker gauges.
pub trait MetricsSink: Send + Sync {
    /// Record the current value of the gauge at `path`.
    fn set_gauge(&self, path: &[&str], value: f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_clone_is_deep() {
        let mut stats = BrokerStats::default();
        stats.total_ready = 2;
        stats
            .by_scheduler
            .insert("service".to_string(), SchedulerStats { ready: 2, unacked: 0 });

        let mut copy = stats.clone();
        copy.by_scheduler.get_mut("service").unwrap().ready = 0;
        assert_eq!(stats.by_scheduler["service"].ready, 2);
    }
}
