//! # Transfer Deduplication Engine
//!
//! Two strategies share one interface and are selected by comparing a
//! transport's transfer-ID modulo against
//! [`MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD`](crate::transport::MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD).
//! Used live by [`super::input::RedundantInputSession`] and offline by
//! [`super::tracer::RedundantTracer`].

use crate::transport::{NodeId, Timestamp, MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD};
use std::collections::HashMap;
use std::time::Duration;

/// Per-session transfer deduplication policy. Never fails — it only ever
/// returns whether to accept a transfer. Selection churn under a disturbed
/// network is expected and acceptable.
pub trait Deduplicator: std::fmt::Debug + Send {
    /// `iface_id` uniquely identifies, within the redundant group, the
    /// inferior the transfer was received from (see
    /// [`crate::transport::next_iface_id`]).
    fn should_accept_transfer(
        &mut self,
        iface_id: u64,
        transfer_id_timeout: Duration,
        timestamp: Timestamp,
        source_node_id: Option<NodeId>,
        transfer_id: u64,
    ) -> bool;
}

/// Constructs the deduplicator variant appropriate for `transfer_id_modulo`.
pub fn new(transfer_id_modulo: u64) -> Box<dyn Deduplicator> {
    if transfer_id_modulo >= MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD {
        Box::new(MonotonicDeduplicator::default())
    } else {
        Box::new(CyclicDeduplicator::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct MonotonicState {
    last_transfer_id: u64,
    last_accepted_at: Timestamp,
}

/// Accepts the first arrival of a higher transfer-ID across *any* inferior,
/// giving instant fail-over. Tracks one highest-accepted transfer-ID per
/// source node; a gap exceeding `transfer_id_timeout` since the last accept
/// is treated as a remote restart and resets that source's state.
#[derive(Debug, Default)]
pub struct MonotonicDeduplicator {
    per_source: HashMap<Option<NodeId>, MonotonicState>,
}

impl Deduplicator for MonotonicDeduplicator {
    fn should_accept_transfer(
        &mut self,
        _iface_id: u64,
        transfer_id_timeout: Duration,
        timestamp: Timestamp,
        source_node_id: Option<NodeId>,
        transfer_id: u64,
    ) -> bool {
        match self.per_source.get_mut(&source_node_id) {
            None => {
                self.per_source.insert(
                    source_node_id,
                    MonotonicState { last_transfer_id: transfer_id, last_accepted_at: timestamp },
                );
                true
            }
            Some(state) => {
                let restarted = timestamp.saturating_duration_since(state.last_accepted_at) > transfer_id_timeout;
                let accept = transfer_id > state.last_transfer_id || restarted;
                if accept {
                    state.last_transfer_id = transfer_id;
                    state.last_accepted_at = timestamp;
                }
                accept
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CyclicState {
    selected_iface_id: u64,
    last_accepted_at: Timestamp,
}

/// Maintains a single selected inferior per source and only switches away
/// from it once that inferior has been silent for `transfer_id_timeout`.
/// Trades fail-over latency (bounded by the TID timeout) for immunity to
/// false duplicate-detection caused by transfer-ID wraparound on a lagged
/// inferior.
#[derive(Debug, Default)]
pub struct CyclicDeduplicator {
    per_source: HashMap<NodeId, CyclicState>,
}

impl Deduplicator for CyclicDeduplicator {
    fn should_accept_transfer(
        &mut self,
        iface_id: u64,
        transfer_id_timeout: Duration,
        timestamp: Timestamp,
        source_node_id: Option<NodeId>,
        _transfer_id: u64,
    ) -> bool {
        // Anonymous transfers cannot be tracked; always accept them.
        let Some(source) = source_node_id else {
            return true;
        };
        match self.per_source.get_mut(&source) {
            None => {
                self.per_source.insert(source, CyclicState { selected_iface_id: iface_id, last_accepted_at: timestamp });
                true
            }
            Some(state) => {
                if state.selected_iface_id == iface_id {
                    state.last_accepted_at = timestamp;
                    true
                } else if timestamp.saturating_duration_since(state.last_accepted_at) > transfer_id_timeout {
                    state.selected_iface_id = iface_id;
                    state.last_accepted_at = timestamp;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn t(millis: u64) -> Timestamp {
        // Anchor all test timestamps to a single base `now` so deltas are
        // exactly `millis` apart regardless of wall-clock skew.
        lazy_base() + Duration::from_millis(millis)
    }

    fn lazy_base() -> Instant {
        static BASE: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        *BASE.get_or_init(Instant::now)
    }

    #[test]
    fn monotonic_accepts_strictly_increasing_ids() {
        let mut d = MonotonicDeduplicator::default();
        let timeout = Duration::from_secs(1);
        assert!(d.should_accept_transfer(1, timeout, t(0), Some(10), 5));
        assert!(d.should_accept_transfer(2, timeout, t(10), Some(10), 6));
        assert!(!d.should_accept_transfer(1, timeout, t(20), Some(10), 6));
        assert!(!d.should_accept_transfer(2, timeout, t(30), Some(10), 4));
    }

    #[test]
    fn monotonic_restart_resets_after_timeout() {
        let mut d = MonotonicDeduplicator::default();
        let timeout = Duration::from_millis(50);
        assert!(d.should_accept_transfer(1, timeout, t(0), Some(10), 100));
        assert!(!d.should_accept_transfer(1, timeout, t(10), Some(10), 50));
        // A lower transfer-ID long after the timeout looks like a restart.
        assert!(d.should_accept_transfer(1, timeout, t(1000), Some(10), 1));
    }

    #[test]
    fn cyclic_prefers_selected_iface_until_timeout() {
        let mut d = CyclicDeduplicator::default();
        let timeout = Duration::from_millis(100);
        assert!(d.should_accept_transfer(1, timeout, t(0), Some(10), 1));
        // Same TID from the other iface, arriving quickly: rejected.
        assert!(!d.should_accept_transfer(2, timeout, t(10), Some(10), 1));
        // Selected iface keeps being accepted.
        assert!(d.should_accept_transfer(1, timeout, t(20), Some(10), 2));
        // Once the selected iface goes silent past the timeout, fail over.
        assert!(d.should_accept_transfer(2, timeout, t(200), Some(10), 2));
    }

    #[test]
    fn cyclic_always_accepts_anonymous() {
        let mut d = CyclicDeduplicator::default();
        let timeout = Duration::from_millis(100);
        assert!(d.should_accept_transfer(1, timeout, t(0), None, 1));
        assert!(d.should_accept_transfer(2, timeout, t(1), None, 1));
    }
}
