//! # Redundant Tracer
//!
//! Consumes [`super::RedundantCapture`]s and emits high-level traces,
//! maintaining one inner tracer per inferior (keyed by iface-id, created
//! lazily via that inferior's own [`Transport::make_tracer`]) and one
//! deduplicator per (destination-node-id, data-specifier), flushed whenever
//! the TID modulo for that key changes.

use super::dedup::{self, Deduplicator};
use super::RedundantCapture;
use crate::transport::{Capture, DataSpecifier, NodeId, Tracer, TracerEvent, Transport};
use std::collections::HashMap;
use std::sync::Arc;

struct NullTracer;

impl Tracer for NullTracer {
    fn update(&mut self, _capture: &dyn Capture) -> Option<TracerEvent> {
        None
    }
}

struct DedupEntry {
    modulo: u64,
    dedup: Box<dyn Deduplicator>,
}

/// See the module documentation. Constructed via
/// [`super::RedundantTransport::make_tracer`], which supplies the
/// iface-id-to-transport map needed to create inner tracers lazily.
pub struct RedundantTracer {
    factories: HashMap<u64, Arc<dyn Transport>>,
    inner_tracers: HashMap<u64, Box<dyn Tracer>>,
    dedups: HashMap<(Option<NodeId>, DataSpecifier), DedupEntry>,
}

impl RedundantTracer {
    pub fn new() -> Self {
        Self { factories: HashMap::new(), inner_tracers: HashMap::new(), dedups: HashMap::new() }
    }

    /// Used by [`super::RedundantTransport::make_tracer`] to seed the
    /// iface-id-to-transport map for the inferiors attached at the time the
    /// tracer was requested.
    pub fn with_factories(factories: HashMap<u64, Arc<dyn Transport>>) -> Self {
        Self { factories, inner_tracers: HashMap::new(), dedups: HashMap::new() }
    }
}

impl Default for RedundantTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for RedundantTracer {
    fn update(&mut self, capture: &dyn Capture) -> Option<TracerEvent> {
        let rc = capture.as_any().downcast_ref::<RedundantCapture>()?;

        if !self.inner_tracers.contains_key(&rc.iface_id) {
            let tracer = self
                .factories
                .get(&rc.iface_id)
                .map(|t| t.make_tracer())
                .unwrap_or_else(|| Box::new(NullTracer) as Box<dyn Tracer>);
            self.inner_tracers.insert(rc.iface_id, tracer);
        }
        let inner_tracer = self.inner_tracers.get_mut(&rc.iface_id).unwrap();
        let event = inner_tracer.update(rc.inner.as_ref())?;

        let TracerEvent::Transfer(trace) = event else {
            return Some(event);
        };

        let key = (trace.transfer.session_specifier.destination_node_id, trace.transfer.session_specifier.data_specifier.clone());
        let entry = self
            .dedups
            .entry(key)
            .and_modify(|entry| {
                if entry.modulo != rc.transfer_id_modulo {
                    *entry = DedupEntry { modulo: rc.transfer_id_modulo, dedup: dedup::new(rc.transfer_id_modulo) };
                }
            })
            .or_insert_with(|| DedupEntry { modulo: rc.transfer_id_modulo, dedup: dedup::new(rc.transfer_id_modulo) });

        let accept = entry.dedup.should_accept_transfer(
            rc.iface_id,
            trace.metadata.transfer_id_timeout,
            trace.timestamp,
            trace.transfer.session_specifier.source_node_id,
            trace.metadata.transfer_id,
        );
        if accept {
            Some(TracerEvent::Transfer(trace))
        } else {
            Some(TracerEvent::DuplicateTransfer { timestamp: trace.timestamp })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        AlienSessionSpecifier, AlienTransfer, InputSession, OutputSession, PayloadMetadata, ProtocolParameters,
        SessionSpecifier, Timestamp, TransferMetadata, TransferTrace,
    };
    use std::time::Duration;

    #[derive(Debug)]
    struct RawCapture {
        ts: Timestamp,
        transfer_id: u64,
        source_node_id: Option<NodeId>,
        data_specifier: DataSpecifier,
    }

    impl Capture for RawCapture {
        fn timestamp(&self) -> Timestamp {
            self.ts
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// Treats every raw capture as an already-complete transfer; stands in
    /// for a concrete transport's reassembly tracer in this unit test.
    struct PassthroughTracer;

    impl Tracer for PassthroughTracer {
        fn update(&mut self, capture: &dyn Capture) -> Option<TracerEvent> {
            let raw = capture.as_any().downcast_ref::<RawCapture>()?;
            Some(TracerEvent::Transfer(TransferTrace {
                timestamp: raw.ts,
                metadata: TransferMetadata {
                    session_specifier: AlienSessionSpecifier {
                        source_node_id: raw.source_node_id,
                        destination_node_id: None,
                        data_specifier: raw.data_specifier.clone(),
                    },
                    transfer_id: raw.transfer_id,
                    transfer_id_timeout: Duration::from_millis(100),
                },
                transfer: AlienTransfer {
                    timestamp: raw.ts,
                    priority: crate::transport::Priority::Nominal,
                    transfer_id: raw.transfer_id,
                    fragmented_payload: vec![],
                    session_specifier: AlienSessionSpecifier {
                        source_node_id: raw.source_node_id,
                        destination_node_id: None,
                        data_specifier: raw.data_specifier.clone(),
                    },
                },
            }))
        }
    }

    struct FakeTransport;

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        fn protocol_parameters(&self) -> ProtocolParameters {
            ProtocolParameters::default()
        }
        fn local_node_id(&self) -> Option<NodeId> {
            None
        }
        async fn get_input_session(
            &self,
            _specifier: SessionSpecifier,
            _payload_metadata: PayloadMetadata,
        ) -> crate::error::Result<Arc<dyn InputSession>> {
            unreachable!("not exercised by this test")
        }
        async fn get_output_session(
            &self,
            _specifier: SessionSpecifier,
            _payload_metadata: PayloadMetadata,
        ) -> crate::error::Result<Arc<dyn OutputSession>> {
            unreachable!("not exercised by this test")
        }
        fn sample_statistics(&self) -> crate::transport::TransportStatistics {
            Default::default()
        }
        async fn close(&self) {}
        fn begin_capture(&self, _handler: crate::transport::CaptureCallback) {}
        async fn spoof(&self, _transfer: AlienTransfer, _deadline: Timestamp) -> crate::error::Result<bool> {
            Ok(true)
        }
        fn make_tracer(&self) -> Box<dyn Tracer> {
            Box::new(PassthroughTracer)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn capture_at(ts: Timestamp, transfer_id: u64) -> RedundantCapture {
        RedundantCapture {
            iface_id: 1,
            transfer_id_modulo: 32,
            inner: Arc::new(RawCapture { ts, transfer_id, source_node_id: Some(10), data_specifier: DataSpecifier::Subject(7) }),
        }
    }

    #[test]
    fn duplicate_across_ifaces_is_suppressed() {
        let mut factories: HashMap<u64, Arc<dyn Transport>> = HashMap::new();
        factories.insert(1, Arc::new(FakeTransport));
        factories.insert(2, Arc::new(FakeTransport));
        let mut tracer = RedundantTracer::with_factories(factories);

        let t0 = Timestamp::now();
        let first = tracer.update(&capture_at(t0, 5));
        assert!(matches!(first, Some(TracerEvent::Transfer(_))));

        let mut dup = capture_at(t0, 5);
        dup.iface_id = 2; // a second, unregistered iface delivering the same transfer
        let second = tracer.update(&dup);
        assert!(matches!(second, Some(TracerEvent::DuplicateTransfer { .. })));
    }
}
