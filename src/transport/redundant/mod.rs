//! # Redundant Transport
//!
//! A composite [`Transport`] that fans transfers out across a list of
//! inferior transports (the "columns") and keeps one redundant session per
//! session specifier (the "rows"), both kept in lock-step as inferiors are
//! attached and detached at runtime.

pub mod dedup;
pub mod input;
pub mod output;
pub(crate) mod session;
pub mod tracer;

pub use dedup::Deduplicator;
pub use input::{RedundantInputSession, RedundantTransferFrom};
pub use output::RedundantOutputSession;
pub use tracer::RedundantTracer;

use self::session::RedundantSessionControl;
use crate::error::{Error, Result};
use crate::transport::{
    next_iface_id, AlienTransfer, Capture, CaptureCallback, InputSession, NodeId, OutputSession, PayloadMetadata,
    ProtocolParameters, SessionSpecifier, Timestamp, Tracer, Transport, TransportStatistics,
    MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::error;

fn tid_category(modulo: u64) -> TidCategory {
    if modulo >= MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD {
        TidCategory::Monotonic
    } else {
        TidCategory::Cyclic(modulo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TidCategory {
    Monotonic,
    Cyclic(u64),
}

/// A capture observed on one inferior of a redundant transport, wrapped
/// with the inferior's identity and TID modulo so a [`tracer::RedundantTracer`]
/// can route it to the correct inner tracer and deduplicator.
#[derive(Debug)]
pub struct RedundantCapture {
    pub iface_id: u64,
    pub transfer_id_modulo: u64,
    pub inner: Arc<dyn Capture>,
}

impl Capture for RedundantCapture {
    fn timestamp(&self) -> Timestamp {
        self.inner.timestamp()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Inner {
    inferiors: Vec<Arc<dyn Transport>>,
    /// Parallel to `inferiors`; assigned once at attach time so capture
    /// wiring and [`tracer::RedundantTracer`] construction agree on the
    /// same iface-id for the lifetime of the attachment.
    iface_ids: Vec<u64>,
    input_rows: HashMap<SessionSpecifier, Arc<RedundantInputSession>>,
    output_rows: HashMap<SessionSpecifier, Arc<RedundantOutputSession>>,
}

/// See the module documentation.
pub struct RedundantTransport {
    inner: Mutex<Inner>,
    capture: SyncMutex<Option<CaptureCallback>>,
    closed: AtomicBool,
}

impl RedundantTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                inferiors: Vec::new(),
                iface_ids: Vec::new(),
                input_rows: HashMap::new(),
                output_rows: HashMap::new(),
            }),
            capture: SyncMutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Current inferior transports, in column order.
    pub async fn inferiors(&self) -> Vec<Arc<dyn Transport>> {
        self.inner.lock().await.inferiors.clone()
    }

    /// Attaches a new inferior transport, validating it against the current
    /// group before creating its column of sessions. On any failure nothing
    /// is left attached.
    pub async fn attach_inferior(&self, inferior: Arc<dyn Transport>) -> Result<()> {
        if inferior.as_any().downcast_ref::<RedundantTransport>().map(|rt| std::ptr::eq(rt, self)).unwrap_or(false) {
            return Err(Error::Configuration("a redundant transport cannot be its own inferior".into()));
        }

        let mut inner = self.inner.lock().await;

        if inner.inferiors.iter().any(|existing| Arc::ptr_eq(existing, &inferior)) {
            return Err(Error::Configuration("inferior is already attached".into()));
        }

        if let Some(first) = inner.inferiors.first() {
            if first.local_node_id() != inferior.local_node_id() {
                return Err(Error::Configuration("inferior local node-ID does not match the group".into()));
            }
            let existing_category = tid_category(first.protocol_parameters().transfer_id_modulo);
            let new_category = tid_category(inferior.protocol_parameters().transfer_id_modulo);
            if existing_category != new_category {
                return Err(Error::Configuration("inferior transfer-ID modulo category does not match the group".into()));
            }
        }

        inner.inferiors.push(inferior.clone());
        let iface_id = next_iface_id();
        inner.iface_ids.push(iface_id);

        let input_specifiers: Vec<_> = inner.input_rows.keys().copied().collect();
        let output_specifiers: Vec<_> = inner.output_rows.keys().copied().collect();
        let mut attached_input = Vec::new();
        let mut attached_output = Vec::new();
        let mut failure = None;

        for specifier in &input_specifiers {
            let row = inner.input_rows.get(specifier).unwrap().clone();
            match row.add_inferior(&inferior).await {
                Ok(()) => attached_input.push(*specifier),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_none() {
            for specifier in &output_specifiers {
                let row = inner.output_rows.get(specifier).unwrap().clone();
                match row.add_inferior(&inferior).await {
                    Ok(()) => attached_output.push(*specifier),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            let last_index = inner.inferiors.len() - 1;
            for specifier in &attached_input {
                inner.input_rows.get(specifier).unwrap().close_inferior(last_index).await;
            }
            for specifier in &attached_output {
                inner.output_rows.get(specifier).unwrap().close_inferior(last_index).await;
            }
            inner.inferiors.pop();
            inner.iface_ids.pop();
            return Err(err);
        }

        if let Some(handler) = self.capture.lock().unwrap().clone() {
            self.wire_capture(&inferior, iface_id, handler);
        }

        Ok(())
    }

    /// Detaches an inferior transport, closing its column in every row.
    /// Errors while closing a row are logged, not propagated.
    pub async fn detach_inferior(&self, inferior: &Arc<dyn Transport>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.inferiors.iter().position(|existing| Arc::ptr_eq(existing, inferior)) else {
            return Err(Error::Configuration("inferior is not attached".into()));
        };
        inner.inferiors.remove(index);
        inner.iface_ids.remove(index);
        let input_rows: Vec<_> = inner.input_rows.values().cloned().collect();
        let output_rows: Vec<_> = inner.output_rows.values().cloned().collect();
        drop(inner);
        for row in input_rows {
            row.close_inferior(index).await;
        }
        for row in output_rows {
            row.close_inferior(index).await;
        }
        Ok(())
    }

    fn wire_capture(&self, inferior: &Arc<dyn Transport>, iface_id: u64, handler: CaptureCallback) {
        let transfer_id_modulo = inferior.protocol_parameters().transfer_id_modulo;
        inferior.begin_capture(Arc::new(move |inner: Arc<dyn Capture>| {
            let wrapped: Arc<dyn Capture> = Arc::new(RedundantCapture { iface_id, transfer_id_modulo, inner });
            handler(wrapped);
        }));
    }
}

#[async_trait::async_trait]
impl Transport for RedundantTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        let Ok(inner) = self.inner.try_lock() else {
            return ProtocolParameters::default();
        };
        inner.inferiors.iter().map(|t| t.protocol_parameters()).fold(None, |acc, p| match acc {
            None => Some(p),
            Some(a) => Some(ProtocolParameters {
                transfer_id_modulo: a.transfer_id_modulo.min(p.transfer_id_modulo),
                max_nodes: a.max_nodes.min(p.max_nodes),
                mtu: a.mtu.min(p.mtu),
            }),
        }).unwrap_or_default()
    }

    fn local_node_id(&self) -> Option<NodeId> {
        let Ok(inner) = self.inner.try_lock() else {
            return None;
        };
        let mut values = inner.inferiors.iter().map(|t| t.local_node_id());
        let first = values.next()?;
        if values.all(|v| v == first) {
            first
        } else {
            error!("redundant transport inferiors disagree on local node-ID");
            None
        }
    }

    async fn get_input_session(
        &self,
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.input_rows.get(&specifier) {
            return Ok(row.clone() as Arc<dyn InputSession>);
        }
        let inferiors = inner.inferiors.clone();
        let row = RedundantInputSession::new(specifier, payload_metadata, Box::new(|| {}));
        let mut attached = 0usize;
        for inferior in &inferiors {
            if let Err(err) = row.add_inferior(inferior).await {
                for i in (0..attached).rev() {
                    row.close_inferior(i).await;
                }
                return Err(err);
            }
            attached += 1;
        }
        inner.input_rows.insert(specifier, row.clone());
        Ok(row as Arc<dyn InputSession>)
    }

    async fn get_output_session(
        &self,
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.output_rows.get(&specifier) {
            return Ok(row.clone() as Arc<dyn OutputSession>);
        }
        let inferiors = inner.inferiors.clone();
        let row = RedundantOutputSession::new(specifier, payload_metadata, Box::new(|| {}));
        let mut attached = 0usize;
        for inferior in &inferiors {
            if let Err(err) = row.add_inferior(inferior).await {
                for i in (0..attached).rev() {
                    row.close_inferior(i).await;
                }
                return Err(err);
            }
            attached += 1;
        }
        inner.output_rows.insert(specifier, row.clone());
        Ok(row as Arc<dyn OutputSession>)
    }

    fn sample_statistics(&self) -> TransportStatistics {
        let Ok(inner) = self.inner.try_lock() else {
            return TransportStatistics::default();
        };
        let inferiors: Vec<_> = inner.inferiors.iter().map(|t| t.sample_statistics()).collect();
        TransportStatistics {
            frames_tx: inferiors.iter().map(|s| s.frames_tx).sum(),
            frames_rx: inferiors.iter().map(|s| s.frames_rx).sum(),
            errors: inferiors.iter().map(|s| s.errors).sum(),
            inferiors,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock().await;
        let input_rows: Vec<_> = inner.input_rows.drain().map(|(_, v)| v).collect();
        let output_rows: Vec<_> = inner.output_rows.drain().map(|(_, v)| v).collect();
        let inferiors: Vec<_> = inner.inferiors.drain(..).collect();
        drop(inner);
        for row in input_rows {
            InputSession::close(row.as_ref()).await;
        }
        for row in output_rows {
            OutputSession::close(row.as_ref()).await;
        }
        for inferior in inferiors {
            inferior.close().await;
        }
    }

    fn begin_capture(&self, handler: CaptureCallback) {
        *self.capture.lock().unwrap() = Some(handler.clone());
        // Can't hold `self.inner`'s async lock from a sync fn; the
        // inferiors list only grows/shrinks under `attach_inferior` /
        // `detach_inferior`, both of which wire capture themselves, so a
        // best-effort snapshot here covers the already-attached group.
        if let Ok(inner) = self.inner.try_lock() {
            for (inferior, iface_id) in inner.inferiors.iter().zip(inner.iface_ids.iter()) {
                self.wire_capture(inferior, *iface_id, handler.clone());
            }
        }
    }

    async fn spoof(&self, transfer: AlienTransfer, deadline: Timestamp) -> Result<bool> {
        let inferiors = self.inner.lock().await.inferiors.clone();
        if inferiors.is_empty() {
            return Ok(false);
        }
        let mut join_set = JoinSet::new();
        for inferior in inferiors {
            let transfer = transfer.clone();
            join_set.spawn(async move { inferior.spoof(transfer, deadline).await });
        }
        let mut all_ok = true;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(ok)) => all_ok &= ok,
                Ok(Err(err)) => {
                    join_set.abort_all();
                    return Err(err);
                }
                Err(_join_err) => all_ok = false,
            }
        }
        Ok(all_ok)
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        let factories = match self.inner.try_lock() {
            Ok(inner) => inner.iface_ids.iter().copied().zip(inner.inferiors.iter().cloned()).collect(),
            Err(_) => HashMap::new(),
        };
        Box::new(RedundantTracer::with_factories(factories))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;
    use crate::transport::{Fragment, MessageSessionSpecifier, Priority, Transfer};
    use std::time::Duration;

    fn params(modulo: u64) -> ProtocolParameters {
        ProtocolParameters { transfer_id_modulo: modulo, max_nodes: 128, mtu: 1024 }
    }

    fn fragment(bytes: &[u8]) -> Fragment {
        Arc::from(bytes.to_vec().into_boxed_slice())
    }

    #[tokio::test]
    async fn attach_and_detach_preserve_sessions() {
        let redundant = RedundantTransport::new();
        let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 2345, remote_node_id: None });
        let payload_metadata = PayloadMetadata { extent_bytes: 64 };

        let output = redundant.get_output_session(specifier, payload_metadata).await.unwrap();
        assert_eq!(redundant.inferiors().await.len(), 0);

        let a = LoopbackTransport::new(Some(42), params(1 << 48));
        redundant.attach_inferior(a.clone()).await.unwrap();
        assert_eq!(redundant.inferiors().await.len(), 1);

        let b = LoopbackTransport::new(Some(42), params(1 << 48));
        redundant.attach_inferior(b.clone()).await.unwrap();
        assert_eq!(redundant.inferiors().await.len(), 2);

        let subscriber_on_b = b.get_input_session(specifier, payload_metadata).await.unwrap();

        output
            .send(
                Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 1111, fragmented_payload: vec![fragment(b"one")] },
                Timestamp::now() + Duration::from_secs(1),
            )
            .await
            .unwrap();
        let received = subscriber_on_b.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(received.transfer_id, 1111);

        redundant.detach_inferior(&(a as Arc<dyn Transport>)).await.unwrap();

        output
            .send(
                Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 1112, fragmented_payload: vec![fragment(b"two")] },
                Timestamp::now() + Duration::from_secs(1),
            )
            .await
            .unwrap();
        let received = subscriber_on_b.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(received.transfer_id, 1112);
    }

    #[tokio::test]
    async fn inconsistent_modulo_category_rejected() {
        let redundant = RedundantTransport::new();
        let a = LoopbackTransport::new(Some(1), params(1 << 48));
        redundant.attach_inferior(a).await.unwrap();

        let b = LoopbackTransport::new(Some(1), params(32));
        let err = redundant.attach_inferior(b).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(redundant.inferiors().await.len(), 1);
    }

    #[tokio::test]
    async fn protocol_parameters_are_elementwise_minimum() {
        let redundant = RedundantTransport::new();
        assert_eq!(redundant.protocol_parameters(), ProtocolParameters::default());

        redundant
            .attach_inferior(LoopbackTransport::new(Some(1), ProtocolParameters { transfer_id_modulo: 1 << 48, max_nodes: 100, mtu: 900 }))
            .await
            .unwrap();
        redundant
            .attach_inferior(LoopbackTransport::new(Some(1), ProtocolParameters { transfer_id_modulo: 1 << 50, max_nodes: 50, mtu: 1200 }))
            .await
            .unwrap();

        let params = redundant.protocol_parameters();
        assert_eq!(params.max_nodes, 50);
        assert_eq!(params.mtu, 900);
        assert_eq!(params.transfer_id_modulo, 1 << 48);
    }

    #[tokio::test]
    async fn cannot_attach_redundant_transport_to_itself() {
        let redundant = RedundantTransport::new();
        let err = redundant.attach_inferior(redundant.clone() as Arc<dyn Transport>).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
