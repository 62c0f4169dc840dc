//! # Loopback Transport
//!
//! The one concrete [`Transport`] this crate ships as a reference
//! implementation of the `Transport` contract: every output session on a
//! loopback transport instance fans its transfer out, as a complete
//! in-memory observation, to every input session of matching specifier on
//! the *same* instance. There is no framing and no MTU fragmentation — the
//! whole serialized payload travels as a single fragment. Fan-out uses the
//! same `tokio::sync::broadcast` pattern as the rest of this crate's
//! multi-listener delivery paths.

use super::{
    AlienTransfer, Capture, CaptureCallback, DataSpecifier, Fragment, InputSession, MessageSessionSpecifier,
    NodeId, OutputSession, PayloadMetadata, ProtocolParameters, ServiceRole, ServiceSessionSpecifier,
    SessionSpecifier, SessionStatistics, Timestamp, Tracer, TracerEvent, Transfer, TransferFrom, TransferMetadata,
    Transport, TransportStatistics,
};
use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

/// One transfer as it travels across the loopback bus, addressed the way a
/// real transport would address a frame on the wire.
#[derive(Debug, Clone)]
struct BusFrame {
    data_specifier: DataSpecifier,
    /// `None` for broadcast messages or a server's request-input session;
    /// `Some(x)` when the frame is addressed to one specific peer.
    dest_node_id: Option<NodeId>,
    transfer: TransferFrom,
}

fn specifier_matches(specifier: &SessionSpecifier, local_node_id: Option<NodeId>, frame: &BusFrame) -> bool {
    match specifier {
        SessionSpecifier::Message(m) => {
            frame.data_specifier == DataSpecifier::Subject(m.subject_id)
                && m.remote_node_id.map_or(true, |want| frame.transfer.source_node_id == Some(want))
        }
        SessionSpecifier::Service(s) => {
            let wants = DataSpecifier::Service { service_id: s.service_id, role: s.role };
            if frame.data_specifier != wants {
                return false;
            }
            match s.peer_node_id {
                Some(peer) => frame.transfer.source_node_id == Some(peer),
                None => local_node_id.is_some() && frame.dest_node_id == local_node_id,
            }
        }
    }
}

/// Observed loopback traffic, fed to [`LoopbackTracer`].
#[derive(Debug)]
pub struct LoopbackCapture {
    timestamp: Timestamp,
    frame: BusFrame,
}

impl Capture for LoopbackCapture {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Every loopback capture already carries a complete transfer, so the
/// tracer needs no reassembly state: it simply restates the capture as a
/// [`TransferTrace`](super::TransferTrace).
#[derive(Debug, Default)]
pub struct LoopbackTracer;

impl Tracer for LoopbackTracer {
    fn update(&mut self, capture: &dyn Capture) -> Option<TracerEvent> {
        let cap = capture.as_any().downcast_ref::<LoopbackCapture>()?;
        let session_specifier = super::AlienSessionSpecifier {
            source_node_id: cap.frame.transfer.source_node_id,
            destination_node_id: cap.frame.dest_node_id,
            data_specifier: cap.frame.data_specifier.clone(),
        };
        let transfer = AlienTransfer {
            timestamp: cap.frame.transfer.timestamp,
            priority: cap.frame.transfer.priority,
            transfer_id: cap.frame.transfer.transfer_id,
            fragmented_payload: cap.frame.transfer.fragmented_payload.clone(),
            session_specifier: session_specifier.clone(),
        };
        Some(TracerEvent::Transfer(super::TransferTrace {
            timestamp: cap.timestamp,
            metadata: TransferMetadata { session_specifier, transfer_id: cap.frame.transfer.transfer_id, transfer_id_timeout: Duration::ZERO },
            transfer,
        }))
    }
}

struct Inner {
    local_node_id: SyncMutex<Option<NodeId>>,
    protocol_parameters: ProtocolParameters,
    bus_tx: broadcast::Sender<BusFrame>,
    input_sessions: Mutex<HashMap<SessionSpecifier, Arc<LoopbackInputSession>>>,
    output_sessions: Mutex<HashMap<SessionSpecifier, Arc<LoopbackOutputSession>>>,
    capture: SyncMutex<Option<CaptureCallback>>,
    closed: AtomicBool,
    frames_tx: AtomicU64,
    frames_rx: AtomicU64,
    errors: AtomicU64,
}

/// The parameters a freshly bootstrapped loopback transport uses absent any
/// more specific register configuration: effectively-monotonic
/// transfer-IDs (`u64::MAX` stands in for `2^64`, which does not fit in a
/// `u64`), 128 nodes, and a 1024-byte MTU.
pub const DEFAULT_PROTOCOL_PARAMETERS: ProtocolParameters =
    ProtocolParameters { transfer_id_modulo: u64::MAX, max_nodes: 128, mtu: 1024 };

/// The loopback transport. Construct with [`LoopbackTransport::new`]; every
/// session obtained from the same instance shares one in-process bus.
pub struct LoopbackTransport(Arc<Inner>);

impl LoopbackTransport {
    pub fn new(local_node_id: Option<NodeId>, protocol_parameters: ProtocolParameters) -> Arc<Self> {
        let (bus_tx, _) = broadcast::channel(1024);
        Arc::new(Self(Arc::new(Inner {
            local_node_id: SyncMutex::new(local_node_id),
            protocol_parameters,
            bus_tx,
            input_sessions: Mutex::new(HashMap::new()),
            output_sessions: Mutex::new(HashMap::new()),
            capture: SyncMutex::new(None),
            closed: AtomicBool::new(false),
            frames_tx: AtomicU64::new(0),
            frames_rx: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })))
    }

    fn emit_capture(&self, frame: &BusFrame) {
        if let Some(handler) = self.0.capture.lock().unwrap().as_ref() {
            let capture: Arc<dyn Capture> =
                Arc::new(LoopbackCapture { timestamp: Timestamp::now(), frame: frame.clone() });
            handler(capture);
        }
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        self.0.protocol_parameters
    }

    fn local_node_id(&self) -> Option<NodeId> {
        *self.0.local_node_id.lock().unwrap()
    }

    async fn get_input_session(
        &self,
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>> {
        let mut sessions = self.0.input_sessions.lock().await;
        if let Some(existing) = sessions.get(&specifier) {
            return Ok(existing.clone() as Arc<dyn InputSession>);
        }
        let session = LoopbackInputSession::new(specifier, payload_metadata, self.0.clone());
        sessions.insert(specifier, session.clone());
        Ok(session as Arc<dyn InputSession>)
    }

    async fn get_output_session(
        &self,
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>> {
        let mut sessions = self.0.output_sessions.lock().await;
        if let Some(existing) = sessions.get(&specifier) {
            return Ok(existing.clone() as Arc<dyn OutputSession>);
        }
        let session = LoopbackOutputSession::new(specifier, payload_metadata, self.0.clone());
        sessions.insert(specifier, session.clone());
        Ok(session as Arc<dyn OutputSession>)
    }

    fn sample_statistics(&self) -> TransportStatistics {
        TransportStatistics {
            frames_tx: self.0.frames_tx.load(Ordering::Relaxed),
            frames_rx: self.0.frames_rx.load(Ordering::Relaxed),
            errors: self.0.errors.load(Ordering::Relaxed),
            inferiors: Vec::new(),
        }
    }

    async fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inputs: Vec<_> = self.0.input_sessions.lock().await.drain().map(|(_, v)| v).collect();
        let outputs: Vec<_> = self.0.output_sessions.lock().await.drain().map(|(_, v)| v).collect();
        for s in inputs {
            InputSession::close(s.as_ref()).await;
        }
        for s in outputs {
            OutputSession::close(s.as_ref()).await;
        }
    }

    fn begin_capture(&self, handler: CaptureCallback) {
        *self.0.capture.lock().unwrap() = Some(handler);
    }

    async fn spoof(&self, transfer: AlienTransfer, _deadline: Timestamp) -> Result<bool> {
        let frame = BusFrame {
            data_specifier: transfer.session_specifier.data_specifier.clone(),
            dest_node_id: transfer.session_specifier.destination_node_id,
            transfer: TransferFrom {
                timestamp: transfer.timestamp,
                priority: transfer.priority,
                transfer_id: transfer.transfer_id,
                fragmented_payload: transfer.fragmented_payload,
                source_node_id: transfer.session_specifier.source_node_id,
            },
        };
        self.emit_capture(&frame);
        Ok(self.0.bus_tx.send(frame).is_ok())
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(LoopbackTracer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One row of the loopback transport's input table: a background task reads
/// every frame broadcast on the bus and keeps the ones matching this
/// session's specifier in an unbounded queue.
pub struct LoopbackInputSession {
    specifier: SessionSpecifier,
    payload_metadata: PayloadMetadata,
    inner: Arc<Inner>,
    rx: Mutex<mpsc::UnboundedReceiver<TransferFrom>>,
    worker: tokio::task::JoinHandle<()>,
    transfer_id_timeout: SyncMutex<Duration>,
    closed: AtomicBool,
    transfers: AtomicU64,
    payload_bytes: AtomicU64,
}

impl LoopbackInputSession {
    fn new(specifier: SessionSpecifier, payload_metadata: PayloadMetadata, inner: Arc<Inner>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus_rx = inner.bus_tx.subscribe();
        let local_node_id = *inner.local_node_id.lock().unwrap();
        let worker_inner = inner.clone();
        let worker = tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(frame) => {
                        if specifier_matches(&specifier, local_node_id, &frame) {
                            worker_inner.frames_rx.fetch_add(1, Ordering::Relaxed);
                            if tx.send(frame.transfer).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "loopback input session lagged behind the bus");
                    }
                }
            }
        });
        Arc::new(Self {
            specifier,
            payload_metadata,
            inner,
            rx: Mutex::new(rx),
            worker,
            transfer_id_timeout: SyncMutex::new(Duration::ZERO),
            closed: AtomicBool::new(false),
            transfers: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
        })
    }
}

#[async_trait::async_trait]
impl InputSession for LoopbackInputSession {
    fn specifier(&self) -> SessionSpecifier {
        self.specifier
    }

    fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    async fn receive(&self, deadline: Timestamp) -> Result<Option<TransferFrom>> {
        let mut rx = self.rx.lock().await;
        let now = Timestamp::now();
        let received = if deadline > now {
            tokio::time::timeout_at(deadline, rx.recv()).await.ok().flatten()
        } else {
            rx.try_recv().ok()
        };
        match received {
            Some(tr) => {
                self.transfers.fetch_add(1, Ordering::Relaxed);
                let bytes: usize = tr.fragmented_payload.iter().map(|f| f.len()).sum();
                self.payload_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                Ok(Some(tr))
            }
            None if self.closed.load(Ordering::Acquire) => Err(Error::ClosedPort),
            None => Ok(None),
        }
    }

    fn transfer_id_timeout(&self) -> Duration {
        *self.transfer_id_timeout.lock().unwrap()
    }

    fn set_transfer_id_timeout(&self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(Error::Configuration("transfer-ID timeout must be positive".into()));
        }
        *self.transfer_id_timeout.lock().unwrap() = value;
        Ok(())
    }

    fn sample_statistics(&self) -> SessionStatistics {
        SessionStatistics {
            transfers: self.transfers.load(Ordering::Relaxed),
            frames: self.transfers.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            errors: 0,
            drops: 0,
            inferiors: Vec::new(),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.worker.abort();
        self.inner.input_sessions.lock().await.remove(&self.specifier);
    }
}

/// One row of the loopback transport's output table: each `send` stamps the
/// transfer with the transport's local node-ID and broadcasts it on the bus.
pub struct LoopbackOutputSession {
    specifier: SessionSpecifier,
    payload_metadata: PayloadMetadata,
    inner: Arc<Inner>,
    feedback: SyncMutex<Option<CaptureFeedback>>,
    closed: AtomicBool,
    transfers: AtomicU64,
    payload_bytes: AtomicU64,
}

type CaptureFeedback = super::FeedbackCallback;

impl LoopbackOutputSession {
    fn new(specifier: SessionSpecifier, payload_metadata: PayloadMetadata, inner: Arc<Inner>) -> Arc<Self> {
        Arc::new(Self {
            specifier,
            payload_metadata,
            inner,
            feedback: SyncMutex::new(None),
            closed: AtomicBool::new(false),
            transfers: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
        })
    }

    fn data_specifier(&self) -> DataSpecifier {
        match self.specifier {
            SessionSpecifier::Message(m) => DataSpecifier::Subject(m.subject_id),
            SessionSpecifier::Service(s) => DataSpecifier::Service { service_id: s.service_id, role: s.role },
        }
    }

    fn dest_node_id(&self) -> Option<NodeId> {
        match self.specifier {
            SessionSpecifier::Message(MessageSessionSpecifier { remote_node_id, .. }) => remote_node_id,
            SessionSpecifier::Service(ServiceSessionSpecifier { peer_node_id, .. }) => peer_node_id,
        }
    }
}

#[async_trait::async_trait]
impl OutputSession for LoopbackOutputSession {
    fn specifier(&self) -> SessionSpecifier {
        self.specifier
    }

    fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    async fn send(&self, transfer: Transfer, _deadline: Timestamp) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPort);
        }
        let source_node_id = self.inner.local_node_id.lock().unwrap().clone();
        let frame = BusFrame {
            data_specifier: self.data_specifier(),
            dest_node_id: self.dest_node_id(),
            transfer: TransferFrom {
                timestamp: transfer.timestamp,
                priority: transfer.priority,
                transfer_id: transfer.transfer_id,
                fragmented_payload: transfer.fragmented_payload,
                source_node_id,
            },
        };
        if let Some(handler) = self.inner.capture.lock().unwrap().as_ref() {
            let capture: Arc<dyn Capture> = Arc::new(LoopbackCapture { timestamp: Timestamp::now(), frame: frame.clone() });
            handler(capture);
        }
        self.inner.frames_tx.fetch_add(1, Ordering::Relaxed);
        self.transfers.fetch_add(1, Ordering::Relaxed);
        let bytes: usize = frame.transfer.fragmented_payload.iter().map(|f| f.len()).sum();
        self.payload_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        // Broadcast has no subscribers until an input session asks for this
        // specifier; that is not an error at the transport layer.
        let _ = self.inner.bus_tx.send(frame);
        if let Some(handler) = self.feedback.lock().unwrap().as_ref() {
            handler(super::Feedback {
                original_transfer_timestamp: transfer.timestamp,
                first_frame_transmission_timestamp: Timestamp::now(),
            });
        }
        Ok(true)
    }

    fn sample_statistics(&self) -> SessionStatistics {
        SessionStatistics {
            transfers: self.transfers.load(Ordering::Relaxed),
            frames: self.transfers.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            errors: 0,
            drops: 0,
            inferiors: Vec::new(),
        }
    }

    fn enable_feedback(&self, handler: super::FeedbackCallback) -> Result<()> {
        *self.feedback.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn disable_feedback(&self) {
        *self.feedback.lock().unwrap() = None;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.output_sessions.lock().await.remove(&self.specifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MessageSessionSpecifier, Priority};

    fn params() -> ProtocolParameters {
        ProtocolParameters { transfer_id_modulo: 1 << 48, max_nodes: 128, mtu: 1024 }
    }

    #[tokio::test]
    async fn publish_subscribe_round_trip() {
        let transport = LoopbackTransport::new(Some(1234), params());
        let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 2000, remote_node_id: None });
        let payload_metadata = PayloadMetadata { extent_bytes: 64 };
        let sub = transport.get_input_session(specifier, payload_metadata).await.unwrap();
        let pub_ = transport.get_output_session(specifier, payload_metadata).await.unwrap();

        let payload: Fragment = Arc::from(b"hello".to_vec().into_boxed_slice());
        let sent = pub_
            .send(
                Transfer {
                    timestamp: Timestamp::now(),
                    priority: Priority::Nominal,
                    transfer_id: 0,
                    fragmented_payload: vec![payload],
                },
                Timestamp::now() + Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(sent);

        let received = sub.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(received.source_node_id, Some(1234));
        assert_eq!(received.transfer_id, 0);
        assert_eq!(&*received.fragmented_payload[0], b"hello");
    }

    #[tokio::test]
    async fn idempotent_session_factory() {
        let transport = LoopbackTransport::new(Some(1), params());
        let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 10, remote_node_id: None });
        let a = transport.get_output_session(specifier, PayloadMetadata::default()).await.unwrap();
        let b = transport.get_output_session(specifier, PayloadMetadata::default()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn closed_input_session_errors_on_receive() {
        let transport = LoopbackTransport::new(Some(1), params());
        let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 5, remote_node_id: None });
        let sub = transport.get_input_session(specifier, PayloadMetadata::default()).await.unwrap();
        InputSession::close(sub.as_ref()).await;
        let err = sub.receive(Timestamp::now()).await.unwrap_err();
        assert!(matches!(err, Error::ClosedPort));
    }
}
