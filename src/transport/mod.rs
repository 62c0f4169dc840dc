//! # Transport Abstraction
//!
//! This module defines the contract every transport in the stack honors —
//! concrete (loopback, and in principle CAN/UDP/serial) or composite
//! (redundant, see [`redundant`]). It does not itself move any bytes; it is
//! the seam the presentation layer programs against so that publishers,
//! subscribers, clients and servers never know whether they are talking to
//! one interface or many.
//!
//! ## Design
//!
//! - **Dynamic dispatch**: transports and sessions are trait objects
//!   (`dyn Transport`, `dyn InputSession`, `dyn OutputSession`). The
//!   redundant variants implement the same traits as concrete ones and hold
//!   a list of peers behind them — there is no deeper hierarchy than
//!   "contract + variants".
//! - **Async-first**: every blocking operation is async and takes an
//!   explicit deadline, built on Tokio.
//! - **Statistics and captures are concrete structs, not further trait
//!   objects**: a redundant transport's statistics simply nest one
//!   [`TransportStatistics`] per inferior, rather than requiring downcasting.

pub mod loopback;
pub mod redundant;

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A Tokio monotonic instant, used both for timestamps and for deadlines.
pub type Timestamp = tokio::time::Instant;

/// A Cyphal node-ID. `None` in any `Option<NodeId>` position means
/// anonymous / broadcast.
pub type NodeId = u16;

/// A Cyphal subject-ID (message session) or service-ID (RPC session).
pub type PortId = u16;

/// One fragment of a transfer's serialized payload. Reference-counted so
/// that fanning the same transfer out to several inferior output sessions
/// never copies the payload.
pub type Fragment = Arc<[u8]>;

/// An ordered sequence of payload fragments, exactly as they will be (or
/// were) carried on the wire.
pub type FragmentedPayload = Vec<Fragment>;

/// Transfer priority, lowest numeric value wins arbitration (mirrors the
/// eight standard Cyphal priority levels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Exceptional = 0,
    Immediate = 1,
    Fast = 2,
    High = 3,
    Nominal = 4,
    Low = 5,
    Slow = 6,
    Optional = 7,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Nominal
    }
}

/// Distinguishes a service session's role: the requester's side or the
/// responder's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Request,
    Response,
}

/// The data specifier half of a session specifier: which subject or service
/// the session concerns, without reference to a specific peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataSpecifier {
    Subject(PortId),
    Service { service_id: PortId, role: ServiceRole },
}

/// Identity of a message session: a subject, optionally filtered to
/// transfers from (for input) or destined to (for output, rarely used) one
/// remote node-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageSessionSpecifier {
    pub subject_id: PortId,
    pub remote_node_id: Option<NodeId>,
}

/// Identity of a service session: a service-ID, a role, and the peer
/// node-ID it is bound to. `Some(x)` for a client's request-output /
/// response-input session (bound to one particular server) or a server's
/// cached per-client response-output session; `None` for a server's
/// request-input session, which listens for requests from any peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceSessionSpecifier {
    pub service_id: PortId,
    pub role: ServiceRole,
    pub peer_node_id: Option<NodeId>,
}

/// The identity tuple that makes two ports reference the same underlying
/// transport session. Equality over this type defines session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionSpecifier {
    Message(MessageSessionSpecifier),
    Service(ServiceSessionSpecifier),
}

impl fmt::Display for SessionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionSpecifier::Message(m) => write!(f, "subject={} remote={:?}", m.subject_id, m.remote_node_id),
            SessionSpecifier::Service(s) => write!(f, "service={} role={:?} peer={:?}", s.service_id, s.role, s.peer_node_id),
        }
    }
}

/// A session specifier that additionally names the peer that is actually
/// involved, used by alien transfers (spoofing, tracing) where there is no
/// live session to inherit the specifier from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlienSessionSpecifier {
    pub source_node_id: Option<NodeId>,
    pub destination_node_id: Option<NodeId>,
    pub data_specifier: DataSpecifier,
}

/// The fixed maximum serialized size of a DSDL type. Immutable once a
/// session is created; transports use it to size receive buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadMetadata {
    pub extent_bytes: usize,
}

/// The triple (transfer-ID modulo, maximum node count, MTU) that
/// characterizes a transport's wire capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolParameters {
    pub transfer_id_modulo: u64,
    pub max_nodes: u32,
    pub mtu: usize,
}

/// An inferior whose `transfer_id_modulo` is less than this value is
/// expected to experience transfer-ID overflow routinely ("cyclic");
/// otherwise it will not overflow for centuries ("monotonic"). See
/// [`redundant::dedup`].
pub const MONOTONIC_TRANSFER_ID_MODULO_THRESHOLD: u64 = 1u64 << 48;

/// An outgoing transfer, ready to be handed to an [`OutputSession`]. The
/// session specifier (hence the destination, for services) is implied by
/// which session the transfer is sent on.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: u64,
    pub fragmented_payload: FragmentedPayload,
}

/// A transfer as received from an [`InputSession`], annotated with the
/// node-ID it arrived from (`None` for anonymous senders).
#[derive(Debug, Clone)]
pub struct TransferFrom {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: u64,
    pub fragmented_payload: FragmentedPayload,
    pub source_node_id: Option<NodeId>,
}

/// A fully self-described transfer used for spoofing (bypassing outgoing
/// session bookkeeping) and for offline/postmortem tracing, where there is
/// no live session to supply the missing context.
#[derive(Debug, Clone)]
pub struct AlienTransfer {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: u64,
    pub fragmented_payload: FragmentedPayload,
    pub session_specifier: AlienSessionSpecifier,
}

/// Output feedback: timestamps bracketing a successful transmission.
#[derive(Debug, Clone, Copy)]
pub struct Feedback {
    pub original_transfer_timestamp: Timestamp,
    pub first_frame_transmission_timestamp: Timestamp,
}

/// Handler invoked once per transmitted transfer when feedback is enabled
/// on an [`OutputSession`].
pub type FeedbackCallback = Arc<dyn Fn(Feedback) + Send + Sync>;

/// A raw observed frame, wrapped with metadata, fed to [`Tracer`]s. Concrete
/// transports define their own capture payload; [`redundant::tracer`] wraps
/// one per inferior.
pub trait Capture: std::any::Any + fmt::Debug + Send + Sync {
    fn timestamp(&self) -> Timestamp;
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Handler invoked once per captured frame when promiscuous capture is
/// enabled on a [`Transport`].
pub type CaptureCallback = Arc<dyn Fn(Arc<dyn Capture>) + Send + Sync>;

/// Metadata describing a reconstructed transfer, independent of which
/// transport produced it.
#[derive(Debug, Clone)]
pub struct TransferMetadata {
    pub session_specifier: AlienSessionSpecifier,
    pub transfer_id: u64,
    pub transfer_id_timeout: Duration,
}

/// A high-level trace of one reconstructed transfer, emitted by a
/// [`Tracer`] from one or more lower-level captures.
#[derive(Debug, Clone)]
pub struct TransferTrace {
    pub timestamp: Timestamp,
    pub metadata: TransferMetadata,
    pub transfer: AlienTransfer,
}

/// The output of feeding one capture into a [`Tracer`].
#[derive(Debug, Clone)]
pub enum TracerEvent {
    /// A complete, accepted transfer.
    Transfer(TransferTrace),
    /// A transfer that was discarded as a duplicate. Deliberately distinct
    /// from `Transfer` so that duplicate-counting consumers do not double
    /// count.
    DuplicateTransfer { timestamp: Timestamp },
}

/// Turns a stream of [`Capture`]s into high-level [`TracerEvent`]s.
/// Implementations may be stateful (e.g. frame reassembly, deduplication).
pub trait Tracer: Send {
    fn update(&mut self, capture: &dyn Capture) -> Option<TracerEvent>;
}

/// Aggregate counters for a session. Redundant sessions nest one entry per
/// inferior in `inferiors`; leaf sessions leave it empty. This flat shape
/// avoids a deeper statistics type hierarchy.
#[derive(Debug, Clone, Default)]
pub struct SessionStatistics {
    pub transfers: u64,
    pub frames: u64,
    pub payload_bytes: u64,
    pub errors: u64,
    pub drops: u64,
    pub inferiors: Vec<SessionStatistics>,
}

/// Aggregate counters for a transport. Redundant transports nest one entry
/// per inferior in `inferiors`.
#[derive(Debug, Clone, Default)]
pub struct TransportStatistics {
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub errors: u64,
    pub inferiors: Vec<TransportStatistics>,
}

/// One end of a message or service session that receives transfers.
#[async_trait::async_trait]
pub trait InputSession: Send + Sync {
    fn specifier(&self) -> SessionSpecifier;
    fn payload_metadata(&self) -> PayloadMetadata;

    /// Waits until `deadline` for the next transfer. Returns `Ok(None)` on
    /// timeout, `Err(Error::ClosedPort)` if the session is closed and no
    /// transfer remains buffered.
    async fn receive(&self, deadline: Timestamp) -> Result<Option<TransferFrom>>;

    /// The duration after which a remote peer with no accepted transfers is
    /// assumed to have restarted. Zero means "unset".
    fn transfer_id_timeout(&self) -> Duration;
    fn set_transfer_id_timeout(&self, value: Duration) -> Result<()>;

    fn sample_statistics(&self) -> SessionStatistics;

    /// Idempotent.
    async fn close(&self);
}

/// One end of a message or service session that transmits transfers.
#[async_trait::async_trait]
pub trait OutputSession: Send + Sync {
    fn specifier(&self) -> SessionSpecifier;
    fn payload_metadata(&self) -> PayloadMetadata;

    /// Sends `transfer` before `deadline`. `Ok(true)` on successful hand-off
    /// to the media layer, `Ok(false)` on timeout, `Err` on unrecoverable
    /// fault.
    async fn send(&self, transfer: Transfer, deadline: Timestamp) -> Result<bool>;

    fn sample_statistics(&self) -> SessionStatistics;

    fn enable_feedback(&self, handler: FeedbackCallback) -> Result<()>;
    fn disable_feedback(&self);

    /// Idempotent.
    async fn close(&self);
}

/// The contract every transport — concrete or redundant — implements.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn protocol_parameters(&self) -> ProtocolParameters;
    fn local_node_id(&self) -> Option<NodeId>;

    /// Idempotent factory keyed by `specifier`.
    async fn get_input_session(
        &self,
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>>;

    /// Idempotent factory keyed by `specifier`.
    async fn get_output_session(
        &self,
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>>;

    fn sample_statistics(&self) -> TransportStatistics;

    /// Idempotent; closes every session this transport owns.
    async fn close(&self);

    /// Enables promiscuous observation: every frame this transport emits or
    /// ingests is also delivered to `handler` exactly once.
    fn begin_capture(&self, handler: CaptureCallback);

    /// Injects a synthetic transfer bypassing outgoing-session bookkeeping.
    async fn spoof(&self, transfer: AlienTransfer, deadline: Timestamp) -> Result<bool>;

    /// A tracer consistent with this transport's framing, for postmortem
    /// analysis of captures it produced.
    fn make_tracer(&self) -> Box<dyn Tracer>;

    /// Used by [`redundant::RedundantTransport::attach_inferior`] to reject
    /// self-nesting without requiring a self-referential `Arc`.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A process-unique identity for an inferior transport or session, used as
/// the `iface_id` the deduplicator keys its per-interface state on. Stands
/// in for pointer identity (`id(x)` in the original Python implementation).
pub fn next_iface_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Returns `Err(Error::ClosedPort)`; a small helper to keep call sites terse.
pub fn closed_port<T>() -> Result<T> {
    Err(Error::ClosedPort)
}
