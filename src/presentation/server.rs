//! Server proxies: accept requests from any peer on one request-input
//! session, dispatch to a user handler, and respond on a lazily-created
//! per-client response-output session.

use super::dsdl::DsdlType;
use crate::error::{Error, Result};
use crate::transport::{
    InputSession, NodeId, PayloadMetadata, PortId, Priority, ServiceRole, ServiceSessionSpecifier, SessionSpecifier,
    Timestamp, Transfer, Transport,
};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(200);
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Context handed to a server's request handler alongside the decoded
/// request.
#[derive(Debug, Clone, Copy)]
pub struct RequestMetadata {
    pub client_node_id: Option<NodeId>,
    pub transfer_id: u64,
    pub priority: Priority,
    pub timestamp: Timestamp,
}

type HandlerFuture<Resp> = Pin<Box<dyn Future<Output = Option<Resp>> + Send>>;
pub type Handler<Req, Resp> = Arc<dyn Fn(Req, RequestMetadata) -> HandlerFuture<Resp> + Send + Sync>;

pub(crate) struct ServerImpl {
    pub(crate) service_id: PortId,
    input_session: Arc<dyn InputSession>,
    transport: Arc<dyn Transport>,
    response_sessions: AsyncMutex<HashMap<NodeId, Arc<dyn crate::transport::OutputSession>>>,
    serve_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    refcount: AtomicUsize,
    finalizer: AsyncMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ServerImpl {
    pub(crate) fn new(
        service_id: PortId,
        input_session: Arc<dyn InputSession>,
        transport: Arc<dyn Transport>,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            input_session,
            transport,
            response_sessions: AsyncMutex::new(HashMap::new()),
            serve_task: AsyncMutex::new(None),
            refcount: AtomicUsize::new(0),
            finalizer: AsyncMutex::new(Some(finalizer)),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    async fn release(self: &Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(handle) = self.serve_task.lock().await.take() {
                handle.abort();
            }
            self.input_session.close().await;
            let sessions = std::mem::take(&mut *self.response_sessions.lock().await);
            for (_, session) in sessions {
                session.close().await;
            }
            if let Some(finalizer) = self.finalizer.lock().await.take() {
                finalizer();
            }
        }
    }

    async fn response_session_for(&self, peer: NodeId, extent_bytes: usize) -> Result<Arc<dyn crate::transport::OutputSession>> {
        let mut sessions = self.response_sessions.lock().await;
        if let Some(session) = sessions.get(&peer) {
            return Ok(session.clone());
        }
        let specifier = SessionSpecifier::Service(ServiceSessionSpecifier {
            service_id: self.service_id,
            role: ServiceRole::Response,
            peer_node_id: Some(peer),
        });
        let session = self.transport.get_output_session(specifier, PayloadMetadata { extent_bytes }).await?;
        sessions.insert(peer, session.clone());
        Ok(session)
    }
}

/// A typed RPC server proxy, promiscuously accepting requests from any
/// client node-ID.
pub struct Server<Req: DsdlType, Resp: DsdlType> {
    impl_: Arc<ServerImpl>,
    closed: std::sync::atomic::AtomicBool,
    _marker: PhantomData<(Req, Resp)>,
}

impl<Req: DsdlType, Resp: DsdlType> Server<Req, Resp> {
    pub(crate) fn new(impl_: Arc<ServerImpl>) -> Self {
        impl_.acquire();
        Self { impl_, closed: std::sync::atomic::AtomicBool::new(false), _marker: PhantomData }
    }

    pub fn service_id(&self) -> PortId {
        self.impl_.service_id
    }

    async fn handle_one(impl_: &Arc<ServerImpl>, handler: &Handler<Req, Resp>) -> Result<bool> {
        let deadline = Timestamp::now() + STOP_POLL;
        let transfer = match impl_.input_session.receive(deadline).await? {
            Some(t) => t,
            None => return Ok(false),
        };
        let request = match Req::from_fragments(&transfer.fragmented_payload) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "server failed to decode request");
                return Ok(true);
            }
        };
        let metadata = RequestMetadata {
            client_node_id: transfer.source_node_id,
            transfer_id: transfer.transfer_id,
            priority: transfer.priority,
            timestamp: transfer.timestamp,
        };
        let Some(response) = handler(request, metadata).await else {
            return Ok(true);
        };
        let Some(peer) = transfer.source_node_id else {
            debug!("cannot respond to an anonymous request");
            return Ok(true);
        };
        let fragmented_payload = match response.to_fragmented_payload() {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, "server failed to encode response");
                return Ok(true);
            }
        };
        let session = impl_.response_session_for(peer, Resp::EXTENT_BYTES).await?;
        let out = Transfer {
            timestamp: Timestamp::now(),
            priority: metadata.priority,
            transfer_id: metadata.transfer_id,
            fragmented_payload,
        };
        let response_deadline = Timestamp::now() + DEFAULT_RESPONSE_TIMEOUT;
        if let Err(err) = session.send(out, response_deadline).await {
            warn!(%err, client_node_id = peer, "server failed to send response");
        }
        Ok(true)
    }

    /// Serves requests until `deadline`, or until a transport error closes
    /// the underlying session.
    pub async fn serve_until(&self, deadline: Timestamp, handler: Handler<Req, Resp>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPort);
        }
        loop {
            if Timestamp::now() >= deadline {
                return Ok(());
            }
            Self::handle_one(&self.impl_, &handler).await?;
        }
    }

    /// Serves requests indefinitely; returns only on a fatal transport
    /// error (in particular once the underlying session is closed).
    pub async fn serve_forever(&self, handler: Handler<Req, Resp>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPort);
        }
        loop {
            Self::handle_one(&self.impl_, &handler).await?;
        }
    }

    /// Spawns a background task that serves requests indefinitely,
    /// restarting after [`RESTART_BACKOFF`] on any recoverable error. At
    /// most one background serve task may be active per server at a time.
    pub async fn serve_background(&self, handler: Handler<Req, Resp>) -> Result<()>
    where
        Req: 'static,
        Resp: 'static,
    {
        let mut slot = self.impl_.serve_task.lock().await;
        if slot.is_some() {
            return Err(Error::Configuration("server already has an active background serve task".into()));
        }
        let impl_ = self.impl_.clone();
        let task = tokio::spawn(async move {
            loop {
                match Self::handle_one(&impl_, &handler).await {
                    Ok(_) => continue,
                    Err(Error::ClosedPort) => break,
                    Err(err) => {
                        warn!(%err, "server restarting after error");
                        tokio::time::sleep(RESTART_BACKOFF).await;
                    }
                }
            }
        });
        *slot = Some(task);
        Ok(())
    }

    /// Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.impl_.release().await;
        }
    }
}

impl<Req: DsdlType, Resp: DsdlType> Drop for Server<Req, Resp> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let impl_ = self.impl_.clone();
            tokio::spawn(async move { impl_.release().await });
        }
    }
}
