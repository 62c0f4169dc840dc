//! Client proxies: a client-side request/response pair sharing one outgoing
//! transfer-ID counter and one background response-demultiplexing task.

use super::dsdl::DsdlType;
use crate::error::{Error, Result};
use crate::transport::{InputSession, NodeId, OutputSession, Priority, Timestamp, Transfer, TransferFrom};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const READ_POLL: Duration = Duration::from_millis(500);

type Pending = Arc<AsyncMutex<HashMap<u64, oneshot::Sender<TransferFrom>>>>;

pub(crate) struct ClientImpl {
    pub(crate) server_node_id: NodeId,
    output_session: Arc<dyn OutputSession>,
    counter: Arc<AtomicU64>,
    modulo: u64,
    pending: Pending,
    reader: tokio::task::JoinHandle<()>,
    unexpected_responses: Arc<AtomicU64>,
    refcount: AtomicUsize,
    finalizer: AsyncMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ClientImpl {
    pub(crate) fn new(
        server_node_id: NodeId,
        output_session: Arc<dyn OutputSession>,
        input_session: Arc<dyn InputSession>,
        counter: Arc<AtomicU64>,
        modulo: u64,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        let pending: Pending = Arc::new(AsyncMutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let unexpected_responses = Arc::new(AtomicU64::new(0));
        let reader_unexpected = unexpected_responses.clone();
        let reader = tokio::spawn(async move {
            loop {
                let deadline = Timestamp::now() + READ_POLL;
                match input_session.receive(deadline).await {
                    Ok(Some(transfer)) => {
                        let mut pending = reader_pending.lock().await;
                        if let Some(tx) = pending.remove(&transfer.transfer_id) {
                            let _ = tx.send(transfer);
                        } else {
                            // A response to a call we already gave up on, or
                            // a transfer-ID collision from an unrelated peer.
                            reader_unexpected.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                "{}",
                                Error::UnexpectedResponse {
                                    transfer_id: transfer.transfer_id,
                                    source_node_id: transfer.source_node_id,
                                }
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(Error::ClosedPort) => break,
                    Err(err) => debug!(%err, "client read error"),
                }
            }
        });
        Arc::new(Self {
            server_node_id,
            output_session,
            counter,
            modulo,
            pending,
            reader,
            unexpected_responses,
            refcount: AtomicUsize::new(0),
            finalizer: AsyncMutex::new(Some(finalizer)),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    async fn release(self: &Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.reader.abort();
            self.output_session.close().await;
            if let Some(finalizer) = self.finalizer.lock().await.take() {
                finalizer();
            }
        }
    }
}

/// A typed RPC client proxy bound to one server node-ID.
pub struct Client<Req: DsdlType, Resp: DsdlType> {
    impl_: Arc<ClientImpl>,
    priority: Priority,
    response_timeout: Duration,
    closed: AtomicBool,
    _marker: PhantomData<(Req, Resp)>,
}

impl<Req: DsdlType, Resp: DsdlType> Client<Req, Resp> {
    pub(crate) fn new(impl_: Arc<ClientImpl>) -> Self {
        impl_.acquire();
        Self {
            impl_,
            priority: Priority::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            closed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    pub fn server_node_id(&self) -> NodeId {
        self.impl_.server_node_id
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Overrides the shared outgoing transfer-ID counter.
    pub fn override_transfer_id_counter(&self, value: u64) {
        self.impl_.counter.store(value, Ordering::Release);
    }

    pub fn unexpected_response_count(&self) -> u64 {
        self.impl_.unexpected_responses.load(Ordering::Relaxed)
    }

    /// Sends `request` and awaits the matching response, up to
    /// `response_timeout`. Fails with [`Error::RequestIdExhausted`] if the
    /// transfer-ID slot this call would use is already awaiting a response
    /// (the modulo has wrapped around faster than responses arrive).
    pub async fn call(&self, request: &Req) -> Result<(Resp, TransferFrom)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPort);
        }
        let transfer_id = self.impl_.counter.fetch_add(1, Ordering::AcqRel) % self.impl_.modulo;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.impl_.pending.lock().await;
            if pending.contains_key(&transfer_id) {
                return Err(Error::RequestIdExhausted { modulo: self.impl_.modulo });
            }
            pending.insert(transfer_id, tx);
        }

        let fragmented_payload = request.to_fragmented_payload()?;
        let deadline = Timestamp::now() + self.response_timeout;
        let transfer = Transfer { timestamp: Timestamp::now(), priority: self.priority, transfer_id, fragmented_payload };

        if let Err(err) = self.impl_.output_session.send(transfer, deadline).await {
            self.impl_.pending.lock().await.remove(&transfer_id);
            return Err(err);
        }

        let outcome = tokio::time::timeout_at(deadline, rx).await;
        self.impl_.pending.lock().await.remove(&transfer_id);
        match outcome {
            Ok(Ok(transfer_from)) => {
                let response = Resp::from_fragments(&transfer_from.fragmented_payload)?;
                Ok((response, transfer_from))
            }
            Ok(Err(_sender_dropped)) => Err(Error::Transport("client shut down while awaiting response".into())),
            Err(_elapsed) => Err(Error::Transport("response timed out".into())),
        }
    }

    /// Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.impl_.release().await;
        }
    }
}

impl<Req: DsdlType, Resp: DsdlType> Drop for Client<Req, Resp> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let impl_ = self.impl_.clone();
            tokio::spawn(async move { impl_.release().await });
        }
    }
}
