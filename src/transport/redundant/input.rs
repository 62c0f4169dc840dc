//! # Redundant Input Session
//!
//! A composite of a group of [`InputSession`]s. One worker task per inferior
//! feeds a single, lazily-constructed [`Deduplicator`]; accepted transfers
//! are delivered to the user at most once, annotated with the inferior they
//! actually arrived on.

use super::dedup::{self, Deduplicator};
use super::session::RedundantSessionControl;
use crate::error::{Error, Result};
use crate::transport::{
    next_iface_id, InputSession, PayloadMetadata, SessionSpecifier, SessionStatistics, Timestamp, TransferFrom,
    Transport,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const READ_POLL: Duration = Duration::from_millis(1000);

/// A transfer delivered by [`RedundantInputSession::receive_redundant`],
/// additionally naming the inferior session it was actually accepted from.
#[derive(Clone)]
pub struct RedundantTransferFrom {
    pub transfer: TransferFrom,
    pub inferior_session: Arc<dyn InputSession>,
}

struct Inferior {
    session: Arc<dyn InputSession>,
    worker: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    iface_id: u64,
}

impl Inferior {
    async fn close(self) {
        self.worker.abort();
        self.session.close().await;
    }
}

struct State {
    inferiors: Vec<Inferior>,
    deduplicator: Option<Box<dyn Deduplicator>>,
    transfer_id_timeout: Duration,
}

/// See the module documentation.
pub struct RedundantInputSession {
    specifier: SessionSpecifier,
    payload_metadata: PayloadMetadata,
    self_weak: Weak<RedundantInputSession>,
    state: Mutex<State>,
    read_tx: mpsc::UnboundedSender<RedundantTransferFrom>,
    read_rx: Mutex<mpsc::UnboundedReceiver<RedundantTransferFrom>>,
    error_tx: mpsc::Sender<Error>,
    error_rx: Mutex<mpsc::Receiver<Error>>,
    closed: AtomicBool,
    stat_transfers: AtomicU64,
    stat_payload_bytes: AtomicU64,
    stat_errors: AtomicU64,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RedundantInputSession {
    pub(crate) fn new(
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::channel(1);
        Arc::new_cyclic(|weak| Self {
            specifier,
            payload_metadata,
            self_weak: weak.clone(),
            state: Mutex::new(State { inferiors: Vec::new(), deduplicator: None, transfer_id_timeout: Duration::ZERO }),
            read_tx,
            read_rx: Mutex::new(read_rx),
            error_tx,
            error_rx: Mutex::new(error_rx),
            closed: AtomicBool::new(false),
            stat_transfers: AtomicU64::new(0),
            stat_payload_bytes: AtomicU64::new(0),
            stat_errors: AtomicU64::new(0),
            finalizer: Mutex::new(Some(finalizer)),
        })
    }

    /// Number of inferior sessions currently in this row.
    pub async fn inferior_count_async(&self) -> usize {
        self.state.lock().await.inferiors.len()
    }

    /// Reads one deduplicated transfer, annotated with the inferior session
    /// it was accepted from. See [`InputSession::receive`] for the deadline
    /// and closed-port semantics; this is the redundancy-aware counterpart.
    pub async fn receive_redundant(&self, deadline: Timestamp) -> Result<Option<RedundantTransferFrom>> {
        // Pending errors preempt normal delivery because draining the read
        // queue might unblock reader tasks that should see the fault first.
        {
            let mut error_rx = self.error_rx.lock().await;
            if let Ok(err) = error_rx.try_recv() {
                return Err(err);
            }
        }

        let mut read_rx = self.read_rx.lock().await;
        let now = Timestamp::now();
        let outcome = if deadline > now {
            tokio::time::timeout_at(deadline, read_rx.recv()).await.ok().flatten()
        } else {
            read_rx.try_recv().ok()
        };
        match outcome {
            Some(rt) => Ok(Some(rt)),
            None => {
                if self.closed.load(Ordering::Acquire) {
                    Err(Error::ClosedPort)
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn process_transfer(self: &Arc<Self>, session: &Arc<dyn InputSession>, iface_id: u64, transfer: TransferFrom) {
        let mut state = self.state.lock().await;
        let Some(dedup) = state.deduplicator.as_deref_mut() else { return };
        let accept = dedup.should_accept_transfer(
            iface_id,
            state.transfer_id_timeout,
            transfer.timestamp,
            transfer.source_node_id,
            transfer.transfer_id,
        );
        drop(state);
        if accept {
            debug!(iface_id, transfer_id = transfer.transfer_id, "accepting transfer");
            self.stat_transfers.fetch_add(1, Ordering::Relaxed);
            let bytes: usize = transfer.fragmented_payload.iter().map(|f| f.len()).sum();
            self.stat_payload_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
            let _ = self.read_tx.send(RedundantTransferFrom { transfer, inferior_session: session.clone() });
        } else {
            debug!(iface_id, transfer_id = transfer.transfer_id, "discarding redundant duplicate");
        }
    }

    async fn inferior_worker_task(self: Arc<Self>, session: Arc<dyn InputSession>, iface_id: u64) {
        loop {
            {
                let state = self.state.lock().await;
                if state.deduplicator.is_none() {
                    break;
                }
            }
            let deadline = Timestamp::now() + READ_POLL;
            match session.receive(deadline).await {
                Ok(Some(tr)) => self.process_transfer(&session, iface_id, tr).await,
                Ok(None) => {}
                Err(Error::ClosedPort) => break,
                Err(err) => {
                    self.stat_errors.fetch_add(1, Ordering::Relaxed);
                    // Blocks until the one-item slot frees, so a broken
                    // inferior cannot spin-flood the error queue.
                    if self.error_tx.send(err).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl InputSession for RedundantInputSession {
    fn specifier(&self) -> SessionSpecifier {
        self.specifier
    }

    fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    async fn receive(&self, deadline: Timestamp) -> Result<Option<TransferFrom>> {
        Ok(self.receive_redundant(deadline).await?.map(|rt| rt.transfer))
    }

    fn transfer_id_timeout(&self) -> Duration {
        // Best-effort snapshot; exact value is also available via `try_lock`.
        self.state.try_lock().map(|s| s.transfer_id_timeout).unwrap_or(Duration::ZERO)
    }

    fn set_transfer_id_timeout(&self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(Error::Configuration("transfer-ID timeout must be positive".into()));
        }
        let Ok(mut state) = self.state.try_lock() else {
            return Err(Error::Configuration("session busy, retry".into()));
        };
        state.transfer_id_timeout = value;
        for inf in &state.inferiors {
            let _ = inf.session.set_transfer_id_timeout(value);
        }
        Ok(())
    }

    fn sample_statistics(&self) -> SessionStatistics {
        SessionStatistics {
            transfers: self.stat_transfers.load(Ordering::Relaxed),
            frames: 0,
            payload_bytes: self.stat_payload_bytes.load(Ordering::Relaxed),
            errors: self.stat_errors.load(Ordering::Relaxed),
            drops: 0,
            inferiors: Vec::new(),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        let inferiors = std::mem::take(&mut state.inferiors);
        state.deduplicator = None;
        drop(state);
        for inf in inferiors {
            inf.close().await;
        }
        if let Some(fin) = self.finalizer.lock().await.take() {
            fin();
        }
    }
}

#[async_trait::async_trait]
impl RedundantSessionControl for RedundantInputSession {
    fn specifier(&self) -> SessionSpecifier {
        self.specifier
    }

    fn inferior_count(&self) -> usize {
        self.state.try_lock().map(|s| s.inferiors.len()).unwrap_or(0)
    }

    async fn add_inferior(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        let session = transport.get_input_session(self.specifier, self.payload_metadata).await?;
        let mut state = self.state.lock().await;
        if state.inferiors.is_empty() {
            state.deduplicator = Some(dedup::new(transport.protocol_parameters().transfer_id_modulo));
        }
        if !state.transfer_id_timeout.is_zero() {
            let _ = session.set_transfer_id_timeout(state.transfer_id_timeout);
        }
        let iface_id = next_iface_id();
        let self_arc = self.self_weak.upgrade().expect("input session outlives its own workers");
        let worker = tokio::spawn(self_arc.inferior_worker_task(session.clone(), iface_id));
        state.inferiors.push(Inferior { session, worker, iface_id });
        Ok(())
    }

    async fn close_inferior(&self, index: usize) {
        let inf = {
            let mut state = self.state.lock().await;
            if index >= state.inferiors.len() {
                return;
            }
            let inf = state.inferiors.remove(index);
            if state.inferiors.is_empty() {
                state.deduplicator = None;
            }
            inf
        };
        inf.close().await;
    }

    async fn close(&self) {
        InputSession::close(self).await
    }
}
