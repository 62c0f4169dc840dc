//! # Redundant Output Session
//!
//! Fans a transfer out to every inferior concurrently and resolves on first
//! success.

use super::session::RedundantSessionControl;
use crate::error::{Error, Result};
use crate::transport::{
    Feedback, FeedbackCallback, OutputSession, PayloadMetadata, SessionSpecifier, SessionStatistics, Timestamp,
    Transfer, Transport,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinSet;

struct WorkItem {
    transfer: Transfer,
    deadline: Timestamp,
    result_tx: oneshot::Sender<Result<bool>>,
}

struct Inferior {
    session: Arc<dyn OutputSession>,
    tx: mpsc::Sender<WorkItem>,
    worker: tokio::task::JoinHandle<()>,
}

impl Inferior {
    async fn close(self) {
        self.worker.abort();
        self.session.close().await;
    }
}

async fn inferior_worker(session: Arc<dyn OutputSession>, mut rx: mpsc::Receiver<WorkItem>) {
    while let Some(item) = rx.recv().await {
        let result = session.send(item.transfer, item.deadline).await;
        let _ = item.result_tx.send(result);
    }
}

struct State {
    inferiors: Vec<Inferior>,
}

/// See the module documentation.
pub struct RedundantOutputSession {
    specifier: SessionSpecifier,
    payload_metadata: PayloadMetadata,
    state: Mutex<State>,
    attach_notify: Notify,
    feedback: Mutex<Option<FeedbackCallback>>,
    stat_transfers: AtomicU64,
    stat_errors: AtomicU64,
    stat_drops: AtomicU64,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RedundantOutputSession {
    pub(crate) fn new(
        specifier: SessionSpecifier,
        payload_metadata: PayloadMetadata,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            specifier,
            payload_metadata,
            state: Mutex::new(State { inferiors: Vec::new() }),
            attach_notify: Notify::new(),
            feedback: Mutex::new(None),
            stat_transfers: AtomicU64::new(0),
            stat_errors: AtomicU64::new(0),
            stat_drops: AtomicU64::new(0),
            finalizer: Mutex::new(Some(finalizer)),
        })
    }

    pub async fn inferior_count_async(&self) -> usize {
        self.state.lock().await.inferiors.len()
    }
}

#[async_trait::async_trait]
impl OutputSession for RedundantOutputSession {
    fn specifier(&self) -> SessionSpecifier {
        self.specifier
    }

    fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    async fn send(&self, transfer: Transfer, deadline: Timestamp) -> Result<bool> {
        loop {
            {
                let state = self.state.lock().await;
                if !state.inferiors.is_empty() {
                    break;
                }
            }
            let now = Timestamp::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = self.attach_notify.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
            }
        }

        let mut join_set = JoinSet::new();
        {
            let state = self.state.lock().await;
            for inf in &state.inferiors {
                let (result_tx, result_rx) = oneshot::channel();
                let item = WorkItem { transfer: transfer.clone(), deadline, result_tx };
                if inf.tx.send(item).await.is_err() {
                    // Worker already gone; treat as a dropped attempt, not
                    // a hard failure for the whole fan-out.
                    self.stat_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                join_set.spawn(async move { result_rx.await });
            }
        }

        let mut saw_false = false;
        let mut last_error: Option<Error> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(Ok(true))) => {
                    self.stat_transfers.fetch_add(1, Ordering::Relaxed);
                    // Remaining futures are cancelled here; their inferior
                    // workers keep transmitting independently in the
                    // background for the rest of the deadline.
                    return Ok(true);
                }
                Ok(Ok(Ok(false))) => saw_false = true,
                Ok(Ok(Err(err))) => {
                    self.stat_errors.fetch_add(1, Ordering::Relaxed);
                    last_error = Some(err);
                }
                Ok(Err(_recv_dropped)) => self.stat_drops.fetch_add(1, Ordering::Relaxed),
                Err(_join_err) => self.stat_drops.fetch_add(1, Ordering::Relaxed),
            }
        }
        if saw_false {
            return Ok(false);
        }
        if let Some(err) = last_error {
            return Err(err);
        }
        // No inferiors actually accepted work (e.g. all channels closed).
        Ok(false)
    }

    fn sample_statistics(&self) -> SessionStatistics {
        SessionStatistics {
            transfers: self.stat_transfers.load(Ordering::Relaxed),
            frames: 0,
            payload_bytes: 0,
            errors: self.stat_errors.load(Ordering::Relaxed),
            drops: self.stat_drops.load(Ordering::Relaxed),
            inferiors: Vec::new(),
        }
    }

    fn enable_feedback(&self, handler: FeedbackCallback) -> Result<()> {
        let Ok(state) = self.state.try_lock() else {
            return Err(Error::Configuration("session busy, retry".into()));
        };
        let mut enabled = Vec::with_capacity(state.inferiors.len());
        for inf in &state.inferiors {
            let wrapped_handler = handler.clone();
            let result = inf.session.enable_feedback(Arc::new(move |fb: Feedback| wrapped_handler(fb)));
            if result.is_err() {
                for done in &enabled {
                    let i: &Arc<dyn OutputSession> = done;
                    i.disable_feedback();
                }
                return result;
            }
            enabled.push(inf.session.clone());
        }
        drop(state);
        *self.feedback.try_lock().unwrap() = Some(handler);
        Ok(())
    }

    fn disable_feedback(&self) {
        if let Ok(state) = self.state.try_lock() {
            for inf in &state.inferiors {
                inf.session.disable_feedback();
            }
        }
        if let Ok(mut feedback) = self.feedback.try_lock() {
            *feedback = None;
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        let inferiors = std::mem::take(&mut state.inferiors);
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
impl RedundantSessionControl for RedundantOutputSession {
    fn specifier(&self) -> SessionSpecifier {
        self.specifier
    }

    fn inferior_count(&self) -> usize {
        self.state.try_lock().map(|s| s.inferiors.len()).unwrap_or(0)
    }

    async fn add_inferior(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        let session = transport.get_output_session(self.specifier, self.payload_metadata).await?;
        let (tx, rx) = mpsc::channel(16);
        let worker = tokio::spawn(inferior_worker(session.clone(), rx));
        let mut state = self.state.lock().await;
        state.inferiors.push(Inferior { session, tx, worker });
        drop(state);
        self.attach_notify.notify_waiters();
        Ok(())
    }

    async fn close_inferior(&self, index: usize) {
        let inf = {
            let mut state = self.state.lock().await;
            if index >= state.inferiors.len() {
                return;
            }
            state.inferiors.remove(index)
        };
        inf.close().await;
    }

    async fn close(&self) {
        OutputSession::close(self).await
    }
}
