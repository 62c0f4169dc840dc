//! Subscriber proxies: one background reader task per subject demultiplexes
//! into every proxy that asked for it.

use super::dsdl::DsdlType;
use crate::error::{Error, Result};
use crate::transport::{InputSession, PortId, SessionSpecifier, Timestamp, TransferFrom};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

const READ_POLL: std::time::Duration = std::time::Duration::from_millis(500);

type Listeners = Arc<AsyncMutex<Vec<mpsc::UnboundedSender<TransferFrom>>>>;

pub(crate) struct SubscriberImpl {
    pub(crate) specifier: SessionSpecifier,
    listeners: Listeners,
    refcount: AtomicUsize,
    reader: tokio::task::JoinHandle<()>,
    finalizer: AsyncMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SubscriberImpl {
    pub(crate) fn new(
        specifier: SessionSpecifier,
        input_session: Arc<dyn InputSession>,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        let listeners: Listeners = Arc::new(AsyncMutex::new(Vec::new()));
        let reader_listeners = listeners.clone();
        let reader = tokio::spawn(async move {
            loop {
                let deadline = Timestamp::now() + READ_POLL;
                match input_session.receive(deadline).await {
                    Ok(Some(transfer)) => {
                        let mut listeners = reader_listeners.lock().await;
                        listeners.retain(|tx| tx.send(transfer.clone()).is_ok());
                    }
                    Ok(None) => {}
                    Err(Error::ClosedPort) => break,
                    Err(err) => debug!(%err, "subscriber read error"),
                }
            }
        });
        Arc::new(Self {
            specifier,
            listeners,
            refcount: AtomicUsize::new(0),
            reader,
            finalizer: AsyncMutex::new(Some(finalizer)),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    async fn register(self: &Arc<Self>) -> mpsc::UnboundedReceiver<TransferFrom> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.push(tx);
        rx
    }

    async fn release(self: &Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.reader.abort();
            if let Some(finalizer) = self.finalizer.lock().await.take() {
                finalizer();
            }
        }
    }
}

/// A typed handle onto a shared subscription. Every proxy receives its own
/// copy of every transfer accepted on the underlying session.
pub struct Subscriber<T: DsdlType> {
    impl_: Arc<SubscriberImpl>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<TransferFrom>>,
    closed: AtomicBool,
    _marker: PhantomData<T>,
}

impl<T: DsdlType> Subscriber<T> {
    pub(crate) async fn new(impl_: Arc<SubscriberImpl>) -> Self {
        impl_.acquire();
        let rx = impl_.register().await;
        Self { impl_, rx: AsyncMutex::new(rx), closed: AtomicBool::new(false), _marker: PhantomData }
    }

    pub fn subject_id(&self) -> PortId {
        match self.impl_.specifier {
            SessionSpecifier::Message(m) => m.subject_id,
            SessionSpecifier::Service(_) => unreachable!("subscriber specifier is always a message specifier"),
        }
    }

    /// Waits until `deadline` for the next message, deserializing it as `T`.
    /// Returns `Ok(None)` on timeout.
    pub async fn receive(&self, deadline: Timestamp) -> Result<Option<(T, TransferFrom)>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPort);
        }
        let mut rx = self.rx.lock().await;
        let received = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return Err(Error::ClosedPort),
            Err(_elapsed) => return Ok(None),
        };
        let value = T::from_fragments(&received.fragmented_payload)?;
        Ok(Some((value, received)))
    }

    /// Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.impl_.release().await;
        }
    }
}

impl<T: DsdlType> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let impl_ = self.impl_.clone();
            tokio::spawn(async move { impl_.release().await });
        }
    }
}
