//! Publisher proxies: typed message ports fronting one shared output
//! session.

use super::dsdl::DsdlType;
use crate::error::{Error, Result};
use crate::transport::{OutputSession, PortId, Priority, SessionSpecifier, Timestamp, Transfer};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct PublisherImpl {
    pub(crate) specifier: SessionSpecifier,
    output_session: Arc<dyn OutputSession>,
    counter: Arc<AtomicU64>,
    refcount: AtomicUsize,
    finalizer: AsyncMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl PublisherImpl {
    pub(crate) fn new(
        specifier: SessionSpecifier,
        output_session: Arc<dyn OutputSession>,
        counter: Arc<AtomicU64>,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            specifier,
            output_session,
            counter,
            refcount: AtomicUsize::new(0),
            finalizer: AsyncMutex::new(Some(finalizer)),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    async fn release(self: &Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.output_session.close().await;
            if let Some(finalizer) = self.finalizer.lock().await.take() {
                finalizer();
            }
        }
    }
}

/// A user-visible handle onto a shared publisher implementation. Cloning a
/// `Publisher` is not supported directly — call
/// [`PresentationController::make_publisher`](super::PresentationController::make_publisher)
/// again to obtain another proxy over the same underlying session; each
/// proxy carries its own priority and send-timeout overrides.
pub struct Publisher<T: DsdlType> {
    impl_: Arc<PublisherImpl>,
    priority: Priority,
    send_timeout: Duration,
    closed: AtomicBool,
    _marker: PhantomData<T>,
}

impl<T: DsdlType> Publisher<T> {
    pub(crate) fn new(impl_: Arc<PublisherImpl>) -> Self {
        impl_.acquire();
        Self { impl_, priority: Priority::default(), send_timeout: DEFAULT_SEND_TIMEOUT, closed: AtomicBool::new(false), _marker: PhantomData }
    }

    pub fn subject_id(&self) -> PortId {
        match self.impl_.specifier {
            SessionSpecifier::Message(m) => m.subject_id,
            SessionSpecifier::Service(_) => unreachable!("publisher specifier is always a message specifier"),
        }
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    /// Overrides the shared outgoing transfer-ID counter. Affects every
    /// proxy naming the same session.
    pub fn override_transfer_id_counter(&self, value: u64) {
        self.impl_.counter.store(value, Ordering::Release);
    }

    /// Serializes `message`, assigns the next transfer-ID, and awaits
    /// completion of the send before returning.
    pub async fn publish(&self, message: &T) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedPort);
        }
        let fragmented_payload = message.to_fragmented_payload()?;
        let transfer_id = self.impl_.counter.fetch_add(1, Ordering::AcqRel);
        let transfer =
            Transfer { timestamp: Timestamp::now(), priority: self.priority, transfer_id, fragmented_payload };
        let deadline = Timestamp::now() + self.send_timeout;
        self.impl_.output_session.send(transfer, deadline).await?;
        Ok(())
    }

    /// Spawns the send in the background; any failure is logged rather than
    /// propagated. Ordering with respect to other `publish`/`publish_soon`
    /// calls on this proxy is preserved because the transfer-ID is assigned
    /// here, synchronously, before the task is spawned.
    pub fn publish_soon(&self, message: T) {
        if self.closed.load(Ordering::Acquire) {
            warn!("publish_soon called on a closed publisher");
            return;
        }
        let impl_ = self.impl_.clone();
        let priority = self.priority;
        let send_timeout = self.send_timeout;
        let transfer_id = impl_.counter.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let fragmented_payload = match message.to_fragmented_payload() {
                Ok(p) => p,
                Err(err) => {
                    warn!(%err, "publish_soon failed to serialize message");
                    return;
                }
            };
            let transfer = Transfer { timestamp: Timestamp::now(), priority, transfer_id, fragmented_payload };
            let deadline = Timestamp::now() + send_timeout;
            if let Err(err) = impl_.output_session.send(transfer, deadline).await {
                warn!(%err, "publish_soon failed to send message");
            }
        });
    }

    /// Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.impl_.release().await;
        }
    }
}

impl<T: DsdlType> Drop for Publisher<T> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let impl_ = self.impl_.clone();
            tokio::spawn(async move { impl_.release().await });
        }
    }
}
