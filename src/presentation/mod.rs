//! # Presentation Layer
//!
//! Publishers, subscribers, clients and servers: typed ports built on top of
//! the transport abstraction in [`crate::transport`]. A
//! [`PresentationController`] owns exactly one session (hence one transfer
//! stream) per distinct [`SessionSpecifier`](crate::transport::SessionSpecifier)
//! and hands out lightweight proxies over it; proxies are reference-counted
//! so the underlying session is only closed once the last proxy referencing
//! it is dropped or explicitly closed.

pub mod client;
pub mod dsdl;
pub mod publisher;
pub mod server;
pub mod subscriber;

pub use client::{Client, RequestMetadata as ClientRequestMetadata};
pub use dsdl::{DsdlType, GetInfoRequest, GetInfoResponse, ScalarValue};
pub use publisher::Publisher;
pub use server::{Handler, RequestMetadata, Server};
pub use subscriber::Subscriber;

use crate::error::Result;
use crate::transport::{
    MessageSessionSpecifier, NodeId, PortId, ServiceRole, ServiceSessionSpecifier, SessionSpecifier, Transport,
};
use client::ClientImpl;
use publisher::PublisherImpl;
use server::ServerImpl;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use subscriber::SubscriberImpl;
use tokio::sync::Mutex;

/// Owns the transport and every live port built on top of it. Cheap to
/// clone (it is always handed around as an `Arc`); the expensive state
/// lives behind the internal maps.
pub struct PresentationController {
    transport: Arc<dyn Transport>,
    publishers: Mutex<HashMap<PortId, Arc<PublisherImpl>>>,
    subscribers: Mutex<HashMap<(PortId, Option<NodeId>), Arc<SubscriberImpl>>>,
    clients: Mutex<HashMap<(PortId, NodeId), Arc<ClientImpl>>>,
    servers: Mutex<HashMap<PortId, Arc<ServerImpl>>>,
    counters: Mutex<HashMap<SessionSpecifier, Arc<AtomicU64>>>,
}

impl PresentationController {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            publishers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn counter_for(&self, specifier: SessionSpecifier) -> Arc<AtomicU64> {
        self.counters.lock().await.entry(specifier).or_insert_with(|| Arc::new(AtomicU64::new(0))).clone()
    }

    /// Returns a publisher proxy for `subject_id`, creating the underlying
    /// output session on first use. Every subsequent call for the same
    /// subject-ID shares that session and its outgoing transfer-ID counter.
    pub async fn make_publisher<T: DsdlType>(self: &Arc<Self>, subject_id: PortId) -> Result<Publisher<T>> {
        let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id, remote_node_id: None });
        let mut publishers = self.publishers.lock().await;
        if let Some(existing) = publishers.get(&subject_id) {
            return Ok(Publisher::new(existing.clone()));
        }
        let output_session = self.transport.get_output_session(specifier, T::payload_metadata()).await?;
        let counter = self.counter_for(specifier).await;
        let weak_self: Weak<Self> = Arc::downgrade(self);
        let finalizer: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(controller) = weak_self.upgrade() {
                tokio::spawn(async move {
                    controller.publishers.lock().await.remove(&subject_id);
                });
            }
        });
        let impl_ = PublisherImpl::new(specifier, output_session, counter, finalizer);
        publishers.insert(subject_id, impl_.clone());
        drop(publishers);
        Ok(Publisher::new(impl_))
    }

    /// Returns a subscriber proxy for `subject_id`, optionally filtered to
    /// one `remote_node_id`. Proxies created for the same `(subject_id,
    /// remote_node_id)` pair share one background reader task.
    pub async fn make_subscriber<T: DsdlType>(
        self: &Arc<Self>,
        subject_id: PortId,
        remote_node_id: Option<NodeId>,
    ) -> Result<Subscriber<T>> {
        let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id, remote_node_id });
        let key = (subject_id, remote_node_id);
        let mut subscribers = self.subscribers.lock().await;
        if let Some(existing) = subscribers.get(&key) {
            drop(subscribers);
            return Ok(Subscriber::new(existing.clone()).await);
        }
        let input_session = self.transport.get_input_session(specifier, T::payload_metadata()).await?;
        let weak_self: Weak<Self> = Arc::downgrade(self);
        let finalizer: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(controller) = weak_self.upgrade() {
                tokio::spawn(async move {
                    controller.subscribers.lock().await.remove(&key);
                });
            }
        });
        let impl_ = SubscriberImpl::new(specifier, input_session, finalizer);
        subscribers.insert(key, impl_.clone());
        drop(subscribers);
        Ok(Subscriber::new(impl_).await)
    }

    /// Returns a client proxy bound to `service_id` on `server_node_id`.
    /// Proxies sharing a `(service_id, server_node_id)` pair share one
    /// request-output/response-input session pair, one outgoing
    /// transfer-ID counter, and one background response-demultiplexing
    /// task.
    pub async fn make_client<Req: DsdlType, Resp: DsdlType>(
        self: &Arc<Self>,
        service_id: PortId,
        server_node_id: NodeId,
    ) -> Result<Client<Req, Resp>> {
        let key = (service_id, server_node_id);
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(&key) {
            return Ok(Client::new(existing.clone()));
        }
        let request_specifier = SessionSpecifier::Service(ServiceSessionSpecifier {
            service_id,
            role: ServiceRole::Request,
            peer_node_id: Some(server_node_id),
        });
        let response_specifier = SessionSpecifier::Service(ServiceSessionSpecifier {
            service_id,
            role: ServiceRole::Response,
            peer_node_id: Some(server_node_id),
        });
        let output_session = self.transport.get_output_session(request_specifier, Req::payload_metadata()).await?;
        let input_session = self.transport.get_input_session(response_specifier, Resp::payload_metadata()).await?;
        let modulo = self.transport.protocol_parameters().transfer_id_modulo.max(1);
        let counter = self.counter_for(request_specifier).await;
        let weak_self: Weak<Self> = Arc::downgrade(self);
        let finalizer: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(controller) = weak_self.upgrade() {
                tokio::spawn(async move {
                    controller.clients.lock().await.remove(&key);
                });
            }
        });
        let impl_ = ClientImpl::new(server_node_id, output_session, input_session, counter, modulo, finalizer);
        clients.insert(key, impl_.clone());
        drop(clients);
        Ok(Client::new(impl_))
    }

    /// Returns a server proxy listening for requests on `service_id` from
    /// any client. At most one request-input session exists per
    /// `service_id`, shared by every server proxy created for it.
    pub async fn get_server<Req: DsdlType, Resp: DsdlType>(
        self: &Arc<Self>,
        service_id: PortId,
    ) -> Result<Server<Req, Resp>> {
        let mut servers = self.servers.lock().await;
        if let Some(existing) = servers.get(&service_id) {
            return Ok(Server::new(existing.clone()));
        }
        let request_specifier = SessionSpecifier::Service(ServiceSessionSpecifier {
            service_id,
            role: ServiceRole::Request,
            peer_node_id: None,
        });
        let input_session = self.transport.get_input_session(request_specifier, Req::payload_metadata()).await?;
        let weak_self: Weak<Self> = Arc::downgrade(self);
        let finalizer: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(controller) = weak_self.upgrade() {
                tokio::spawn(async move {
                    controller.servers.lock().await.remove(&service_id);
                });
            }
        });
        let impl_ = ServerImpl::new(service_id, input_session, self.transport.clone(), finalizer);
        servers.insert(service_id, impl_.clone());
        drop(servers);
        Ok(Server::new(impl_))
    }

    /// Like [`Self::make_publisher`], but takes the subject-ID from `T`'s
    /// [`DsdlType::FIXED_PORT_ID`] instead of an explicit argument. Fails
    /// with a configuration error if `T` defines no fixed port-ID.
    pub async fn make_publisher_with_fixed_subject_id<T: DsdlType>(self: &Arc<Self>) -> Result<Publisher<T>> {
        let subject_id = T::FIXED_PORT_ID.ok_or_else(|| {
            crate::error::Error::Configuration("type defines no fixed subject-ID".into())
        })?;
        self.make_publisher(subject_id).await
    }

    /// Like [`Self::make_subscriber`], but takes the subject-ID from `T`'s
    /// [`DsdlType::FIXED_PORT_ID`] instead of an explicit argument.
    pub async fn make_subscriber_with_fixed_subject_id<T: DsdlType>(
        self: &Arc<Self>,
        remote_node_id: Option<NodeId>,
    ) -> Result<Subscriber<T>> {
        let subject_id = T::FIXED_PORT_ID.ok_or_else(|| {
            crate::error::Error::Configuration("type defines no fixed subject-ID".into())
        })?;
        self.make_subscriber(subject_id, remote_node_id).await
    }

    /// Like [`Self::make_client`], but takes the service-ID from `Req`'s
    /// [`DsdlType::FIXED_PORT_ID`] instead of an explicit argument.
    pub async fn make_client_with_fixed_service_id<Req: DsdlType, Resp: DsdlType>(
        self: &Arc<Self>,
        server_node_id: NodeId,
    ) -> Result<Client<Req, Resp>> {
        let service_id = Req::FIXED_PORT_ID.ok_or_else(|| {
            crate::error::Error::Configuration("type defines no fixed service-ID".into())
        })?;
        self.make_client(service_id, server_node_id).await
    }

    /// Like [`Self::get_server`], but takes the service-ID from `Req`'s
    /// [`DsdlType::FIXED_PORT_ID`] instead of an explicit argument.
    pub async fn get_server_with_fixed_service_id<Req: DsdlType, Resp: DsdlType>(
        self: &Arc<Self>,
    ) -> Result<Server<Req, Resp>> {
        let service_id = Req::FIXED_PORT_ID.ok_or_else(|| {
            crate::error::Error::Configuration("type defines no fixed service-ID".into())
        })?;
        self.get_server(service_id).await
    }

    /// Closes every publisher, subscriber, client and server this
    /// controller has created, then the transport itself.
    pub async fn close(&self) {
        for (_, impl_) in std::mem::take(&mut *self.publishers.lock().await) {
            let _ = impl_;
        }
        for (_, impl_) in std::mem::take(&mut *self.subscribers.lock().await) {
            let _ = impl_;
        }
        for (_, impl_) in std::mem::take(&mut *self.clients.lock().await) {
            let _ = impl_;
        }
        for (_, impl_) in std::mem::take(&mut *self.servers.lock().await) {
            let _ = impl_;
        }
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;
    use crate::transport::ProtocolParameters;
    use tokio::time::Duration;

    fn params() -> ProtocolParameters {
        ProtocolParameters { transfer_id_modulo: 1 << 48, max_nodes: 128, mtu: 1024 }
    }

    #[tokio::test]
    async fn publish_subscribe_round_trip() {
        // One shared loopback bus, two proxies over it: a publisher and a
        // subscriber created from the same controller, matching the
        // end-to-end scenario of one node observing its own publication.
        let transport = LoopbackTransport::new(Some(1234), params());
        let controller = PresentationController::new(transport);
        let publisher = controller.make_publisher::<ScalarValue>(2000).await.unwrap();
        let subscriber = controller.make_subscriber::<ScalarValue>(2000, None).await.unwrap();

        publisher.publish(&ScalarValue(402.15)).await.unwrap();
        let deadline = crate::transport::Timestamp::now() + Duration::from_secs(1);
        let (value, transfer) = subscriber.receive(deadline).await.unwrap().expect("message");
        assert_eq!(value, ScalarValue(402.15));
        assert_eq!(transfer.source_node_id, Some(1234));
        assert_eq!(transfer.transfer_id, 0);
    }

    /// Two subscribers on the same subject but with differing
    /// `remote_node_id` filters must own distinct sessions: §3 defines
    /// session identity as subject-ID *and* the remote node-ID filter, so
    /// a node-5-filtered subscriber and a promiscuous one are different
    /// rows, not the same cached impl.
    #[tokio::test]
    async fn subscribers_on_one_subject_with_different_filters_are_independent() {
        use crate::transport::{AlienSessionSpecifier, AlienTransfer, DataSpecifier, Fragment, Priority, Transport};
        use std::sync::Arc as StdArc;

        let transport = LoopbackTransport::new(Some(1234), params());
        let controller = PresentationController::new(transport.clone());

        let filtered = controller.make_subscriber::<ScalarValue>(2000, Some(5)).await.unwrap();
        let promiscuous = controller.make_subscriber::<ScalarValue>(2000, None).await.unwrap();

        let spoof = |source_node_id: u16, value: f32| {
            let payload: Fragment = StdArc::from(value.to_le_bytes().to_vec().into_boxed_slice());
            AlienTransfer {
                timestamp: crate::transport::Timestamp::now(),
                priority: Priority::Nominal,
                transfer_id: 0,
                fragmented_payload: vec![payload],
                session_specifier: AlienSessionSpecifier {
                    source_node_id: Some(source_node_id),
                    destination_node_id: None,
                    data_specifier: DataSpecifier::Subject(2000),
                },
            }
        };

        let deadline = || crate::transport::Timestamp::now() + Duration::from_millis(200);

        // A transfer from node 9 must not reach the node-5-filtered subscriber...
        transport.spoof(spoof(9, 1.0), crate::transport::Timestamp::now()).await.unwrap();
        assert!(promiscuous.receive(deadline()).await.unwrap().is_some());
        assert!(filtered.receive(deadline()).await.unwrap().is_none());

        // ...but a transfer from node 5 reaches both.
        transport.spoof(spoof(5, 2.0), crate::transport::Timestamp::now()).await.unwrap();
        assert!(promiscuous.receive(deadline()).await.unwrap().is_some());
        assert!(filtered.receive(deadline()).await.unwrap().is_some());
    }

    /// The loopback transport models a single local node, so a "server on
    /// 1234" and a "client on 42" calling it share that one local node-id
    /// here; priority, the transfer-ID override, and the timeout are all
    /// still asserted on their own.
    #[tokio::test]
    async fn client_server_round_trip() {
        let transport = LoopbackTransport::new(Some(1234), params());
        let controller = PresentationController::new(transport);

        let server = controller.get_server::<GetInfoRequest, GetInfoResponse>(430).await.unwrap();
        let handler: Handler<GetInfoRequest, GetInfoResponse> = Arc::new(|_req, _meta| {
            Box::pin(async move { Some(GetInfoResponse { name: "node".into(), software_version: (1, 0) }) })
        });
        tokio::spawn(async move {
            let deadline = crate::transport::Timestamp::now() + Duration::from_secs(2);
            let _ = server.serve_until(deadline, handler).await;
        });

        let mut client = controller.make_client::<GetInfoRequest, GetInfoResponse>(430, 1234).await.unwrap();
        client.set_priority(crate::transport::Priority::Exceptional);
        client.set_response_timeout(Duration::from_secs(1));
        client.override_transfer_id_counter(22);
        let (response, transfer) = client.call(&GetInfoRequest).await.unwrap();
        assert_eq!(response.name, "node");
        assert_eq!(transfer.transfer_id, 22);
        assert_eq!(transfer.source_node_id, Some(1234));
        assert_eq!(transfer.priority, crate::transport::Priority::Exceptional);
    }

    #[tokio::test]
    async fn fixed_port_id_helpers_use_the_type_s_own_port_id() {
        let transport = LoopbackTransport::new(Some(1234), params());
        let controller = PresentationController::new(transport);

        let server = controller.get_server_with_fixed_service_id::<GetInfoRequest, GetInfoResponse>().await.unwrap();
        assert_eq!(server.service_id(), 430);
        let handler: Handler<GetInfoRequest, GetInfoResponse> = Arc::new(|_req, _meta| {
            Box::pin(async move { Some(GetInfoResponse { name: "node".into(), software_version: (1, 0) }) })
        });
        tokio::spawn(async move {
            let deadline = crate::transport::Timestamp::now() + Duration::from_secs(2);
            let _ = server.serve_until(deadline, handler).await;
        });

        let client = controller.make_client_with_fixed_service_id::<GetInfoRequest, GetInfoResponse>(1234).await.unwrap();
        let (response, _) = client.call(&GetInfoRequest).await.unwrap();
        assert_eq!(response.name, "node");
    }

    #[tokio::test]
    async fn fixed_port_id_helper_rejects_a_type_with_no_fixed_port_id() {
        let transport = LoopbackTransport::new(Some(1234), params());
        let controller = PresentationController::new(transport);
        let err = controller.make_publisher_with_fixed_subject_id::<ScalarValue>().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Configuration(_)));
    }
}
