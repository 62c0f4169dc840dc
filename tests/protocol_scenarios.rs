//! End-to-end exercises of the six scenarios used while designing this
//! crate's presentation, redundant-transport and deduplication layers.

use cyphal_core::presentation::{GetInfoRequest, GetInfoResponse, Handler, PresentationController, ScalarValue};
use cyphal_core::transport::loopback::LoopbackTransport;
use cyphal_core::transport::redundant::RedundantTransport;
use cyphal_core::transport::{Fragment, MessageSessionSpecifier, PayloadMetadata, Priority, ProtocolParameters, SessionSpecifier, Timestamp, Transfer, Transport};
use std::sync::Arc;
use std::time::Duration;

fn params(modulo: u64) -> ProtocolParameters {
    ProtocolParameters { transfer_id_modulo: modulo, max_nodes: 128, mtu: 1024 }
}

fn fragment(bytes: &[u8]) -> Fragment {
    Arc::from(bytes.to_vec().into_boxed_slice())
}

/// Scenario 1: basic pub/sub over the loopback transport.
#[tokio::test]
async fn basic_pub_sub_loopback() {
    let transport = LoopbackTransport::new(Some(1234), params(1 << 48));
    let controller = PresentationController::new(transport);

    let mut publisher = controller.make_publisher::<ScalarValue>(2000).await.unwrap();
    let subscriber = controller.make_subscriber::<ScalarValue>(2000, None).await.unwrap();

    publisher.publish(&ScalarValue(402.15)).await.unwrap();

    let deadline = Timestamp::now() + Duration::from_secs(1);
    let (value, transfer) = subscriber.receive(deadline).await.unwrap().expect("message");
    assert_eq!(value, ScalarValue(402.15));
    assert_eq!(transfer.source_node_id, Some(1234));
    assert_eq!(transfer.transfer_id, 0);
}

/// Scenario 2: attaching and detaching inferiors preserves the sessions
/// built before and after the membership change.
#[tokio::test]
async fn redundant_attach_detach_preserves_sessions() {
    let redundant = RedundantTransport::new();
    let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 2345, remote_node_id: None });
    let payload_metadata = PayloadMetadata { extent_bytes: 64 };

    let output = redundant.get_output_session(specifier, payload_metadata).await.unwrap();
    assert_eq!(redundant.inferiors().await.len(), 0);

    let a = LoopbackTransport::new(Some(42), params(1 << 48));
    redundant.attach_inferior(a.clone()).await.unwrap();
    let b = LoopbackTransport::new(Some(42), params(1 << 48));
    redundant.attach_inferior(b.clone()).await.unwrap();
    assert_eq!(redundant.inferiors().await.len(), 2);

    let subscriber_on_b = b.get_input_session(specifier, payload_metadata).await.unwrap();
    output
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 1, fragmented_payload: vec![fragment(b"one")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let received = subscriber_on_b.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(received.transfer_id, 1);

    redundant.detach_inferior(&(a as Arc<dyn Transport>)).await.unwrap();
    output
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 2, fragmented_payload: vec![fragment(b"two")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let received = subscriber_on_b.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(received.transfer_id, 2);
}

/// Scenario 3: an inferior whose transfer-ID modulo category disagrees with
/// the group is rejected and the group is left unchanged.
#[tokio::test]
async fn inconsistent_inferior_rejected() {
    let redundant = RedundantTransport::new();
    redundant.attach_inferior(LoopbackTransport::new(Some(1), params(1 << 48))).await.unwrap();

    let err = redundant.attach_inferior(LoopbackTransport::new(Some(1), params(32))).await.unwrap_err();
    assert!(matches!(err, cyphal_core::Error::Configuration(_)));
    assert_eq!(redundant.inferiors().await.len(), 1);
}

/// Scenario 4: two cyclic (modulo 32) inferiors carrying the same stream of
/// transfer-IDs. The deduplicator sticks with whichever inferior it first
/// selected until that inferior falls silent for `transfer_id_timeout`.
#[tokio::test]
async fn cyclic_fail_over() {
    let redundant = RedundantTransport::new();
    let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 9, remote_node_id: None });
    let payload_metadata = PayloadMetadata { extent_bytes: 8 };

    let input = redundant.get_input_session(specifier, payload_metadata).await.unwrap();
    input.set_transfer_id_timeout(Duration::from_millis(50)).unwrap();

    let a = LoopbackTransport::new(Some(7), params(32));
    let b = LoopbackTransport::new(Some(7), params(32));
    redundant.attach_inferior(a.clone()).await.unwrap();
    redundant.attach_inferior(b.clone()).await.unwrap();

    let out_a = a.get_output_session(specifier, payload_metadata).await.unwrap();
    let out_b = b.get_output_session(specifier, payload_metadata).await.unwrap();

    out_a
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 1, fragmented_payload: vec![fragment(b"hb")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let first = input.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().expect("heartbeat from a");
    assert_eq!(first.transfer_id, 1);

    // Same TID from the non-selected inferior, still within the timeout: rejected.
    out_b
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 1, fragmented_payload: vec![fragment(b"hb")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let duplicate = input.receive(Timestamp::now() + Duration::from_millis(100)).await.unwrap();
    assert!(duplicate.is_none());

    // Inferior `a` goes silent past the timeout; `b` takes over.
    tokio::time::sleep(Duration::from_millis(80)).await;
    out_b
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 2, fragmented_payload: vec![fragment(b"hb")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let failed_over = input.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().expect("failed-over heartbeat");
    assert_eq!(failed_over.transfer_id, 2);
}

/// Scenario 5: two monotonic inferiors. Whichever copy of a transfer-ID
/// arrives first wins regardless of which inferior it came from, so a
/// transfer on the "wrong" inferior is accepted immediately and the later
/// copy is rejected as a duplicate.
#[tokio::test]
async fn monotonic_instant_fail_over() {
    let redundant = RedundantTransport::new();
    let specifier = SessionSpecifier::Message(MessageSessionSpecifier { subject_id: 9, remote_node_id: None });
    let payload_metadata = PayloadMetadata { extent_bytes: 8 };

    let input = redundant.get_input_session(specifier, payload_metadata).await.unwrap();

    let a = LoopbackTransport::new(Some(7), params(1 << 48));
    let b = LoopbackTransport::new(Some(7), params(1 << 48));
    redundant.attach_inferior(a.clone()).await.unwrap();
    redundant.attach_inferior(b.clone()).await.unwrap();

    let out_a = a.get_output_session(specifier, payload_metadata).await.unwrap();
    let out_b = b.get_output_session(specifier, payload_metadata).await.unwrap();

    // `b` delivers transfer 5 first, even though `a` is the "primary" link.
    out_b
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 5, fragmented_payload: vec![fragment(b"x")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let accepted = input.receive(Timestamp::now() + Duration::from_secs(1)).await.unwrap().expect("accepted from b");
    assert_eq!(accepted.transfer_id, 5);

    // The late copy of the same transfer arriving via `a` is a duplicate.
    out_a
        .send(
            Transfer { timestamp: Timestamp::now(), priority: Priority::Nominal, transfer_id: 5, fragmented_payload: vec![fragment(b"x")] },
            Timestamp::now() + Duration::from_secs(1),
        )
        .await
        .unwrap();
    let duplicate = input.receive(Timestamp::now() + Duration::from_millis(100)).await.unwrap();
    assert!(duplicate.is_none());
}

/// Scenario 6: client/server round-trip with a non-default priority, a
/// transfer-ID override and an explicit timeout.
#[tokio::test]
async fn client_server_round_trip_with_priority_and_timeout() {
    let transport = LoopbackTransport::new(Some(1234), params(1 << 48));
    let controller = PresentationController::new(transport);

    let server = controller.get_server::<GetInfoRequest, GetInfoResponse>(430).await.unwrap();
    let handler: Handler<GetInfoRequest, GetInfoResponse> = Arc::new(|_req, _meta| {
        Box::pin(async move { Some(GetInfoResponse { name: "node".into(), software_version: (1, 0) }) })
    });
    tokio::spawn(async move {
        let deadline = Timestamp::now() + Duration::from_secs(2);
        let _ = server.serve_until(deadline, handler).await;
    });

    let mut client = controller.make_client::<GetInfoRequest, GetInfoResponse>(430, 1234).await.unwrap();
    client.set_priority(Priority::Exceptional);
    client.set_response_timeout(Duration::from_secs(1));
    client.override_transfer_id_counter(22);

    let (response, transfer) = client.call(&GetInfoRequest).await.unwrap();
    assert_eq!(response.name, "node");
    assert_eq!(transfer.transfer_id, 22);
    assert_eq!(transfer.source_node_id, Some(1234));
    assert_eq!(transfer.priority, Priority::Exceptional);
}
