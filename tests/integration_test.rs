//! End-to-end tests for the write-then-notify push protocol over the
//! emulated fabric.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rdma_push::client::{run_client, ClientConfig};
use rdma_push::completion::WrTag;
use rdma_push::connection::{ConnectParams, Connection};
use rdma_push::endpoint::Endpoint;
use rdma_push::error::RdmaError;
use rdma_push::event::CmEventKind;
use rdma_push::handshake::{self, HandshakeConfig};
use rdma_push::memory::{AccessRights, MemoryRegion, ProtectionDomain};
use rdma_push::server::{serve_on, ServerConfig};
use rdma_push::{wire, write_notify};

/// Find an available port for testing
fn find_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rdma_push=debug")
        .try_init();
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn single_payload_round_trip() {
    init_tracing();

    let endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server_cfg = ServerConfig {
        buf_elements: 512,
        ..Default::default()
    };
    let server = tokio::spawn(async move { serve_on(endpoint, &server_cfg).await });

    let elements: Vec<u32> = (1..=10).collect();
    let client_cfg = ClientConfig {
        server_addr: "127.0.0.1".to_string(),
        port,
        ..Default::default()
    };
    let acked = run_client(&client_cfg, &elements).await.unwrap();
    assert_eq!(acked, 10);

    let payloads = server.await.unwrap().unwrap();
    assert_eq!(payloads, vec![elements]);
}

#[tokio::test]
async fn connect_without_listener_times_out() {
    init_tracing();

    // Bind-then-drop leaves the port free but unserved.
    let port = find_available_port();
    let pd = ProtectionDomain::new();
    let cfg = HandshakeConfig {
        resolve_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_millis(500),
    };

    let start = Instant::now();
    let err = handshake::connect_active("127.0.0.1", port, pd, &cfg)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RdmaError::HandshakeTimeout {
            waiting_for: CmEventKind::Established
        }
    ));
    // Refusal or timeout, either way bounded rather than hanging.
    assert!(start.elapsed() < Duration::from_secs(2));
}

/// One client-side cycle against an already-established connection:
/// post the reply receive, push the payload, read back the acked count.
async fn push_cycle(
    conn: &mut Connection,
    pd: &ProtectionDomain,
    payload_mr: &MemoryRegion,
    elements: &[u32],
    remote: &wire::RemoteBufferDescriptor,
) -> u32 {
    let packed = wire::pack_payload(elements, payload_mr.len()).unwrap();
    payload_mr.write_at(0, &packed).unwrap();

    let reply_mr = pd.register(vec![0u8; 4], AccessRights::LocalWrite).unwrap();
    conn.qp()
        .post_recv(WrTag::ExpectReceive.wr_id(), &reply_mr)
        .unwrap();

    write_notify::push_and_notify(conn, payload_mr, packed.len(), remote, TIMEOUT)
        .await
        .unwrap();

    let wc = conn.cq_mut().wait_one(TIMEOUT).await.unwrap();
    assert_eq!(WrTag::from_wr_id(wc.wr_id), Some(WrTag::ExpectReceive));
    conn.cq_mut().ack_events(1);

    let reply = reply_mr.snapshot();
    reply_mr.deregister().unwrap();
    u32::from_be_bytes(reply[..4].try_into().unwrap())
}

#[tokio::test]
async fn two_sequential_cycles_on_one_connection() {
    init_tracing();

    let endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server_cfg = ServerConfig {
        buf_elements: 64,
        ..Default::default()
    };
    let server = tokio::spawn(async move { serve_on(endpoint, &server_cfg).await });

    let pd = ProtectionDomain::new();
    let (mut conn, remote) = handshake::connect_active(
        "127.0.0.1",
        port,
        pd.clone(),
        &HandshakeConfig::default(),
    )
    .await
    .unwrap();

    let payload_mr = pd
        .register(vec![0u8; 64 * 4], AccessRights::LocalWrite)
        .unwrap();

    let acked = push_cycle(&mut conn, &pd, &payload_mr, &[1, 2, 3], &remote).await;
    assert_eq!(acked, 3);
    let acked = push_cycle(&mut conn, &pd, &payload_mr, &[9, 8, 7, 6], &remote).await;
    assert_eq!(acked, 4);

    payload_mr.deregister().unwrap();
    conn.disconnect().unwrap();
    conn.wait_disconnected(TIMEOUT).await.unwrap();
    conn.close().unwrap();

    // Each cycle arrives intact; the second fully replaces the first.
    let payloads = server.await.unwrap().unwrap();
    assert_eq!(payloads, vec![vec![1, 2, 3], vec![9, 8, 7, 6]]);
}

#[tokio::test]
async fn rapid_cycles_never_outrun_the_posted_receive() {
    init_tracing();

    let endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server_cfg = ServerConfig {
        buf_elements: 64,
        ..Default::default()
    };
    let server = tokio::spawn(async move { serve_on(endpoint, &server_cfg).await });

    let pd = ProtectionDomain::new();
    let (mut conn, remote) = handshake::connect_active(
        "127.0.0.1",
        port,
        pd.clone(),
        &HandshakeConfig::default(),
    )
    .await
    .unwrap();

    let payload_mr = pd
        .register(vec![0u8; 64 * 4], AccessRights::LocalWrite)
        .unwrap();

    // Each cycle starts the instant the previous reply lands, so the reply
    // must guarantee the server's next receive is already posted.
    for i in 0..16u32 {
        let elements = vec![i, i + 1, i + 2];
        let acked = push_cycle(&mut conn, &pd, &payload_mr, &elements, &remote).await;
        assert_eq!(acked, 3);
    }

    payload_mr.deregister().unwrap();
    conn.disconnect().unwrap();
    conn.wait_disconnected(TIMEOUT).await.unwrap();
    conn.close().unwrap();

    let payloads = server.await.unwrap().unwrap();
    assert_eq!(payloads.len(), 16);
    assert_eq!(payloads[0], vec![0, 1, 2]);
    assert_eq!(payloads[15], vec![15, 16, 17]);
}

#[tokio::test]
async fn deregister_during_outstanding_cycle_is_busy() {
    init_tracing();

    let endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let pd = ProtectionDomain::new();
        let data_mr = pd
            .register(vec![0u8; 64], AccessRights::RemoteReadWrite)
            .unwrap();

        let mut posted = None;
        let mut conn = handshake::accept_passive(
            endpoint,
            &data_mr,
            pd.clone(),
            &HandshakeConfig::default(),
            {
                let posted = &mut posted;
                |conn| {
                    *posted = Some(write_notify::post_notify_receive(conn, &data_mr)?);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();
        let posted = posted.unwrap();

        // The posted cycle pins the region; deregistration must refuse
        // rather than yank the write target out from under the peer.
        assert_eq!(data_mr.in_flight(), 1);
        let (data_mr, err) = data_mr.deregister().unwrap_err();
        assert!(matches!(err, RdmaError::RegionBusy { in_flight: 1, .. }));

        // The refused deregistration left the region live, so the cycle
        // still completes.
        write_notify::await_notification(&mut conn, posted, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(pd.region_count(), 1);

        // With the cycle finished the retry goes through.
        data_mr.deregister().unwrap();
        assert_eq!(pd.region_count(), 0);

        conn.wait_disconnected(TIMEOUT).await.unwrap();
        conn.close().unwrap();
    });

    let pd = ProtectionDomain::new();
    let (mut conn, remote) = handshake::connect_active(
        "127.0.0.1",
        port,
        pd.clone(),
        &HandshakeConfig::default(),
    )
    .await
    .unwrap();

    let packed = wire::pack_payload(&[42, 43], 64).unwrap();
    let mut buffer = vec![0u8; 64];
    buffer[..packed.len()].copy_from_slice(&packed);
    let payload_mr = pd.register(buffer, AccessRights::LocalWrite).unwrap();

    write_notify::push_and_notify(&mut conn, &payload_mr, packed.len(), &remote, TIMEOUT)
        .await
        .unwrap();

    payload_mr.deregister().unwrap();
    conn.disconnect().unwrap();
    conn.wait_disconnected(TIMEOUT).await.unwrap();
    conn.close().unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn rejected_request_surfaces_to_the_active_side() {
    init_tracing();

    let mut endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let guard = endpoint
            .wait_for_event(CmEventKind::ConnectRequest, TIMEOUT)
            .await
            .unwrap();
        let pending = Endpoint::take_connect_request(guard).unwrap();
        let mut conn = Connection::new_passive(endpoint, pending, ProtectionDomain::new());
        conn.reject().unwrap();
        // Hold the fabric open until the peer has seen the rejection.
        conn.wait_disconnected(TIMEOUT).await.unwrap();
        conn.close().unwrap();
    });

    let err = handshake::connect_active(
        "127.0.0.1",
        port,
        ProtectionDomain::new(),
        &HandshakeConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RdmaError::UnexpectedEvent {
            expected: CmEventKind::Established,
            actual: CmEventKind::Rejected
        }
    ));

    server.await.unwrap();
}

#[tokio::test]
async fn teardown_completes_every_signaled_request() {
    init_tracing();

    let endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let pd = ProtectionDomain::new();
        let data_mr = pd
            .register(vec![0u8; 64], AccessRights::RemoteReadWrite)
            .unwrap();
        let conn = handshake::accept_passive(
            endpoint,
            &data_mr,
            pd,
            &HandshakeConfig::default(),
            |_| Ok(()),
        )
        .await
        .unwrap();
        // Abrupt teardown: the socket goes away without a disconnect frame.
        drop(conn);
    });

    let pd = ProtectionDomain::new();
    let (mut conn, _remote) = handshake::connect_active(
        "127.0.0.1",
        port,
        pd.clone(),
        &HandshakeConfig::default(),
    )
    .await
    .unwrap();
    server.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Every signaled request gets exactly one completion, success or
    // flushed, even when the fabric dies with requests still queued.
    let send_mr = pd.register(vec![0u8; 4], AccessRights::LocalWrite).unwrap();
    for _ in 0..4 {
        conn.qp()
            .post_send(WrTag::ExpectSendCompletion.wr_id(), &send_mr, 4, true)
            .unwrap();
    }
    for _ in 0..4 {
        match conn.cq_mut().wait_one(Duration::from_secs(1)).await {
            Ok(wc) => assert_eq!(wc.status, rdma_push::completion::WcStatus::Success),
            Err(RdmaError::Completion { status, .. }) => {
                assert_eq!(status, rdma_push::completion::WcStatus::WorkRequestFlushed);
            }
            Err(other) => panic!("completion lost: {other}"),
        }
    }
    conn.cq_mut().ack_events(4);
}

#[tokio::test]
async fn oversized_connect_payload_is_refused() {
    init_tracing();

    // A live listener so the dial succeeds; validation fails before any
    // frame is sent.
    let _listener = Endpoint::listen(0, 1).await.unwrap();
    let port = _listener.local_addr().unwrap().port();

    let mut endpoint = Endpoint::new();
    endpoint.resolve("127.0.0.1", port, TIMEOUT).await.unwrap();
    endpoint
        .wait_for_event(CmEventKind::AddrResolved, TIMEOUT)
        .await
        .unwrap()
        .ack();
    endpoint.resolve_route(TIMEOUT).await.unwrap();
    endpoint
        .wait_for_event(CmEventKind::RouteResolved, TIMEOUT)
        .await
        .unwrap()
        .ack();

    let mut conn = Connection::new_active(endpoint, ProtectionDomain::new(), TIMEOUT)
        .await
        .unwrap();
    let err = conn
        .connect(&ConnectParams {
            private_data: Some(Bytes::from(vec![0u8; 197])),
            ..Default::default()
        })
        .unwrap_err();
    match err {
        RdmaError::PayloadTooLarge { len, max } => {
            assert_eq!(len, 197);
            assert_eq!(max, 196);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn descriptor_survives_the_private_payload() {
    init_tracing();

    let endpoint = Endpoint::listen(0, 1).await.unwrap();
    let port = endpoint.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let pd = ProtectionDomain::new();
        let data_mr = pd
            .register(vec![0u8; 128], AccessRights::RemoteReadWrite)
            .unwrap();
        let descriptor = data_mr.descriptor().unwrap();

        let mut conn = handshake::accept_passive(
            endpoint,
            &data_mr,
            pd,
            &HandshakeConfig::default(),
            |_| Ok(()),
        )
        .await
        .unwrap();
        conn.wait_disconnected(TIMEOUT).await.unwrap();
        conn.close().unwrap();
        data_mr.deregister().unwrap();
        descriptor
    });

    let pd = ProtectionDomain::new();
    let (mut conn, remote) = handshake::connect_active(
        "127.0.0.1",
        port,
        pd,
        &HandshakeConfig::default(),
    )
    .await
    .unwrap();
    conn.disconnect().unwrap();
    conn.wait_disconnected(TIMEOUT).await.unwrap();
    conn.close().unwrap();

    // The peer sees exactly the address and key the owner registered.
    let sent = server.await.unwrap();
    assert_eq!(remote, sent);
}
