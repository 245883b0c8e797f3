//! End-to-end integration tests for the Tether hub.
//!
//! These tests run a real hub on an ephemeral port and connect agents and
//! viewers over TCP:
//! - Handshake and login
//! - Request/response and stream routing through the hub
//! - Unknown recipients
//! - Registry cleanup and shutdown
//! - Reconnecting after a hub restart
//! - TLS certificate policy

use std::sync::Arc;
use std::time::Duration;

use net::{
    client, handshake, CertPolicy, ChannelConsumer, ChannelHandler, CloseReason, ConnectOptions,
    Connection, ConnectionConfig, Error, MessageHandler, RetryWait, StreamEvent, StreamReceiver,
};
use protocol::control_message::Body;
use protocol::messages::{hash_password, EndpointClosed};
use protocol::{ControlMessage, Envelope, IdKind, InstanceType};
use server::config::{Config, UserEntry};
use server::hub::{Hub, HubState};
use server::registry::RegistryEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

/// Create a test configuration bound to an ephemeral loopback port.
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.server.listen_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.auth.users = vec![UserEntry {
        username: "admin".to_string(),
        password_sha256: hash_password("secret"),
    }];
    config
}

async fn start_hub(config: Config) -> (Hub, u16) {
    let mut hub = Hub::new(config);
    hub.start().await.unwrap();
    let port = hub.local_addr().unwrap().port();
    (hub, port)
}

/// Agent that echoes requests and attaches streams on demand.
///
/// A request whose payload is `attach <id>` registers stream `<id>` and
/// hands its receiver to the test.
struct EchoAgent {
    streams: UnboundedSender<StreamReceiver>,
}

impl MessageHandler for EchoAgent {
    fn on_message(&self, connection: &Connection, envelope: Envelope) {
        if envelope.kind() != IdKind::Request {
            return;
        }
        if let Some(rest) = envelope.payload.strip_prefix(b"attach ") {
            let id: i32 = std::str::from_utf8(rest).unwrap().parse().unwrap();
            let (consumer, rx) = ChannelConsumer::new();
            connection
                .attach_stream(id, envelope.from, Arc::new(consumer))
                .unwrap();
            self.streams.send(rx).unwrap();
            connection.respond(&envelope, b"attached".to_vec()).unwrap();
        } else {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&envelope.payload);
            connection.respond(&envelope, reply).unwrap();
        }
    }
}

async fn connect_agent(port: u16) -> (Connection, UnboundedReceiver<StreamReceiver>) {
    let (streams, rx) = mpsc::unbounded_channel();
    let options = ConnectOptions::new("127.0.0.1", port, InstanceType::Agent).flavor(1);
    let connection = client::connect(&options, EchoAgent { streams }).await.unwrap();
    (connection, rx)
}

async fn connect_viewer(port: u16) -> (Connection, UnboundedReceiver<Envelope>) {
    let (handler, inbox) = ChannelHandler::new();
    let options = ConnectOptions::new("127.0.0.1", port, InstanceType::Viewer)
        .credentials("admin", "secret");
    let connection = client::connect(&options, handler).await.unwrap();
    (connection, inbox)
}

// =============================================================================
// Handshake Tests
// =============================================================================

#[tokio::test]
async fn test_agent_and_viewer_register() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let mut events = hub.registry().subscribe();

    let (agent, _streams) = connect_agent(port).await;
    let (viewer, _inbox) = connect_viewer(port).await;

    assert_eq!(hub.registry().len(), 2);
    assert!(hub.registry().contains(agent.local_cvid()));
    assert!(hub.registry().contains(viewer.local_cvid()));
    assert_ne!(agent.local_cvid(), viewer.local_cvid());
    assert_eq!(agent.remote_cvid(), hub.server_cvid());
    assert_eq!(protocol::cvid::extract_flavor(agent.local_cvid()), 1);

    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Registered {
            cvid: agent.local_cvid(),
            instance: Some(InstanceType::Agent)
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        RegistryEvent::Registered {
            cvid: viewer.local_cvid(),
            instance: Some(InstanceType::Viewer)
        }
    );

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let (mut hub, port) = start_hub(create_test_config()).await;

    let options = ConnectOptions::new("127.0.0.1", port, InstanceType::Viewer)
        .credentials("admin", "guess");
    let result = client::connect(&options, |_: &Connection, _: Envelope| {}).await;

    match result {
        Err(Error::LoginFailed(comment)) => {
            assert_eq!(comment, "invalid username or password");
        }
        other => panic!("Expected LoginFailed, got {:?}", other.map(|c| c.id())),
    }
    assert!(hub.registry().is_empty());

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_viewer_without_login_when_not_required() {
    let mut config = create_test_config();
    config.auth.require_login = false;
    let (mut hub, port) = start_hub(config).await;

    // Handshake by hand: the high-level client always logs viewers in
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let viewer = Connection::spawn(
        stream,
        ConnectionConfig::default(),
        |_: &Connection, _: Envelope| {},
    );
    let response = handshake::request_cvid(&viewer, InstanceType::Viewer, 0, "viewer", WAIT)
        .await
        .unwrap();

    assert!(hub.registry().contains(response.cvid));
    assert_eq!(response.server_cvid, hub.server_cvid());

    hub.stop().await.unwrap();
}

// =============================================================================
// Routing Tests
// =============================================================================

#[tokio::test]
async fn test_request_response_through_hub() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let (agent, _streams) = connect_agent(port).await;
    let (viewer, _inbox) = connect_viewer(port).await;

    let response = viewer
        .request(agent.local_cvid(), b"ls".to_vec(), WAIT)
        .await
        .unwrap();

    assert_eq!(&response.payload[..], b"echo:ls");
    assert_eq!(response.from, agent.local_cvid());
    assert_eq!(response.to, viewer.local_cvid());
    assert_eq!(viewer.pending_requests(), 0);

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_correlated() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let (agent, _streams) = connect_agent(port).await;
    let (viewer, _inbox) = connect_viewer(port).await;
    let target = agent.local_cvid();

    let calls: Vec<_> = (0..20)
        .map(|i| viewer.request(target, format!("call-{}", i).into_bytes(), WAIT))
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let response = call.await.unwrap();
        assert_eq!(response.payload, format!("echo:call-{}", i).into_bytes());
    }

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_message_delivered_with_sender() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let (agent, _streams) = connect_agent(port).await;
    let (viewer, mut inbox) = connect_viewer(port).await;

    agent
        .send(viewer.local_cvid(), b"status: ready".to_vec())
        .unwrap();

    let envelope = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.from, agent.local_cvid());
    assert_eq!(envelope.id, 0);
    assert_eq!(&envelope.payload[..], b"status: ready");

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_stream_routed_in_order() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let (agent, mut agent_streams) = connect_agent(port).await;
    let (viewer, _inbox) = connect_viewer(port).await;
    let target = agent.local_cvid();

    let (stream, _viewer_rx) = viewer.open_stream_to(target).unwrap();
    assert_eq!(stream.id() % 2, 1);

    // Tell the agent which id to expect before sending on it
    let ack = viewer
        .request(target, format!("attach {}", stream.id()).into_bytes(), WAIT)
        .await
        .unwrap();
    assert_eq!(&ack.payload[..], b"attached");

    let mut agent_rx = tokio::time::timeout(WAIT, agent_streams.recv())
        .await
        .unwrap()
        .unwrap();

    for chunk in [b"1", b"2", b"3"] {
        stream.send(chunk.to_vec()).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        match tokio::time::timeout(WAIT, agent_rx.recv()).await.unwrap().unwrap() {
            StreamEvent::Message(envelope) => {
                assert_eq!(envelope.id, stream.id());
                assert_eq!(envelope.from, viewer.local_cvid());
                received.push(envelope.payload.to_vec());
            }
            StreamEvent::Closed(reason) => panic!("stream closed early: {:?}", reason),
        }
    }
    assert_eq!(received, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    hub.stop().await.unwrap();
}

// =============================================================================
// Unknown Recipient Tests
// =============================================================================

#[tokio::test]
async fn test_unknown_recipient_times_out_by_default() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let (viewer, _inbox) = connect_viewer(port).await;
    let missing = protocol::cvid::generate(InstanceType::Agent, 0);

    let err = viewer
        .request(missing, b"hello?".to_vec(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    // The connection survives the drop
    assert!(viewer.is_established());
    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_recipient_notified_when_enabled() {
    let mut config = create_test_config();
    config.network.notify_endpoint_closed = true;
    let (mut hub, port) = start_hub(config).await;
    let (viewer, _inbox) = connect_viewer(port).await;
    let missing = protocol::cvid::generate(InstanceType::Agent, 0);

    let response = viewer
        .request(missing, b"hello?".to_vec(), WAIT)
        .await
        .unwrap();
    let message = ControlMessage::from_payload(&response.payload).unwrap();
    assert_eq!(
        message.body,
        Some(Body::EndpointClosed(EndpointClosed { cvid: missing }))
    );
    assert_eq!(response.from, hub.server_cvid());

    hub.stop().await.unwrap();
}

// =============================================================================
// Cleanup Tests
// =============================================================================

#[tokio::test]
async fn test_registry_cleaned_when_agent_leaves() {
    let mut config = create_test_config();
    config.network.notify_endpoint_closed = true;
    let (mut hub, port) = start_hub(config).await;
    let (agent, _streams) = connect_agent(port).await;
    let (viewer, _inbox) = connect_viewer(port).await;
    let agent_cvid = agent.local_cvid();
    let mut events = hub.registry().subscribe();

    agent.disconnect();
    assert_eq!(agent.closed().await, CloseReason::LocalDisconnect);

    let event = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                RegistryEvent::Unregistered { cvid } if cvid == agent_cvid => break cvid,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, agent_cvid);
    assert!(!hub.registry().contains(agent_cvid));

    // Further traffic for the departed agent gets the no-route notice
    let response = viewer
        .request(agent_cvid, b"still there?".to_vec(), WAIT)
        .await
        .unwrap();
    let message = ControlMessage::from_payload(&response.payload).unwrap();
    assert!(matches!(message.body, Some(Body::EndpointClosed(_))));

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn test_hub_stop_disconnects_clients() {
    let (mut hub, port) = start_hub(create_test_config()).await;
    let (agent, _streams) = connect_agent(port).await;
    let (viewer, _inbox) = connect_viewer(port).await;

    hub.stop().await.unwrap();
    assert_eq!(hub.state().await, HubState::Stopped);

    for connection in [&agent, &viewer] {
        let reason = tokio::time::timeout(WAIT, connection.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::PeerClosed);
    }
}

// =============================================================================
// Reconnect Tests
// =============================================================================

#[tokio::test]
async fn test_connect_loop_reconnects_after_hub_restart() {
    let (mut first_hub, port) = start_hub(create_test_config()).await;

    let options = ConnectOptions::new("127.0.0.1", port, InstanceType::Agent).uuid("restart-agent");
    let retry = RetryWait::Constant(Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let (tx, mut connections) = mpsc::unbounded_channel();

    let looping = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client::connect_loop(
                &options,
                || |_: &Connection, _: Envelope| {},
                &retry,
                cancel,
                tx,
            )
            .await
        })
    };

    let first = tokio::time::timeout(WAIT, connections.recv()).await.unwrap().unwrap();
    assert!(first.is_established());
    assert!(first_hub.registry().contains(first.local_cvid()));

    first_hub.stop().await.unwrap();
    let reason = tokio::time::timeout(WAIT, first.closed()).await.unwrap();
    assert_eq!(reason, CloseReason::PeerClosed);

    // Same port, fresh hub
    let mut config = create_test_config();
    config.server.port = port;
    let (mut second_hub, second_port) = start_hub(config).await;
    assert_eq!(second_port, port);

    let second = tokio::time::timeout(WAIT, connections.recv()).await.unwrap().unwrap();
    assert!(second.is_established());
    assert_ne!(second.id(), first.id());
    assert!(second_hub.registry().contains(second.local_cvid()));

    cancel.cancel();
    let result = tokio::time::timeout(WAIT, looping).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(second.closed().await, CloseReason::LocalDisconnect);

    second_hub.stop().await.unwrap();
}

// =============================================================================
// TLS Tests
// =============================================================================

/// Write a self-signed certificate and key for the loopback names.
fn write_self_signed(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

#[tokio::test]
async fn test_tls_untrusted_certificate_needs_insecure_policy() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_self_signed(dir.path());

    let mut config = create_test_config();
    config.tls.enabled = true;
    config.tls.cert_path = Some(cert_path);
    config.tls.key_path = Some(key_path);
    let (mut hub, port) = start_hub(config).await;

    let verified = ConnectOptions::new("127.0.0.1", port, InstanceType::Agent).tls(CertPolicy::Verify);
    match client::connect(&verified, |_: &Connection, _: Envelope| {}).await {
        Err(Error::Certificate { reason }) => assert!(!reason.is_empty()),
        other => panic!("Expected Certificate error, got {:?}", other.map(|c| c.id())),
    }
    assert!(hub.registry().is_empty());

    let insecure =
        ConnectOptions::new("127.0.0.1", port, InstanceType::Agent).tls(CertPolicy::Insecure);
    let agent = client::connect(&insecure, |_: &Connection, _: Envelope| {})
        .await
        .unwrap();
    assert!(agent.is_established());
    assert_eq!(agent.remote_cvid(), hub.server_cvid());
    assert!(hub.registry().contains(agent.local_cvid()));

    // Login runs over the encrypted link too
    let (viewer, _inbox) = {
        let (handler, inbox) = ChannelHandler::new();
        let options = ConnectOptions::new("127.0.0.1", port, InstanceType::Viewer)
            .tls(CertPolicy::Insecure)
            .credentials("admin", "secret");
        (client::connect(&options, handler).await.unwrap(), inbox)
    };
    assert!(viewer.is_established());

    hub.stop().await.unwrap();
}
