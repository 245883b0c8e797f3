//! Hub-side message handling.
//!
//! Every accepted connection gets its own [`HubHandler`]. The handler
//! answers the control messages addressed to the hub (CVID assignment,
//! login, ping) and forwards everything addressed to another instance
//! through the [`Registry`].
//!
//! Forwarding rules:
//!
//! - the sender must be `Established`
//! - the envelope's `from` must be the sender's assigned CVID
//! - an unknown recipient is dropped, or answered with `EndpointClosed`
//!   when `notify_endpoint_closed` is set

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use net::{Connection, MessageHandler};
use protocol::control_message::Body;
use protocol::messages::{CvidRequest, CvidResponse, EndpointClosed, LoginRequest, Outcome};
use protocol::{cvid, ids, ControlMessage, Cvid, Envelope, InstanceType};
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::registry::{Registry, RouteOutcome};

/// State shared by the handlers of every connection.
pub struct HubContext {
    pub registry: Arc<Registry>,
    pub auth: Authenticator,
    pub server_cvid: Cvid,
    pub server_uuid: String,
    pub notify_endpoint_closed: bool,
}

impl HubContext {
    pub fn new(registry: Arc<Registry>, auth: Authenticator, server_uuid: String) -> Self {
        Self {
            registry,
            auth,
            server_cvid: cvid::generate(InstanceType::Server, 0),
            server_uuid,
            notify_endpoint_closed: false,
        }
    }

    /// Sets whether unknown recipients are reported back to the sender.
    pub fn notify_endpoint_closed(mut self, enabled: bool) -> Self {
        self.notify_endpoint_closed = enabled;
        self
    }

    /// A CVID for `instance` not currently in use.
    fn allocate(&self, instance: InstanceType, flavor: u8) -> Cvid {
        loop {
            let candidate = cvid::generate(instance, flavor);
            if candidate != self.server_cvid && !self.registry.contains(candidate) {
                return candidate;
            }
        }
    }
}

#[derive(Debug)]
enum Session {
    /// No CVID requested yet.
    New,
    /// CVID assigned; waiting for a successful login.
    AwaitingLogin { cvid: Cvid },
    /// Registered and routable.
    Registered,
}

/// Message handler for one hub connection.
pub struct HubHandler {
    context: Arc<HubContext>,
    session: Mutex<Session>,
}

impl HubHandler {
    pub fn new(context: Arc<HubContext>) -> Self {
        Self {
            context,
            session: Mutex::new(Session::New),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_control(&self, connection: &Connection, envelope: &Envelope, message: ControlMessage) {
        let reply: Option<ControlMessage> = match message.body {
            Some(Body::CvidRequest(request)) => Some(self.on_cvid_request(connection, request).into()),
            Some(Body::LoginRequest(request)) => Some(self.on_login(connection, &request).into()),
            Some(Body::Ping(ping)) => Some(ControlMessage::new(Body::Pong(ping))),
            Some(other) => {
                debug!(conn = connection.id(), body = ?other, "Ignoring control message");
                None
            }
            None => None,
        };

        if let Some(reply) = reply {
            if let Err(e) = connection.respond(envelope, reply.to_payload()) {
                debug!(conn = connection.id(), error = %e, "Failed to answer control message");
            }
        }
    }

    fn on_cvid_request(&self, connection: &Connection, request: CvidRequest) -> CvidResponse {
        let context = &self.context;
        let refuse = |reason: &str| {
            warn!(conn = connection.id(), reason, "Refusing CVID request");
            CvidResponse {
                cvid: 0,
                server_cvid: context.server_cvid,
                server_uuid: context.server_uuid.clone(),
            }
        };

        let mut session = self.session();
        if !matches!(*session, Session::New) {
            return refuse("CVID already assigned");
        }
        let instance = match request.instance_type() {
            Ok(InstanceType::Server) | Err(_) => return refuse("unsupported instance type"),
            Ok(instance) => instance,
        };

        let assigned = context.allocate(instance, request.flavor as u8);
        connection.set_local_cvid(context.server_cvid);
        connection.set_remote_cvid(assigned);

        if context.auth.requires_login(instance) {
            *session = Session::AwaitingLogin { cvid: assigned };
        } else {
            *session = Session::Registered;
            drop(session);
            self.establish(connection, assigned);
        }

        info!(
            conn = connection.id(),
            cvid = assigned,
            %instance,
            uuid = %request.uuid,
            "CVID assigned"
        );
        CvidResponse {
            cvid: assigned,
            server_cvid: context.server_cvid,
            server_uuid: context.server_uuid.clone(),
        }
    }

    fn on_login(&self, connection: &Connection, request: &LoginRequest) -> Outcome {
        let mut session = self.session();
        let cvid = match *session {
            Session::AwaitingLogin { cvid } => cvid,
            Session::New => return Outcome::failure("request a CVID first"),
            Session::Registered => return Outcome::failure("already logged in"),
        };

        let outcome = self.context.auth.check(request);
        if outcome.result {
            *session = Session::Registered;
            drop(session);
            self.establish(connection, cvid);
        }
        outcome
    }

    fn establish(&self, connection: &Connection, cvid: Cvid) {
        self.context.registry.register(cvid, connection.clone());
        connection.mark_established();
    }

    fn forward(&self, connection: &Connection, envelope: Envelope) {
        if !connection.is_established() {
            warn!(
                conn = connection.id(),
                to = envelope.to,
                "Dropping envelope from connection that has not completed its handshake"
            );
            return;
        }

        let sender = connection.remote_cvid();
        if envelope.from != sender {
            warn!(
                conn = connection.id(),
                claimed = envelope.from,
                actual = sender,
                "Dropping envelope with spoofed sender"
            );
            return;
        }

        let to = envelope.to;
        let id = envelope.id;
        match self.context.registry.route(envelope) {
            RouteOutcome::Delivered => {}
            RouteOutcome::NoRoute => {
                debug!(conn = connection.id(), to, id, "No route to recipient");
                self.endpoint_closed(connection, to, id);
            }
            RouteOutcome::Failed(e) => {
                debug!(conn = connection.id(), to, id, error = %e, "Recipient is closing");
                self.endpoint_closed(connection, to, id);
            }
        }
    }

    fn endpoint_closed(&self, connection: &Connection, recipient: Cvid, id: i32) {
        if !self.context.notify_endpoint_closed {
            return;
        }
        let payload = ControlMessage::from(EndpointClosed::new(recipient)).to_payload();
        // Only a request id can be reused: an odd id would land in the
        // sender's stream consumer as data
        let id = if ids::is_request_id(id) { id } else { ids::NO_ID };
        let notice = Envelope::new(connection.remote_cvid(), payload)
            .with_id(id)
            .with_from(self.context.server_cvid);
        let _ = connection.send_envelope(notice);
    }
}

impl MessageHandler for HubHandler {
    fn on_message(&self, connection: &Connection, envelope: Envelope) {
        let to = envelope.to;
        if to != 0 && to != self.context.server_cvid {
            // Addressed elsewhere before the hub's CVID was set on the connection
            self.forward(connection, envelope);
            return;
        }

        match ControlMessage::from_payload(&envelope.payload) {
            Ok(message) => self.handle_control(connection, &envelope, message),
            Err(e) => {
                debug!(conn = connection.id(), error = %e, "Dropping non-control envelope for the hub");
            }
        }
    }

    fn on_foreign(&self, connection: &Connection, envelope: Envelope) {
        self.forward(connection, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, UserEntry};
    use net::{handshake, ChannelHandler, ConnectionConfig, Error, Timeout};
    use protocol::messages::{hash_password, Ping};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(2);

    fn context(notify: bool) -> Arc<HubContext> {
        let auth = Authenticator::new(&AuthConfig {
            require_login: true,
            users: vec![UserEntry {
                username: "admin".to_string(),
                password_sha256: hash_password("secret"),
            }],
        });
        Arc::new(
            HubContext::new(Registry::new(), auth, "hub-uuid".to_string())
                .notify_endpoint_closed(notify),
        )
    }

    struct Client {
        connection: Connection,
        inbox: UnboundedReceiver<Envelope>,
        hub_side: Connection,
    }

    fn attach(context: &Arc<HubContext>) -> Client {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let hub_side = Connection::spawn(a, ConnectionConfig::default(), HubHandler::new(context.clone()));
        let (handler, inbox) = ChannelHandler::new();
        let connection = Connection::spawn(b, ConnectionConfig::default(), handler);
        Client {
            connection,
            inbox,
            hub_side,
        }
    }

    async fn agent(context: &Arc<HubContext>) -> Client {
        let client = attach(context);
        handshake::request_cvid(&client.connection, InstanceType::Agent, 0, "agent", WAIT)
            .await
            .unwrap();
        client.connection.mark_established();
        client
    }

    async fn viewer(context: &Arc<HubContext>) -> Client {
        let client = attach(context);
        handshake::request_cvid(&client.connection, InstanceType::Viewer, 0, "viewer", WAIT)
            .await
            .unwrap();
        handshake::login(&client.connection, "admin", "secret", WAIT)
            .await
            .unwrap();
        client.connection.mark_established();
        client
    }

    #[tokio::test]
    async fn test_agent_registered_without_login() {
        let context = context(false);
        let client = agent(&context).await;

        let cvid = client.connection.local_cvid();
        assert_eq!(client.connection.remote_cvid(), context.server_cvid);
        assert!(context.registry.contains(cvid));
        assert!(client.hub_side.is_established());
        assert_eq!(client.hub_side.remote_cvid(), cvid);
    }

    #[tokio::test]
    async fn test_viewer_registered_only_after_login() {
        let context = context(false);
        let client = attach(&context);
        handshake::request_cvid(&client.connection, InstanceType::Viewer, 0, "viewer", WAIT)
            .await
            .unwrap();
        let cvid = client.connection.local_cvid();
        assert!(!context.registry.contains(cvid));
        assert!(!client.hub_side.is_established());

        let err = handshake::login(&client.connection, "admin", "wrong", WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LoginFailed(_)));
        assert!(!context.registry.contains(cvid));

        handshake::login(&client.connection, "admin", "secret", WAIT)
            .await
            .unwrap();
        assert!(context.registry.contains(cvid));
        assert!(client.hub_side.is_established());
    }

    #[tokio::test]
    async fn test_second_cvid_request_refused() {
        let context = context(false);
        let client = agent(&context).await;

        let err = handshake::request_cvid(&client.connection, InstanceType::Agent, 0, "again", WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_server_instance_refused() {
        let context = context(false);
        let client = attach(&context);

        let err = handshake::request_cvid(&client.connection, InstanceType::Server, 0, "rogue", WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert!(context.registry.is_empty());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let context = context(false);
        let client = agent(&context).await;

        let ping = ControlMessage::new(Body::Ping(Ping { timestamp: 42 }));
        let response = client
            .connection
            .request(0, ping.to_payload(), Timeout::After(WAIT))
            .await
            .unwrap();

        let reply = ControlMessage::from_payload(&response.payload).unwrap();
        assert_eq!(reply.body, Some(Body::Pong(Ping { timestamp: 42 })));
    }

    #[tokio::test]
    async fn test_request_routed_between_instances() {
        let context = context(false);
        let mut agent = agent(&context).await;
        let viewer = viewer(&context).await;
        let agent_cvid = agent.connection.local_cvid();

        let pending = viewer
            .connection
            .request(agent_cvid, b"uptime".to_vec(), Timeout::After(WAIT));

        let request = tokio::time::timeout(WAIT, agent.inbox.recv()).await.unwrap().unwrap();
        assert_eq!(request.from, viewer.connection.local_cvid());
        assert_eq!(&request.payload[..], b"uptime");
        agent.connection.respond(&request, b"42 days".to_vec()).unwrap();

        let response = pending.await.unwrap();
        assert_eq!(response.from, agent_cvid);
        assert_eq!(&response.payload[..], b"42 days");
    }

    #[tokio::test]
    async fn test_spoofed_sender_dropped() {
        let context = context(false);
        let mut target = agent(&context).await;
        let spoofer = agent(&context).await;
        let target_cvid = target.connection.local_cvid();

        spoofer
            .connection
            .send_envelope(Envelope::new(target_cvid, b"forged".to_vec()).with_from(0x1234_5673))
            .unwrap();
        spoofer.connection.send(target_cvid, b"honest".to_vec()).unwrap();

        let received = tokio::time::timeout(WAIT, target.inbox.recv()).await.unwrap().unwrap();
        assert_eq!(&received.payload[..], b"honest");
        assert_eq!(received.from, spoofer.connection.local_cvid());
    }

    #[tokio::test]
    async fn test_unestablished_sender_cannot_route() {
        let context = context(false);
        let mut target = agent(&context).await;
        let target_cvid = target.connection.local_cvid();

        let anonymous = attach(&context);
        anonymous.connection.send(target_cvid, b"sneaky".to_vec()).unwrap();

        let sender = agent(&context).await;
        sender.connection.send(target_cvid, b"legit".to_vec()).unwrap();

        let received = tokio::time::timeout(WAIT, target.inbox.recv()).await.unwrap().unwrap();
        assert_eq!(&received.payload[..], b"legit");
    }

    #[tokio::test]
    async fn test_unknown_recipient_dropped_by_default() {
        let context = context(false);
        let client = agent(&context).await;
        let missing = cvid::generate(InstanceType::Agent, 0);

        let err = client
            .connection
            .request(missing, b"hello".to_vec(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(client.connection.is_established());
    }

    #[tokio::test]
    async fn test_unknown_recipient_notified_when_enabled() {
        let context = context(true);
        let client = agent(&context).await;
        let missing = cvid::generate(InstanceType::Agent, 0);

        let response = client
            .connection
            .request(missing, b"hello".to_vec(), Timeout::After(WAIT))
            .await
            .unwrap();

        assert_eq!(response.from, context.server_cvid);
        let notice = ControlMessage::from_payload(&response.payload).unwrap();
        assert_eq!(
            notice.body,
            Some(Body::EndpointClosed(EndpointClosed { cvid: missing }))
        );
    }

    #[tokio::test]
    async fn test_stream_to_unknown_recipient_notified_out_of_band() {
        let context = context(true);
        let mut client = agent(&context).await;
        let missing = cvid::generate(InstanceType::Agent, 0);

        let (stream, mut events) = client.connection.open_stream_to(missing).unwrap();
        stream.send(b"frame".to_vec()).unwrap();

        let notice = tokio::time::timeout(WAIT, client.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.id, 0);
        assert_eq!(notice.from, context.server_cvid);
        assert_eq!(
            ControlMessage::from_payload(&notice.payload).unwrap().body,
            Some(Body::EndpointClosed(EndpointClosed { cvid: missing }))
        );

        // Nothing leaked into the stream
        assert!(events.try_recv().is_err());
        assert_eq!(client.connection.open_streams(), 1);
    }

    #[tokio::test]
    async fn test_registry_cleaned_when_client_leaves() {
        let context = context(false);
        let client = agent(&context).await;
        let cvid = client.connection.local_cvid();
        let mut events = context.registry.subscribe();

        client.connection.disconnect();
        client.hub_side.closed().await;

        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, crate::registry::RegistryEvent::Unregistered { cvid });
        assert!(!context.registry.contains(cvid));
    }
}
