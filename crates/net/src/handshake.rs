//! Client side of the connection handshake.
//!
//! After the socket is up, an instance asks the hub for a CVID and, if its
//! role requires it, logs in. Both exchanges are ordinary requests addressed
//! to the directly connected peer (`to = 0`) carrying a [`ControlMessage`].

use std::time::Duration;

use protocol::control_message::Body;
use protocol::cvid;
use protocol::messages::{CvidRequest, CvidResponse, LoginRequest};
use protocol::{ControlMessage, Envelope, InstanceType};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Ask the hub for a CVID and record it on the connection.
///
/// On success the assigned CVID becomes the connection's local CVID and the
/// hub's CVID its remote CVID.
pub async fn request_cvid(
    connection: &Connection,
    instance: InstanceType,
    flavor: u8,
    uuid: &str,
    timeout: Duration,
) -> Result<CvidResponse> {
    let request = ControlMessage::from(CvidRequest::new(instance, flavor, uuid));
    let reply = exchange(connection, request, timeout).await?;

    let response = match reply.body {
        Some(Body::CvidResponse(response)) => response,
        _ => return Err(Error::Handshake("expected a CVID response".to_string())),
    };

    let assigned = cvid::validate(response.cvid)
        .map_err(|_| Error::Handshake(format!("hub refused CVID request ({})", response.cvid)))?;

    connection.set_local_cvid(assigned);
    connection.set_remote_cvid(response.server_cvid);
    info!(
        conn = connection.id(),
        cvid = assigned,
        server_uuid = %response.server_uuid,
        "CVID assigned"
    );
    Ok(response)
}

/// Present credentials to the hub.
///
/// The password is sent as its SHA-256 hex digest, never in plaintext.
pub async fn login(
    connection: &Connection,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<()> {
    let request = ControlMessage::from(LoginRequest::new(username, password));
    let reply = exchange(connection, request, timeout).await?;

    match reply.body {
        Some(Body::Outcome(outcome)) if outcome.result => {
            debug!(conn = connection.id(), username, "Login accepted");
            Ok(())
        }
        Some(Body::Outcome(outcome)) => {
            warn!(conn = connection.id(), username, comment = %outcome.comment, "Login rejected");
            Err(Error::LoginFailed(outcome.comment))
        }
        _ => Err(Error::Handshake("expected a login outcome".to_string())),
    }
}

async fn exchange(
    connection: &Connection,
    message: ControlMessage,
    timeout: Duration,
) -> Result<ControlMessage> {
    let response: Envelope = connection
        .request(0, message.to_payload(), timeout)
        .await?;
    Ok(ControlMessage::from_payload(&response.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, MessageHandler};
    use protocol::messages::Outcome;

    const WAIT: Duration = Duration::from_secs(2);

    /// Minimal hub: assigns CVIDs and accepts one user.
    struct FakeHub {
        server_cvid: u32,
        refuse: bool,
    }

    impl MessageHandler for FakeHub {
        fn on_message(&self, connection: &Connection, envelope: Envelope) {
            let Ok(message) = ControlMessage::from_payload(&envelope.payload) else {
                return;
            };
            let reply: ControlMessage = match message.body {
                Some(Body::CvidRequest(request)) => {
                    let instance = request.instance_type().unwrap();
                    CvidResponse {
                        cvid: if self.refuse {
                            0
                        } else {
                            cvid::generate(instance, request.flavor as u8)
                        },
                        server_cvid: self.server_cvid,
                        server_uuid: "hub-uuid".to_string(),
                    }
                    .into()
                }
                Some(Body::LoginRequest(login)) => {
                    if login.username == "admin"
                        && login.password == protocol::messages::hash_password("secret")
                    {
                        Outcome::success().into()
                    } else {
                        Outcome::failure("invalid credentials").into()
                    }
                }
                _ => return,
            };
            let _ = connection.respond(&envelope, reply.to_payload());
        }
    }

    fn pair(refuse: bool) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = Connection::spawn(a, ConnectionConfig::default(), |_: &Connection, _: Envelope| {});
        let hub = Connection::spawn(
            b,
            ConnectionConfig::default(),
            FakeHub {
                server_cvid: cvid::generate(InstanceType::Server, 0),
                refuse,
            },
        );
        (client, hub)
    }

    #[tokio::test]
    async fn test_request_cvid_records_ids() {
        let (client, _hub) = pair(false);

        let response = request_cvid(&client, InstanceType::Agent, 3, "agent-uuid", WAIT)
            .await
            .unwrap();

        assert_eq!(client.local_cvid(), response.cvid);
        assert_eq!(client.remote_cvid(), response.server_cvid);
        assert_eq!(cvid::extract_instance(response.cvid).unwrap(), InstanceType::Agent);
        assert_eq!(cvid::extract_flavor(response.cvid), 3);
    }

    #[tokio::test]
    async fn test_refused_cvid_is_handshake_error() {
        let (client, _hub) = pair(true);

        let err = request_cvid(&client, InstanceType::Viewer, 0, "viewer-uuid", WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert_eq!(client.local_cvid(), 0);
    }

    #[tokio::test]
    async fn test_login_success_and_failure() {
        let (client, _hub) = pair(false);

        login(&client, "admin", "secret", WAIT).await.unwrap();

        match login(&client, "admin", "wrong", WAIT).await {
            Err(Error::LoginFailed(comment)) => assert_eq!(comment, "invalid credentials"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_hub_times_out() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let client = Connection::spawn(a, ConnectionConfig::default(), |_: &Connection, _: Envelope| {});
        let _hub = Connection::spawn(b, ConnectionConfig::default(), |_: &Connection, _: Envelope| {});

        let err = login(&client, "admin", "secret", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
