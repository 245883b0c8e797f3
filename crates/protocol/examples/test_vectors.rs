//! Generate wire test vectors for interop testing with other Tether clients.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::{CvidRequest, CvidResponse, LoginRequest, Outcome};
use protocol::{ControlMessage, Envelope, Frame, FrameCodec, InstanceType};

fn main() {
    // Test vector 1: fire-and-forget to the direct peer
    let notify = Envelope::new(0, b"hello".to_vec());
    print_test_vector("notify", &notify);

    // Test vector 2: request with an even id
    let request = Envelope::new(0x0000_1A2B, b"ping".to_vec())
        .with_from(0x0000_3C4D)
        .with_id(4096);
    print_test_vector("request", &request);

    // Test vector 3: response echoing the request id
    print_test_vector("response", &request.reply(b"pong".to_vec()));

    // Test vector 4: stream message with an odd id and a two-byte length prefix
    let stream = Envelope::new(7, vec![0x5A; 200]).with_id(1_000_001);
    print_test_vector("stream_frame", &stream);

    // Test vector 5: CVID handshake
    let cvid_request = ControlMessage::from(CvidRequest::new(
        InstanceType::Agent,
        2,
        "6f1c7a2e-0d4b-4c6e-9a61-2f1f5e8b9c10",
    ));
    print_test_vector(
        "cvid_request",
        &Envelope::new(0, cvid_request.to_payload()).with_id(2),
    );

    let cvid_response = ControlMessage::from(CvidResponse {
        cvid: 0x0123_4513,
        server_cvid: 0x0765_4301,
        server_uuid: "server".to_string(),
    });
    print_test_vector(
        "cvid_response",
        &Envelope::new(0, cvid_response.to_payload()).with_id(2),
    );

    // Test vector 6: login and its outcome
    let login = ControlMessage::from(LoginRequest::new("admin", "password"));
    print_test_vector("login", &Envelope::new(0, login.to_payload()).with_id(6));

    let outcome = ControlMessage::from(Outcome::failure("invalid credentials"));
    print_test_vector(
        "login_outcome",
        &Envelope::new(0, outcome.to_payload()).with_id(6),
    );
}

fn print_test_vector(name: &str, envelope: &Envelope) {
    let codec = FrameCodec::new();
    let bytes = match codec.encode(&Frame::new(envelope.to_bytes())) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("{}: {}", name, e);
            return;
        }
    };
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("0x{:02x}", b);
    }
    println!("]);");
}
