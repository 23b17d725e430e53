//! Print framed test vectors for viewer implementations in other languages.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::*;
use protocol::FrameCodec;

fn main() {
    // Test vector 1: AUTH REQUEST
    print_test_vector("auth_request", Header::Auth, Content::Auth(AuthMessage::Request));

    // Test vector 2: AUTH RESPONSE
    print_test_vector(
        "auth_response",
        Header::Auth,
        Content::Auth(AuthMessage::response("alice", "ample-brook-cider")),
    );

    // Test vector 3: INFO(AUTH_SUCCESS)
    print_test_vector(
        "info_auth_success",
        Header::Info,
        Content::Info(InfoMessage::new(InfoType::AuthSuccess, "welcome")),
    );

    // Test vector 4: ERROR(SERVER_FULL)
    print_test_vector(
        "error_server_full",
        Header::Error,
        Content::Error(ErrorMessage::new(
            ErrorCode::ServerFull,
            "server_full",
            "server is full",
        )),
    );

    // Test vector 5: HEARTBEAT ping
    print_test_vector(
        "heartbeat_ping",
        Header::Heartbeat,
        Content::Heartbeat(HeartbeatMessage::ping()),
    );

    // Test vector 6: TERMINAL_DATA
    print_test_vector(
        "terminal_data",
        Header::TerminalData,
        Content::Terminal(TerminalContent::new("00000000-0000-0000-0000-000000000001", b"Hello".to_vec())),
    );
}

fn print_test_vector(name: &str, header: Header, content: Content) {
    // Fixed timestamp so the vectors are reproducible.
    let payload = Payload {
        version: PROTOCOL_VERSION,
        header,
        timestamp: 1_704_067_200,
        content,
    };
    let bytes = payload.to_msgpack().expect("serialization failed");
    let frame = FrameCodec::new().encode(&bytes).expect("framing failed");

    print!("export const {} = new Uint8Array([", name);
    for (i, b) in frame.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
