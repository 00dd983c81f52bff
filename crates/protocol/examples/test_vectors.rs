//! Generate test vectors for interop testing against other implementations.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::envelope::{encode_request, nonce_for, seal, Reply};
use protocol::{PrivateKey, PublicKey, SharedSecret, WireMessage};

const SERVER_PRIVATE: &str = "qHTyTvwGYKFeww0tn0/Gdn7vkPvfAsfSUFeXwNUCpnU=";
const CLIENT_PRIVATE: &str = "iBv818sWwMDjU/IdvVyb2hAvlTrm6S/xf9oSFySEVnw=";
const TIMESTAMP: i64 = 1_700_000_000;

fn main() {
    let server = PrivateKey::from_base64(SERVER_PRIVATE).unwrap();
    let client = PrivateKey::from_base64(CLIENT_PRIVATE).unwrap();
    let server_pub = server.public_key();
    let client_pub = client.public_key();

    println!("=== keys ===");
    println!("server_public: {}", server_pub);
    println!("client_public: {}", client_pub);

    let shared = client.shared_secret(&server_pub);
    println!("=== agreement ===");
    println!("shared_secret: {}", hex::encode(shared.as_bytes()));
    println!("shared_fingerprint: {}", shared.fingerprint());
    println!("client_fingerprint: {}", client_pub.fingerprint());

    println!("=== nonce ===");
    println!("nonce({}): {}", TIMESTAMP, hex::encode(nonce_for(TIMESTAMP)));

    // The client static key stands in for the ephemeral one so the output is
    // reproducible.
    let request = encode_request(
        &client_pub.fingerprint(),
        &shared.fingerprint(),
        "service.Query",
        &[0x81, 0xa4, b'N', b'a', b'm', b'e', 0xa5, b'a', b'd', b'm', b'i', b'n'],
    )
    .unwrap();
    print_sealed("request", &client_pub, &shared, &request);

    let ok = Reply::Success(vec![0x81, 0xa3, b'A', b'g', b'e', 0x64]).encode();
    print_sealed("reply_ok", &server_pub, &server.shared_secret(&client_pub), &ok);

    let err = Reply::LogicError("unknown name".to_string()).encode();
    print_sealed("reply_logic_error", &server_pub, &server.shared_secret(&client_pub), &err);
}

fn print_sealed(name: &str, sender: &PublicKey, secret: &SharedSecret, plaintext: &[u8]) {
    let ciphertext = seal(secret, TIMESTAMP, plaintext).unwrap();
    let msg = WireMessage::new(*sender, TIMESTAMP, ciphertext);
    let (key_header, ts_header) = msg.header_values();

    println!("=== {} ===", name);
    println!("plaintext: {}", hex::encode(plaintext));
    println!("ciphertext: {}", hex::encode(&msg.ciphertext));
    println!("stream_frame: {}", hex::encode(msg.encode_stream().unwrap()));
    println!("X-Rpc-E: {}", key_header);
    println!("X-Rpc-T: {}", ts_header);
}
