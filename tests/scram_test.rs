//! End-to-end SCRAM-SHA-256 authentication over the wire, with the client
//! side of the exchange implemented here.

mod common;

use common::*;

use crypto::digest::Digest;
use crypto::hmac::Hmac;
use crypto::mac::Mac;
use crypto::pbkdf2::pbkdf2;
use crypto::sha2::Sha256;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::new(Sha256::new(), key);
    mac.input(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(mac.result().code());
    out
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.input(data);
    let mut out = [0u8; 32];
    hasher.result(&mut out);
    out
}

struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
    raw: String,
}

fn parse_server_first(data: &[u8]) -> ServerFirst {
    let raw = String::from_utf8(data.to_vec()).unwrap();
    let mut nonce = String::new();
    let mut salt = Vec::new();
    let mut iterations = 0u32;
    for attr in raw.split(',') {
        if let Some(v) = attr.strip_prefix("r=") {
            nonce = v.to_string();
        } else if let Some(v) = attr.strip_prefix("s=") {
            salt = base64::decode(v).unwrap();
        } else if let Some(v) = attr.strip_prefix("i=") {
            iterations = v.parse().unwrap();
        }
    }
    ServerFirst {
        nonce,
        salt,
        iterations,
        raw,
    }
}

/// Drive the client side of the SASL exchange. Returns the startup
/// response messages after AuthenticationOk on success, or the
/// ErrorResponse on failure.
async fn scram_login(
    client: &mut TestClient,
    user: &str,
    password: &str,
) -> Result<Vec<Backend>, Backend> {
    client.send_startup(user).await;

    // AuthenticationSASL advertising SCRAM-SHA-256
    let auth = client.read_message().await;
    assert_eq!(auth.tag, b'R');
    assert_eq!(&auth.body[0..4], &10i32.to_be_bytes());
    let mechanisms = String::from_utf8_lossy(&auth.body[4..]);
    assert!(mechanisms.contains("SCRAM-SHA-256"));

    // SASLInitialResponse
    let client_nonce = "clientnoncedata";
    let client_first_bare = format!("n=,r={}", client_nonce);
    let client_first = format!("n,,{}", client_first_bare);
    let mut body = Vec::new();
    body.extend_from_slice(b"SCRAM-SHA-256\0");
    body.extend_from_slice(&(client_first.len() as i32).to_be_bytes());
    body.extend_from_slice(client_first.as_bytes());
    client.send(b'p', &body).await;

    // AuthenticationSASLContinue with the server-first message
    let cont = client.read_message().await;
    if cont.tag == b'E' {
        return Err(cont);
    }
    assert_eq!(cont.tag, b'R');
    assert_eq!(&cont.body[0..4], &11i32.to_be_bytes());
    let server_first = parse_server_first(&cont.body[4..]);
    assert!(server_first.nonce.starts_with(client_nonce));
    assert!(server_first.iterations >= 4096);

    // client-final with the proof
    let mut salted = [0u8; 32];
    let mut prf = Hmac::new(Sha256::new(), password.as_bytes());
    pbkdf2(&mut prf, &server_first.salt, server_first.iterations, &mut salted);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key = sha256(&client_key);
    let without_proof = format!("c=biws,r={}", server_first.nonce);
    let auth_message = format!(
        "{},{},{}",
        client_first_bare, server_first.raw, without_proof
    );
    let client_signature = hmac(&stored_key, auth_message.as_bytes());
    let mut proof = [0u8; 32];
    for i in 0..32 {
        proof[i] = client_key[i] ^ client_signature[i];
    }
    let client_final = format!("{},p={}", without_proof, base64::encode(proof));
    client.send(b'p', client_final.as_bytes()).await;

    // AuthenticationSASLFinal carrying the server signature
    let fin = client.read_message().await;
    if fin.tag == b'E' {
        return Err(fin);
    }
    assert_eq!(fin.tag, b'R');
    assert_eq!(&fin.body[0..4], &12i32.to_be_bytes());
    let server_final = String::from_utf8_lossy(&fin.body[4..]).into_owned();
    let server_key = hmac(&salted, b"Server Key");
    let expected = format!(
        "v={}",
        base64::encode(hmac(&server_key, auth_message.as_bytes()))
    );
    assert_eq!(server_final, expected, "server signature mismatch");

    let ok = client.read_message().await;
    assert_eq!(ok.tag, b'R');
    assert_eq!(&ok.body[0..4], &0i32.to_be_bytes());
    Ok(client.read_until_ready().await)
}

#[tokio::test]
async fn test_scram_login_and_query() {
    let port = spawn_scram_server(&[("alice", "secret")]).await;
    let mut client = TestClient::connect(port).await;
    let startup = scram_login(&mut client, "alice", "secret")
        .await
        .expect("authentication should succeed");
    assert_eq!(startup.last().unwrap().rfq_status(), b'I');

    let response = client.query("SELECT 1").await;
    assert_eq!(command_tags(&response), vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn test_scram_wrong_password_rejected() {
    let port = spawn_scram_server(&[("alice", "secret")]).await;
    let mut client = TestClient::connect(port).await;
    let err = scram_login(&mut client, "alice", "not-the-password")
        .await
        .expect_err("authentication must fail");
    assert_eq!(err.sqlstate(), "28P01");
}

/// The server must not leak which users exist: an unknown user gets a
/// complete, well-formed exchange that only fails at proof verification.
#[tokio::test]
async fn test_scram_unknown_user_fails_at_verification_only() {
    let port = spawn_scram_server(&[("alice", "secret")]).await;
    let mut client = TestClient::connect(port).await;
    let err = scram_login(&mut client, "mallory", "whatever")
        .await
        .expect_err("authentication must fail");
    assert_eq!(err.sqlstate(), "28P01");
}
