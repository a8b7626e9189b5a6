//! Shared helpers for the end-to-end tests: spawning an in-process server
//! backed by the memory engine, and a minimal wire-level PostgreSQL client.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use iriswire::config::{AuthMode, Settings};
use iriswire::iris::MemoryEngine;
use iriswire::server::{HostServices, Server};

pub const SSL_REQUEST: i32 = 80877103;
pub const CANCEL_REQUEST: i32 = 80877102;
pub const PROTOCOL_VERSION: i32 = 196608;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_settings() -> Settings {
    let mut settings = Settings::default_for_tests();
    settings.host = "127.0.0.1".to_string();
    settings.port = 0; // pick a free port
    settings
}

/// Start a server on a free port with the memory engine and trust auth.
pub async fn spawn_server() -> u16 {
    spawn_server_with(test_settings()).await
}

pub async fn spawn_server_with(settings: Settings) -> u16 {
    let server = Server::new(
        Arc::new(settings),
        MemoryEngine::new(),
        HostServices::default(),
    )
    .expect("server must start");
    let port = server.local_port();
    tokio::spawn(server.run());
    port
}

pub async fn spawn_scram_server(users: &[(&str, &str)]) -> u16 {
    let mut settings = test_settings();
    settings.auth.mode = AuthMode::Scram;
    settings.auth.users = users
        .iter()
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .collect::<BTreeMap<_, _>>();
    spawn_server_with(settings).await
}

/// One backend message off the wire.
#[derive(Debug, Clone)]
pub struct Backend {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl Backend {
    pub fn command_tag(&self) -> String {
        assert_eq!(self.tag, b'C', "not CommandComplete: {:?}", self);
        String::from_utf8_lossy(self.body.strip_suffix(&[0]).unwrap_or(&self.body)).into_owned()
    }

    pub fn rfq_status(&self) -> u8 {
        assert_eq!(self.tag, b'Z', "not ReadyForQuery: {:?}", self);
        self.body[0]
    }

    pub fn data_row(&self) -> Vec<Option<String>> {
        assert_eq!(self.tag, b'D', "not DataRow: {:?}", self);
        let mut fields = Vec::new();
        let n = i16::from_be_bytes(self.body[0..2].try_into().unwrap());
        let mut pos = 2usize;
        for _ in 0..n {
            let len = i32::from_be_bytes(self.body[pos..pos + 4].try_into().unwrap());
            pos += 4;
            if len < 0 {
                fields.push(None);
            } else {
                let end = pos + len as usize;
                fields.push(Some(
                    String::from_utf8(self.body[pos..end].to_vec()).unwrap(),
                ));
                pos = end;
            }
        }
        fields
    }

    /// Fields of an ErrorResponse/NoticeResponse keyed by field tag.
    pub fn error_fields(&self) -> Vec<(u8, String)> {
        assert!(self.tag == b'E' || self.tag == b'N', "not an error: {:?}", self);
        let mut fields = Vec::new();
        let mut pos = 0usize;
        while pos < self.body.len() && self.body[pos] != 0 {
            let tag = self.body[pos];
            pos += 1;
            let end = self.body[pos..]
                .iter()
                .position(|&b| b == 0)
                .map(|i| pos + i)
                .unwrap_or(self.body.len());
            fields.push((
                tag,
                String::from_utf8_lossy(&self.body[pos..end]).into_owned(),
            ));
            pos = end + 1;
        }
        fields
    }

    pub fn sqlstate(&self) -> String {
        self.error_fields()
            .into_iter()
            .find(|(tag, _)| *tag == b'C')
            .map(|(_, v)| v)
            .expect("error has no SQLSTATE field")
    }

    /// RowDescription column names.
    pub fn column_names(&self) -> Vec<String> {
        assert_eq!(self.tag, b'T', "not RowDescription: {:?}", self);
        let n = i16::from_be_bytes(self.body[0..2].try_into().unwrap());
        let mut names = Vec::new();
        let mut pos = 2usize;
        for _ in 0..n {
            let end = pos
                + self.body[pos..]
                    .iter()
                    .position(|&b| b == 0)
                    .expect("field name terminator");
            names.push(String::from_utf8_lossy(&self.body[pos..end]).into_owned());
            pos = end + 1 + 18; // fixed-width field metadata
        }
        names
    }
}

pub struct TestClient {
    pub stream: TcpStream,
}

impl TestClient {
    pub async fn connect(port: u16) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect");
        TestClient { stream }
    }

    /// Send an SSLRequest probe; returns the one-byte answer (S or N).
    pub async fn ssl_probe(&mut self) -> u8 {
        let mut req = Vec::new();
        req.extend_from_slice(&8i32.to_be_bytes());
        req.extend_from_slice(&SSL_REQUEST.to_be_bytes());
        self.stream.write_all(&req).await.unwrap();
        let mut answer = [0u8; 1];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut answer))
            .await
            .expect("ssl probe timed out")
            .unwrap();
        answer[0]
    }

    /// StartupMessage followed by everything through ReadyForQuery.
    pub async fn startup(&mut self, user: &str) -> Vec<Backend> {
        self.send_startup(user).await;
        self.read_until_ready().await
    }

    pub async fn send_startup(&mut self, user: &str) {
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        body.extend_from_slice(b"user\0");
        body.extend_from_slice(user.as_bytes());
        body.push(0);
        body.extend_from_slice(b"database\0testdb\0");
        body.extend_from_slice(b"application_name\0e2e\0");
        body.push(0);
        let mut msg = Vec::new();
        msg.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        msg.extend_from_slice(&body);
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut msg = Vec::with_capacity(body.len() + 5);
        msg.push(tag);
        msg.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        msg.extend_from_slice(body);
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn send_query(&mut self, sql: &str) {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.send(b'Q', &body).await;
    }

    pub async fn query(&mut self, sql: &str) -> Vec<Backend> {
        self.send_query(sql).await;
        self.read_until_ready().await
    }

    pub async fn read_message(&mut self) -> Backend {
        let mut head = [0u8; 5];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut head))
            .await
            .expect("read timed out")
            .expect("read message header");
        let tag = head[0];
        let len = i32::from_be_bytes(head[1..5].try_into().unwrap());
        assert!(len >= 4, "bad frame length {}", len);
        let mut body = vec![0u8; (len - 4) as usize];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut body))
            .await
            .expect("read timed out")
            .expect("read message body");
        Backend { tag, body }
    }

    pub async fn read_until_ready(&mut self) -> Vec<Backend> {
        let mut messages = Vec::new();
        loop {
            let msg = self.read_message().await;
            let done = msg.tag == b'Z';
            messages.push(msg);
            if done {
                return messages;
            }
        }
    }
}

/// (pid, secret) from the BackendKeyData in a startup response.
pub fn backend_key_data(messages: &[Backend]) -> (i32, i32) {
    let key = messages
        .iter()
        .find(|m| m.tag == b'K')
        .expect("no BackendKeyData in startup response");
    (
        i32::from_be_bytes(key.body[0..4].try_into().unwrap()),
        i32::from_be_bytes(key.body[4..8].try_into().unwrap()),
    )
}

pub fn tags(messages: &[Backend]) -> Vec<u8> {
    messages.iter().map(|m| m.tag).collect()
}

pub fn data_rows(messages: &[Backend]) -> Vec<Vec<Option<String>>> {
    messages
        .iter()
        .filter(|m| m.tag == b'D')
        .map(|m| m.data_row())
        .collect()
}

pub fn command_tags(messages: &[Backend]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.tag == b'C')
        .map(|m| m.command_tag())
        .collect()
}

pub fn first_error(messages: &[Backend]) -> Option<&Backend> {
    messages.iter().find(|m| m.tag == b'E')
}
