//! In-memory server used by unit tests
//!
//! `DuplexConnector` hands out one half of a `tokio::io::duplex` pipe per
//! connection and answers frames on the other half according to a mutable
//! `MockBehavior`, optionally overridden per endpoint.
use crate::core::{Connector, Endpoint, Transport};
use crate::protocol::{Decoded, Message, OpCode, WireCodec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Debug, Clone)]
pub(crate) struct MockBehavior {
    pub reject_handshake: bool,
    pub max_wire_version: i32,
    pub max_message_size: Option<usize>,
    pub set_name: Option<String>,
    pub primary: bool,
    pub secondary: bool,
    pub command_delay: Duration,
    /// Delay only the first N non-ping commands; `None` delays every command
    pub delayed_commands: Option<usize>,
    pub corrupt_reply_ids: bool,
    pub refuse_connections: bool,
    /// Connects never complete
    pub stall_connects: bool,
    pub error_code: Option<i32>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            reject_handshake: false,
            max_wire_version: 17,
            max_message_size: None,
            set_name: None,
            primary: true,
            secondary: false,
            command_delay: Duration::ZERO,
            delayed_commands: None,
            corrupt_reply_ids: false,
            refuse_connections: false,
            stall_connects: false,
            error_code: None,
        }
    }
}

impl MockBehavior {
    pub fn replica_member(set_name: &str, primary: bool) -> Self {
        Self {
            set_name: Some(set_name.to_string()),
            primary,
            secondary: !primary,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Shared {
    default: Mutex<MockBehavior>,
    overrides: Mutex<HashMap<Endpoint, MockBehavior>>,
    connects: AtomicUsize,
    handshakes: AtomicUsize,
    commands: AtomicUsize,
    counted_for_delay: AtomicUsize,
}

impl Shared {
    fn behavior_for(&self, endpoint: &Endpoint) -> MockBehavior {
        if let Some(behavior) = self.overrides.lock().unwrap().get(endpoint) {
            return behavior.clone();
        }
        self.default.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
pub(crate) struct DuplexConnector {
    shared: Arc<Shared>,
}

impl DuplexConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let connector = Self::default();
        *connector.shared.default.lock().unwrap() = behavior;
        connector
    }

    /// Change the behavior of every endpoint without an override
    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.shared.default.lock().unwrap());
    }

    pub fn set_endpoint(&self, endpoint: &Endpoint, behavior: MockBehavior) {
        self.shared
            .overrides
            .lock()
            .unwrap()
            .insert(endpoint.clone(), behavior);
    }

    pub fn update_endpoint(&self, endpoint: &Endpoint, f: impl FnOnce(&mut MockBehavior)) {
        let default = self.shared.default.lock().unwrap().clone();
        let mut overrides = self.shared.overrides.lock().unwrap();
        f(overrides.entry(endpoint.clone()).or_insert(default));
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> usize {
        self.shared.commands.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Transport>> {
        let behavior = self.shared.behavior_for(endpoint);
        if behavior.refuse_connections {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        if behavior.stall_connects {
            return futures::future::pending().await;
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, endpoint.clone(), self.shared.clone()));
        Ok(Box::new(client))
    }
}

/// Connector whose connect never completes
pub(crate) struct PendingConnector;

#[async_trait]
impl Connector for PendingConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> io::Result<Box<dyn Transport>> {
        futures::future::pending().await
    }
}

/// `{"<name>": 1}` as a command payload
pub(crate) fn command_payload(name: &str) -> Bytes {
    Bytes::from(json!({ name: 1 }).to_string())
}

async fn serve(mut stream: DuplexStream, endpoint: Endpoint, shared: Arc<Shared>) {
    let codec = WireCodec::default();
    let mut buf = BytesMut::new();

    loop {
        let request = loop {
            match codec.decode(&mut buf) {
                Ok(Decoded::Frame(message)) => break message,
                Ok(Decoded::NeedMoreData) => {}
                Err(_) => return,
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };

        let behavior = shared.behavior_for(&endpoint);
        let reply = match request.op_code {
            OpCode::Handshake => {
                shared.handshakes.fetch_add(1, Ordering::SeqCst);
                hello_reply(&behavior)
            }
            OpCode::Command => {
                shared.commands.fetch_add(1, Ordering::SeqCst);
                let delayed = match behavior.delayed_commands {
                    None => true,
                    Some(n) => {
                        !is_ping(&request.payload)
                            && shared.counted_for_delay.fetch_add(1, Ordering::SeqCst) < n
                    }
                };
                if delayed && !behavior.command_delay.is_zero() {
                    tokio::time::sleep(behavior.command_delay).await;
                }
                command_reply(&behavior, &request.payload)
            }
            OpCode::Reply => return,
        };

        let request_id = if behavior.corrupt_reply_ids {
            request.request_id.wrapping_add(1000)
        } else {
            request.request_id
        };
        let message = Message::new(request_id, OpCode::Reply, reply.to_string());
        let frame = match codec.encode(&message) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn is_ping(payload: &[u8]) -> bool {
    serde_json::from_slice::<Value>(payload)
        .map(|command| command.get("ping").is_some())
        .unwrap_or(false)
}

fn hello_reply(behavior: &MockBehavior) -> Value {
    if behavior.reject_handshake {
        return json!({ "ok": 0, "errmsg": "authentication failed" });
    }
    let mut reply = json!({
        "ok": 1,
        "isWritablePrimary": behavior.primary,
        "secondary": behavior.secondary,
        "minWireVersion": 0,
        "maxWireVersion": behavior.max_wire_version,
    });
    if let Some(set_name) = &behavior.set_name {
        reply["setName"] = json!(set_name);
    }
    if let Some(max) = behavior.max_message_size {
        reply["maxMessageSizeBytes"] = json!(max);
    }
    reply
}

fn command_reply(behavior: &MockBehavior, payload: &[u8]) -> Value {
    if let Some(code) = behavior.error_code {
        return json!({ "ok": 0, "code": code, "errmsg": "forced failure" });
    }
    let command: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    if command.get("ping").is_some() {
        return json!({ "ok": 1 });
    }
    if command.get("find").is_some() {
        return json!({ "ok": 1, "cursor": { "id": 0, "firstBatch": [] } });
    }
    json!({ "ok": 1, "n": 1 })
}
