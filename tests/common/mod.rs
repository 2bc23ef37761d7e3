//! In-process database server speaking the wire protocol over TCP
//!
//! Keeps documents in memory per namespace and can be scripted to reject
//! handshakes, stall, drop, or fail upcoming commands.
#![allow(dead_code)]

use bytes::BytesMut;
use docwire::config::Config;
use docwire::protocol::{Decoded, Message, OpCode, WireCodec};
use docwire::Endpoint;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const DUPLICATE_KEY: i32 = 11000;

/// What the next command does instead of being answered normally
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Hold the request without replying until the client goes away
    Stall,
    /// Close the connection without replying
    Drop,
    /// Reply `ok: 0` with this code
    Fail(i32),
    /// Answer normally after a pause
    Delay(Duration),
}

#[derive(Default)]
struct Script {
    reject_handshakes: bool,
    primary: bool,
    faults: Vec<Fault>,
}

#[derive(Default)]
struct State {
    script: Mutex<Script>,
    store: Mutex<HashMap<String, Vec<Value>>>,
    commands: Mutex<HashMap<String, usize>>,
    connections: AtomicUsize,
    handshakes: AtomicUsize,
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_role(true).await
    }

    /// Start a server advertising itself as a secondary
    pub async fn start_secondary() -> Self {
        Self::start_with_role(false).await
    }

    async fn start_with_role(primary: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        state.script.lock().unwrap().primary = primary;

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { addr, state, accept }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// A config pointing at this server with test-friendly timeouts
    pub fn config(&self) -> Config {
        config_for(&[self])
    }

    pub fn reject_handshakes(&self, reject: bool) {
        self.state.script.lock().unwrap().reject_handshakes = reject;
    }

    pub fn stall_next_commands(&self, count: usize) {
        self.push_faults(Fault::Stall, count);
    }

    pub fn drop_next_commands(&self, count: usize) {
        self.push_faults(Fault::Drop, count);
    }

    pub fn fail_next_commands(&self, count: usize, code: i32) {
        self.push_faults(Fault::Fail(code), count);
    }

    pub fn delay_next_commands(&self, count: usize, delay: Duration) {
        self.push_faults(Fault::Delay(delay), count);
    }

    fn push_faults(&self, fault: Fault, count: usize) {
        let mut script = self.state.script.lock().unwrap();
        script.faults.extend(std::iter::repeat(fault).take(count));
    }

    /// Commands received with this name, counting ones that were faulted
    pub fn commands(&self, name: &str) -> usize {
        self.state.commands.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Documents stored under `database.collection`
    pub fn documents(&self, namespace: &str) -> Vec<Value> {
        self.state
            .store
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

pub fn config_for(servers: &[&MockServer]) -> Config {
    let mut config = Config::default();
    config.client.endpoints = servers.iter().map(|s| s.endpoint().to_string()).collect();
    config.timeouts.connect_timeout_ms = 1_000;
    config.timeouts.socket_timeout_ms = 2_000;
    config.timeouts.selection_timeout_ms = 1_000;
    config.timeouts.operation_timeout_ms = 10_000;
    config.health.heartbeat_interval_ms = 10_000;
    config.health.min_heartbeat_interval_ms = 50;
    config.pool.wait_queue_timeout_ms = 2_000;
    config.logging.level = "debug".to_string();
    config
}

async fn serve(mut stream: TcpStream, state: Arc<State>) {
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

        let reply = match request.op_code {
            OpCode::Handshake => {
                state.handshakes.fetch_add(1, Ordering::SeqCst);
                hello(&state)
            }
            OpCode::Command => {
                let command: Value = match serde_json::from_slice(&request.payload) {
                    Ok(command) => command,
                    Err(_) => return,
                };
                let name = command_name(&command);
                *state.commands.lock().unwrap().entry(name.clone()).or_insert(0) += 1;

                let fault = if name == "ping" {
                    None
                } else {
                    let mut script = state.script.lock().unwrap();
                    if script.faults.is_empty() {
                        None
                    } else {
                        Some(script.faults.remove(0))
                    }
                };

                match fault {
                    Some(Fault::Stall) => {
                        // Wait for the client to give up and close
                        let mut sink = [0u8; 1024];
                        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                        return;
                    }
                    Some(Fault::Drop) => return,
                    Some(Fault::Fail(code)) => {
                        json!({ "ok": 0, "code": code, "errmsg": "scripted failure" })
                    }
                    Some(Fault::Delay(delay)) => {
                        tokio::time::sleep(delay).await;
                        execute(&state, &name, &command)
                    }
                    None => execute(&state, &name, &command),
                }
            }
            OpCode::Reply => return,
        };

        let message = Message::new(request.request_id, OpCode::Reply, reply.to_string());
        let frame = match codec.encode(&message) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn hello(state: &State) -> Value {
    let script = state.script.lock().unwrap();
    if script.reject_handshakes {
        return json!({ "ok": 0, "errmsg": "handshake rejected" });
    }
    json!({
        "ok": 1,
        "isWritablePrimary": script.primary,
        "secondary": !script.primary,
        "setName": "rs0",
        "minWireVersion": 0,
        "maxWireVersion": 17,
        "maxMessageSizeBytes": 48_000_000,
    })
}

fn command_name(command: &Value) -> String {
    command
        .as_object()
        .and_then(|fields| fields.keys().next())
        .cloned()
        .unwrap_or_default()
}

fn namespace(command: &Value, name: &str) -> String {
    format!(
        "{}.{}",
        command["$db"].as_str().unwrap_or(""),
        command[name].as_str().unwrap_or("")
    )
}

fn matches(document: &Value, filter: &Value) -> bool {
    filter
        .as_object()
        .map(|fields| fields.iter().all(|(key, value)| document.get(key) == Some(value)))
        .unwrap_or(true)
}

fn execute(state: &State, name: &str, command: &Value) -> Value {
    let ns = namespace(command, name);
    let mut store = state.store.lock().unwrap();

    match name {
        "ping" => json!({ "ok": 1 }),
        "insert" => {
            let collection = store.entry(ns).or_default();
            let mut inserted = 0;
            for document in command["documents"].as_array().cloned().unwrap_or_default() {
                if collection.iter().any(|existing| existing["_id"] == document["_id"]) {
                    return json!({
                        "ok": 1,
                        "n": inserted,
                        "writeErrors": [{
                            "index": inserted,
                            "code": DUPLICATE_KEY,
                            "errmsg": "E11000 duplicate key error",
                        }],
                    });
                }
                collection.push(document);
                inserted += 1;
            }
            json!({ "ok": 1, "n": inserted })
        }
        "find" => {
            let limit = command["limit"].as_u64().unwrap_or(u64::MAX) as usize;
            let batch: Vec<Value> = store
                .get(&ns)
                .map(|docs| {
                    docs.iter()
                        .filter(|doc| matches(doc, &command["filter"]))
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            json!({ "ok": 1, "cursor": { "id": 0, "ns": ns, "firstBatch": batch } })
        }
        "count" => {
            let n = store
                .get(&ns)
                .map(|docs| docs.iter().filter(|doc| matches(doc, &command["query"])).count())
                .unwrap_or(0);
            json!({ "ok": 1, "n": n })
        }
        "update" => {
            let spec = &command["updates"][0];
            let set = spec["u"]["$set"].as_object().cloned().unwrap_or_default();
            let multi = spec["multi"].as_bool().unwrap_or(false);
            let collection = store.entry(ns).or_default();

            let mut n = 0;
            for document in collection.iter_mut().filter(|doc| matches(doc, &spec["q"])) {
                if let Some(fields) = document.as_object_mut() {
                    for (key, value) in &set {
                        fields.insert(key.clone(), value.clone());
                    }
                }
                n += 1;
                if !multi {
                    break;
                }
            }

            if n == 0 && spec["upsert"].as_bool().unwrap_or(false) {
                let mut document: Map<String, Value> =
                    spec["q"].as_object().cloned().unwrap_or_default();
                document.extend(set);
                let id = document
                    .entry("_id")
                    .or_insert_with(|| json!(docwire::utils::generate_object_id()))
                    .clone();
                collection.push(Value::Object(document));
                return json!({
                    "ok": 1,
                    "n": 1,
                    "nModified": 0,
                    "upserted": [{ "index": 0, "_id": id }],
                });
            }
            json!({ "ok": 1, "n": n, "nModified": n })
        }
        "delete" => {
            let spec = &command["deletes"][0];
            let single = spec["limit"].as_u64() == Some(1);
            let collection = store.entry(ns).or_default();

            let mut deleted = 0;
            collection.retain(|doc| {
                if (single && deleted == 1) || !matches(doc, &spec["q"]) {
                    return true;
                }
                deleted += 1;
                false
            });
            json!({ "ok": 1, "n": deleted })
        }
        "createIndexes" => json!({ "ok": 1, "numIndexesBefore": 1, "numIndexesAfter": 2 }),
        other => json!({
            "ok": 0,
            "code": 59,
            "codeName": "CommandNotFound",
            "errmsg": format!("no such command: '{}'", other),
        }),
    }
}
