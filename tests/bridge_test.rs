//! End-to-end tests driving the bridge exactly the way a foreign JS
//! environment would: JSON request strings in, rendered JavaScript call
//! strings out.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::json;

use ipc_bridge::{Bridge, ConnectionManager, SerialQueue, Transport};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Transport that forwards every delivered call to a test channel.
struct ChannelTransport {
    call_tx: Mutex<mpsc::Sender<String>>,
}

impl Transport for ChannelTransport {
    fn deliver(&self, call: String) {
        let _ = self.call_tx.lock().expect("call_tx mutex").send(call);
    }
}

/// A delivered JavaScript call, split into function name and decoded args.
#[derive(Debug)]
struct Call {
    function: String,
    args: Vec<String>,
}

impl Call {
    /// Parse `ipcBridge.fn(1,"b64",...)`. Base64 string args are decoded to
    /// UTF-8; integer args are kept as their literal text.
    fn parse(raw: &str) -> Self {
        let open = raw.find('(').expect("call should have an argument list");
        let function = raw[..open]
            .strip_prefix("ipcBridge.")
            .expect("calls are addressed to the ipcBridge object")
            .to_owned();
        let arg_list = raw[open + 1..].strip_suffix(')').expect("unterminated call");

        let args = if arg_list.is_empty() {
            Vec::new()
        } else {
            arg_list
                .split(',')
                .map(|arg| {
                    if let Some(quoted) = arg.strip_prefix('"') {
                        let encoded = quoted.strip_suffix('"').expect("unterminated string arg");
                        let bytes = BASE64.decode(encoded).expect("string args are base64");
                        String::from_utf8(bytes).expect("test payloads are UTF-8")
                    } else {
                        arg.to_owned()
                    }
                })
                .collect()
        };

        Self { function, args }
    }

    fn sequence(&self) -> i32 {
        self.args[0].parse().expect("first arg is the sequence")
    }

    fn int(&self, index: usize) -> i32 {
        self.args[index].parse().expect("integer argument")
    }
}

struct Harness {
    bridge: Bridge,
    call_rx: mpsc::Receiver<String>,
    /// Responses received while waiting for a different sequence.
    pending: std::cell::RefCell<Vec<Call>>,
}

impl Harness {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (call_tx, call_rx) = mpsc::channel();
        let manager = Arc::new(ConnectionManager::new().expect("manager should start"));
        let transport = Arc::new(ChannelTransport {
            call_tx: Mutex::new(call_tx),
        });
        let queue = Arc::new(SerialQueue::new().expect("queue should start"));
        let bridge = Bridge::new(manager, transport, queue, "bridge ready");

        let harness = Self {
            bridge,
            call_rx,
            pending: std::cell::RefCell::new(Vec::new()),
        };
        let handshake = harness.recv();
        assert_eq!(handshake.function, "initialize");
        assert_eq!(handshake.args, vec!["bridge ready"]);
        harness
    }

    fn send(&self, request: serde_json::Value) {
        self.bridge
            .handle_message(&request.to_string())
            .expect("request should decode");
    }

    fn recv(&self) -> Call {
        let raw = self
            .call_rx
            .recv_timeout(TIMEOUT)
            .expect("expected a delivered call");
        Call::parse(&raw)
    }

    /// Wait for the response bearing `sequence`, asserting its function
    /// name. Responses for other sequences may arrive first (ordering across
    /// sequences is not guaranteed); those are buffered for later callers.
    fn recv_sequence(&self, function: &str, sequence: i32) -> Call {
        let buffered = {
            let mut pending = self.pending.borrow_mut();
            pending
                .iter()
                .position(|call| call.sequence() == sequence)
                .map(|index| pending.remove(index))
        };
        if let Some(call) = buffered {
            assert_eq!(call.function, function);
            return call;
        }

        for _ in 0..16 {
            let call = self.recv();
            if call.sequence() == sequence {
                assert_eq!(call.function, function);
                return call;
            }
            self.pending.borrow_mut().push(call);
        }
        panic!("no response for sequence {sequence}");
    }
}

#[test]
fn test_full_listen_connect_exchange_and_teardown() {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let path = tmp.path().join("bridge.sock");
    let path_str = path.to_str().expect("utf-8 path");
    let harness = Harness::new();

    // Listen resolves synchronously and the endpoint appears on disk.
    harness.send(json!({"sequence": 1, "kind": "listen", "path": path_str}));
    let listen = harness.recv_sequence("respondListen", 1);
    let listener_id = listen.int(1);
    assert!(listener_id >= 0);
    assert_eq!(listen.args[2], "");
    assert!(path.exists());

    // Accept and connect race; each resolves with its own sequence.
    harness.send(json!({"sequence": 2, "kind": "accept", "listenerId": listener_id}));
    harness.send(json!({"sequence": 3, "kind": "connect", "path": path_str}));
    let accept = harness.recv_sequence("respondAccept", 2);
    let connect = harness.recv_sequence("respondConnect", 3);
    let server_id = accept.int(1);
    let client_id = connect.int(1);
    assert_eq!(accept.args[2], "");
    assert_eq!(connect.args[2], "");
    assert_ne!(server_id, client_id);

    // "ping" across the pair.
    harness.send(json!({
        "sequence": 4,
        "kind": "write",
        "connectionId": client_id,
        "dataBase64": BASE64.encode("ping"),
    }));
    let write = harness.recv_sequence("respondWrite", 4);
    assert_eq!(write.int(1), 4, "full buffer written");
    assert_eq!(write.args[2], "");

    harness.send(json!({"sequence": 5, "kind": "read", "connectionId": server_id, "length": 4}));
    let read = harness.recv_sequence("respondRead", 5);
    assert_eq!(read.args[1], "ping");
    assert_eq!(read.args[2], "");

    // Close everything; the endpoint leaves the disk with the listener.
    harness.send(json!({"sequence": 6, "kind": "close", "connectionId": client_id}));
    assert_eq!(harness.recv_sequence("respondClose", 6).args[1], "");
    harness.send(json!({"sequence": 7, "kind": "close", "connectionId": server_id}));
    assert_eq!(harness.recv_sequence("respondClose", 7).args[1], "");
    harness.send(json!({"sequence": 8, "kind": "closeListener", "listenerId": listener_id}));
    assert_eq!(harness.recv_sequence("respondCloseListener", 8).args[1], "");
    assert!(!path.exists());
}

#[test]
fn test_outstanding_requests_correlate_by_sequence_not_arrival_order() {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let path = tmp.path().join("pairs.sock");
    let path_str = path.to_str().expect("utf-8 path");
    let harness = Harness::new();

    harness.send(json!({"sequence": 10, "kind": "listen", "path": path_str}));
    let listener_id = harness.recv_sequence("respondListen", 10).int(1);

    // Two unrelated connected pairs.
    let mut pairs = Vec::new();
    for (accept_seq, connect_seq) in [(11, 12), (13, 14)] {
        harness.send(json!({"sequence": accept_seq, "kind": "accept", "listenerId": listener_id}));
        harness.send(json!({"sequence": connect_seq, "kind": "connect", "path": path_str}));
        let server_id = harness.recv_sequence("respondAccept", accept_seq).int(1);
        let client_id = harness.recv_sequence("respondConnect", connect_seq).int(1);
        pairs.push((client_id, server_id));
    }

    // Reads with sequences 7 and 9 outstanding on both pairs at once.
    harness.send(json!({"sequence": 7, "kind": "read", "connectionId": pairs[0].1, "length": 16}));
    harness.send(json!({"sequence": 9, "kind": "read", "connectionId": pairs[1].1, "length": 16}));

    // Satisfy the second read first: completion order must not matter.
    harness.send(json!({
        "sequence": 20,
        "kind": "write",
        "connectionId": pairs[1].0,
        "dataBase64": BASE64.encode("second"),
    }));
    let _write = harness.recv_sequence("respondWrite", 20);
    let second = harness.recv_sequence("respondRead", 9);
    assert_eq!(second.args[1], "second");

    harness.send(json!({
        "sequence": 21,
        "kind": "write",
        "connectionId": pairs[0].0,
        "dataBase64": BASE64.encode("first"),
    }));
    let _write = harness.recv_sequence("respondWrite", 21);
    let first = harness.recv_sequence("respondRead", 7);
    assert_eq!(first.args[1], "first");
}

#[test]
fn test_dropping_the_bridge_with_a_pending_read_emits_nothing_more() {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let path = tmp.path().join("drop.sock");
    let path_str = path.to_str().expect("utf-8 path");
    let harness = Harness::new();

    harness.send(json!({"sequence": 1, "kind": "listen", "path": path_str}));
    let listener_id = harness.recv_sequence("respondListen", 1).int(1);
    harness.send(json!({"sequence": 2, "kind": "accept", "listenerId": listener_id}));
    harness.send(json!({"sequence": 3, "kind": "connect", "path": path_str}));
    let server_id = harness.recv_sequence("respondAccept", 2).int(1);
    let _client_id = harness.recv_sequence("respondConnect", 3).int(1);

    // Read left pending — no peer data is coming.
    harness.send(json!({"sequence": 4, "kind": "read", "connectionId": server_id, "length": 8}));

    let Harness { bridge, call_rx, .. } = harness;
    drop(bridge);

    // Teardown joined the I/O thread; the pending read's response must never
    // arrive, and the listener endpoint is gone.
    assert!(call_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!path.exists());
}

#[test]
fn test_error_responses_carry_readable_messages() {
    let harness = Harness::new();

    harness.send(json!({"sequence": 30, "kind": "read", "connectionId": 1234, "length": 8}));
    let read = harness.recv_sequence("respondRead", 30);
    assert_eq!(read.args[1], "");
    assert_eq!(read.args[2], "invalid connection id");

    harness.send(json!({"sequence": 31, "kind": "accept", "listenerId": 77}));
    let accept = harness.recv_sequence("respondAccept", 31);
    assert_eq!(accept.int(1), -1);
    assert_eq!(accept.args[2], "invalid listener id");
}
