//! Wire protocol between the foreign JavaScript environment and the bridge.
//!
//! Inbound requests are JSON envelopes carrying a caller-chosen `sequence`,
//! a `kind` tag, and kind-specific arguments. Filesystem paths travel as
//! UTF-8 text; binary payloads travel base64-encoded.
//!
//! Outbound responses are rendered as JavaScript calls addressed by a dotted
//! function path under the fixed `ipcBridge` control object, so the foreign
//! side can route them without a central switch. Numeric arguments are
//! emitted as signed 32-bit literals; string arguments are base64-encoded so
//! they never need escaping.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;

/// Name of the JavaScript object that owns every bridge-facing function.
pub(crate) const CONTROL_OBJECT: &str = "ipcBridge";

/// One decoded inbound request.
#[derive(Debug, Deserialize)]
pub(crate) struct Request {
    /// Caller-chosen correlation number, echoed back verbatim. Opaque to the
    /// native side; only required to be unique while the request is
    /// outstanding.
    pub(crate) sequence: i32,
    #[serde(flatten)]
    pub(crate) kind: RequestKind,
}

/// Request kinds and their arguments, tagged by the JSON `kind` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub(crate) enum RequestKind {
    Connect { path: String },
    Read { connection_id: i32, length: i32 },
    Write { connection_id: i32, data_base64: String },
    Close { connection_id: i32 },
    Listen { path: String },
    Accept { listener_id: i32 },
    CloseListener { listener_id: i32 },
}

/// Parse one inbound request envelope.
pub(crate) fn parse_request(raw: &str) -> Result<Request> {
    serde_json::from_str(raw).context("malformed bridge request")
}

/// Decode a base64 argument (e.g. a write payload).
pub(crate) fn decode_base64(data64: &str) -> Result<Vec<u8>> {
    BASE64.decode(data64).context("invalid base64 payload")
}

/// One outbound response, always carrying the sequence of the request that
/// produced it. An empty error string means success.
#[derive(Debug)]
pub(crate) enum Response {
    Connect { sequence: i32, connection_id: i32, error: String },
    Read { sequence: i32, data: Vec<u8>, error: String },
    Write { sequence: i32, count: i32, error: String },
    Close { sequence: i32, error: String },
    Listen { sequence: i32, listener_id: i32, error: String },
    Accept { sequence: i32, connection_id: i32, error: String },
    CloseListener { sequence: i32, error: String },
}

impl Response {
    /// Render the response as a JavaScript call string.
    pub(crate) fn render(&self) -> String {
        match self {
            Self::Connect { sequence, connection_id, error } => render_call(
                "respondConnect",
                &[Arg::Int(*sequence), Arg::Int(*connection_id), Arg::Text(error)],
            ),
            Self::Read { sequence, data, error } => render_call(
                "respondRead",
                &[Arg::Int(*sequence), Arg::Bytes(data), Arg::Text(error)],
            ),
            Self::Write { sequence, count, error } => render_call(
                "respondWrite",
                &[Arg::Int(*sequence), Arg::Int(*count), Arg::Text(error)],
            ),
            Self::Close { sequence, error } => {
                render_call("respondClose", &[Arg::Int(*sequence), Arg::Text(error)])
            }
            Self::Listen { sequence, listener_id, error } => render_call(
                "respondListen",
                &[Arg::Int(*sequence), Arg::Int(*listener_id), Arg::Text(error)],
            ),
            Self::Accept { sequence, connection_id, error } => render_call(
                "respondAccept",
                &[Arg::Int(*sequence), Arg::Int(*connection_id), Arg::Text(error)],
            ),
            Self::CloseListener { sequence, error } => render_call(
                "respondCloseListener",
                &[Arg::Int(*sequence), Arg::Text(error)],
            ),
        }
    }
}

/// Render the one-time initialization handshake sent at bridge setup.
pub(crate) fn render_initialize(message: &str) -> String {
    render_call("initialize", &[Arg::Text(message)])
}

/// A single call argument: a signed 32-bit integer or a base64-quoted string.
enum Arg<'a> {
    Int(i32),
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl Arg<'_> {
    fn render(&self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Text(text) => format!("\"{}\"", BASE64.encode(text.as_bytes())),
            Self::Bytes(bytes) => format!("\"{}\"", BASE64.encode(bytes)),
        }
    }
}

fn render_call(function: &str, args: &[Arg<'_>]) -> String {
    let rendered: Vec<String> = args.iter().map(Arg::render).collect();
    format!("{CONTROL_OBJECT}.{function}({})", rendered.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_request() {
        let request =
            parse_request(r#"{"sequence": 7, "kind": "connect", "path": "/tmp/x.sock"}"#)
                .expect("should parse");
        assert_eq!(request.sequence, 7);
        match request.kind {
            RequestKind::Connect { path } => assert_eq!(path, "/tmp/x.sock"),
            other => panic!("expected connect, got: {other:?}"),
        }
    }

    #[test]
    fn test_parse_read_and_write_requests() {
        let read = parse_request(
            r#"{"sequence": 1, "kind": "read", "connectionId": 3, "length": 128}"#,
        )
        .expect("should parse");
        match read.kind {
            RequestKind::Read { connection_id, length } => {
                assert_eq!(connection_id, 3);
                assert_eq!(length, 128);
            }
            other => panic!("expected read, got: {other:?}"),
        }

        let write = parse_request(
            r#"{"sequence": 2, "kind": "write", "connectionId": 3, "dataBase64": "cGluZw=="}"#,
        )
        .expect("should parse");
        match write.kind {
            RequestKind::Write { connection_id, data_base64 } => {
                assert_eq!(connection_id, 3);
                assert_eq!(decode_base64(&data_base64).expect("valid base64"), b"ping");
            }
            other => panic!("expected write, got: {other:?}"),
        }
    }

    #[test]
    fn test_parse_listener_requests() {
        let listen =
            parse_request(r#"{"sequence": 4, "kind": "listen", "path": "/tmp/l.sock"}"#)
                .expect("should parse");
        assert!(matches!(listen.kind, RequestKind::Listen { .. }));

        let accept =
            parse_request(r#"{"sequence": 5, "kind": "accept", "listenerId": 0}"#)
                .expect("should parse");
        assert!(matches!(accept.kind, RequestKind::Accept { listener_id: 0 }));

        let close =
            parse_request(r#"{"sequence": 6, "kind": "closeListener", "listenerId": 0}"#)
                .expect("should parse");
        assert!(matches!(close.kind, RequestKind::CloseListener { listener_id: 0 }));
    }

    #[test]
    fn test_parse_rejects_unknown_kind_and_missing_sequence() {
        assert!(parse_request(r#"{"sequence": 1, "kind": "shutdown"}"#).is_err());
        assert!(parse_request(r#"{"kind": "close", "connectionId": 1}"#).is_err());
        assert!(parse_request("not json").is_err());
    }

    #[test]
    fn test_render_success_responses() {
        let response = Response::Read {
            sequence: 3,
            data: b"ping".to_vec(),
            error: String::new(),
        };
        assert_eq!(response.render(), r#"ipcBridge.respondRead(3,"cGluZw==","")"#);

        let response = Response::Connect {
            sequence: 12,
            connection_id: 4,
            error: String::new(),
        };
        assert_eq!(response.render(), r#"ipcBridge.respondConnect(12,4,"")"#);

        let response = Response::Write { sequence: -8, count: 100, error: String::new() };
        assert_eq!(response.render(), r#"ipcBridge.respondWrite(-8,100,"")"#);
    }

    #[test]
    fn test_render_error_response_base64_encodes_message() {
        let response = Response::Close {
            sequence: 9,
            error: "invalid connection id".to_owned(),
        };
        let expected = format!(
            r#"ipcBridge.respondClose(9,"{}")"#,
            BASE64.encode("invalid connection id")
        );
        assert_eq!(response.render(), expected);
    }

    #[test]
    fn test_render_initialize_handshake() {
        assert_eq!(render_initialize("ready"), r#"ipcBridge.initialize("cmVhZHk=")"#);
    }
}
