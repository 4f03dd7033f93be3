//! Unix domain socket IPC for an embedded, single-threaded JavaScript runtime.
//!
//! Code running inside a sandboxed JS environment has no syscall access of
//! its own. This crate lets it connect to, listen on, read from, and write
//! to Unix domain sockets anyway, through a small sequence-correlated
//! request/response protocol: the JS side issues numbered requests, the
//! native side performs the socket operation asynchronously and answers with
//! a numbered call back into the JS environment.
//!
//! # Architecture
//!
//! - **[`mux::ConnectionManager`]** — thread-safe, handle-based async Unix
//!   socket multiplexer with its own I/O thread
//! - **[`bridge::Bridge`]** — dispatcher correlating foreign-environment
//!   requests to multiplexer operations via sequence numbers
//! - **[`bridge::ExecutionContext`] / [`bridge::Transport`]** — the seams
//!   where an embedding attaches its serialized queue and its message
//!   channel into the JS engine
//!
//! Data flow: JS request string → [`bridge::Bridge::handle_message`] →
//! multiplexer operation → completion on the I/O thread → response rendered
//! and re-dispatched onto the execution context → [`bridge::Transport`] →
//! JS environment.

pub mod bridge;
pub mod mux;

pub use bridge::{Bridge, ExecutionContext, SerialQueue, Transport};
pub use mux::{ConnectionManager, INVALID_ID};
