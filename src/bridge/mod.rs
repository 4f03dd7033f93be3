//! Bridging dispatcher between the foreign JavaScript environment and the
//! socket multiplexer.
//!
//! The foreign side issues numbered requests; the [`Bridge`] decodes each
//! one, invokes exactly one matching [`ConnectionManager`] operation, and on
//! completion emits exactly one response carrying the same sequence number.
//! Multiplexer callbacks may fire on the background I/O thread, so every
//! emission is re-dispatched onto the environment's [`ExecutionContext`]
//! before the [`Transport`] delivers it.
//!
//! Ordering between different sequences is not guaranteed — only the
//! contract between a request and its own response.

mod context;
mod protocol;

pub use context::{ExecutionContext, SerialQueue, Task};

use std::sync::Arc;

use anyhow::Result;

use crate::mux::ConnectionManager;
use protocol::{Request, RequestKind, Response};

/// The channel that carries rendered calls to the foreign environment.
///
/// `deliver` may be invoked from any thread; the adapter behind it owns
/// placing the call onto whatever thread the environment actually requires.
/// The bridge guarantees logical per-sequence ordering, the transport
/// guarantees thread safety of the actual delivery.
pub trait Transport: Send + Sync {
    /// Deliver one rendered JavaScript call string.
    fn deliver(&self, call: String);
}

/// Sequence-correlated dispatcher over a [`ConnectionManager`].
///
/// Owns no sockets — only the transient correlation between an inbound
/// request and its single outbound response, which lives inside the
/// completion callbacks themselves.
pub struct Bridge {
    manager: Arc<ConnectionManager>,
    emitter: Emitter,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").finish_non_exhaustive()
    }
}

impl Bridge {
    /// Create the bridge and send the one-time initialization handshake to
    /// the foreign environment's fixed control address, announcing that the
    /// bridge is ready to receive requests.
    pub fn new(
        manager: Arc<ConnectionManager>,
        transport: Arc<dyn Transport>,
        execution_context: Arc<dyn ExecutionContext>,
        ready_message: &str,
    ) -> Self {
        let emitter = Emitter {
            transport,
            execution_context,
        };
        emitter.emit_call(protocol::render_initialize(ready_message));
        log::info!("[Bridge] Initialization handshake scheduled");
        Self { manager, emitter }
    }

    /// Handle one raw inbound request string.
    ///
    /// # Errors
    ///
    /// Returns an error only for an envelope so malformed that no sequence
    /// number can be recovered — there is nothing to respond to. Any request
    /// that does carry a sequence produces exactly one response, success or
    /// error.
    pub fn handle_message(&self, raw: &str) -> Result<()> {
        let request = protocol::parse_request(raw)?;
        log::debug!("[Bridge] Accepted request sequence={}", request.sequence);
        self.handle_request(request);
        Ok(())
    }

    fn handle_request(&self, request: Request) {
        let sequence = request.sequence;
        match request.kind {
            RequestKind::Connect { path } => {
                let emitter = self.emitter.clone();
                self.manager.connect(path, move |connection_id, error| {
                    emitter.emit(Response::Connect { sequence, connection_id, error });
                });
            }
            RequestKind::Read { connection_id, length } => {
                let emitter = self.emitter.clone();
                if length < 0 {
                    emitter.emit(Response::Read {
                        sequence,
                        data: Vec::new(),
                        error: "invalid read length".to_owned(),
                    });
                    return;
                }
                self.manager.read(connection_id, length as usize, move |data, error| {
                    emitter.emit(Response::Read { sequence, data, error });
                });
            }
            RequestKind::Write { connection_id, data_base64 } => {
                let emitter = self.emitter.clone();
                match protocol::decode_base64(&data_base64) {
                    Ok(data) => {
                        self.manager.write(connection_id, data, move |count, error| {
                            emitter.emit(Response::Write {
                                sequence,
                                count: count as i32,
                                error,
                            });
                        });
                    }
                    Err(e) => emitter.emit(Response::Write {
                        sequence,
                        count: 0,
                        error: e.to_string(),
                    }),
                }
            }
            RequestKind::Close { connection_id } => {
                let emitter = self.emitter.clone();
                self.manager.close(connection_id, move |error| {
                    emitter.emit(Response::Close { sequence, error });
                });
            }
            RequestKind::Listen { path } => {
                let emitter = self.emitter.clone();
                self.manager.listen(path, move |listener_id, error| {
                    emitter.emit(Response::Listen { sequence, listener_id, error });
                });
            }
            RequestKind::Accept { listener_id } => {
                let emitter = self.emitter.clone();
                self.manager.accept(listener_id, move |connection_id, error| {
                    emitter.emit(Response::Accept { sequence, connection_id, error });
                });
            }
            RequestKind::CloseListener { listener_id } => {
                let emitter = self.emitter.clone();
                self.manager.close_listener(listener_id, move |error| {
                    emitter.emit(Response::CloseListener { sequence, error });
                });
            }
        }
    }
}

/// Emits responses toward the foreign environment, hopping onto its
/// execution context first. Multiplexer callbacks clone one of these.
#[derive(Clone)]
struct Emitter {
    transport: Arc<dyn Transport>,
    execution_context: Arc<dyn ExecutionContext>,
}

impl Emitter {
    fn emit(&self, response: Response) {
        self.emit_call(response.render());
    }

    fn emit_call(&self, call: String) {
        let transport = Arc::clone(&self.transport);
        self.execution_context.schedule(Box::new(move || {
            transport.deliver(call);
        }));
    }
}
