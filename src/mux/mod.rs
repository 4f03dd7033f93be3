//! Thread-safe asynchronous Unix domain socket multiplexer.
//!
//! [`ConnectionManager`] owns a dedicated I/O thread and a registry of open
//! sockets and acceptors, each addressed by an opaque `i32` handle. Every
//! operation is asynchronous, thread-safe, and resolves exactly once through
//! a completion callback.
//!
//! # Handler discipline
//!
//! A handler runs either inline, during the call that registered it (when the
//! operation can complete or fail without waiting), or later on the I/O
//! thread. Inline invocation never happens while the registry lock is held,
//! so handlers may safely issue further operations on the manager. Callers
//! must be correct under both cases.
//!
//! Operations on the same handle are not serialized against each other;
//! callers needing strict ordering (e.g. a second read only after the first
//! completes) must wait for completion before issuing the next operation.

mod registry;

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use registry::Registry;

/// Reserved handle value that never names a live connection or listener.
pub const INVALID_ID: i32 = -1;

/// Error string for operations aborted by closing their handle.
const CANCELED: &str = "operation canceled";
/// Error string for a stream whose peer closed the read half. The foreign
/// side reconstructs its end-of-stream condition from this exact text.
const EOF: &str = "EOF";

/// Asynchronous, handle-based Unix domain socket connection manager.
///
/// All operations may be called from any thread concurrently. Dropping the
/// manager stops the I/O thread (joining it before returning, so no handler
/// fires afterwards), closes every open socket, and unlinks every
/// still-registered listener endpoint path.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: IoDriver,
}

struct Shared {
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry mutex poisoned")
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Start the manager and its I/O thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::new()),
            }),
            driver: IoDriver::start()?,
        })
    }

    /// Asynchronously connect a new stream socket to `path`.
    ///
    /// The handler receives the new connection id and an empty error string,
    /// or [`INVALID_ID`] and a description of the failure. An id is never
    /// published for a failed connect.
    pub fn connect<H>(&self, path: impl AsRef<Path>, handler: H)
    where
        H: FnOnce(i32, String) + Send + 'static,
    {
        let allocated = self.shared.registry().allocate_connection_id();
        let Some(connection_id) = allocated else {
            handler(INVALID_ID, "connection ids exhausted".to_owned());
            return;
        };

        let path = path.as_ref().to_path_buf();
        let shared = Arc::clone(&self.shared);
        self.driver.spawn(async move {
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    shared.registry().insert_connection(connection_id, stream);
                    log::debug!("[Mux] Connection {connection_id} established to {}", path.display());
                    handler(connection_id, String::new());
                }
                Err(e) => {
                    log::debug!("[Mux] Connect to {} failed: {e}", path.display());
                    handler(INVALID_ID, e.to_string());
                }
            }
        });
    }

    /// Asynchronously read up to `max_length` bytes from a connection.
    ///
    /// This is a partial read: it resolves as soon as at least one byte is
    /// available. A `max_length` of 0 resolves inline with no bytes and no
    /// error, for any connection id. End of stream is reported as the error
    /// string `"EOF"` with no bytes. Zero-byte completions that are not end
    /// of stream are retried internally, never surfaced.
    pub fn read<H>(&self, connection_id: i32, max_length: usize, handler: H)
    where
        H: FnOnce(Vec<u8>, String) + Send + 'static,
    {
        if max_length == 0 {
            handler(Vec::new(), String::new());
            return;
        }

        let entry = self.shared.registry().connection(connection_id);
        let Some((stream, cancel)) = entry else {
            handler(Vec::new(), "invalid connection id".to_owned());
            return;
        };

        let shared = Arc::clone(&self.shared);
        self.driver.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => handler(Vec::new(), CANCELED.to_owned()),
                (data, error) = read_some(&stream, max_length) => {
                    if !error.is_empty() && error != EOF {
                        // The socket is no longer usable; retire the handle.
                        retire_connection(&shared, connection_id);
                    }
                    handler(data, error);
                }
            }
        });
    }

    /// Asynchronously write the entire buffer to a connection.
    ///
    /// Partial writes are retried internally; the handler only observes a
    /// count short of `data.len()` together with a non-empty error string.
    /// An empty buffer resolves inline with a zero count and no error.
    pub fn write<H>(&self, connection_id: i32, data: Vec<u8>, handler: H)
    where
        H: FnOnce(usize, String) + Send + 'static,
    {
        let entry = self.shared.registry().connection(connection_id);
        let Some((stream, cancel)) = entry else {
            handler(0, "invalid connection id".to_owned());
            return;
        };

        if data.is_empty() {
            handler(0, String::new());
            return;
        }

        let shared = Arc::clone(&self.shared);
        self.driver.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => handler(0, CANCELED.to_owned()),
                (written, error) = write_all(&stream, &data) => {
                    if !error.is_empty() {
                        retire_connection(&shared, connection_id);
                    }
                    handler(written, error);
                }
            }
        });
    }

    /// Close a connection and retire its handle immediately.
    ///
    /// Any operation still in flight on the connection resolves with an
    /// `"operation canceled"` error. An invalid id reports an error without
    /// touching any other handle.
    pub fn close<H>(&self, connection_id: i32, handler: H)
    where
        H: FnOnce(String) + Send + 'static,
    {
        let removed = self.shared.registry().remove_connection(connection_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                log::debug!("[Mux] Connection {connection_id} closed");
                handler(String::new());
            }
            None => handler("invalid connection id".to_owned()),
        }
    }

    /// Open, bind, and begin listening on a filesystem path in one step.
    ///
    /// Binding resolves synchronously at the OS level, so the handler always
    /// runs inline. On any failure after the path was successfully bound, the
    /// path is unlinked before the error is reported; a failed listen never
    /// leaks a stale socket file.
    pub fn listen<H>(&self, path: impl AsRef<Path>, handler: H)
    where
        H: FnOnce(i32, String) + Send + 'static,
    {
        let allocated = self.shared.registry().allocate_listener_id();
        let Some(listener_id) = allocated else {
            handler(INVALID_ID, "listener ids exhausted".to_owned());
            return;
        };

        let path = path.as_ref().to_path_buf();
        let std_listener = match std::os::unix::net::UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                // Nothing was bound, so there is nothing on disk to clean up
                // (the path may belong to another process).
                handler(INVALID_ID, e.to_string());
                return;
            }
        };

        let listener = match self.register_listener(std_listener) {
            Ok(listener) => listener,
            Err(e) => {
                // Bound but unusable: unlink before reporting.
                let _ = std::fs::remove_file(&path);
                handler(INVALID_ID, e.to_string());
                return;
            }
        };

        log::debug!("[Mux] Listener {listener_id} bound to {}", path.display());
        self.shared
            .registry()
            .insert_listener(listener_id, listener, path);
        handler(listener_id, String::new());
    }

    /// Asynchronously accept one inbound connection on a listener.
    ///
    /// The handler receives the new connection id, minted from the same
    /// monotonic space as connect ids.
    pub fn accept<H>(&self, listener_id: i32, handler: H)
    where
        H: FnOnce(i32, String) + Send + 'static,
    {
        let entry = self.shared.registry().listener(listener_id);
        let Some((listener, cancel)) = entry else {
            handler(INVALID_ID, "invalid listener id".to_owned());
            return;
        };

        let allocated = self.shared.registry().allocate_connection_id();
        let Some(connection_id) = allocated else {
            handler(INVALID_ID, "connection ids exhausted".to_owned());
            return;
        };

        let shared = Arc::clone(&self.shared);
        self.driver.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => handler(INVALID_ID, CANCELED.to_owned()),
                result = listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        shared.registry().insert_connection(connection_id, stream);
                        log::debug!("[Mux] Connection {connection_id} accepted on listener {listener_id}");
                        handler(connection_id, String::new());
                    }
                    Err(e) => handler(INVALID_ID, e.to_string()),
                },
            }
        });
    }

    /// Close a listener and unlink its endpoint path exactly once.
    ///
    /// A pending accept on the listener resolves with an
    /// `"operation canceled"` error.
    pub fn close_listener<H>(&self, listener_id: i32, handler: H)
    where
        H: FnOnce(String) + Send + 'static,
    {
        let removed = self.shared.registry().remove_listener(listener_id);
        let Some((entry, endpoint)) = removed else {
            handler("invalid listener id".to_owned());
            return;
        };

        entry.cancel.cancel();
        drop(entry);
        let _ = std::fs::remove_file(&endpoint);
        log::debug!("[Mux] Listener {listener_id} closed, unlinked {}", endpoint.display());
        handler(String::new());
    }

    /// Convert a bound std listener into a tokio listener registered with the
    /// I/O thread's reactor.
    fn register_listener(
        &self,
        listener: std::os::unix::net::UnixListener,
    ) -> io::Result<UnixListener> {
        listener.set_nonblocking(true)?;
        let _guard = self.driver.enter();
        UnixListener::from_std(listener)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Stop and join the I/O thread first: once this returns, no handler
        // can fire, and the registry can be torn down without racing them.
        self.driver.shutdown();

        let mut registry = self.shared.registry();
        for endpoint in registry.drain_listener_endpoints() {
            let _ = std::fs::remove_file(&endpoint);
        }
        registry.clear_connections();
    }
}

/// Remove a connection whose socket failed, aborting any sibling operation
/// still in flight on it.
fn retire_connection(shared: &Shared, connection_id: i32) {
    if let Some(entry) = shared.registry().remove_connection(connection_id) {
        entry.cancel.cancel();
        log::debug!("[Mux] Connection {connection_id} retired after I/O error");
    }
}

/// Read at most `max_length` bytes, resolving on first progress.
async fn read_some(stream: &UnixStream, max_length: usize) -> (Vec<u8>, String) {
    let mut buffer = vec![0u8; max_length];
    loop {
        if let Err(e) = stream.readable().await {
            return (Vec::new(), e.to_string());
        }
        match stream.try_read(&mut buffer) {
            Ok(0) => return (Vec::new(), EOF.to_owned()),
            Ok(n) => {
                buffer.truncate(n);
                return (buffer, String::new());
            }
            // Readiness was spurious: a zero-byte non-EOF completion.
            // Retry instead of surfacing it.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return (Vec::new(), e.to_string()),
        }
    }
}

/// Write the whole buffer, retrying partial writes.
async fn write_all(stream: &UnixStream, data: &[u8]) -> (usize, String) {
    let mut written = 0;
    while written < data.len() {
        if let Err(e) = stream.writable().await {
            return (written, e.to_string());
        }
        match stream.try_write(&data[written..]) {
            Ok(0) => return (written, "write resolved with zero bytes".to_owned()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return (written, e.to_string()),
        }
    }
    (written, String::new())
}

/// The dedicated I/O thread and its single-threaded runtime.
///
/// The runtime parks on a shutdown channel, which is what keeps the event
/// loop alive while no operation is in flight. Dropping the driver signals
/// the channel and joins the thread; dropping the runtime on the way out
/// cancels every in-flight task, so no handler survives teardown.
struct IoDriver {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IoDriver {
    fn start() -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("ipc-io".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .context("failed to spawn the socket I/O thread")?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e).context("failed to build the socket I/O runtime");
            }
            Err(_) => {
                let _ = thread.join();
                anyhow::bail!("socket I/O thread exited before reporting readiness");
            }
        };

        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Run a completion task on the I/O thread. If the runtime is already
    /// shut down, the task is dropped without running.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.handle.spawn(future);
    }

    /// Enter the runtime context, e.g. to register sockets with the reactor
    /// from a caller thread.
    fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.handle.enter()
    }

    /// Signal the runtime to stop and join the thread. Idempotent.
    fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            // A lost I/O thread is unrecoverable.
            assert!(thread.join().is_ok(), "socket I/O thread panicked");
        }
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
