//! Execution context abstraction for thread-affine callees.
//!
//! The foreign environment is single-threaded: it may only be touched from
//! one specific thread or queue. Rather than assuming a particular native
//! threading primitive, the bridge depends on this small contract — a thing
//! that accepts work items and runs them exclusively, in submission order.

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedSender};

/// A scheduled unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Something that runs scheduled work items exclusively and in submission
/// order, representing the foreign environment's thread-affinity
/// requirement. Embedders with a platform main queue (a UI run loop, a
/// webview's dispatch queue) implement this over that queue.
pub trait ExecutionContext: Send + Sync {
    /// Schedule a work item. Items scheduled through the same context run
    /// one at a time, in the order they were submitted.
    fn schedule(&self, task: Task);
}

/// An [`ExecutionContext`] backed by one dedicated worker thread.
///
/// Suitable for embedders without a platform serial queue, and for tests.
/// Dropping the queue closes the channel and joins the worker; items already
/// scheduled still run before the join completes.
pub struct SerialQueue {
    task_tx: Option<UnboundedSender<Task>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue").finish_non_exhaustive()
    }
}

impl SerialQueue {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new() -> Result<Self> {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Task>();
        let worker = std::thread::Builder::new()
            .name("ipc-context".to_owned())
            .spawn(move || {
                while let Some(task) = task_rx.blocking_recv() {
                    task();
                }
            })
            .context("failed to spawn the serial queue worker")?;
        Ok(Self {
            task_tx: Some(task_tx),
            worker: Some(worker),
        })
    }
}

impl ExecutionContext for SerialQueue {
    fn schedule(&self, task: Task) {
        let Some(task_tx) = &self.task_tx else { return };
        if task_tx.send(task).is_err() {
            log::warn!("[Context] Serial queue worker is gone — task dropped");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what was scheduled and exit.
        self.task_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
