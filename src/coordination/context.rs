//! Execution contexts that completion callbacks are delivered on

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A unit of caller work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a completion callback runs.
///
/// Each submitted job must run exactly once.
pub trait DispatchContext: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs the job on whatever thread completed the operation
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl DispatchContext for Immediate {
    fn dispatch(&self, job: Job) {
        job();
    }
}

/// Runs jobs on the runtime's blocking pool
impl DispatchContext for Handle {
    fn dispatch(&self, job: Job) {
        self.spawn_blocking(job);
    }
}

/// Dedicated thread that runs jobs one at a time, in submission order
pub struct SerialQueue {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Start the queue's worker thread.
    ///
    /// The thread exits once the queue is dropped and all pending jobs ran.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Job panicked on queue {}", thread_name);
                }
            }
            debug!("Queue {} drained, worker exiting", thread_name);
        })?;

        Ok(Self { name, sender })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DispatchContext for SerialQueue {
    fn dispatch(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job) {
            // The worker only stops if it panicked outside a job
            warn!("Queue {} is closed, running job inline", self.name);
            job();
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue").field("name", &self.name).finish()
    }
}
