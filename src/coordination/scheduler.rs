//! Schedulers that run task graphs
//!
//! A scheduler accepts all units of a graph at once and returns a handle that
//! aborts every unit of that graph, whether queued or running. Aborted units
//! are dropped, which closes the graph's completion channel.

use super::dependency::Unit;
use crate::config::SchedulerConfig;

use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs sets of dependent units
pub trait Scheduler: Send + Sync {
    /// Schedule every unit of one graph as a single batch
    fn enqueue(&self, units: Vec<Unit>) -> GraphHandle;
}

/// Cancellation handle for one scheduled graph
pub struct GraphHandle {
    id: Uuid,
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl GraphHandle {
    pub fn new(id: Uuid, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            cancel: Box::new(cancel),
        }
    }

    /// Handle for a graph that was refused and is already gone
    pub fn detached(id: Uuid) -> Self {
        Self::new(id, || {})
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Abort all queued and running units of the graph
    pub fn cancel(self) {
        debug!("Cancelling graph {}", self.id);
        (self.cancel)();
    }
}

impl fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphHandle").field("id", &self.id).finish()
    }
}

/// Drive every unit of a graph to completion inside one task.
///
/// Dropping the returned future drops the `JoinSet`, which aborts all units.
fn supervise(id: Uuid, units: Vec<Unit>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let mut set = JoinSet::new();
        for unit in units {
            debug!("Graph {}: starting unit {}", id, unit.name());
            set.spawn(unit.into_future());
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Graph {}: unit panicked", id);
                }
            }
        }
    })
}

/// Spawn `work` and track it under `id` until it returns.
///
/// The task waits until its entry is registered so a fast graph cannot
/// remove itself before it was inserted.
fn spawn_tracked(
    runtime: &Handle,
    tracked: &Arc<DashMap<Uuid, AbortHandle>>,
    id: Uuid,
    work: impl Future<Output = ()> + Send + 'static,
) -> AbortHandle {
    let (registered_tx, registered_rx) = oneshot::channel::<()>();
    let map = tracked.clone();
    let task = runtime.spawn(async move {
        if registered_rx.await.is_err() {
            return;
        }
        work.await;
        map.remove(&id);
        crate::metrics::set_inflight_graphs(map.len());
    });

    let abort = task.abort_handle();
    tracked.insert(id, abort.clone());
    crate::metrics::set_inflight_graphs(tracked.len());
    let _ = registered_tx.send(());
    abort
}

/// Scheduler backed by a tokio runtime, with an explicit start/stop lifecycle
pub struct TokioScheduler {
    runtime: Handle,
    running: AtomicBool,
    inflight: Arc<DashMap<Uuid, AbortHandle>>,
    permits: Arc<Semaphore>,
}

impl TokioScheduler {
    /// Create a stopped scheduler; call `start` before enqueueing
    pub fn new(runtime: Handle, config: &SchedulerConfig) -> Self {
        Self {
            runtime,
            running: AtomicBool::new(false),
            inflight: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_graphs)),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Scheduler started");
    }

    /// Refuse new graphs and abort all in-flight ones. Returns how many were aborted.
    pub fn stop(&self) -> usize {
        self.running.store(false, Ordering::SeqCst);

        let ids: Vec<Uuid> = self.inflight.iter().map(|entry| *entry.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, task)) = self.inflight.remove(&id) {
                task.abort();
                aborted += 1;
            }
        }

        info!("Scheduler stopped, aborted {} graphs", aborted);
        crate::metrics::set_inflight_graphs(0);
        aborted
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }
}

impl Scheduler for TokioScheduler {
    fn enqueue(&self, units: Vec<Unit>) -> GraphHandle {
        let id = Uuid::new_v4();
        if !self.is_running() {
            warn!("Scheduler stopped, refusing graph {} ({} units)", id, units.len());
            return GraphHandle::detached(id);
        }

        let permits = self.permits.clone();
        let abort = spawn_tracked(&self.runtime, &self.inflight, id, async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            supervise(id, units).await;
        });

        let inflight = self.inflight.clone();
        GraphHandle::new(id, move || {
            inflight.remove(&id);
            abort.abort();
        })
    }
}

type QueuedGraph = (Uuid, Vec<Unit>);

/// Deterministic scheduler: graphs wait until explicitly released.
///
/// Released graphs run on the ambient tokio runtime; queued graphs can be
/// cancelled without ever running.
#[derive(Default)]
pub struct ManualScheduler {
    queued: Arc<Mutex<Vec<QueuedGraph>>>,
    released: Arc<DashMap<Uuid, AbortHandle>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, Vec<QueuedGraph>> {
        self.queued.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of graphs waiting to be released
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Start every queued graph. Must be called inside a tokio runtime.
    pub fn release_all(&self) -> usize {
        let graphs: Vec<QueuedGraph> = self.queue().drain(..).collect();
        let count = graphs.len();

        let runtime = Handle::current();
        for (id, units) in graphs {
            spawn_tracked(&runtime, &self.released, id, supervise(id, units));
        }
        count
    }

    /// Drop queued graphs and abort released ones
    pub fn cancel_all(&self) -> usize {
        let dropped: Vec<QueuedGraph> = self.queue().drain(..).collect();
        let mut count = dropped.len();
        drop(dropped);

        let ids: Vec<Uuid> = self.released.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, task)) = self.released.remove(&id) {
                task.abort();
                count += 1;
            }
        }
        count
    }
}

impl Scheduler for ManualScheduler {
    fn enqueue(&self, units: Vec<Unit>) -> GraphHandle {
        let id = Uuid::new_v4();
        self.queue().push((id, units));

        let queued = self.queued.clone();
        let released = self.released.clone();
        GraphHandle::new(id, move || {
            let removed = {
                let mut queue = queued.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                queue
                    .iter()
                    .position(|(queued_id, _)| *queued_id == id)
                    .map(|index| queue.remove(index))
            };
            drop(removed);
            if let Some((_, task)) = released.remove(&id) {
                task.abort();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::dependency::GraphBuilder;
    use crate::error::ExtrinsicError;
    use std::time::Duration;

    fn config(max_concurrent_graphs: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_graphs,
        }
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_graph() {
        let scheduler = TokioScheduler::new(Handle::current(), &config(4));
        scheduler.start();

        let mut graph = GraphBuilder::new();
        let first = graph.add("first", async { Ok(2u64) });
        let graph = graph.finish("double", async move { Ok(first.await? * 2) });
        let (units, completion) = graph.into_parts();

        scheduler.enqueue(units);
        assert_eq!(completion.outcome().await, Ok(4));
    }

    #[tokio::test]
    async fn test_stopped_scheduler_refuses_graphs() {
        let scheduler = TokioScheduler::new(Handle::current(), &config(4));
        let graph = GraphBuilder::new().finish("target", async { Ok(()) });
        let (units, completion) = graph.into_parts();

        scheduler.enqueue(units);
        assert_eq!(completion.outcome().await, Err(ExtrinsicError::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_aborts_running_graphs() {
        let scheduler = TokioScheduler::new(Handle::current(), &config(4));
        scheduler.start();

        let graph = GraphBuilder::new().finish("forever", async {
            futures::future::pending::<()>().await;
            Ok(())
        });
        let (units, completion) = graph.into_parts();
        scheduler.enqueue(units);
        tokio::task::yield_now().await;

        assert_eq!(scheduler.stop(), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(1), completion.outcome())
            .await
            .expect("completion must resolve after stop");
        assert_eq!(outcome, Err(ExtrinsicError::Cancelled));
    }

    #[tokio::test]
    async fn test_handle_cancel_is_scoped_to_its_graph() {
        let scheduler = TokioScheduler::new(Handle::current(), &config(1));
        scheduler.start();

        let blocked = GraphBuilder::new().finish("blocked", async {
            futures::future::pending::<()>().await;
            Ok(1u8)
        });
        let (units, blocked_completion) = blocked.into_parts();
        let blocked_handle = scheduler.enqueue(units);

        // Waits for the single permit held by the blocked graph.
        let waiting = GraphBuilder::new().finish("waiting", async { Ok(2u8) });
        let (units, waiting_completion) = waiting.into_parts();
        scheduler.enqueue(units);

        blocked_handle.cancel();
        assert_eq!(blocked_completion.outcome().await, Err(ExtrinsicError::Cancelled));
        assert_eq!(waiting_completion.outcome().await, Ok(2));
    }

    #[tokio::test]
    async fn test_manual_scheduler_holds_until_released() {
        let scheduler = ManualScheduler::new();
        let graph = GraphBuilder::new().finish("target", async { Ok("done") });
        let (units, completion) = graph.into_parts();

        scheduler.enqueue(units);
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.release_all(), 1);
        assert_eq!(completion.outcome().await, Ok("done"));
    }

    #[tokio::test]
    async fn test_manual_scheduler_cancel_queued() {
        let scheduler = ManualScheduler::new();
        let first = GraphBuilder::new().finish("first", async { Ok(1u8) });
        let second = GraphBuilder::new().finish("second", async { Ok(2u8) });
        let (first_units, first_completion) = first.into_parts();
        let (second_units, second_completion) = second.into_parts();

        let first_handle = scheduler.enqueue(first_units);
        scheduler.enqueue(second_units);

        first_handle.cancel();
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(first_completion.outcome().await, Err(ExtrinsicError::Cancelled));

        assert_eq!(scheduler.cancel_all(), 1);
        assert_eq!(second_completion.outcome().await, Err(ExtrinsicError::Cancelled));
    }
}
