//! Extrinsic orchestration service
//!
//! Every public call builds a task graph, hands it to the scheduler and
//! returns. A delivery task waits for the graph's target and re-dispatches
//! the outcome onto the caller's execution context, so each completion
//! handler runs exactly once, on the context the caller asked for.

use super::context::DispatchContext;
use super::dependency::TaskGraph;
use super::fanout::fan_out;
use super::scheduler::{GraphHandle, Scheduler};
use crate::error::{ExtrinsicError, ExtrinsicResult};
use crate::metrics;
use crate::signer::Signer;
use crate::tx::{BuildStrategy, ExtrinsicHash, ExtrinsicOperationFactory, FeeInfo, IndexedBuildStrategy};

use dashmap::DashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fee estimation and submission front end
pub struct ExtrinsicService {
    /// Graph construction
    factory: ExtrinsicOperationFactory,
    /// Runs graph units
    scheduler: Arc<dyn Scheduler>,
    /// Runs delivery tasks
    runtime: Handle,
    /// Graphs whose completion has not been delivered yet
    inflight: Arc<DashMap<Uuid, GraphHandle>>,
}

impl ExtrinsicService {
    /// Delivery tasks run on `runtime`. If it shuts down first, pending
    /// handlers receive `Cancelled` on their contexts.
    pub fn new(factory: ExtrinsicOperationFactory, scheduler: Arc<dyn Scheduler>, runtime: Handle) -> Self {
        Self {
            factory,
            scheduler,
            runtime,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Estimate the fee of one extrinsic without signing or broadcasting it
    pub fn estimate_fee<B, F>(
        &self,
        strategy: B,
        context: Arc<dyn DispatchContext>,
        on_complete: F,
    ) -> Uuid
    where
        B: BuildStrategy,
        F: FnOnce(ExtrinsicResult<FeeInfo>) + Send + 'static,
    {
        let graph = self.factory.estimate_fee_graph(strategy);
        self.launch("estimate_fee", graph, context, on_complete)
    }

    /// Estimate fees of `count` extrinsics; always delivers `count` results
    pub fn estimate_fee_batch<B, F>(
        &self,
        strategy: B,
        count: NonZeroUsize,
        context: Arc<dyn DispatchContext>,
        on_complete: F,
    ) -> Uuid
    where
        B: IndexedBuildStrategy,
        F: FnOnce(Vec<ExtrinsicResult<FeeInfo>>) + Send + 'static,
    {
        let graph = self.factory.estimate_fee_batch_graph(strategy, count);
        self.launch("estimate_fee_batch", graph, context, move |outcome| {
            on_complete(fan_out(outcome, count))
        })
    }

    /// Sign and broadcast once; completes when the node accepts the extrinsic
    pub fn submit<B, F>(
        &self,
        strategy: B,
        signer: Arc<dyn Signer>,
        context: Arc<dyn DispatchContext>,
        on_complete: F,
    ) -> Uuid
    where
        B: BuildStrategy,
        F: FnOnce(ExtrinsicResult<ExtrinsicHash>) + Send + 'static,
    {
        let graph = self.factory.submission_graph(strategy, signer);
        self.launch("submit", graph, context, on_complete)
    }

    /// Sign, broadcast and wait until the watch policy is satisfied
    pub fn submit_and_watch<B, F>(
        &self,
        strategy: B,
        signer: Arc<dyn Signer>,
        context: Arc<dyn DispatchContext>,
        on_complete: F,
    ) -> Uuid
    where
        B: BuildStrategy,
        F: FnOnce(ExtrinsicResult<ExtrinsicHash>) + Send + 'static,
    {
        let graph = self.factory.watch_submission_graph(strategy, signer);
        self.launch("submit_and_watch", graph, context, on_complete)
    }

    /// Sign and broadcast `count` independent extrinsics.
    ///
    /// Always delivers `count` results. A failure shared by the whole batch
    /// fills every slot; see `BatchErrorMode` for per-item attribution.
    pub fn submit_batch<B, F>(
        &self,
        strategy: B,
        signer: Arc<dyn Signer>,
        count: NonZeroUsize,
        context: Arc<dyn DispatchContext>,
        on_complete: F,
    ) -> Uuid
    where
        B: IndexedBuildStrategy,
        F: FnOnce(Vec<ExtrinsicResult<ExtrinsicHash>>) + Send + 'static,
    {
        let graph = self.factory.submission_batch_graph(strategy, signer, count);
        self.launch("submit_batch", graph, context, move |outcome| {
            on_complete(fan_out(outcome, count))
        })
    }

    /// Cancel one operation; its handler still fires with `Cancelled`
    pub fn cancel(&self, operation_id: Uuid) -> bool {
        match self.inflight.remove(&operation_id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every undelivered operation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = self.inflight.iter().map(|entry| *entry.key()).collect();
        let cancelled = ids.into_iter().filter(|id| self.cancel(*id)).count();
        if cancelled > 0 {
            info!("Cancelled {} in-flight operations", cancelled);
        }
        cancelled
    }

    /// Operations whose completion has not been delivered yet
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn launch<T, F>(
        &self,
        operation: &'static str,
        graph: TaskGraph<T>,
        context: Arc<dyn DispatchContext>,
        deliver: F,
    ) -> Uuid
    where
        T: Send + 'static,
        F: FnOnce(ExtrinsicResult<T>) + Send + 'static,
    {
        let started = Instant::now();
        let unit_count = graph.len();
        let (units, completion) = graph.into_parts();

        let handle = self.scheduler.enqueue(units);
        let id = handle.id();
        self.inflight.insert(id, handle);
        debug!("Enqueued {} graph {} with {} units", operation, id, unit_count);

        let delivery = Delivery {
            id,
            operation,
            started,
            inflight: self.inflight.clone(),
            context,
            deliver: Some(deliver),
            _outcome: std::marker::PhantomData,
        };
        self.runtime.spawn(async move {
            let outcome = completion.outcome().await;
            delivery.complete(outcome);
        });

        id
    }
}

/// Hands one outcome to the caller's context.
///
/// If the delivery task is dropped before the graph completes, for example
/// because its runtime shut down, the caller receives `Cancelled` instead.
struct Delivery<T, F>
where
    F: FnOnce(ExtrinsicResult<T>) + Send + 'static,
    T: Send + 'static,
{
    id: Uuid,
    operation: &'static str,
    started: Instant,
    inflight: Arc<DashMap<Uuid, GraphHandle>>,
    context: Arc<dyn DispatchContext>,
    deliver: Option<F>,
    _outcome: std::marker::PhantomData<fn(ExtrinsicResult<T>)>,
}

impl<T, F> Delivery<T, F>
where
    F: FnOnce(ExtrinsicResult<T>) + Send + 'static,
    T: Send + 'static,
{
    fn complete(mut self, outcome: ExtrinsicResult<T>) {
        self.dispatch(outcome);
    }

    fn dispatch(&mut self, outcome: ExtrinsicResult<T>) {
        let Some(deliver) = self.deliver.take() else {
            return;
        };
        self.inflight.remove(&self.id);

        metrics::record_outcome(self.operation, &outcome, self.started.elapsed());
        match &outcome {
            Ok(_) => debug!(
                "{} {} completed in {:?}",
                self.operation,
                self.id,
                self.started.elapsed()
            ),
            Err(e) if e.is_cancelled() => debug!("{} {} cancelled", self.operation, self.id),
            Err(e) => warn!("{} {} failed: {}", self.operation, self.id, e),
        }

        self.context.dispatch(Box::new(move || deliver(outcome)));
    }
}

impl<T, F> Drop for Delivery<T, F>
where
    F: FnOnce(ExtrinsicResult<T>) + Send + 'static,
    T: Send + 'static,
{
    fn drop(&mut self) {
        if self.deliver.is_some() {
            warn!("{} {} abandoned before completion", self.operation, self.id);
            self.dispatch(Err(ExtrinsicError::Cancelled));
        }
    }
}

impl Drop for ExtrinsicService {
    fn drop(&mut self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            debug!("Service dropped with {} operations in flight", cancelled);
        }
    }
}
