//! Task graphs: units of work with dependencies and one designated target
//!
//! A unit's output is a shared future, so any number of dependent units can
//! await it and it runs at most once. The target's output is delivered through
//! a oneshot channel; if the target never runs, the channel closes and the
//! graph reports `Cancelled`.

use crate::error::{ExtrinsicError, ExtrinsicResult};

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;

/// Shared output of a unit that other units can await
pub type Dependency<T> = Shared<BoxFuture<'static, ExtrinsicResult<T>>>;

/// A schedulable unit of work
pub struct Unit {
    name: String,
    future: BoxFuture<'static, ()>,
}

impl Unit {
    pub fn new(name: impl Into<String>, future: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            name: name.into(),
            future: future.boxed(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_future(self) -> BoxFuture<'static, ()> {
        self.future
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit").field("name", &self.name).finish()
    }
}

/// Collects units until the target is designated
#[derive(Debug, Default)]
pub struct GraphBuilder {
    units: Vec<Unit>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an intermediate unit and return a handle to its output
    pub fn add<T, F>(&mut self, name: impl Into<String>, future: F) -> Dependency<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = ExtrinsicResult<T>> + Send + 'static,
    {
        let output = future.boxed().shared();
        let driver = output.clone();
        self.units.push(Unit::new(name, async move {
            let _ = driver.await;
        }));
        output
    }

    /// Designate the target unit and seal the graph
    pub fn finish<T, F>(mut self, name: impl Into<String>, future: F) -> TaskGraph<T>
    where
        T: Send + 'static,
        F: Future<Output = ExtrinsicResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.units.push(Unit::new(name, async move {
            let _ = tx.send(future.await);
        }));

        TaskGraph {
            units: self.units,
            completion: Completion { rx },
        }
    }
}

/// Sealed graph ready to be handed to a scheduler as one batch
pub struct TaskGraph<T> {
    units: Vec<Unit>,
    completion: Completion<T>,
}

impl<T> TaskGraph<T> {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(Unit::name).collect()
    }

    pub fn into_parts(self) -> (Vec<Unit>, Completion<T>) {
        (self.units, self.completion)
    }
}

impl<T> fmt::Debug for TaskGraph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph").field("units", &self.units).finish()
    }
}

/// Receiving side of a graph's target output
pub struct Completion<T> {
    rx: oneshot::Receiver<ExtrinsicResult<T>>,
}

impl<T> Completion<T> {
    /// Wait for the target; `Cancelled` if it was dropped without running
    pub async fn outcome(self) -> ExtrinsicResult<T> {
        self.rx.await.unwrap_or(Err(ExtrinsicError::Cancelled))
    }
}
