//! Watch policies for submit-and-watch
//!
//! Substrate reports a transaction's life as a stream of statuses:
//! - Future/Ready/Broadcast: still in the pool
//! - InBlock: included in a block that may still be retracted
//! - Retracted: the including block left the best chain, keep waiting
//! - Finalized: included in a finalized block
//! - FinalityTimeout/Usurped/Dropped/Invalid: the transaction will not land

use super::ExtrinsicStatus;
use crate::error::{ExtrinsicError, ExtrinsicResult};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

/// Which status is sufficient to resolve a watched submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPolicy {
    /// First `InBlock` (or `Finalized`) status
    #[default]
    InBlock,
    /// Only `Finalized`
    Finalized,
}

/// Outcome of a single status under a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusVerdict {
    Pending,
    /// Resolved; carries the block hash
    Included(String),
    Rejected(ExtrinsicError),
}

impl WatchPolicy {
    pub fn evaluate(self, status: &ExtrinsicStatus) -> StatusVerdict {
        match status {
            ExtrinsicStatus::Finalized(block) => StatusVerdict::Included(block.clone()),
            ExtrinsicStatus::InBlock(block) if self == WatchPolicy::InBlock => {
                StatusVerdict::Included(block.clone())
            }
            ExtrinsicStatus::FinalityTimeout(_)
            | ExtrinsicStatus::Usurped(_)
            | ExtrinsicStatus::Dropped
            | ExtrinsicStatus::Invalid => StatusVerdict::Rejected(ExtrinsicError::TerminalStatus {
                status: status.name().to_string(),
            }),
            _ => StatusVerdict::Pending,
        }
    }
}

/// Consume statuses until one is terminal under `policy`.
///
/// Returns the block hash of the including block. A stream that ends before
/// a terminal status is a transport failure.
pub async fn await_terminal<S>(mut events: S, policy: WatchPolicy) -> ExtrinsicResult<String>
where
    S: Stream<Item = ExtrinsicResult<ExtrinsicStatus>> + Unpin,
{
    while let Some(event) = events.next().await {
        let status = event?;
        crate::metrics::record_watch_status(&status);

        match policy.evaluate(&status) {
            StatusVerdict::Pending => debug!("Extrinsic status {}, waiting", status.name()),
            StatusVerdict::Included(block) => return Ok(block),
            StatusVerdict::Rejected(err) => return Err(err),
        }
    }

    Err(ExtrinsicError::Transport(
        "status subscription closed before a terminal status".to_string(),
    ))
}
