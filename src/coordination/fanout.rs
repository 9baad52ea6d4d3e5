//! Expansion of a batch outcome into one result per index

use crate::error::ExtrinsicResult;

use std::num::NonZeroUsize;
use tracing::debug;

/// Expand a batch outcome into exactly `count` per-item results.
///
/// A successful outcome already carries one result per index and passes
/// through unchanged. A failed outcome is replicated to every index.
pub fn fan_out<T>(
    outcome: ExtrinsicResult<Vec<ExtrinsicResult<T>>>,
    count: NonZeroUsize,
) -> Vec<ExtrinsicResult<T>> {
    match outcome {
        Ok(items) => {
            debug_assert_eq!(items.len(), count.get(), "batch produced a wrong number of results");
            items
        }
        Err(e) => {
            debug!("Batch of {} failed as a whole: {}", count, e);
            (0..count.get()).map(|_| Err(e.clone())).collect()
        }
    }
}
