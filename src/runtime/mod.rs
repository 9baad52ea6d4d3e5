//! Runtime metadata needed to encode calls and extrinsics
//!
//! The orchestrator only needs a narrow view of the chain metadata: runtime
//! versions for the signing payload, the genesis hash, and the pallet/call
//! indices of every call it may encode.

use crate::error::{ExtrinsicError, ExtrinsicResult};
use crate::tx::BlockHash;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Encoding view of the current chain runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMetadata {
    pub spec_version: u32,
    pub transaction_version: u32,
    pub genesis_hash: BlockHash,
    call_indices: HashMap<(String, String), [u8; 2]>,
}

impl RuntimeMetadata {
    pub fn new(spec_version: u32, transaction_version: u32, genesis_hash: BlockHash) -> Self {
        Self {
            spec_version,
            transaction_version,
            genesis_hash,
            call_indices: HashMap::new(),
        }
    }

    /// Register the pallet and call index of `module.function`
    pub fn with_call(
        mut self,
        module: impl Into<String>,
        function: impl Into<String>,
        pallet_index: u8,
        call_index: u8,
    ) -> Self {
        self.call_indices
            .insert((module.into(), function.into()), [pallet_index, call_index]);
        self
    }

    pub fn call_index(&self, module: &str, function: &str) -> Option<[u8; 2]> {
        self.call_indices
            .get(&(module.to_string(), function.to_string()))
            .copied()
    }
}

/// Supplies the metadata of the runtime the node is currently running
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch_metadata(&self) -> ExtrinsicResult<Arc<RuntimeMetadata>>;
}

/// Metadata provider fed by whoever syncs the runtime.
///
/// Fails with `MetadataUnavailable` until the first snapshot is published.
#[derive(Default)]
pub struct RuntimeCache {
    current: RwLock<Option<Arc<RuntimeMetadata>>>,
}

impl RuntimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached snapshot after a runtime upgrade
    pub async fn update(&self, metadata: RuntimeMetadata) {
        let mut current = self.current.write().await;
        let previous = current.as_ref().map(|m| m.spec_version);
        info!(
            "Runtime metadata updated: spec {:?} -> {}",
            previous, metadata.spec_version
        );
        *current = Some(Arc::new(metadata));
    }

    pub async fn clear(&self) {
        *self.current.write().await = None;
        debug!("Runtime metadata cache cleared");
    }
}

#[async_trait]
impl MetadataProvider for RuntimeCache {
    async fn fetch_metadata(&self) -> ExtrinsicResult<Arc<RuntimeMetadata>> {
        self.current.read().await.clone().ok_or_else(|| {
            ExtrinsicError::MetadataUnavailable("runtime metadata not fetched yet".to_string())
        })
    }
}
