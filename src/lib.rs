//! Extrinsic orchestration for Substrate-based chains
//!
//! Fee estimation, signing and submission of extrinsics, each expressed as a
//! task graph run by an injected scheduler. Completion handlers fire exactly
//! once, on the execution context the caller chose.

pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod signer;
pub mod tx;

pub use chain::{ExtrinsicStatus, RpcEngine, StatusSubscription, WatchPolicy, WsRpcEngine};
pub use config::{BatchErrorMode, Settings};
pub use coordination::{
    DispatchContext, ExtrinsicService, Immediate, ManualScheduler, Scheduler, SerialQueue,
    TokioScheduler,
};
pub use error::{ExtrinsicError, ExtrinsicResult};
pub use runtime::{MetadataProvider, RuntimeCache, RuntimeMetadata};
pub use signer::Signer;
pub use tx::{
    BatchType, BuildStrategy, Call, CryptoType, Era, ExtrinsicBuilder, ExtrinsicHash,
    ExtrinsicOperationFactory, FeeInfo, IndexedBuildStrategy, MultiSignature,
};
