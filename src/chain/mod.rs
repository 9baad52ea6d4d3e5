//! Chain module - the RPC surface the orchestrator talks to
//!
//! This module provides:
//! - The `RpcEngine` abstraction over fee queries and submission
//! - Transaction status events reported by watch subscriptions
//! - Watch policies deciding which status resolves a submission
//! - A WebSocket JSON-RPC engine for Substrate nodes

pub mod finality;
pub mod provider;

pub use finality::{await_terminal, StatusVerdict, WatchPolicy};
pub use provider::WsRpcEngine;

use crate::error::ExtrinsicResult;
use crate::tx::{ExtrinsicHash, FeeInfo};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a watched extrinsic (`author_extrinsicUpdate` payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtrinsicStatus {
    Future,
    Ready,
    Broadcast(Vec<String>),
    InBlock(String),
    Retracted(String),
    FinalityTimeout(String),
    Finalized(String),
    Usurped(String),
    Dropped,
    Invalid,
}

impl ExtrinsicStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ExtrinsicStatus::Future => "future",
            ExtrinsicStatus::Ready => "ready",
            ExtrinsicStatus::Broadcast(_) => "broadcast",
            ExtrinsicStatus::InBlock(_) => "in_block",
            ExtrinsicStatus::Retracted(_) => "retracted",
            ExtrinsicStatus::FinalityTimeout(_) => "finality_timeout",
            ExtrinsicStatus::Finalized(_) => "finalized",
            ExtrinsicStatus::Usurped(_) => "usurped",
            ExtrinsicStatus::Dropped => "dropped",
            ExtrinsicStatus::Invalid => "invalid",
        }
    }
}

/// Open `submit and watch` subscription
pub struct StatusSubscription {
    pub id: String,
    pub events: BoxStream<'static, ExtrinsicResult<ExtrinsicStatus>>,
}

impl fmt::Debug for StatusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Remote calls issued against the node.
///
/// Implementations are shared by every in-flight graph and must tolerate
/// concurrent calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcEngine: Send + Sync {
    /// Dry-run fee query; never broadcasts
    async fn query_fee(&self, extrinsic_hex: &str) -> ExtrinsicResult<FeeInfo>;

    /// One-shot submission, resolved on node acceptance
    async fn submit(&self, extrinsic_hex: &str) -> ExtrinsicResult<ExtrinsicHash>;

    /// Submission with a status subscription
    async fn submit_and_watch(&self, extrinsic_hex: &str) -> ExtrinsicResult<StatusSubscription>;

    /// Close a subscription opened by `submit_and_watch`
    async fn unsubscribe(&self, subscription_id: &str) -> ExtrinsicResult<()>;
}
