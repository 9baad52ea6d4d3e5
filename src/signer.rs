//! Signing capability injected per submission

use crate::error::ExtrinsicResult;
use crate::tx::{AccountId, CryptoType, MultiSignature};

use async_trait::async_trait;

/// Produces signatures for one account.
///
/// Signing may wait on a user prompt or a hardware device; implementations
/// are shared between concurrent submissions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    fn account_id(&self) -> AccountId;

    fn crypto_type(&self) -> CryptoType;

    /// Sign an encoded signing payload
    async fn sign(&self, payload: &[u8]) -> ExtrinsicResult<MultiSignature>;
}
