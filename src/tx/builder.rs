//! Extrinsic build context and the build strategies callers inject

use super::types::{BlockHash, Call, Era};
use crate::error::{ExtrinsicError, ExtrinsicResult};

/// How several calls in one extrinsic are wrapped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchType {
    /// `Utility.batch`: stops at the first failing call
    Batch,
    /// `Utility.batch_all`: reverts everything if any call fails
    #[default]
    BatchAll,
    /// `Utility.force_batch`: runs every call regardless of failures
    ForceBatch,
}

impl BatchType {
    pub fn function_name(self) -> &'static str {
        match self {
            BatchType::Batch => "batch",
            BatchType::BatchAll => "batch_all",
            BatchType::ForceBatch => "force_batch",
        }
    }
}

/// Mutable context a build strategy fills in before encoding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtrinsicBuilder {
    calls: Vec<Call>,
    nonce: u32,
    tip: u128,
    era: Era,
    era_block_hash: Option<BlockHash>,
    batch_type: BatchType,
}

impl ExtrinsicBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adding_call(mut self, call: Call) -> Self {
        self.calls.push(call);
        self
    }

    pub fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_tip(mut self, tip: u128) -> Self {
        self.tip = tip;
        self
    }

    /// Set a mortal era; `block_hash` is the hash of the era's birth block.
    pub fn with_era(mut self, era: Era, block_hash: BlockHash) -> Self {
        self.era = era;
        self.era_block_hash = Some(block_hash);
        self
    }

    pub fn with_batch_type(mut self, batch_type: BatchType) -> Self {
        self.batch_type = batch_type;
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn tip(&self) -> u128 {
        self.tip
    }

    pub fn era(&self) -> Era {
        self.era
    }

    pub fn era_block_hash(&self) -> Option<BlockHash> {
        self.era_block_hash
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    /// Reject contexts that cannot produce an extrinsic
    pub fn validate(&self) -> ExtrinsicResult<()> {
        if self.calls.is_empty() {
            return Err(ExtrinsicError::Builder(
                "extrinsic must contain at least one call".to_string(),
            ));
        }
        if !self.era.is_immortal() && self.era_block_hash.is_none() {
            return Err(ExtrinsicError::Builder(
                "mortal era requires the birth block hash".to_string(),
            ));
        }
        Ok(())
    }
}

/// Single-shot build capability, consumed when the graph runs.
pub trait BuildStrategy: Send + 'static {
    fn build(self, builder: ExtrinsicBuilder) -> ExtrinsicResult<ExtrinsicBuilder>;
}

impl<F> BuildStrategy for F
where
    F: FnOnce(ExtrinsicBuilder) -> ExtrinsicResult<ExtrinsicBuilder> + Send + 'static,
{
    fn build(self, builder: ExtrinsicBuilder) -> ExtrinsicResult<ExtrinsicBuilder> {
        self(builder)
    }
}

/// Build capability producing the `index`-th of N independent extrinsics.
pub trait IndexedBuildStrategy: Send + Sync + 'static {
    fn build(&self, builder: ExtrinsicBuilder, index: usize) -> ExtrinsicResult<ExtrinsicBuilder>;
}

impl<F> IndexedBuildStrategy for F
where
    F: Fn(ExtrinsicBuilder, usize) -> ExtrinsicResult<ExtrinsicBuilder> + Send + Sync + 'static,
{
    fn build(&self, builder: ExtrinsicBuilder, index: usize) -> ExtrinsicResult<ExtrinsicBuilder> {
        self(builder, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(amount: u8) -> Call {
        Call::new("Balances", "transfer_keep_alive", vec![amount])
    }

    #[test]
    fn test_empty_builder_rejected() {
        let err = ExtrinsicBuilder::new().validate().unwrap_err();
        assert!(matches!(err, ExtrinsicError::Builder(_)));
    }

    #[test]
    fn test_mortal_era_needs_block_hash() {
        let mut builder = ExtrinsicBuilder::new().adding_call(transfer(1));
        builder.era = Era::mortal(64, 10);
        assert!(builder.validate().is_err());

        let builder = builder.with_era(Era::mortal(64, 10), [7u8; 32]);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn test_closure_strategies() {
        let single = |builder: ExtrinsicBuilder| -> ExtrinsicResult<ExtrinsicBuilder> {
            Ok(builder.adding_call(transfer(5)).with_tip(3))
        };
        let built = BuildStrategy::build(single, ExtrinsicBuilder::new()).unwrap();
        assert_eq!(built.calls().len(), 1);
        assert_eq!(built.tip(), 3);

        let indexed = |builder: ExtrinsicBuilder, index: usize| -> ExtrinsicResult<ExtrinsicBuilder> {
            Ok(builder.adding_call(transfer(index as u8)).with_nonce(10 + index as u32))
        };
        let built = IndexedBuildStrategy::build(&indexed, ExtrinsicBuilder::new(), 2).unwrap();
        assert_eq!(built.nonce(), 12);
        assert_eq!(built.calls()[0].args, vec![2]);
    }
}
