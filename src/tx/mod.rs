//! Extrinsic construction, encoding and the operation factory

pub mod builder;
pub mod codec;
pub mod factory;
pub mod types;

pub use builder::{BatchType, BuildStrategy, ExtrinsicBuilder, IndexedBuildStrategy};
pub use factory::ExtrinsicOperationFactory;
pub use types::{
    AccountId, BlockHash, Call, CryptoType, DispatchClass, Era, ExtrinsicHash, FeeInfo,
    MultiSignature, Weight,
};
