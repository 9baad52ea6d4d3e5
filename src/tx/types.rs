//! Primitive transaction types shared by the builder, codec and RPC layers

use crate::error::{ExtrinsicError, ExtrinsicResult};

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// 32-byte account identifier (public key or its hash)
pub type AccountId = [u8; 32];

/// 32-byte block or genesis hash
pub type BlockHash = [u8; 32];

/// Signature scheme of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoType {
    Sr25519,
    Ed25519,
    Ecdsa,
}

impl CryptoType {
    /// Variant index inside `MultiSignature`
    pub fn multi_signature_index(self) -> u8 {
        match self {
            CryptoType::Ed25519 => 0,
            CryptoType::Sr25519 => 1,
            CryptoType::Ecdsa => 2,
        }
    }

    /// Raw signature length in bytes
    pub fn signature_len(self) -> usize {
        match self {
            CryptoType::Sr25519 | CryptoType::Ed25519 => 64,
            CryptoType::Ecdsa => 65,
        }
    }
}

/// Signature tagged with its scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSignature {
    crypto_type: CryptoType,
    bytes: Vec<u8>,
}

impl MultiSignature {
    pub fn new(crypto_type: CryptoType, bytes: Vec<u8>) -> ExtrinsicResult<Self> {
        if bytes.len() != crypto_type.signature_len() {
            return Err(ExtrinsicError::Signing(format!(
                "{:?} signature must be {} bytes, got {}",
                crypto_type,
                crypto_type.signature_len(),
                bytes.len()
            )));
        }
        Ok(Self { crypto_type, bytes })
    }

    /// Zero-valued signature; only valid for fee queries.
    pub fn zeroed(crypto_type: CryptoType) -> Self {
        Self {
            crypto_type,
            bytes: vec![0u8; crypto_type.signature_len()],
        }
    }

    pub fn crypto_type(&self) -> CryptoType {
        self.crypto_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Transaction validity period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Era {
    #[default]
    Immortal,
    Mortal { period: u64, phase: u64 },
}

impl Era {
    /// Mortal era starting at `current_block` and lasting roughly `period` blocks.
    ///
    /// The period is rounded up to a power of two in `[4, 65536]` and the
    /// phase is quantized so the era fits in two bytes.
    pub fn mortal(period: u64, current_block: u64) -> Self {
        let period = period.checked_next_power_of_two().unwrap_or(1 << 16).clamp(4, 1 << 16);
        let phase = current_block % period;
        let quantize_factor = (period >> 12).max(1);
        let quantized_phase = phase / quantize_factor * quantize_factor;

        Era::Mortal {
            period,
            phase: quantized_phase,
        }
    }

    pub fn is_immortal(&self) -> bool {
        matches!(self, Era::Immortal)
    }
}

/// A single runtime call addressed by pallet and function name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub module: String,
    pub function: String,
    /// SCALE-encoded call arguments
    pub args: Vec<u8>,
}

impl Call {
    pub fn new(module: impl Into<String>, function: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args,
        }
    }
}

/// Node-assigned transaction hash, kept exactly as the node reported it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtrinsicHash(String);

impl ExtrinsicHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtrinsicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dispatch weight as reported by `payment_queryInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Weight {
    #[serde(rename_all = "camelCase")]
    V2 { ref_time: u64, proof_size: u64 },
    Legacy(u64),
}

impl Weight {
    pub fn ref_time(&self) -> u64 {
        match self {
            Weight::V2 { ref_time, .. } => *ref_time,
            Weight::Legacy(weight) => *weight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchClass {
    Normal,
    Operational,
    Mandatory,
}

/// Fee information for an extrinsic (`RuntimeDispatchInfo`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeInfo {
    pub weight: Weight,
    pub class: DispatchClass,
    #[serde(deserialize_with = "deserialize_balance")]
    pub partial_fee: u128,
}

/// Balances arrive as decimal strings, hex strings or plain numbers.
fn deserialize_balance<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Balance {
        Number(u64),
        Text(String),
    }

    match Balance::deserialize(deserializer)? {
        Balance::Number(value) => Ok(value as u128),
        Balance::Text(text) => {
            let parsed = match text.strip_prefix("0x") {
                Some(hex_digits) => u128::from_str_radix(hex_digits, 16),
                None => text.parse::<u128>(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("invalid balance {}: {}", text, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_info_v2_weight() {
        let json = r#"{"weight":{"refTime":160123000,"proofSize":3593},"class":"normal","partialFee":"15600000123"}"#;
        let info: FeeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.weight.ref_time(), 160_123_000);
        assert_eq!(info.class, DispatchClass::Normal);
        assert_eq!(info.partial_fee, 15_600_000_123);
    }

    #[test]
    fn test_fee_info_legacy_weight_numeric_fee() {
        let json = r#"{"weight":195000000,"class":"operational","partialFee":1000}"#;
        let info: FeeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.weight, Weight::Legacy(195_000_000));
        assert_eq!(info.partial_fee, 1000);
    }

    #[test]
    fn test_fee_info_hex_fee() {
        let json = r#"{"weight":1,"class":"mandatory","partialFee":"0x10"}"#;
        let info: FeeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.partial_fee, 16);
    }

    #[test]
    fn test_mortal_era_rounding() {
        assert_eq!(Era::mortal(64, 42), Era::Mortal { period: 64, phase: 42 });
        assert_eq!(Era::mortal(100, 300), Era::Mortal { period: 128, phase: 44 });
        assert_eq!(Era::mortal(1, 7), Era::Mortal { period: 4, phase: 3 });
        // 2^16 period quantizes the phase by 16
        assert_eq!(
            Era::mortal(1 << 20, 70_001),
            Era::Mortal { period: 1 << 16, phase: 4464 }
        );
    }

    #[test]
    fn test_signature_length_checked() {
        assert!(MultiSignature::new(CryptoType::Ecdsa, vec![1; 64]).is_err());
        let sig = MultiSignature::new(CryptoType::Ecdsa, vec![1; 65]).unwrap();
        assert_eq!(sig.crypto_type().multi_signature_index(), 2);
    }
}
