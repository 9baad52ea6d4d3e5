//! SCALE encoding of calls, signing payloads and signed extrinsics
//!
//! Layout follows extrinsic format v4 with the default signed extensions
//! (era, nonce, tip in the body; spec version, transaction version, genesis
//! hash and era birth hash as additional signed data).

use super::builder::ExtrinsicBuilder;
use super::types::{AccountId, Era, ExtrinsicHash, MultiSignature};
use crate::error::{ExtrinsicError, ExtrinsicResult};
use crate::runtime::RuntimeMetadata;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

const EXTRINSIC_VERSION: u8 = 4;
const SIGNED_BIT: u8 = 0b1000_0000;
const MULTI_ADDRESS_ID: u8 = 0;
const UTILITY_MODULE: &str = "Utility";

/// Payloads longer than this are hashed before signing
const MAX_UNHASHED_PAYLOAD: usize = 256;

type Blake2b256 = Blake2b<U32>;

pub fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b256::digest(data));
    out
}

/// Hash the node will report for an encoded extrinsic
pub fn extrinsic_hash(encoded: &[u8]) -> ExtrinsicHash {
    ExtrinsicHash::from_bytes(&blake2_256(encoded))
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// SCALE compact integer encoding
pub fn encode_compact(value: u128, out: &mut Vec<u8>) {
    match value {
        0..=0x3f => out.push((value as u8) << 2),
        0x40..=0x3fff => out.extend_from_slice(&(((value as u16) << 2) | 0b01).to_le_bytes()),
        0x4000..=0x3fff_ffff => {
            out.extend_from_slice(&(((value as u32) << 2) | 0b10).to_le_bytes())
        }
        _ => {
            let bytes = value.to_le_bytes();
            let significant = (16 - value.leading_zeros() as usize / 8).max(4);
            out.push((((significant - 4) as u8) << 2) | 0b11);
            out.extend_from_slice(&bytes[..significant]);
        }
    }
}

pub fn encode_era(era: Era, out: &mut Vec<u8>) {
    match era {
        Era::Immortal => out.push(0),
        Era::Mortal { period, phase } => {
            let quantize_factor = (period >> 12).max(1);
            let low = (period.trailing_zeros().saturating_sub(1)).clamp(1, 15) as u16;
            let encoded = low | (((phase / quantize_factor) as u16) << 4);
            out.extend_from_slice(&encoded.to_le_bytes());
        }
    }
}

fn call_index(metadata: &RuntimeMetadata, module: &str, function: &str) -> ExtrinsicResult<[u8; 2]> {
    metadata.call_index(module, function).ok_or_else(|| {
        ExtrinsicError::Encoding(format!(
            "call {}.{} not found in runtime {}",
            module, function, metadata.spec_version
        ))
    })
}

/// Encode the builder's calls, wrapping several of them in a utility batch
pub fn encode_call(metadata: &RuntimeMetadata, builder: &ExtrinsicBuilder) -> ExtrinsicResult<Vec<u8>> {
    builder.validate()?;

    let calls = builder.calls();
    let mut encoded_calls = Vec::with_capacity(calls.len());
    for call in calls {
        let mut encoded = call_index(metadata, &call.module, &call.function)?.to_vec();
        encoded.extend_from_slice(&call.args);
        encoded_calls.push(encoded);
    }

    if encoded_calls.len() == 1 {
        return Ok(encoded_calls.remove(0));
    }

    let mut batch = call_index(metadata, UTILITY_MODULE, builder.batch_type().function_name())?.to_vec();
    encode_compact(encoded_calls.len() as u128, &mut batch);
    for encoded in encoded_calls {
        batch.extend_from_slice(&encoded);
    }
    Ok(batch)
}

fn encode_extra(builder: &ExtrinsicBuilder, out: &mut Vec<u8>) {
    encode_era(builder.era(), out);
    encode_compact(builder.nonce() as u128, out);
    encode_compact(builder.tip(), out);
}

/// Bytes handed to the signer
pub fn signing_payload(metadata: &RuntimeMetadata, builder: &ExtrinsicBuilder) -> ExtrinsicResult<Vec<u8>> {
    let mut payload = encode_call(metadata, builder)?;
    encode_extra(builder, &mut payload);
    payload.extend_from_slice(&metadata.spec_version.to_le_bytes());
    payload.extend_from_slice(&metadata.transaction_version.to_le_bytes());
    payload.extend_from_slice(&metadata.genesis_hash);
    let birth_hash = match builder.era() {
        Era::Immortal => metadata.genesis_hash,
        Era::Mortal { .. } => builder.era_block_hash().ok_or_else(|| {
            ExtrinsicError::Builder("mortal era requires the birth block hash".to_string())
        })?,
    };
    payload.extend_from_slice(&birth_hash);

    if payload.len() > MAX_UNHASHED_PAYLOAD {
        return Ok(blake2_256(&payload).to_vec());
    }
    Ok(payload)
}

/// Length-prefixed signed extrinsic
pub fn encode_signed(
    metadata: &RuntimeMetadata,
    builder: &ExtrinsicBuilder,
    account: &AccountId,
    signature: &MultiSignature,
) -> ExtrinsicResult<Vec<u8>> {
    let call = encode_call(metadata, builder)?;

    let mut body = Vec::with_capacity(call.len() + 110);
    body.push(SIGNED_BIT | EXTRINSIC_VERSION);
    body.push(MULTI_ADDRESS_ID);
    body.extend_from_slice(account);
    body.push(signature.crypto_type().multi_signature_index());
    body.extend_from_slice(signature.as_bytes());
    encode_extra(builder, &mut body);
    body.extend_from_slice(&call);

    let mut encoded = Vec::with_capacity(body.len() + 4);
    encode_compact(body.len() as u128, &mut encoded);
    encoded.extend_from_slice(&body);
    Ok(encoded)
}
