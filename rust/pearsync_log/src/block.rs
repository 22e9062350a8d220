//! Block wire codec, chained hashing and signatures.
//!
//! Wire frame:
//!   [frame_len:u32][msg_type:u8][seq:varint][payload_len:u32][payload][signature:64]
//!
//! `frame_len` counts everything after itself. `seq` is a minimal LEB128
//! varint (non-minimal encodings are rejected so that decode/encode is the
//! identity on valid frames). The signature is Ed25519 over
//! `prior_block_hash || seq_le || payload`; the chain hash of a block is
//! SHA-256 over the same bytes, and the genesis prior hash is all zeros.

use pearsync_core::keys::{Keypair, PublicKey, Signature, SIGNATURE_LEN};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// `msg_type` for a log block frame. The only type on the wire today;
/// kept so the frame layout has room for protocol evolution.
pub const MSG_TYPE_BLOCK: u8 = 1;

/// Prior hash of the first block in every log.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown message type {0}")]
    BadMsgType(u8),
    #[error("invalid varint")]
    BadVarint,
    #[error("frame has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("frame length mismatch: header says {header}, body is {body}")]
    LengthMismatch { header: usize, body: usize },
}

/// One signed log block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub seq: u64,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl Block {
    /// Sign a new block extending the chain whose tip hash is `prior_hash`.
    pub fn sign(keypair: &Keypair, prior_hash: &[u8; 32], seq: u64, payload: Vec<u8>) -> Self {
        let signature = keypair.sign(&signing_bytes(prior_hash, seq, &payload));
        Self {
            seq,
            payload,
            signature,
        }
    }

    /// Verify this block against its writer key and the prior chain hash.
    pub fn verify(&self, writer: &PublicKey, prior_hash: &[u8; 32]) -> bool {
        writer.verify(
            &signing_bytes(prior_hash, self.seq, &self.payload),
            &self.signature,
        )
    }

    /// Chain hash of this block, fed to the next block's signature.
    pub fn chain_hash(&self, prior_hash: &[u8; 32]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(signing_bytes(prior_hash, self.seq, &self.payload));
        h.finalize().into()
    }

    /// Encode as one wire frame (including the leading length field).
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + 10 + 4 + self.payload.len() + SIGNATURE_LEN);
        body.push(MSG_TYPE_BLOCK);
        write_varint(&mut body, self.seq);
        body.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.payload);
        body.extend_from_slice(self.signature.as_bytes());

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode one wire frame. The input must be exactly one frame.
    pub fn decode_frame(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let frame_len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        let body = &bytes[4..];
        if body.len() != frame_len {
            return Err(CodecError::LengthMismatch {
                header: frame_len,
                body: body.len(),
            });
        }
        Self::decode_body(body)
    }

    /// Decode a frame body (everything after the `frame_len` field).
    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        if body.is_empty() {
            return Err(CodecError::Truncated);
        }
        let msg_type = body[0];
        if msg_type != MSG_TYPE_BLOCK {
            return Err(CodecError::BadMsgType(msg_type));
        }
        let mut at = 1;

        let (seq, n) = read_varint(&body[at..]).ok_or(CodecError::BadVarint)?;
        at += n;

        if body.len() < at + 4 {
            return Err(CodecError::Truncated);
        }
        let payload_len =
            u32::from_le_bytes(body[at..at + 4].try_into().unwrap()) as usize;
        at += 4;

        if body.len() < at + payload_len + SIGNATURE_LEN {
            return Err(CodecError::Truncated);
        }
        let payload = body[at..at + payload_len].to_vec();
        at += payload_len;

        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&body[at..at + SIGNATURE_LEN]);
        at += SIGNATURE_LEN;

        if at != body.len() {
            return Err(CodecError::TrailingBytes(body.len() - at));
        }

        Ok(Self {
            seq,
            payload,
            signature: Signature(sig),
        })
    }
}

/// The byte string that is both signed and chained:
/// `prior_hash || seq_le || payload`.
fn signing_bytes(prior_hash: &[u8; 32], seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32 + 8 + payload.len());
    bytes.extend_from_slice(prior_hash);
    bytes.extend_from_slice(&seq.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Minimal LEB128 encoding.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a minimal LEB128 varint; returns `(value, bytes_consumed)`.
///
/// Non-minimal encodings (a redundant trailing zero group) are rejected so
/// that every valid frame has exactly one byte representation.
pub fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 || (shift == 63 && (byte & 0x7e) != 0) {
            return None; // overflow
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return None; // non-minimal
            }
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

// ===========================================================================
// Tests
// ===========================================================================
