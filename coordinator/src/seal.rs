// Copyright (c) 2023-2025 The Mesh Foundation

//! Sealed-state blob layout.
//!
//! The persistence layer above the core stores one opaque blob. Its layout:
//! a 4-byte little-endian header length, a cleartext JSON header carrying the
//! manifest's recovery keys, a 12-byte nonce, and an AES-256-GCM ciphertext
//! of the serialized [`SealedState`]. The header stays readable when the
//! sealing key is lost, which is what makes the recovery handshake possible.

use crate::{state::State, update_log::UpdateLog};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use displaydoc::Display;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const NONCE_LEN: usize = 12;

/// An error handling a sealed blob.
#[derive(Debug, Display)]
pub enum SealError {
    /// sealed blob is truncated
    Truncated,
    /// sealed blob header is malformed: {0}
    Header(serde_json::Error),
    /// sealed state payload is malformed: {0}
    Payload(serde_json::Error),
    /// sealed state could not be decrypted
    Decrypt,
    /// sealed state could not be encrypted
    Encrypt,
}

/// Cleartext prefix of the sealed blob.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RecoveryHeader {
    /// Recovery keys of the sealed manifest, name to PEM public key.
    pub recovery_keys: BTreeMap<String, String>,
}

/// Everything the Coordinator needs to resume after a restart.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SealedState {
    /// Identity private key, PKCS#8 DER.
    pub identity_key: Vec<u8>,
    /// Identity certificate, DER.
    pub identity_cert: Vec<u8>,
    /// The manifest bytes as the operator uploaded them.
    pub manifest_bytes: Vec<u8>,
    /// Per-marble activation counters.
    pub activations: BTreeMap<String, u64>,
    /// The audit log.
    pub update_log: UpdateLog,
    /// Master secret for per-marble key derivation.
    pub master_secret: [u8; 32],
    /// The state to resume in.
    pub state: State,
}

/// Seal `state` under `key`, prefixing the cleartext `header`.
pub fn seal<R: CryptoRng + RngCore>(
    state: &SealedState,
    header: &RecoveryHeader,
    key: &[u8; 32],
    rng: &mut R,
) -> Result<Vec<u8>, SealError> {
    let header_json = serde_json::to_vec(header).map_err(SealError::Header)?;
    let payload = serde_json::to_vec(state).map_err(SealError::Payload)?;

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::Encrypt)?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload.as_slice())
        .map_err(|_| SealError::Encrypt)?;

    let mut blob =
        Vec::with_capacity(4 + header_json.len() + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
    blob.extend_from_slice(&header_json);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Read the cleartext header, returning it and the remaining sealed bytes.
pub fn parse_header(blob: &[u8]) -> Result<(RecoveryHeader, &[u8]), SealError> {
    if blob.len() < 4 {
        return Err(SealError::Truncated);
    }
    let header_len = u32::from_le_bytes(blob[..4].try_into().expect("4 bytes")) as usize;
    let rest = &blob[4..];
    if rest.len() < header_len {
        return Err(SealError::Truncated);
    }
    let header = serde_json::from_slice(&rest[..header_len]).map_err(SealError::Header)?;
    Ok((header, &rest[header_len..]))
}

/// Decrypt and deserialize a sealed blob.
pub fn unseal(blob: &[u8], key: &[u8; 32]) -> Result<SealedState, SealError> {
    let (_, sealed) = parse_header(blob)?;
    if sealed.len() < NONCE_LEN {
        return Err(SealError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::Decrypt)?;
    let payload = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::Decrypt)?;
    serde_json::from_slice(&payload).map_err(SealError::Payload)
}
