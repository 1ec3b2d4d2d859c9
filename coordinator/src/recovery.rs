// Copyright (c) 2023-2025 The Mesh Foundation

//! Recovery secrets.
//!
//! The recovery secret is the Coordinator's sealing key. When the manifest
//! declares recovery keys, `set_manifest` wraps the secret to each of them
//! with an ECIES construction (ephemeral P-256 ECDH, HKDF-SHA256, AES-256-GCM)
//! and hands the wrapped blobs back to the operator. A key holder later
//! proves authorization by signing the unwrapped secret; the Coordinator
//! checks the signature against the recovery keys kept in the sealed blob's
//! cleartext header.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use displaydoc::Display;
use hkdf::Hkdf;
use p256::{
    ecdh::{diffie_hellman, EphemeralSecret},
    ecdsa::{DerSignature, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    pkcs8::DecodePublicKey,
    PublicKey, SecretKey,
};
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use signature::Verifier;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

const HKDF_INFO: &[u8] = b"mesh-recovery";
const POINT_LEN: usize = 65;
const NONCE_LEN: usize = 12;

/// An error in recovery-secret handling.
#[derive(Debug, Display)]
pub enum RecoveryError {
    /// no recovery keys are declared in the manifest
    NoRecoveryKeys,
    /// recovery key {0} is not a valid P-256 public key
    InvalidKey(String),
    /// wrapped recovery secret is malformed
    MalformedBlob,
    /// recovery secret could not be unwrapped
    Unwrap,
    /// encryption failure while wrapping the recovery secret
    Wrap,
    /// recovery secret has the wrong length
    SecretLength,
    /// signature does not verify under any declared recovery key
    SignatureMismatch,
    /// sealed state could not be decrypted with the provided secret
    WrongSecret,
    /// there is no sealed state to recover
    NothingToRecover,
}

/// Generate a fresh 256-bit recovery secret (= sealing key).
pub fn generate_secret<R: CryptoRng + RngCore>(rng: &mut R) -> Zeroizing<[u8; 32]> {
    let mut secret = Zeroizing::new([0u8; 32]);
    rng.fill_bytes(&mut *secret);
    secret
}

fn derive_wrap_key(shared: &[u8]) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(HKDF_INFO, key.as_mut_slice())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Wrap `secret` to a PEM-encoded P-256 recovery public key.
///
/// Blob layout: ephemeral public key (SEC1 uncompressed, 65 bytes) followed
/// by a 12-byte nonce and the AES-256-GCM ciphertext.
pub fn wrap_secret<R: CryptoRng + RngCore>(
    key_name: &str,
    recovery_key_pem: &str,
    secret: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, RecoveryError> {
    let recovery_key = PublicKey::from_public_key_pem(recovery_key_pem)
        .map_err(|_| RecoveryError::InvalidKey(key_name.to_string()))?;

    let ephemeral = EphemeralSecret::random(rng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(&recovery_key);
    let wrap_key = derive_wrap_key(shared.raw_secret_bytes().as_slice());

    let cipher =
        Aes256Gcm::new_from_slice(wrap_key.as_slice()).map_err(|_| RecoveryError::Wrap)?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), secret)
        .map_err(|_| RecoveryError::Wrap)?;

    let mut blob = Vec::with_capacity(POINT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(ephemeral_point.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Unwrap a blob produced by [`wrap_secret`] with the recovery private key.
///
/// This is the key holder's half of the handshake; it lives here so the
/// admin tooling and the tests agree on the format.
pub fn unwrap_secret(
    recovery_key: &SecretKey,
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, RecoveryError> {
    if blob.len() < POINT_LEN + NONCE_LEN {
        return Err(RecoveryError::MalformedBlob);
    }
    let (point, rest) = blob.split_at(POINT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral =
        PublicKey::from_sec1_bytes(point).map_err(|_| RecoveryError::MalformedBlob)?;
    let shared = diffie_hellman(recovery_key.to_nonzero_scalar(), ephemeral.as_affine());
    let wrap_key = derive_wrap_key(shared.raw_secret_bytes().as_slice());

    let cipher =
        Aes256Gcm::new_from_slice(wrap_key.as_slice()).map_err(|_| RecoveryError::Unwrap)?;
    let secret = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| RecoveryError::Unwrap)?;
    Ok(Zeroizing::new(secret))
}

/// Find the recovery key under which `signature` verifies over `secret`.
///
/// Returns the key's manifest name. `signature` is a DER-encoded ECDSA
/// signature; keys that fail to parse are skipped so a single corrupt entry
/// cannot lock out the others.
pub fn find_signer(
    recovery_keys: &BTreeMap<String, String>,
    secret: &[u8],
    signature: &[u8],
) -> Result<String, RecoveryError> {
    if recovery_keys.is_empty() {
        return Err(RecoveryError::NoRecoveryKeys);
    }
    let signature =
        DerSignature::try_from(signature).map_err(|_| RecoveryError::SignatureMismatch)?;
    for (name, pem) in recovery_keys {
        let Ok(public_key) = PublicKey::from_public_key_pem(pem) else {
            continue;
        };
        if VerifyingKey::from(public_key)
            .verify(secret, &signature)
            .is_ok()
        {
            return Ok(name.clone());
        }
    }
    Err(RecoveryError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::{EncodePublicKey, LineEnding};
    use rand::rngs::OsRng;
    use signature::Signer;

    fn recovery_keypair() -> (SecretKey, String) {
        let secret_key = SecretKey::random(&mut OsRng);
        let pem = secret_key
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (secret_key, pem)
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let (private, pem) = recovery_keypair();
        let secret = generate_secret(&mut OsRng);

        let blob = wrap_secret("admin", &pem, secret.as_slice(), &mut OsRng).unwrap();
        let unwrapped = unwrap_secret(&private, &blob).unwrap();
        assert_eq!(unwrapped.as_slice(), secret.as_slice());
    }

    #[test]
    fn unwrap_with_the_wrong_key_fails() {
        let (_, pem) = recovery_keypair();
        let (other_private, _) = recovery_keypair();
        let secret = generate_secret(&mut OsRng);

        let blob = wrap_secret("admin", &pem, secret.as_slice(), &mut OsRng).unwrap();
        assert!(matches!(
            unwrap_secret(&other_private, &blob),
            Err(RecoveryError::Unwrap)
        ));
    }

    #[test]
    fn wrapping_to_a_garbage_key_is_rejected() {
        let secret = generate_secret(&mut OsRng);
        assert!(matches!(
            wrap_secret("admin", "not a key", secret.as_slice(), &mut OsRng),
            Err(RecoveryError::InvalidKey(name)) if name == "admin"
        ));
    }

    #[test]
    fn find_signer_identifies_the_signing_key() {
        let (private, pem) = recovery_keypair();
        let (_, other_pem) = recovery_keypair();
        let keys = BTreeMap::from([
            ("admin".to_string(), pem),
            ("backup".to_string(), other_pem),
        ]);

        let secret = generate_secret(&mut OsRng);
        let signing_key = p256::ecdsa::SigningKey::from(&private);
        let signature: DerSignature = signing_key.sign(secret.as_slice());

        let signer = find_signer(&keys, secret.as_slice(), &signature.to_bytes()).unwrap();
        assert_eq!(signer, "admin");
    }

    #[test]
    fn find_signer_rejects_foreign_signatures() {
        let (_, pem) = recovery_keypair();
        let keys = BTreeMap::from([("admin".to_string(), pem)]);

        let secret = generate_secret(&mut OsRng);
        let foreign = p256::ecdsa::SigningKey::random(&mut OsRng);
        let signature: DerSignature = foreign.sign(secret.as_slice());

        assert!(matches!(
            find_signer(&keys, secret.as_slice(), &signature.to_bytes()),
            Err(RecoveryError::SignatureMismatch)
        ));

        assert!(matches!(
            find_signer(&BTreeMap::new(), secret.as_slice(), &signature.to_bytes()),
            Err(RecoveryError::NoRecoveryKeys)
        ));
    }
}
