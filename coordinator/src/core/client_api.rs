// Copyright (c) 2023-2025 The Mesh Foundation

//! Admin-facing operations.
//!
//! The transport terminates the admin's mTLS connection and hands the peer
//! certificate chain (DER, leaf first) into these methods; the core decides.

use super::{Coordinator, InstalledManifest, BOOTSTRAP_ADMIN};
use crate::{
    error::CoordinatorError,
    manifest::{self, Manifest, UpdateManifest},
    recovery,
    seal,
    state::State,
    update_log::UpdateAction,
};
use const_oid::db::rfc4519::CN;
use der::asn1::{PrintableStringRef, Utf8StringRef};
use der::Decode;
use mesh_attest::{QuoteIssuer, QuoteValidator};
use mesh_common::logger::log;
use mesh_crypto_identity::{decode_certificate_pem, Identity};
use rand_core::OsRng;
use std::collections::BTreeMap;
use x509_cert::Certificate;
use zeroize::Zeroizing;

impl<I: QuoteIssuer, V: QuoteValidator> Coordinator<I, V> {
    /// Install the initial manifest.
    ///
    /// Only legal in `AcceptingManifest`. On success the state moves to
    /// `AcceptingMarbles`, an audit entry is appended, and — when the
    /// manifest declares recovery keys — a fresh recovery secret is wrapped
    /// to each key and returned by key name. A rejected manifest leaves all
    /// state untouched, so the next attempt may succeed.
    pub fn set_manifest(
        &self,
        raw: &[u8],
    ) -> Result<BTreeMap<String, Vec<u8>>, CoordinatorError> {
        let mut inner = self.lock();
        match inner.state {
            State::AcceptingManifest => {}
            State::AcceptingMarbles => return Err(CoordinatorError::ManifestAlreadySet),
            State::Recovery => return Err(CoordinatorError::InvalidState(inner.state)),
        }

        let parsed = Manifest::parse(raw)?;
        parsed.check()?;

        let mut rng = OsRng;
        let secret = recovery::generate_secret(&mut rng);
        let mut wrapped = BTreeMap::new();
        for (name, pem) in &parsed.recovery_keys {
            let blob = recovery::wrap_secret(name, pem, secret.as_slice(), &mut rng)
                .map_err(|err| {
                    CoordinatorError::Internal(format!(
                        "wrapping recovery secret for {name}: {err}"
                    ))
                })?;
            wrapped.insert(name.clone(), blob);
        }

        let digest = manifest::compute_signature(raw);
        inner.update_log.append(
            BOOTSTRAP_ADMIN,
            UpdateAction::ManifestSet {
                digest: hex::encode(digest),
            },
        );
        inner.manifest = Some(InstalledManifest {
            manifest: parsed,
            raw: raw.to_vec(),
        });
        inner.sealing_key = Some(secret);
        inner.state = State::AcceptingMarbles;

        log::info!(self.logger(), "manifest installed, accepting marbles");
        Ok(wrapped)
    }

    /// SHA-256 over the bytes accepted by the successful `set_manifest`, or
    /// `None` before one.
    pub fn get_manifest_signature(&self) -> Option<[u8; 32]> {
        self.lock()
            .manifest
            .as_ref()
            .map(|installed| manifest::compute_signature(&installed.raw))
    }

    /// Whether the peer chain's leaf certificate is declared under `Clients`
    /// in the current manifest. The comparison is an exact DER compare; an
    /// empty chain (or no manifest) is never authorized.
    pub fn verify_admin(&self, peer_cert_chain: &[Vec<u8>]) -> bool {
        let inner = self.lock();
        let Some(installed) = inner.manifest.as_ref() else {
            return false;
        };
        admin_entry(&installed.manifest, peer_cert_chain).is_some()
    }

    /// Apply an update manifest on behalf of an authenticated admin.
    ///
    /// The caller must present the same chain `verify_admin` accepted; the
    /// admin's subject common name goes into the audit log. The merge is
    /// all-or-nothing per the manifest rules; already-activated marbles are
    /// not re-validated.
    pub fn update_manifest(
        &self,
        raw: &[u8],
        peer_cert_chain: &[Vec<u8>],
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.lock();
        if inner.state != State::AcceptingMarbles {
            return Err(CoordinatorError::InvalidState(inner.state));
        }

        let installed = inner
            .manifest
            .as_mut()
            .expect("manifest is present while accepting marbles");
        let admin =
            admin_entry(&installed.manifest, peer_cert_chain).ok_or(CoordinatorError::Auth)?;

        let update = UpdateManifest::parse(raw)?;
        let applied = installed.manifest.apply_update(&update)?;

        for (package, security_version) in &applied {
            inner.update_log.append(
                &admin,
                UpdateAction::PackageUpdated {
                    package: package.clone(),
                    security_version: *security_version,
                },
            );
        }
        log::info!(
            self.logger(),
            "manifest updated by {}: {} package(s) raised",
            admin,
            applied.len()
        );
        Ok(())
    }

    /// Render the audit log, one committed mutation per line.
    pub fn update_log(&self) -> String {
        self.lock().update_log.render()
    }

    /// Restore sealed state with an unwrapped recovery secret.
    ///
    /// Only legal in `Recovery`. `signature` must be a DER ECDSA signature
    /// over `secret` under one of the recovery keys named by the sealed
    /// blob's header. On success the full pre-failure state (identity,
    /// manifest, activation counters, audit log) is restored and the
    /// Coordinator resumes in the sealed state; on failure it stays in
    /// `Recovery` for another attempt.
    pub fn recover(&self, secret: &[u8], signature: &[u8]) -> Result<(), CoordinatorError> {
        let mut inner = self.lock();
        if inner.state != State::Recovery {
            return Err(CoordinatorError::InvalidState(inner.state));
        }
        let pending = inner
            .pending_recovery
            .as_ref()
            .ok_or(CoordinatorError::Recovery(
                recovery::RecoveryError::NothingToRecover,
            ))?;

        let signer = recovery::find_signer(&pending.header.recovery_keys, secret, signature)?;
        let key = <[u8; 32]>::try_from(secret)
            .map_err(|_| CoordinatorError::Recovery(recovery::RecoveryError::SecretLength))?;
        let sealed = seal::unseal(&pending.blob, &key)
            .map_err(|_| CoordinatorError::Recovery(recovery::RecoveryError::WrongSecret))?;

        let identity = Identity::from_parts(&sealed.identity_key, &sealed.identity_cert)
            .map_err(|err| CoordinatorError::Internal(format!("restoring identity: {err}")))?;
        let quote = self.issuer().issue(identity.certificate_der())?;
        let parsed = Manifest::parse(&sealed.manifest_bytes)
            .map_err(|err| CoordinatorError::Internal(format!("restoring manifest: {err}")))?;

        inner.identity = identity;
        inner.quote = quote;
        inner.manifest = Some(InstalledManifest {
            manifest: parsed,
            raw: sealed.manifest_bytes,
        });
        inner.activations = sealed.activations;
        inner.update_log = sealed.update_log;
        inner.master_secret = Zeroizing::new(sealed.master_secret);
        inner.sealing_key = Some(Zeroizing::new(key));
        inner.state = sealed.state;
        inner.pending_recovery = None;
        inner.update_log.append(
            &signer,
            UpdateAction::Recovered {
                key: signer.clone(),
            },
        );

        log::info!(self.logger(), "state recovered with key {}", signer);
        Ok(())
    }
}

/// Match the chain's leaf against the manifest's admin certificates,
/// returning the admin identity for the audit log: the certificate's subject
/// common name, or the manifest entry name when the subject carries no CN.
fn admin_entry(manifest: &Manifest, peer_cert_chain: &[Vec<u8>]) -> Option<String> {
    let leaf = peer_cert_chain.first()?;
    for (name, pem) in &manifest.clients {
        let Ok(der) = decode_certificate_pem(pem) else {
            continue;
        };
        if &der == leaf {
            return Some(subject_common_name(leaf).unwrap_or_else(|| name.clone()));
        }
    }
    None
}

fn subject_common_name(cert_der: &[u8]) -> Option<String> {
    let cert = Certificate::from_der(cert_der).ok()?;
    for rdn in cert.tbs_certificate.subject.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid != CN {
                continue;
            }
            if let Ok(value) = atv.value.decode_as::<Utf8StringRef>() {
                return Some(value.as_str().to_string());
            }
            if let Ok(value) = atv.value.decode_as::<PrintableStringRef>() {
                return Some(value.as_str().to_string());
            }
        }
    }
    None
}
