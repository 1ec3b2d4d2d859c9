// Copyright (c) 2023-2025 The Mesh Foundation

//! The Coordinator itself.
//!
//! The Coordinator sits under the transport layer and implements the
//! decision half of every RPC. It is thread-safe: an `Arc<Coordinator>` can
//! be shared with any number of transport workers, and a single mutex over
//! the mutable state makes manifest installation, manifest updates, and
//! marble activation linearizable against each other.

mod client_api;
mod marble_api;

pub use marble_api::{ActivationRequest, ActivationResponse};

use crate::{
    error::CoordinatorError,
    manifest::Manifest,
    seal::{self, RecoveryHeader, SealedState},
    state::State,
    update_log::UpdateLog,
};
use mesh_attest::{QuoteIssuer, QuoteValidator};
use mesh_common::logger::{log, Logger};
use mesh_crypto_identity::Identity;
use rand_core::{OsRng, RngCore};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};
use zeroize::Zeroizing;

/// Common name carried by every Coordinator root certificate.
pub const COORDINATOR_CN: &str = "Mesh Coordinator";

/// Admin identity recorded for the initial manifest installation.
const BOOTSTRAP_ADMIN: &str = "bootstrap";

/// The accepted manifest, parsed tree plus the operator's exact bytes.
///
/// The signature endpoint hashes `raw`, never a re-serialization.
pub(crate) struct InstalledManifest {
    pub manifest: Manifest,
    pub raw: Vec<u8>,
}

/// A sealed blob we could not decrypt at startup, retained until an
/// authorized recovery-key holder restores it.
pub(crate) struct PendingRecovery {
    pub header: RecoveryHeader,
    pub blob: Vec<u8>,
}

/// Everything behind the Coordinator mutex.
pub(crate) struct Inner {
    pub identity: Identity,
    pub quote: Vec<u8>,
    pub state: State,
    pub manifest: Option<InstalledManifest>,
    pub activations: BTreeMap<String, u64>,
    pub update_log: UpdateLog,
    pub master_secret: Zeroizing<[u8; 32]>,
    pub sealing_key: Option<Zeroizing<[u8; 32]>>,
    pub pending_recovery: Option<PendingRecovery>,
}

/// The control-plane trust kernel.
pub struct Coordinator<I: QuoteIssuer, V: QuoteValidator> {
    organization: String,
    issuer: I,
    validator: V,
    inner: Mutex<Inner>,
    logger: Logger,
}

impl<I: QuoteIssuer, V: QuoteValidator> Coordinator<I, V> {
    /// Create a fresh Coordinator in the `AcceptingManifest` state.
    ///
    /// Generates the root identity, asks the quote issuer to bind the
    /// certificate to the local enclave, and caches both for the lifetime of
    /// the instance.
    pub fn new(
        organization: &str,
        validator: V,
        issuer: I,
        logger: Logger,
    ) -> Result<Self, CoordinatorError> {
        let mut rng = OsRng;
        let identity = Identity::create(organization, COORDINATOR_CN, &mut rng)
            .map_err(|err| CoordinatorError::Internal(format!("creating identity: {err}")))?;
        let quote = issuer.issue(identity.certificate_der())?;

        let mut master_secret = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut *master_secret);

        log::info!(logger, "coordinator identity created, accepting manifest");
        Ok(Self {
            organization: organization.to_string(),
            issuer,
            validator,
            inner: Mutex::new(Inner {
                identity,
                quote,
                state: State::AcceptingManifest,
                manifest: None,
                activations: BTreeMap::new(),
                update_log: UpdateLog::default(),
                master_secret,
                sealing_key: None,
                pending_recovery: None,
            }),
            logger,
        })
    }

    /// Resume from a sealed blob.
    ///
    /// With the right sealing key the full state is restored and the
    /// Coordinator comes up in the sealed state. Without one (or with a
    /// wrong one) a temporary identity is generated and the Coordinator
    /// enters `Recovery`, holding the blob until an authorized key holder
    /// calls [`recover`](Self::recover).
    pub fn from_sealed(
        organization: &str,
        validator: V,
        issuer: I,
        blob: &[u8],
        sealing_key: Option<&[u8]>,
        logger: Logger,
    ) -> Result<Self, CoordinatorError> {
        let (header, _) = seal::parse_header(blob)?;

        if let Some(key) = sealing_key {
            if let Ok(key) = <[u8; 32]>::try_from(key) {
                match seal::unseal(blob, &key) {
                    Ok(sealed) => {
                        return Self::restore(organization, validator, issuer, sealed, key, logger)
                    }
                    Err(err) => {
                        log::warn!(logger, "unsealing stored state failed: {}", err)
                    }
                }
            } else {
                log::warn!(logger, "stored sealing key has the wrong length");
            }
        }

        let mut rng = OsRng;
        let identity = Identity::create(organization, COORDINATOR_CN, &mut rng)
            .map_err(|err| CoordinatorError::Internal(format!("creating identity: {err}")))?;
        let quote = issuer.issue(identity.certificate_der())?;
        let mut master_secret = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut *master_secret);

        log::warn!(
            logger,
            "sealed state could not be unsealed, entering recovery"
        );
        Ok(Self {
            organization: organization.to_string(),
            issuer,
            validator,
            inner: Mutex::new(Inner {
                identity,
                quote,
                state: State::Recovery,
                manifest: None,
                activations: BTreeMap::new(),
                update_log: UpdateLog::default(),
                master_secret,
                sealing_key: None,
                pending_recovery: Some(PendingRecovery {
                    header,
                    blob: blob.to_vec(),
                }),
            }),
            logger,
        })
    }

    fn restore(
        organization: &str,
        validator: V,
        issuer: I,
        sealed: SealedState,
        key: [u8; 32],
        logger: Logger,
    ) -> Result<Self, CoordinatorError> {
        let identity = Identity::from_parts(&sealed.identity_key, &sealed.identity_cert)
            .map_err(|err| CoordinatorError::Internal(format!("restoring identity: {err}")))?;
        let quote = issuer.issue(identity.certificate_der())?;
        let manifest = Manifest::parse(&sealed.manifest_bytes)
            .map_err(|err| CoordinatorError::Internal(format!("restoring manifest: {err}")))?;

        log::info!(logger, "sealed state restored");
        Ok(Self {
            organization: organization.to_string(),
            issuer,
            validator,
            inner: Mutex::new(Inner {
                identity,
                quote,
                state: sealed.state,
                manifest: Some(InstalledManifest {
                    manifest,
                    raw: sealed.manifest_bytes,
                }),
                activations: sealed.activations,
                update_log: sealed.update_log,
                master_secret: Zeroizing::new(sealed.master_secret),
                sealing_key: Some(Zeroizing::new(key)),
                pending_recovery: None,
            }),
            logger,
        })
    }

    /// The Coordinator certificate (PEM) and the cached quote over its DER
    /// encoding. Available in every state so clients can pin the Coordinator
    /// before uploading policy.
    pub fn cert_quote(&self) -> (String, Vec<u8>) {
        let inner = self.lock();
        (
            inner.identity.certificate_pem().to_string(),
            inner.quote.clone(),
        )
    }

    /// The current state as a numeric code plus human-readable text.
    pub fn status(&self) -> (i64, String) {
        let state = self.lock().state;
        (state.code(), state.text().to_string())
    }

    /// Serialize and encrypt the current state for the persistence layer.
    ///
    /// Only meaningful once a manifest (and with it the sealing key) exists.
    pub fn seal_state(&self) -> Result<Vec<u8>, CoordinatorError> {
        let inner = self.lock();
        let key = inner
            .sealing_key
            .as_ref()
            .ok_or(CoordinatorError::InvalidState(inner.state))?;
        let installed = inner
            .manifest
            .as_ref()
            .ok_or(CoordinatorError::InvalidState(inner.state))?;

        let sealed = SealedState {
            identity_key: inner
                .identity
                .private_key_der()
                .map_err(|err| CoordinatorError::Internal(format!("sealing identity: {err}")))?,
            identity_cert: inner.identity.certificate_der().to_vec(),
            manifest_bytes: installed.raw.clone(),
            activations: inner.activations.clone(),
            update_log: inner.update_log.clone(),
            master_secret: *inner.master_secret,
            state: inner.state,
        };
        let header = RecoveryHeader {
            recovery_keys: installed.manifest.recovery_keys.clone(),
        };
        Ok(seal::seal(&sealed, &header, key, &mut OsRng)?)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("mutex poisoned")
    }

    pub(crate) fn organization(&self) -> &str {
        &self.organization
    }

    pub(crate) fn validator(&self) -> &V {
        &self.validator
    }

    pub(crate) fn issuer(&self) -> &I {
        &self.issuer
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }
}
