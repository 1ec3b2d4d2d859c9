// Copyright (c) 2023-2025 The Mesh Foundation

//! Errors surfaced by the Coordinator core.

use crate::{
    manifest::{ManifestError, UpdateError},
    recovery::RecoveryError,
    seal::SealError,
    state::State,
};
use displaydoc::Display;
use mesh_attest::QuoteError;
use mesh_crypto_identity::IdentityError;

/// An error returned by a Coordinator operation. The wire representation is
/// the transport layer's concern; the core only guarantees a stable kind and
/// a human message.
#[derive(Debug, Display)]
pub enum CoordinatorError {
    /// operation not allowed in state: {0}
    InvalidState(State),
    /// manifest already set
    ManifestAlreadySet,
    /// could not parse manifest: {0}
    ManifestParse(serde_json::Error),
    /// {0}
    ManifestValidation(ManifestError),
    /// manifest update rejected: {0}
    UpdateRejected(UpdateError),
    /// quote verification failed: {0}
    Attestation(QuoteError),
    /// unknown marble {0}
    UnknownMarble(String),
    /// marble {0} has exhausted its activation limit
    ActivationLimitExceeded(String),
    /// client certificate is not authorized for administration
    Auth,
    /// recovery failed: {0}
    Recovery(RecoveryError),
    /// sealing failure: {0}
    Seal(SealError),
    /// failed to issue marble certificate: {0}
    CertificateIssuance(IdentityError),
    /// internal error: {0}
    Internal(String),
}

impl From<ManifestError> for CoordinatorError {
    fn from(src: ManifestError) -> Self {
        match src {
            ManifestError::Json(err) => Self::ManifestParse(err),
            other => Self::ManifestValidation(other),
        }
    }
}

impl From<UpdateError> for CoordinatorError {
    fn from(src: UpdateError) -> Self {
        Self::UpdateRejected(src)
    }
}

impl From<QuoteError> for CoordinatorError {
    fn from(src: QuoteError) -> Self {
        Self::Attestation(src)
    }
}

impl From<RecoveryError> for CoordinatorError {
    fn from(src: RecoveryError) -> Self {
        Self::Recovery(src)
    }
}

impl From<SealError> for CoordinatorError {
    fn from(src: SealError) -> Self {
        Self::Seal(src)
    }
}

impl From<IdentityError> for CoordinatorError {
    fn from(src: IdentityError) -> Self {
        Self::CertificateIssuance(src)
    }
}
