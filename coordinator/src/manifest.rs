// Copyright (c) 2023-2025 The Mesh Foundation

//! The manifest: the operator-signed policy document.
//!
//! A manifest declares the enclave packages the mesh trusts, the platform
//! infrastructures marbles may run on, the marble templates themselves, the
//! admin client certificates, and optional recovery keys. Parsing is strict
//! (unknown fields anywhere are rejected); the semantic rules live in
//! [`Manifest::check`].
//!
//! The manifest signature is SHA-256 over the exact bytes the operator
//! uploaded, never over a re-serialized form, so the Coordinator keeps the
//! original byte sequence alongside the parsed tree.

use crate::template::{self, TemplateError};
use displaydoc::Display;
use mesh_attest::{InfrastructureProperties, PackageProperties};
use mesh_crypto_identity::decode_certificate_pem;
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A package identity field, in the canonical order validation reports them.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq)]
pub enum PackageField {
    /// SignerID
    SignerId,
    /// ProductID
    ProductId,
    /// SecurityVersion
    SecurityVersion,
}

/// An error arising while parsing or validating a manifest.
#[derive(Debug, Display)]
pub enum ManifestError {
    /// manifest is not valid JSON: {0}
    Json(serde_json::Error),
    /// manifest does not contain marble package {0}
    MissingMarblePackage(String),
    /// manifest misses value for {field} in package {package}
    MissingPackageValue {
        /// The package missing a value.
        package: String,
        /// The first missing field in canonical order.
        field: PackageField,
    },
    /// manifest specifies both UniqueID *and* SignerID/ProductID/SecurityVersion in package {0}
    ConflictingPackageIdentity(String),
    /// manifest uses unknown placeholder {placeholder} in parameters of marble {marble}
    UnknownPlaceholder {
        /// The marble whose parameters are at fault.
        marble: String,
        /// The placeholder name outside the vocabulary.
        placeholder: String,
    },
    /// manifest contains an unterminated placeholder in parameters of marble {0}
    UnterminatedPlaceholder(String),
    /// manifest contains an invalid certificate for client {0}
    InvalidClientCertificate(String),
    /// manifest contains an invalid public key for recovery key {0}
    InvalidRecoveryKey(String),
}

impl From<serde_json::Error> for ManifestError {
    fn from(src: serde_json::Error) -> Self {
        Self::Json(src)
    }
}

/// An error rejecting an update manifest. The merge is all-or-nothing: any
/// of these leaves the installed manifest untouched.
#[derive(Debug, Display)]
pub enum UpdateError {
    /// update manifest is malformed: {0}
    Json(serde_json::Error),
    /// update manifest does not change any package
    Empty,
    /// update manifest references unknown package {0}
    UnknownPackage(String),
    /// package {0} has no security version to update
    NoSecurityVersion(String),
    /// security version of package {package} must increase strictly (current {current}, proposed {proposed})
    VersionNotIncreased {
        /// The package the update targets.
        package: String,
        /// The installed security version.
        current: u64,
        /// The version the update proposed.
        proposed: u64,
    },
}

impl From<serde_json::Error> for UpdateError {
    fn from(src: serde_json::Error) -> Self {
        Self::Json(src)
    }
}

/// A marble template: which package it must attest as and the parameters it
/// receives once admitted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Marble {
    /// Name of the package this marble must measure as.
    #[serde(rename = "Package")]
    pub package: String,
    /// Upper bound on successful activations; absent means unlimited.
    #[serde(
        rename = "MaxActivations",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_activations: Option<u64>,
    /// Templated runtime configuration handed out at activation.
    #[serde(rename = "Parameters", default)]
    pub parameters: Parameters,
}

/// Per-marble runtime configuration; every value is a template string.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    /// Files to place in the marble, keyed by path.
    #[serde(rename = "Files", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Environment variables.
    #[serde(rename = "Env", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Process arguments.
    #[serde(rename = "Argv", default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,
}

/// The parsed manifest tree. A pure value: clones freely, compares
/// structurally.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Enclave packages the mesh trusts.
    #[serde(rename = "Packages")]
    pub packages: BTreeMap<String, PackageProperties>,
    /// Platform profiles marbles may run on.
    #[serde(
        rename = "Infrastructures",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub infrastructures: BTreeMap<String, InfrastructureProperties>,
    /// Marble templates.
    #[serde(rename = "Marbles", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub marbles: BTreeMap<String, Marble>,
    /// Admin client certificates, PEM encoded.
    #[serde(rename = "Clients", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clients: BTreeMap<String, String>,
    /// Public keys authorized to recover sealed state, PEM encoded.
    #[serde(
        rename = "RecoveryKeys",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub recovery_keys: BTreeMap<String, String>,
}

/// A partial manifest whose only permitted effect is raising the
/// SecurityVersion of existing packages. Strict parsing rejects any attempt
/// to smuggle in other changes.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateManifest {
    /// Per-package version bumps.
    #[serde(rename = "Packages")]
    pub packages: BTreeMap<String, PackageUpdate>,
}

/// The one field an update may touch per package.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageUpdate {
    /// The proposed new security version.
    #[serde(rename = "SecurityVersion")]
    pub security_version: u64,
}

/// SHA-256 over the operator-supplied manifest bytes.
pub fn compute_signature(raw: &[u8]) -> [u8; 32] {
    Sha256::digest(raw).into()
}

impl Manifest {
    /// Strict-parse a manifest from its JSON encoding.
    pub fn parse(raw: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Apply the semantic validation rules.
    ///
    /// Errors carry the offending package or marble name; the first failing
    /// rule in document order wins so operators get deterministic messages.
    pub fn check(&self) -> Result<(), ManifestError> {
        for (name, package) in &self.packages {
            if package.debug {
                continue;
            }
            let names_triple = package.signer_id.is_some()
                || package.product_id.is_some()
                || package.security_version.is_some();
            if package.unique_id.is_some() {
                if names_triple {
                    return Err(ManifestError::ConflictingPackageIdentity(name.clone()));
                }
                continue;
            }
            let missing = if package.signer_id.is_none() {
                Some(PackageField::SignerId)
            } else if package.product_id.is_none() {
                Some(PackageField::ProductId)
            } else if package.security_version.is_none() {
                Some(PackageField::SecurityVersion)
            } else {
                None
            };
            if let Some(field) = missing {
                return Err(ManifestError::MissingPackageValue {
                    package: name.clone(),
                    field,
                });
            }
        }

        for (name, marble) in &self.marbles {
            if !self.packages.contains_key(&marble.package) {
                return Err(ManifestError::MissingMarblePackage(marble.package.clone()));
            }
            let values = marble
                .parameters
                .files
                .values()
                .chain(marble.parameters.env.values())
                .chain(marble.parameters.argv.iter());
            for value in values {
                template::check(value).map_err(|err| match err {
                    TemplateError::UnknownPlaceholder(placeholder) => {
                        ManifestError::UnknownPlaceholder {
                            marble: name.clone(),
                            placeholder,
                        }
                    }
                    TemplateError::Unterminated => {
                        ManifestError::UnterminatedPlaceholder(name.clone())
                    }
                })?;
            }
        }

        for (name, pem) in &self.clients {
            decode_certificate_pem(pem)
                .map_err(|_| ManifestError::InvalidClientCertificate(name.clone()))?;
        }

        for (name, pem) in &self.recovery_keys {
            p256::PublicKey::from_public_key_pem(pem)
                .map_err(|_| ManifestError::InvalidRecoveryKey(name.clone()))?;
        }

        Ok(())
    }

    /// Merge an update manifest, raising package security versions.
    ///
    /// Validates every referenced package before mutating anything, so a
    /// rejected update leaves the manifest byte-for-byte identical. Returns
    /// the applied bumps as (package, new version) pairs in name order.
    pub fn apply_update(
        &mut self,
        update: &UpdateManifest,
    ) -> Result<Vec<(String, u64)>, UpdateError> {
        if update.packages.is_empty() {
            return Err(UpdateError::Empty);
        }

        for (name, bump) in &update.packages {
            let package = self
                .packages
                .get(name)
                .ok_or_else(|| UpdateError::UnknownPackage(name.clone()))?;
            let current = package
                .security_version
                .ok_or_else(|| UpdateError::NoSecurityVersion(name.clone()))?;
            if bump.security_version <= current {
                return Err(UpdateError::VersionNotIncreased {
                    package: name.clone(),
                    current,
                    proposed: bump.security_version,
                });
            }
        }

        let mut applied = Vec::with_capacity(update.packages.len());
        for (name, bump) in &update.packages {
            let package = self
                .packages
                .get_mut(name)
                .expect("update packages were validated above");
            package.security_version = Some(bump.security_version);
            applied.push((name.clone(), bump.security_version));
        }
        Ok(applied)
    }
}

impl UpdateManifest {
    /// Strict-parse an update manifest from its JSON encoding.
    pub fn parse(raw: &[u8]) -> Result<Self, UpdateError> {
        Ok(serde_json::from_slice(raw)?)
    }
}
