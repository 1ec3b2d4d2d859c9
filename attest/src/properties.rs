// Copyright (c) 2023-2025 The Mesh Foundation

//! Measurement requirement records.
//!
//! These are the values an operator writes into the manifest and the values a
//! [`QuoteValidator`](crate::QuoteValidator) enforces, so they live on the
//! attestation seam rather than in the manifest model. Field names follow the
//! manifest wire format; byte-valued fields are JSON arrays of integers of
//! the expected length.

use serde::{Deserialize, Serialize};

/// Measurement requirements identifying a class of enclaves.
///
/// A package is either identified by a unique enclave measurement
/// (`UniqueID`) or by the signer triple (`SignerID`, `ProductID`,
/// `SecurityVersion`). Mixing the two is a manifest validation error unless
/// the package is marked `Debug`. `MiscSelect` and `Attributes` are
/// supplemental platform-specific measurements an operator may pin in
/// addition to either identity.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PackageProperties {
    /// Unique enclave measurement.
    #[serde(rename = "UniqueID", default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<[u8; 32]>,
    /// Enclave signer measurement.
    #[serde(rename = "SignerID", default, skip_serializing_if = "Option::is_none")]
    pub signer_id: Option<[u8; 32]>,
    /// Product identifier assigned by the signer.
    #[serde(rename = "ProductID", default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u64>,
    /// Minimum security version of the enclave.
    #[serde(
        rename = "SecurityVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub security_version: Option<u64>,
    /// Required MISCSELECT bits.
    #[serde(rename = "MiscSelect", default, skip_serializing_if = "Option::is_none")]
    pub misc_select: Option<u32>,
    /// Required attribute flags.
    #[serde(rename = "Attributes", default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<[u8; 16]>,
    /// Debug packages skip measurement enforcement.
    #[serde(rename = "Debug", default, skip_serializing_if = "core::ops::Not::not")]
    pub debug: bool,
}

/// Platform measurement requirements naming where marbles may run.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InfrastructureProperties {
    /// Minimum quoting enclave security version.
    #[serde(rename = "QESVN", default, skip_serializing_if = "Option::is_none")]
    pub qe_svn: Option<u16>,
    /// Minimum provisioning certification enclave security version.
    #[serde(rename = "PCESVN", default, skip_serializing_if = "Option::is_none")]
    pub pce_svn: Option<u16>,
    /// Required CPU security version.
    #[serde(rename = "CPUSVN", default, skip_serializing_if = "Option::is_none")]
    pub cpu_svn: Option<[u8; 16]>,
    /// Attestation root certificate of the platform.
    #[serde(rename = "RootCA", default, skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<Vec<u8>>,
}
