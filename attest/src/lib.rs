// Copyright (c) 2023-2025 The Mesh Foundation

//! Quote capability seam.
//!
//! The Coordinator consumes enclave attestation through two small capability
//! contracts: a [`QuoteIssuer`] which binds a message to the local enclave
//! measurement, and a [`QuoteValidator`] which checks a remote quote against
//! the measurement requirements declared in the manifest. The concrete
//! platform driver lives behind this seam; the [`MockQuoteIssuer`] and
//! [`MockQuoteValidator`] doubles are what the test suites run against.

#![deny(missing_docs)]

mod mock;
mod properties;

pub use mock::{MockQuoteIssuer, MockQuoteValidator};
pub use properties::{InfrastructureProperties, PackageProperties};

use displaydoc::Display;

/// An error which can occur during quote issuance or validation.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum QuoteError {
    /// quote does not correspond to any known enclave
    UnknownQuote,
    /// quote was not issued over this message
    MessageMismatch,
    /// enclave measurements do not meet the package requirements
    PackageMismatch,
    /// platform measurements do not meet the infrastructure requirements
    InfrastructureMismatch,
    /// quote issuance failed: {0}
    Issue(String),
}

/// Binds a message to the identity of the local enclave.
pub trait QuoteIssuer {
    /// Produce a quote over `message`.
    ///
    /// The result is a pure function of `message` and the local enclave
    /// identity; callers may cache it for the lifetime of the message.
    fn issue(&self, message: &[u8]) -> Result<Vec<u8>, QuoteError>;
}

/// Verifies a remote quote against required measurements.
pub trait QuoteValidator {
    /// Check that `quote` binds `message` to an enclave satisfying `package`
    /// running on a platform satisfying `infrastructure`.
    fn validate(
        &self,
        quote: &[u8],
        message: &[u8],
        package: &PackageProperties,
        infrastructure: &InfrastructureProperties,
    ) -> Result<(), QuoteError>;
}
