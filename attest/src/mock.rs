// Copyright (c) 2023-2025 The Mesh Foundation

//! Reference quote capability doubles for tests.
//!
//! The issuer quotes a message by hashing it; the validator holds a fixture
//! table keyed by quote bytes and accepts a quote only when message, package
//! requirements, and infrastructure requirements all equal the stored
//! fixture.

use crate::{
    InfrastructureProperties, PackageProperties, QuoteError, QuoteIssuer, QuoteValidator,
};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// A mock quote issuer whose quotes are SHA-256 digests of the message.
#[derive(Clone, Debug, Default)]
pub struct MockQuoteIssuer;

impl MockQuoteIssuer {
    /// Create a new mock issuer.
    pub fn new() -> Self {
        Self
    }
}

impl QuoteIssuer for MockQuoteIssuer {
    fn issue(&self, message: &[u8]) -> Result<Vec<u8>, QuoteError> {
        Ok(Sha256::digest(message).to_vec())
    }
}

#[derive(Clone, Debug)]
struct Fixture {
    message: Vec<u8>,
    package: PackageProperties,
    infrastructure: InfrastructureProperties,
}

/// A mock quote validator backed by an explicit fixture table.
///
/// Clones share the table, so a test can keep one handle while the
/// Coordinator owns another and registered quotes are visible to both.
#[derive(Clone, Debug, Default)]
pub struct MockQuoteValidator {
    valid: Arc<Mutex<HashMap<Vec<u8>, Fixture>>>,
}

impl MockQuoteValidator {
    /// Create a new mock validator with an empty fixture table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `quote` as valid for the given message and requirements.
    pub fn add_valid_quote(
        &self,
        quote: &[u8],
        message: &[u8],
        package: PackageProperties,
        infrastructure: InfrastructureProperties,
    ) {
        self.valid.lock().expect("mutex poisoned").insert(
            quote.to_vec(),
            Fixture {
                message: message.to_vec(),
                package,
                infrastructure,
            },
        );
    }
}

impl QuoteValidator for MockQuoteValidator {
    fn validate(
        &self,
        quote: &[u8],
        message: &[u8],
        package: &PackageProperties,
        infrastructure: &InfrastructureProperties,
    ) -> Result<(), QuoteError> {
        let valid = self.valid.lock().expect("mutex poisoned");
        let fixture = valid.get(quote).ok_or(QuoteError::UnknownQuote)?;
        if fixture.message != message {
            return Err(QuoteError::MessageMismatch);
        }
        if &fixture.package != package {
            return Err(QuoteError::PackageMismatch);
        }
        if &fixture.infrastructure != infrastructure {
            return Err(QuoteError::InfrastructureMismatch);
        }
        Ok(())
    }
}
