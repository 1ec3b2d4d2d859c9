// Copyright (c) 2023-2025 The Mesh Foundation

//! Marble parameter templating.
//!
//! Manifest parameter values may embed `{{ Name }}` placeholders drawn from a
//! fixed vocabulary. The vocabulary is enforced when the manifest is checked,
//! so expansion at activation time cannot fail on a policy typo.

use displaydoc::Display;
use hkdf::Hkdf;
use sha2::Sha256;

/// Placeholder names a manifest template may reference.
const VOCABULARY: &[&str] = &["MarbleName", "Certificate", "RootCA", "SealKey"];

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// An error in a parameter template.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum TemplateError {
    /// unknown placeholder {0}
    UnknownPlaceholder(String),
    /// unterminated placeholder
    Unterminated,
}

/// The values substituted into a marble's parameters during activation.
#[derive(Clone, Debug)]
pub struct Substitutions {
    /// The marble's manifest name.
    pub marble_name: String,
    /// PEM leaf certificate issued during this activation.
    pub certificate: String,
    /// PEM Coordinator root certificate.
    pub root_ca: String,
    /// Hex-encoded per-marble sealing key.
    pub seal_key: String,
}

impl Substitutions {
    fn get(&self, name: &str) -> Option<&str> {
        match name {
            "MarbleName" => Some(&self.marble_name),
            "Certificate" => Some(&self.certificate),
            "RootCA" => Some(&self.root_ca),
            "SealKey" => Some(&self.seal_key),
            _ => None,
        }
    }
}

/// Derive the per-marble sealing key from the Coordinator master secret.
pub fn derive_seal_key(master_secret: &[u8; 32], marble_name: &str) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, master_secret);
    let mut key = [0u8; 32];
    hkdf.expand(marble_name.as_bytes(), &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Scan `template` and verify every placeholder is in the vocabulary.
pub fn check(template: &str) -> Result<(), TemplateError> {
    walk(template, |name| {
        if VOCABULARY.contains(&name) {
            Ok(String::new())
        } else {
            Err(TemplateError::UnknownPlaceholder(name.into()))
        }
    })
    .map(|_| ())
}

/// Expand every placeholder in `template` from `substitutions`.
///
/// Vocabulary violations were rejected at manifest-check time; hitting one
/// here means the caller skipped [`check`].
pub fn expand(template: &str, substitutions: &Substitutions) -> Result<String, TemplateError> {
    walk(template, |name| {
        substitutions
            .get(name)
            .map(str::to_owned)
            .ok_or_else(|| TemplateError::UnknownPlaceholder(name.into()))
    })
}

fn walk<F>(template: &str, mut substitute: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Result<String, TemplateError>,
{
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open.find(CLOSE).ok_or(TemplateError::Unterminated)?;
        let name = after_open[..end].trim();
        output.push_str(&substitute(name)?);
        rest = &after_open[end + CLOSE.len()..];
    }
    output.push_str(rest);
    Ok(output)
}
