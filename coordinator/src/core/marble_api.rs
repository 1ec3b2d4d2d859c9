// Copyright (c) 2023-2025 The Mesh Foundation

//! The marble activation engine.
//!
//! Activation is the admission handshake: a marble connects over mTLS with a
//! self-signed certificate, presents a quote binding that certificate to its
//! enclave, and asks for its mesh identity. Every step runs under the
//! Coordinator mutex, so the attestation check, the activation-cap
//! accounting, and the certificate issuance are atomic with respect to
//! concurrent manifest updates. No partial activation is ever exposed:
//! failures after the cap increment roll the counter back.

use super::Coordinator;
use crate::{
    error::CoordinatorError,
    manifest::Parameters,
    state::State,
    template::{self, Substitutions, TemplateError},
};
use mesh_attest::{InfrastructureProperties, QuoteError, QuoteIssuer, QuoteValidator};
use mesh_common::logger::log;
use rand_core::OsRng;

/// What a marble submits to activate.
#[derive(Clone, Debug)]
pub struct ActivationRequest {
    /// DER certificate signing request for the marble's mesh identity.
    pub csr: Vec<u8>,
    /// The marble template name from the manifest.
    pub marble_name: String,
    /// Quote binding the marble's TLS certificate to its enclave.
    pub quote: Vec<u8>,
}

/// What an admitted marble receives.
#[derive(Clone, Debug)]
pub struct ActivationResponse {
    /// PEM leaf certificate signed by the Coordinator root CA.
    pub certificate: String,
    /// The marble's parameters with all placeholders expanded.
    pub parameters: Parameters,
}

impl<I: QuoteIssuer, V: QuoteValidator> Coordinator<I, V> {
    /// Admit a marble.
    ///
    /// `peer_cert_der` is the certificate the marble presented on the mTLS
    /// connection; the quote must bind exactly those bytes. Infrastructures
    /// are tried in name order and the first one the validator accepts wins;
    /// a manifest without infrastructures attests the package alone.
    pub fn activate(
        &self,
        request: &ActivationRequest,
        peer_cert_der: &[u8],
    ) -> Result<ActivationResponse, CoordinatorError> {
        let mut inner = self.lock();
        if inner.state != State::AcceptingMarbles {
            log::debug!(
                self.logger(),
                "rejecting activation of {} in state {}",
                request.marble_name,
                inner.state
            );
            return Err(CoordinatorError::InvalidState(inner.state));
        }

        let marble = {
            let installed = inner
                .manifest
                .as_ref()
                .expect("manifest is present while accepting marbles");
            let marble = installed
                .manifest
                .marbles
                .get(&request.marble_name)
                .cloned()
                .ok_or_else(|| CoordinatorError::UnknownMarble(request.marble_name.clone()))?;
            let package = installed.manifest.packages.get(&marble.package).ok_or_else(|| {
                CoordinatorError::Internal(format!(
                    "marble {} references package {} missing from the checked manifest",
                    request.marble_name, marble.package
                ))
            })?;

            let mut verdict = if installed.manifest.infrastructures.is_empty() {
                self.validator().validate(
                    &request.quote,
                    peer_cert_der,
                    package,
                    &InfrastructureProperties::default(),
                )
            } else {
                Err(QuoteError::UnknownQuote)
            };
            for infrastructure in installed.manifest.infrastructures.values() {
                if verdict.is_ok() {
                    break;
                }
                verdict = self.validator().validate(
                    &request.quote,
                    peer_cert_der,
                    package,
                    infrastructure,
                );
            }
            if let Err(err) = verdict {
                log::debug!(
                    self.logger(),
                    "quote rejected for {}: {}",
                    request.marble_name,
                    err
                );
                return Err(err.into());
            }
            marble
        };

        // Cap accounting and issuance are one critical section; the counter
        // rolls back if issuance fails so failed requests consume no capacity.
        let count = inner
            .activations
            .entry(request.marble_name.clone())
            .or_insert(0);
        *count += 1;
        if let Some(cap) = marble.max_activations {
            if *count > cap {
                *count -= 1;
                log::debug!(
                    self.logger(),
                    "marble {} hit its activation cap of {}",
                    request.marble_name,
                    cap
                );
                return Err(CoordinatorError::ActivationLimitExceeded(
                    request.marble_name.clone(),
                ));
            }
        }

        let issued = (|| -> Result<ActivationResponse, CoordinatorError> {
            let certificate = inner.identity.issue_leaf(
                &request.csr,
                self.organization(),
                &request.marble_name,
                &mut OsRng,
            )?;
            let substitutions = Substitutions {
                marble_name: request.marble_name.clone(),
                certificate: certificate.clone(),
                root_ca: inner.identity.certificate_pem().to_string(),
                seal_key: hex::encode(template::derive_seal_key(
                    &inner.master_secret,
                    &request.marble_name,
                )),
            };
            let parameters = expand_parameters(&marble.parameters, &substitutions)?;
            Ok(ActivationResponse {
                certificate,
                parameters,
            })
        })();

        match issued {
            Ok(response) => {
                log::info!(
                    self.logger(),
                    "activated marble {} ({} activation(s))",
                    request.marble_name,
                    inner.activations[&request.marble_name]
                );
                Ok(response)
            }
            Err(err) => {
                let count = inner
                    .activations
                    .get_mut(&request.marble_name)
                    .expect("counter was incremented above");
                *count -= 1;
                Err(err)
            }
        }
    }
}

fn expand_parameters(
    parameters: &Parameters,
    substitutions: &Substitutions,
) -> Result<Parameters, CoordinatorError> {
    // vocabulary violations are caught at manifest-check time, so a failure
    // here is a core invariant break, not a policy error
    let expand = |value: &str| {
        template::expand(value, substitutions).map_err(|err: TemplateError| {
            CoordinatorError::Internal(format!("template rejected after manifest check: {err}"))
        })
    };

    Ok(Parameters {
        files: parameters
            .files
            .iter()
            .map(|(path, value)| Ok((path.clone(), expand(value)?)))
            .collect::<Result<_, CoordinatorError>>()?,
        env: parameters
            .env
            .iter()
            .map(|(name, value)| Ok((name.clone(), expand(value)?)))
            .collect::<Result<_, CoordinatorError>>()?,
        argv: parameters
            .argv
            .iter()
            .map(|value| expand(value))
            .collect::<Result<_, CoordinatorError>>()?,
    })
}
