// Copyright (c) 2023-2025 The Mesh Foundation

//! Sealing and recovery round trips: a Coordinator that cannot unseal its
//! state comes up in Recovery and an authorized key holder restores it.

use mesh_attest::{
    InfrastructureProperties, MockQuoteIssuer, MockQuoteValidator, PackageProperties, QuoteIssuer,
};
use mesh_common::logger::create_null_logger;
use mesh_coordinator::{
    recovery::unwrap_secret, state::State, ActivationRequest, Coordinator, CoordinatorError,
};
use der::{Decode, Encode};
use hex_literal::hex;
use p256::{
    ecdsa::{DerSignature, SigningKey},
    pkcs8::{EncodePublicKey, LineEnding},
    SecretKey,
};
use signature::Signer;
use std::{str::FromStr, time::Duration};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile, RequestBuilder},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

type TestCoordinator = Coordinator<MockQuoteIssuer, MockQuoteValidator>;

fn tikv_package() -> PackageProperties {
    PackageProperties {
        unique_id: Some(hex!(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
        )),
        ..Default::default()
    }
}

fn generate_marble_credentials() -> (Vec<u8>, Vec<u8>) {
    let secret = SecretKey::random(&mut rand::rngs::OsRng);
    let signing_key = SigningKey::from(&secret);
    let spki = SubjectPublicKeyInfoOwned::from_der(
        signing_key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes(),
    )
    .unwrap();
    let subject = Name::from_str("CN=unattested marble,O=Acme Inc.").unwrap();
    let builder = CertificateBuilder::new(
        Profile::Manual { issuer: None },
        SerialNumber::new(&[0x13, 0x37]).unwrap(),
        Validity::from_now(Duration::from_secs(3600)).unwrap(),
        subject.clone(),
        spki,
        &signing_key,
    )
    .unwrap();
    let cert_der = builder.build::<DerSignature>().unwrap().to_der().unwrap();
    let csr_builder = RequestBuilder::new(subject, &signing_key).unwrap();
    let csr_der = csr_builder.build::<DerSignature>().unwrap().to_der().unwrap();
    (cert_der, csr_der)
}

fn tikv_connection(
    validator: &MockQuoteValidator,
    issuer: &MockQuoteIssuer,
) -> (ActivationRequest, Vec<u8>) {
    let (cert_der, csr_der) = generate_marble_credentials();
    let quote = issuer.issue(&cert_der).unwrap();
    validator.add_valid_quote(
        &quote,
        &cert_der,
        tikv_package(),
        InfrastructureProperties::default(),
    );
    (
        ActivationRequest {
            csr: csr_der,
            marble_name: "tikv_first".to_string(),
            quote,
        },
        cert_der,
    )
}

/// A populated Coordinator: manifest with one recovery key, one capped
/// marble already activated. Returns the coordinator, its capability
/// handles, the recovery private key, and the unwrapped recovery secret.
fn populated_coordinator() -> (
    TestCoordinator,
    MockQuoteValidator,
    MockQuoteIssuer,
    SecretKey,
    Vec<u8>,
) {
    let validator = MockQuoteValidator::new();
    let issuer = MockQuoteIssuer::new();
    let coordinator = Coordinator::new(
        "Acme Inc.",
        validator.clone(),
        issuer.clone(),
        create_null_logger(),
    )
    .unwrap();

    let recovery_private = SecretKey::random(&mut rand::rngs::OsRng);
    let recovery_pem = recovery_private
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    let manifest = serde_json::json!({
        "Packages": {
            "tikv": {
                "UniqueID": (0u8..32).collect::<Vec<_>>(),
            }
        },
        "Marbles": {
            "tikv_first": {"Package": "tikv", "MaxActivations": 1}
        },
        "RecoveryKeys": {"admin": recovery_pem},
    });

    let wrapped = coordinator
        .set_manifest(&serde_json::to_vec(&manifest).unwrap())
        .unwrap();
    assert_eq!(wrapped.len(), 1);
    let secret = unwrap_secret(&recovery_private, &wrapped["admin"]).unwrap();
    assert_eq!(secret.len(), 32);

    let (request, peer_cert) = tikv_connection(&validator, &issuer);
    coordinator.activate(&request, &peer_cert).unwrap();

    (
        coordinator,
        validator,
        issuer,
        recovery_private,
        secret.to_vec(),
    )
}

#[test]
fn restore_with_the_sealing_key_skips_recovery() {
    let (coordinator, validator, issuer, _, secret) = populated_coordinator();
    let original_cert = coordinator.cert_quote().0;
    let blob = coordinator.seal_state().unwrap();

    let restored = Coordinator::from_sealed(
        "Acme Inc.",
        validator.clone(),
        issuer.clone(),
        &blob,
        Some(&secret),
        create_null_logger(),
    )
    .unwrap();

    assert_eq!(restored.status().0, State::AcceptingMarbles.code());
    assert_eq!(restored.cert_quote().0, original_cert);

    // the activation counter survived sealing: the cap of one still holds
    let (request, peer_cert) = tikv_connection(&validator, &issuer);
    assert!(matches!(
        restored.activate(&request, &peer_cert),
        Err(CoordinatorError::ActivationLimitExceeded(_))
    ));
}

#[test]
fn unsealable_state_enters_recovery_and_is_restored() {
    let (coordinator, validator, issuer, recovery_private, secret) = populated_coordinator();
    let original_cert = coordinator.cert_quote().0;
    let original_signature = coordinator.get_manifest_signature().unwrap();
    let blob = coordinator.seal_state().unwrap();

    // no sealing key available: Recovery, serving a temporary identity
    let recovering = Coordinator::from_sealed(
        "Acme Inc.",
        validator.clone(),
        issuer.clone(),
        &blob,
        None,
        create_null_logger(),
    )
    .unwrap();
    let (status, text) = recovering.status();
    assert_eq!(status, State::Recovery.code());
    assert!(!text.is_empty());
    let (temp_cert, _) = recovering.cert_quote();
    assert!(temp_cert.contains("-----BEGIN CERTIFICATE-----"));
    assert_ne!(temp_cert, original_cert);

    // only cert_quote, status and recover are legal now
    let (request, peer_cert) = tikv_connection(&validator, &issuer);
    assert!(matches!(
        recovering.activate(&request, &peer_cert),
        Err(CoordinatorError::InvalidState(_))
    ));
    assert!(matches!(
        recovering.set_manifest(br#"{"Packages": {}}"#),
        Err(CoordinatorError::InvalidState(_))
    ));

    // a signature under a foreign key is refused and recovery continues
    let foreign = SigningKey::random(&mut rand::rngs::OsRng);
    let bad_signature: DerSignature = foreign.sign(&secret);
    assert!(matches!(
        recovering.recover(&secret, &bad_signature.to_bytes()),
        Err(CoordinatorError::Recovery(_))
    ));
    assert_eq!(recovering.status().0, State::Recovery.code());

    // the authorized key holder restores the full state
    let signing_key = SigningKey::from(&recovery_private);
    let signature: DerSignature = signing_key.sign(&secret);
    recovering.recover(&secret, &signature.to_bytes()).unwrap();

    assert_eq!(recovering.status().0, State::AcceptingMarbles.code());
    assert_eq!(recovering.cert_quote().0, original_cert);
    assert_eq!(
        recovering.get_manifest_signature(),
        Some(original_signature)
    );

    // counters and the audit log came back; the recovery itself is logged
    let (request, peer_cert) = tikv_connection(&validator, &issuer);
    assert!(matches!(
        recovering.activate(&request, &peer_cert),
        Err(CoordinatorError::ActivationLimitExceeded(_))
    ));
    let log = recovering.update_log();
    assert_eq!(log.lines().count(), 2);
    assert!(
        log.lines()
            .nth(1)
            .unwrap()
            .contains("admin: recovered sealed state with recovery key admin"),
        "{log}"
    );

    // recover is gated once the Coordinator is running again
    assert!(matches!(
        recovering.recover(&secret, &signature.to_bytes()),
        Err(CoordinatorError::InvalidState(_))
    ));
}

#[test]
fn recovery_with_a_wrong_secret_fails_closed() {
    let (coordinator, validator, issuer, recovery_private, _) = populated_coordinator();
    let blob = coordinator.seal_state().unwrap();

    let recovering = Coordinator::from_sealed(
        "Acme Inc.",
        validator,
        issuer,
        &blob,
        None,
        create_null_logger(),
    )
    .unwrap();

    // correctly signed, but the secret is not the sealing key
    let wrong_secret = [9u8; 32];
    let signing_key = SigningKey::from(&recovery_private);
    let signature: DerSignature = signing_key.sign(&wrong_secret);
    assert!(matches!(
        recovering.recover(&wrong_secret, &signature.to_bytes()),
        Err(CoordinatorError::Recovery(_))
    ));
    assert_eq!(recovering.status().0, State::Recovery.code());
}

#[test]
fn sealing_requires_an_installed_manifest() {
    let validator = MockQuoteValidator::new();
    let issuer = MockQuoteIssuer::new();
    let coordinator = Coordinator::new(
        "Acme Inc.",
        validator,
        issuer,
        create_null_logger(),
    )
    .unwrap();
    assert!(matches!(
        coordinator.seal_state(),
        Err(CoordinatorError::InvalidState(_))
    ));
}
