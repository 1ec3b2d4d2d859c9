// Copyright (c) 2023-2025 The Mesh Foundation

//! Coordinator identity and certificate issuance.
//!
//! The Coordinator holds a P-256 key pair and a self-signed root certificate.
//! Marbles submit certificate signing requests during activation; after the
//! attestation gate passes, the Coordinator verifies the CSR's self-signature
//! and issues a short-lived leaf whose subject is rewritten to the marble's
//! manifest identity.

use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use der::{Decode, Encode};
use displaydoc::Display;
use p256::{
    ecdsa::{DerSignature, SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    SecretKey,
};
use rand_core::{CryptoRng, RngCore};
use signature::Verifier;
use std::{str::FromStr, time::Duration};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages},
    name::Name,
    request::CertReq,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
    Certificate,
};

/// Lifetime of the self-signed root certificate.
pub const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Lifetime of an issued marble leaf certificate.
pub const LEAF_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// An error which can occur while managing the Coordinator identity.
#[derive(Debug, Display)]
pub enum IdentityError {
    /// ASN.1 encoding failure: {0}
    Der(der::Error),
    /// certificate builder failure: {0}
    Builder(x509_cert::builder::Error),
    /// the subject public key is not a P-256 key: {0}
    PublicKey(x509_cert::spki::Error),
    /// the CSR carries no signature bits
    MalformedCsr,
    /// the CSR self-signature does not verify
    CsrSignature,
    /// PEM decoding failure: {0}
    Pem(pem::PemError),
    /// expected a {expected} PEM block, found {found}
    UnexpectedPemTag {
        /// The tag that was required.
        expected: String,
        /// The tag that was present.
        found: String,
    },
    /// the private key could not be decoded
    Key,
    /// the private key does not match the certificate public key
    KeyCertificateMismatch,
}

impl From<der::Error> for IdentityError {
    fn from(src: der::Error) -> Self {
        Self::Der(src)
    }
}

impl From<x509_cert::builder::Error> for IdentityError {
    fn from(src: x509_cert::builder::Error) -> Self {
        Self::Builder(src)
    }
}

impl From<x509_cert::spki::Error> for IdentityError {
    fn from(src: x509_cert::spki::Error) -> Self {
        Self::PublicKey(src)
    }
}

impl From<pem::PemError> for IdentityError {
    fn from(src: pem::PemError) -> Self {
        Self::Pem(src)
    }
}

/// PEM-armor a DER certificate.
pub fn encode_certificate_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(CERTIFICATE_PEM_TAG, der))
}

/// Strip PEM armor from a certificate, returning the DER bytes.
pub fn decode_certificate_pem(pem_str: &str) -> Result<Vec<u8>, IdentityError> {
    let block = pem::parse(pem_str)?;
    if block.tag() != CERTIFICATE_PEM_TAG {
        return Err(IdentityError::UnexpectedPemTag {
            expected: CERTIFICATE_PEM_TAG.into(),
            found: block.tag().into(),
        });
    }
    Ok(block.contents().to_vec())
}

/// Parse a DER CSR and verify its self-signature.
///
/// Only P-256 subject keys are accepted; the signature must be a DER-encoded
/// ECDSA signature over the `CertificationRequestInfo`.
pub fn verify_csr(csr_der: &[u8]) -> Result<CertReq, IdentityError> {
    let csr = CertReq::from_der(csr_der)?;
    let verifying_key = VerifyingKey::from_public_key_der(&csr.info.public_key.to_der()?)?;
    let message = csr.info.to_der()?;
    let signature_bytes = csr.signature.as_bytes().ok_or(IdentityError::MalformedCsr)?;
    let signature =
        DerSignature::try_from(signature_bytes).map_err(|_| IdentityError::CsrSignature)?;
    verifying_key
        .verify(&message, &signature)
        .map_err(|_| IdentityError::CsrSignature)?;
    Ok(csr)
}

fn random_serial<R: CryptoRng + RngCore>(rng: &mut R) -> Result<SerialNumber, IdentityError> {
    let mut bytes = [0u8; 20];
    rng.fill_bytes(&mut bytes);
    // positive, non-zero leading byte keeps the DER INTEGER canonical
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    Ok(SerialNumber::new(&bytes)?)
}

fn subject_name(organization: &str, common_name: &str) -> Result<Name, IdentityError> {
    Ok(Name::from_str(&format!(
        "CN={common_name},O={organization}"
    ))?)
}

/// The Coordinator's root-CA identity.
pub struct Identity {
    secret_key: SecretKey,
    signing_key: SigningKey,
    certificate_der: Vec<u8>,
    certificate_pem: String,
    subject: Name,
}

impl Identity {
    /// Generate a fresh key pair and self-signed root certificate.
    ///
    /// The subject is `CN=<common_name>, O=<organization>`; key usage is
    /// digitalSignature|keyCertSign with the serverAuth extended usage, as
    /// clients pin this certificate for their TLS connections.
    pub fn create<R: CryptoRng + RngCore>(
        organization: &str,
        common_name: &str,
        rng: &mut R,
    ) -> Result<Self, IdentityError> {
        let secret_key = SecretKey::random(rng);
        let signing_key = SigningKey::from(&secret_key);

        let subject = subject_name(organization, common_name)?;
        let spki = SubjectPublicKeyInfoOwned::from_der(
            signing_key.verifying_key().to_public_key_der()?.as_bytes(),
        )?;
        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            random_serial(rng)?,
            Validity::from_now(ROOT_VALIDITY)?,
            subject.clone(),
            spki,
            &signing_key,
        )?;
        builder.add_extension(&BasicConstraints {
            ca: true,
            path_len_constraint: None,
        })?;
        builder.add_extension(&KeyUsage(
            KeyUsages::DigitalSignature | KeyUsages::KeyCertSign,
        ))?;
        builder.add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))?;
        let certificate = builder.build::<DerSignature>()?;

        let certificate_der = certificate.to_der()?;
        let certificate_pem = encode_certificate_pem(&certificate_der);
        Ok(Self {
            secret_key,
            signing_key,
            certificate_der,
            certificate_pem,
            subject,
        })
    }

    /// Rebuild an identity from a sealed key pair and certificate.
    pub fn from_parts(key_pkcs8_der: &[u8], certificate_der: &[u8]) -> Result<Self, IdentityError> {
        let secret_key =
            SecretKey::from_pkcs8_der(key_pkcs8_der).map_err(|_| IdentityError::Key)?;
        let signing_key = SigningKey::from(&secret_key);

        let certificate = Certificate::from_der(certificate_der)?;
        let cert_spki_der = certificate.tbs_certificate.subject_public_key_info.to_der()?;
        let key_spki_der = signing_key.verifying_key().to_public_key_der()?;
        if cert_spki_der != key_spki_der.as_bytes() {
            return Err(IdentityError::KeyCertificateMismatch);
        }

        Ok(Self {
            secret_key,
            signing_key,
            certificate_der: certificate_der.to_vec(),
            certificate_pem: encode_certificate_pem(certificate_der),
            subject: certificate.tbs_certificate.subject,
        })
    }

    /// The root certificate, DER encoded.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// The root certificate, PEM armored.
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// The private half of the identity, PKCS#8 DER encoded, for sealing.
    pub fn private_key_der(&self) -> Result<Vec<u8>, IdentityError> {
        Ok(self
            .secret_key
            .to_pkcs8_der()
            .map_err(|_| IdentityError::Key)?
            .as_bytes()
            .to_vec())
    }

    /// Sign a leaf certificate for a verified CSR.
    ///
    /// The CSR's own subject is discarded: the issued leaf carries
    /// `CN=<common_name>, O=<organization>` and a fresh random serial, so a
    /// marble cannot choose its mesh identity.
    pub fn issue_leaf<R: CryptoRng + RngCore>(
        &self,
        csr_der: &[u8],
        organization: &str,
        common_name: &str,
        rng: &mut R,
    ) -> Result<String, IdentityError> {
        let csr = verify_csr(csr_der)?;

        let mut builder = CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(self.subject.clone()),
            },
            random_serial(rng)?,
            Validity::from_now(LEAF_VALIDITY)?,
            subject_name(organization, common_name)?,
            csr.info.public_key,
            &self.signing_key,
        )?;
        builder.add_extension(&BasicConstraints {
            ca: false,
            path_len_constraint: None,
        })?;
        builder.add_extension(&KeyUsage(KeyUsages::DigitalSignature.into()))?;
        builder.add_extension(&ExtendedKeyUsage(vec![
            ID_KP_SERVER_AUTH,
            ID_KP_CLIENT_AUTH,
        ]))?;
        let leaf = builder.build::<DerSignature>()?;

        Ok(encode_certificate_pem(&leaf.to_der()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use x509_cert::builder::RequestBuilder;

    fn test_rng() -> StdRng {
        StdRng::from_seed([7u8; 32])
    }

    fn generate_csr(rng: &mut StdRng) -> (SigningKey, Vec<u8>) {
        let secret_key = SecretKey::random(rng);
        let signing_key = SigningKey::from(&secret_key);
        let subject = Name::from_str("CN=unattested,O=Acme Inc.").unwrap();
        let builder = RequestBuilder::new(subject, &signing_key).unwrap();
        let csr = builder.build::<DerSignature>().unwrap();
        (signing_key, csr.to_der().unwrap())
    }

    #[test]
    fn create_yields_self_signed_pem_certificate() {
        let mut rng = test_rng();
        let identity = Identity::create("Acme Inc.", "Mesh Coordinator", &mut rng).unwrap();

        assert!(identity
            .certificate_pem()
            .contains("-----BEGIN CERTIFICATE-----"));

        let certificate = Certificate::from_der(identity.certificate_der()).unwrap();
        assert_eq!(
            certificate.tbs_certificate.subject,
            certificate.tbs_certificate.issuer
        );
        let subject = certificate.tbs_certificate.subject.to_string();
        assert!(subject.contains("Mesh Coordinator"), "{subject}");
        assert!(subject.contains("Acme Inc."), "{subject}");
    }

    #[test]
    fn identity_round_trips_through_sealed_parts() {
        let mut rng = test_rng();
        let identity = Identity::create("Acme Inc.", "Mesh Coordinator", &mut rng).unwrap();

        let key_der = identity.private_key_der().unwrap();
        let restored = Identity::from_parts(&key_der, identity.certificate_der()).unwrap();
        assert_eq!(restored.certificate_der(), identity.certificate_der());
        assert_eq!(restored.certificate_pem(), identity.certificate_pem());
    }

    #[test]
    fn mismatched_key_and_certificate_are_rejected() {
        let mut rng = test_rng();
        let identity = Identity::create("Acme Inc.", "Mesh Coordinator", &mut rng).unwrap();
        let other = Identity::create("Acme Inc.", "Mesh Coordinator", &mut rng).unwrap();

        let result = Identity::from_parts(
            &other.private_key_der().unwrap(),
            identity.certificate_der(),
        );
        assert!(matches!(
            result,
            Err(IdentityError::KeyCertificateMismatch)
        ));
    }

    #[test]
    fn issue_leaf_substitutes_the_subject() {
        let mut rng = test_rng();
        let identity = Identity::create("Acme Inc.", "Mesh Coordinator", &mut rng).unwrap();
        let (_, csr_der) = generate_csr(&mut rng);

        let leaf_pem = identity
            .issue_leaf(&csr_der, "Acme Inc.", "tikv_first", &mut rng)
            .unwrap();
        let leaf_der = decode_certificate_pem(&leaf_pem).unwrap();
        let leaf = Certificate::from_der(&leaf_der).unwrap();

        let subject = leaf.tbs_certificate.subject.to_string();
        assert!(subject.contains("tikv_first"), "{subject}");
        assert!(!subject.contains("unattested"), "{subject}");

        let ca = Certificate::from_der(identity.certificate_der()).unwrap();
        assert_eq!(leaf.tbs_certificate.issuer, ca.tbs_certificate.subject);

        // the leaf must verify under the root key
        let root_key =
            VerifyingKey::from_public_key_der(&ca.tbs_certificate.subject_public_key_info.to_der().unwrap())
                .unwrap();
        let message = leaf.tbs_certificate.to_der().unwrap();
        let signature =
            DerSignature::try_from(leaf.signature.as_bytes().unwrap()).unwrap();
        root_key.verify(&message, &signature).unwrap();
    }

    #[test]
    fn tampered_csr_is_rejected() {
        let mut rng = test_rng();
        let identity = Identity::create("Acme Inc.", "Mesh Coordinator", &mut rng).unwrap();
        let (_, mut csr_der) = generate_csr(&mut rng);

        // flip a bit inside the encoded request info
        let mid = csr_der.len() / 2;
        csr_der[mid] ^= 0x01;

        let result = identity.issue_leaf(&csr_der, "Acme Inc.", "tikv_first", &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn pem_helpers_reject_foreign_tags() {
        let block = pem::encode(&pem::Pem::new("PUBLIC KEY", vec![1, 2, 3]));
        assert!(matches!(
            decode_certificate_pem(&block),
            Err(IdentityError::UnexpectedPemTag { .. })
        ));
    }
}
