//! Certificate utilities for X.509 parsing.
//!
//! # Security
//!
//! - Input is limited to 16KB per certificate to prevent DoS
//! - The x509_parser library handles ASN.1 parsing safely

use thiserror::Error;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

use crate::identity::PublicKey;

/// Maximum certificate size (16KB is generous for a single cert)
pub const MAX_CERT_SIZE: usize = 16 * 1024;

/// Errors that can occur during certificate parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertError {
    #[error("certificate too large: {0} bytes (max {MAX_CERT_SIZE})")]
    TooLarge(usize),

    #[error("failed to parse X.509 certificate: {0}")]
    ParseError(String),

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no certificates found")]
    Empty,

    #[error("certificate key is not Ed25519")]
    UnsupportedKey,
}

/// Parse a single DER certificate, rejecting oversize input and trailing bytes.
pub fn parse_der(cert_der: &[u8]) -> Result<X509Certificate<'_>, CertError> {
    if cert_der.len() > MAX_CERT_SIZE {
        return Err(CertError::TooLarge(cert_der.len()));
    }

    let (rest, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertError::ParseError(format!("{:?}", e)))?;
    if !rest.is_empty() {
        return Err(CertError::ParseError(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }

    Ok(cert)
}

/// Extract the Ed25519 public key a certificate binds.
pub fn ed25519_public_key(cert: &X509Certificate<'_>) -> Result<PublicKey, CertError> {
    let spki = cert.public_key();
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return Err(CertError::UnsupportedKey);
    }
    PublicKey::from_bytes(&spki.subject_public_key.data).map_err(|_| CertError::UnsupportedKey)
}

/// Split a PEM bundle into DER certificates, checking that each one parses.
pub fn pem_bundle_to_der(pem: &[u8]) -> Result<Vec<Vec<u8>>, CertError> {
    let mut certs = Vec::new();
    for entry in Pem::iter_from_buffer(pem) {
        let entry = entry.map_err(|e| CertError::Pem(format!("{:?}", e)))?;
        if entry.label != "CERTIFICATE" {
            continue;
        }
        parse_der(&entry.contents)?;
        certs.push(entry.contents);
    }

    if certs.is_empty() {
        return Err(CertError::Empty);
    }
    Ok(certs)
}
