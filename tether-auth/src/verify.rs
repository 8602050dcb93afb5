//! Checkin signature verification.
//!
//! # Verification Order
//!
//! 1. Decode the envelope (framing, sizes, DER) → `MalformedMessage`
//! 2. Check every certificate's validity window → `SignatureInvalid`
//! 3. Walk the chain leaf → top, each link issued and signed by the next
//! 4. Require the top to be an anchor or be signed by one
//! 5. Verify the body signature with the leaf's Ed25519 key
//! 6. Parse the now-trusted body into a [`Document`] → `MalformedMessage`
//!
//! The body is never interpreted before its signature checks out.

use tether_core::Document;
use x509_parser::prelude::X509Certificate;

use crate::cert::{self, CertError};
use crate::envelope::{SignatureEnvelope, SignedMessage};
use crate::identity::Fingerprint;
use crate::trust::TrustAnchors;

/// Largest accepted checkin body.
pub const MAX_BODY_SIZE: usize = 256 * 1024;

/// Errors that can occur during checkin verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The chain or signature does not validate against the trust anchors.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// The envelope or body could not be parsed.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl VerifyError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::SignatureInvalid(reason.into())
    }

    fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(reason.to_string())
    }
}

/// A checkin whose signer chains to a trust anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedMessage {
    pub document: Document,
    /// Fingerprint of the leaf certificate's key.
    pub signer: Fingerprint,
    /// Leaf certificate subject, for logging.
    pub subject: String,
}

/// Verify a signed checkin at unix time `now`.
pub fn verify(
    message: &SignedMessage,
    anchors: &TrustAnchors,
    now: i64,
) -> Result<VerifiedMessage, VerifyError> {
    if message.body.len() > MAX_BODY_SIZE {
        return Err(VerifyError::malformed(format!(
            "body of {} bytes exceeds limit",
            message.body.len()
        )));
    }
    if message.signature.trim().is_empty() {
        return Err(VerifyError::malformed("missing signature"));
    }

    let envelope = SignatureEnvelope::decode(&message.signature).map_err(VerifyError::malformed)?;
    let chain = envelope
        .certificates
        .iter()
        .map(|der| cert::parse_der(der))
        .collect::<Result<Vec<_>, CertError>>()
        .map_err(VerifyError::malformed)?;

    for cert in &chain {
        if !valid_at(cert, now) {
            return Err(VerifyError::invalid(format!(
                "certificate '{}' is outside its validity period",
                cert.subject()
            )));
        }
    }

    for link in chain.windows(2) {
        if !issued_by(&link[0], &link[1]) {
            return Err(VerifyError::invalid(format!(
                "certificate '{}' is not issued by '{}'",
                link[0].subject(),
                link[1].subject()
            )));
        }
    }

    // Chain length is at least one; the envelope enforces it.
    let (leaf, top) = match (chain.first(), chain.last()) {
        (Some(leaf), Some(top)) => (leaf, top),
        _ => return Err(VerifyError::malformed("empty certificate chain")),
    };
    let top_der = envelope
        .certificates
        .last()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let anchored = anchors.parsed().any(|(anchor_der, anchor)| {
        valid_at(&anchor, now) && (anchor_der == top_der || issued_by(top, &anchor))
    });
    if !anchored {
        return Err(VerifyError::invalid("chain does not terminate at a trusted authority"));
    }

    let leaf_key = cert::ed25519_public_key(leaf).map_err(|e| VerifyError::invalid(e.to_string()))?;
    if !leaf_key.verify(&message.body, &envelope.signature) {
        return Err(VerifyError::invalid("signature does not match body"));
    }

    let document = Document::from_slice(&message.body).map_err(VerifyError::malformed)?;

    Ok(VerifiedMessage {
        document,
        signer: Fingerprint::from_public_key(&leaf_key),
        subject: leaf.subject().to_string(),
    })
}

fn valid_at(cert: &X509Certificate<'_>, now: i64) -> bool {
    let validity = cert.validity();
    validity.not_before.timestamp() <= now && now <= validity.not_after.timestamp()
}

/// `child` names `issuer` as its issuer, `issuer` is a CA and its key signed `child`.
fn issued_by(child: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> bool {
    child.issuer().as_raw() == issuer.subject().as_raw()
        && issuer.is_ca()
        && child.verify_signature(Some(issuer.public_key())).is_ok()
}
