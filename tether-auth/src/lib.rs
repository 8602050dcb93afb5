//! Signed checkin verification for Tether.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No network calls
//! - No logging
//!
//! Callers load trust anchors and supply the current time.
//!
//! # Example
//!
//! ```ignore
//! use tether_auth::{verify, SignedMessage, TrustAnchors};
//!
//! let anchors = TrustAnchors::from_pem(&std::fs::read("ca.pem")?)?;
//! let message = SignedMessage::new(body, signature_header);
//! let verified = verify(&message, &anchors, now)?;
//! println!("checkin from {}", verified.signer);
//! ```

pub mod cert;
pub mod envelope;
pub mod identity;
pub mod trust;
pub mod verify;

pub use cert::CertError;
pub use envelope::{EnvelopeError, SignatureEnvelope, SignedMessage};
pub use identity::{Fingerprint, KeyError, PrivateKey, PublicKey, Signature};
pub use trust::TrustAnchors;
pub use verify::{verify, VerifiedMessage, VerifyError, MAX_BODY_SIZE};
