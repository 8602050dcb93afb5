//! Signer identities.
//!
//! - [`PrivateKey`] - Signing key with automatic zeroization on drop
//! - [`PublicKey`] - Verification key taken from a leaf certificate
//! - [`Signature`] - Detached Ed25519 signature over a checkin body
//! - [`Fingerprint`] - `SHA256:{base64_no_padding}` identifier of a signer
//!
//! # Example
//!
//! ```
//! use tether_auth::identity::{Fingerprint, PrivateKey};
//!
//! let private_key = PrivateKey::generate();
//! let public_key = private_key.public_key();
//!
//! let body = br#"{"UDID":"D1","Status":"Idle"}"#;
//! let signature = private_key.sign(body);
//! assert!(public_key.verify(body, &signature));
//!
//! let fingerprint = Fingerprint::from_public_key(&public_key);
//! assert!(fingerprint.as_str().starts_with("SHA256:"));
//! ```

mod keys;

pub use keys::{Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature};
