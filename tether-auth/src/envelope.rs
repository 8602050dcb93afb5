//! Detached signature envelope.
//!
//! A signed checkin is the raw document body plus a signature header. The
//! header is standard base64 of the following frame:
//!
//! | Field            | Size        | Description                                   |
//! |------------------|-------------|-----------------------------------------------|
//! | magic            | 12 bytes    | `TETHER-SIG\0\0`                              |
//! | version          | 1 byte      | `0x01`                                        |
//! | cert_count       | 1 byte      | 1..=[`MAX_CHAIN_LEN`], leaf first             |
//! | cert_len, cert   | 2 + n bytes | big-endian length, then DER (per certificate) |
//! | sig_len          | 1 byte      | must be 64                                    |
//! | signature        | 64 bytes    | Ed25519 signature over the body               |
//!
//! Nothing may follow the signature.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::cert::MAX_CERT_SIZE;
use crate::identity::{PrivateKey, Signature};

/// Frame magic.
pub const MAGIC: &[u8; 12] = b"TETHER-SIG\0\0";

/// Current frame version.
pub const VERSION: u8 = 1;

/// Longest accepted certificate chain (leaf plus intermediates).
pub const MAX_CHAIN_LEN: usize = 4;

const SIGNATURE_LEN: usize = 64;

/// Errors decoding a signature header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("signature header is not valid base64")]
    Base64,

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("certificate chain length {0} out of range")]
    ChainLength(usize),

    #[error("certificate of {0} bytes exceeds limit")]
    CertTooLarge(usize),

    #[error("signature length {0}, expected 64")]
    SignatureLength(usize),

    #[error("envelope truncated")]
    Truncated,

    #[error("{0} trailing bytes after signature")]
    TrailingBytes(usize),
}

/// A checkin as received: body bytes and the signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub body: Vec<u8>,
    pub signature: String,
}

impl SignedMessage {
    pub fn new(body: impl Into<Vec<u8>>, signature: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            signature: signature.into(),
        }
    }

    /// Sign `body` with `key`, attaching `chain` (leaf first).
    pub fn sign(body: impl Into<Vec<u8>>, key: &PrivateKey, chain: Vec<Vec<u8>>) -> Self {
        let body = body.into();
        let envelope = SignatureEnvelope {
            certificates: chain,
            signature: key.sign(&body),
        };
        Self {
            body,
            signature: envelope.encode(),
        }
    }
}

/// Decoded signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    /// DER certificates, leaf first.
    pub certificates: Vec<Vec<u8>>,
    pub signature: Signature,
}

impl SignatureEnvelope {
    /// Render as a base64 header value.
    pub fn encode(&self) -> String {
        let mut out = Vec::with_capacity(
            MAGIC.len() + 3 + SIGNATURE_LEN + self.certificates.iter().map(|c| c.len() + 2).sum::<usize>(),
        );
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.certificates.len() as u8);
        for cert in &self.certificates {
            out.extend_from_slice(&(cert.len() as u16).to_be_bytes());
            out.extend_from_slice(cert);
        }
        out.push(SIGNATURE_LEN as u8);
        out.extend_from_slice(&self.signature.to_bytes());
        STANDARD.encode(out)
    }

    /// Parse a base64 header value.
    pub fn decode(header: &str) -> Result<Self, EnvelopeError> {
        let raw = STANDARD
            .decode(header.trim())
            .map_err(|_| EnvelopeError::Base64)?;
        let mut reader = Reader::new(&raw);

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        let version = reader.u8()?;
        if version != VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }

        let count = reader.u8()? as usize;
        if count == 0 || count > MAX_CHAIN_LEN {
            return Err(EnvelopeError::ChainLength(count));
        }
        let mut certificates = Vec::with_capacity(count);
        for _ in 0..count {
            let len = reader.u16()? as usize;
            if len > MAX_CERT_SIZE {
                return Err(EnvelopeError::CertTooLarge(len));
            }
            certificates.push(reader.take(len)?.to_vec());
        }

        let sig_len = reader.u8()? as usize;
        if sig_len != SIGNATURE_LEN {
            return Err(EnvelopeError::SignatureLength(sig_len));
        }
        let signature = Signature::from_bytes(reader.take(SIGNATURE_LEN)?)
            .map_err(|_| EnvelopeError::SignatureLength(sig_len))?;

        if reader.remaining() > 0 {
            return Err(EnvelopeError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            certificates,
            signature,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.checked_add(n).ok_or(EnvelopeError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(EnvelopeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(certs: Vec<Vec<u8>>) -> SignatureEnvelope {
        SignatureEnvelope {
            certificates: certs,
            signature: PrivateKey::generate().sign(b"body"),
        }
    }

    fn raw(header: &str) -> Vec<u8> {
        STANDARD.decode(header).unwrap()
    }

    #[test]
    fn encode_decode_preserves_chain_order() {
        let env = envelope(vec![b"leaf".to_vec(), b"intermediate".to_vec()]);
        let decoded = SignatureEnvelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn sign_attaches_verifiable_signature() {
        let key = PrivateKey::generate();
        let msg = SignedMessage::sign(b"{}".to_vec(), &key, vec![b"leaf".to_vec()]);
        let env = SignatureEnvelope::decode(&msg.signature).unwrap();
        assert!(key.public_key().verify(&msg.body, &env.signature));
    }

    #[test]
    fn rejects_bad_base64_and_magic() {
        assert_eq!(
            SignatureEnvelope::decode("%%%"),
            Err(EnvelopeError::Base64)
        );
        let mut bytes = raw(&envelope(vec![b"c".to_vec()]).encode());
        bytes[0] = b'X';
        assert_eq!(
            SignatureEnvelope::decode(&STANDARD.encode(&bytes)),
            Err(EnvelopeError::BadMagic)
        );
    }

    #[test]
    fn rejects_version_and_chain_length() {
        let mut bytes = raw(&envelope(vec![b"c".to_vec()]).encode());
        bytes[12] = 2;
        assert_eq!(
            SignatureEnvelope::decode(&STANDARD.encode(&bytes)),
            Err(EnvelopeError::UnsupportedVersion(2))
        );

        let empty = envelope(vec![]).encode();
        assert_eq!(
            SignatureEnvelope::decode(&empty),
            Err(EnvelopeError::ChainLength(0))
        );
        let long = envelope(vec![b"c".to_vec(); MAX_CHAIN_LEN + 1]).encode();
        assert_eq!(
            SignatureEnvelope::decode(&long),
            Err(EnvelopeError::ChainLength(MAX_CHAIN_LEN + 1))
        );
    }

    #[test]
    fn rejects_truncation_and_trailing_bytes() {
        let bytes = raw(&envelope(vec![b"cert".to_vec()]).encode());

        let short = STANDARD.encode(&bytes[..bytes.len() - 1]);
        assert_eq!(
            SignatureEnvelope::decode(&short),
            Err(EnvelopeError::Truncated)
        );

        let mut long = bytes.clone();
        long.extend_from_slice(b"xx");
        assert_eq!(
            SignatureEnvelope::decode(&STANDARD.encode(&long)),
            Err(EnvelopeError::TrailingBytes(2))
        );
    }

    #[test]
    fn rejects_oversize_certificate_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        bytes.push(1);
        bytes.extend_from_slice(&((MAX_CERT_SIZE + 1) as u16).to_be_bytes());
        assert_eq!(
            SignatureEnvelope::decode(&STANDARD.encode(&bytes)),
            Err(EnvelopeError::CertTooLarge(MAX_CERT_SIZE + 1))
        );
    }
}
