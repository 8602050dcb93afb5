//! Trusted certificate authorities.

use x509_parser::prelude::X509Certificate;

use crate::cert::{self, CertError};

/// Certificate authorities a checkin chain must terminate at.
///
/// Anchors are held as DER and parsed on use; every entry is validated when
/// the set is built.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    certs: Vec<Vec<u8>>,
}

impl TrustAnchors {
    /// Load anchors from a PEM bundle containing one or more certificates.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CertError> {
        Ok(Self {
            certs: cert::pem_bundle_to_der(pem)?,
        })
    }

    /// Build anchors from DER certificates.
    pub fn from_der(certs: Vec<Vec<u8>>) -> Result<Self, CertError> {
        if certs.is_empty() {
            return Err(CertError::Empty);
        }
        for der in &certs {
            cert::parse_der(der)?;
        }
        Ok(Self { certs })
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// DER bytes of each anchor.
    pub fn ders(&self) -> impl Iterator<Item = &[u8]> {
        self.certs.iter().map(Vec::as_slice)
    }

    /// Parsed anchors. Entries were validated on construction.
    pub(crate) fn parsed(&self) -> impl Iterator<Item = (&[u8], X509Certificate<'_>)> {
        self.certs
            .iter()
            .filter_map(|der| cert::parse_der(der).ok().map(|c| (der.as_slice(), c)))
    }
}
