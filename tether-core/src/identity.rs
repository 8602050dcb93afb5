//! Device identity and opaque addressing tokens.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable device identifier (the UDID reported by the device).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Push token used to address wake notifications to a device.
///
/// Serialized as standard base64 so persisted records stay textual.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PushToken(
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub Vec<u8>,
);

impl PushToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering, the form push gateways expect.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for PushToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        let shown = hex.get(..8).unwrap_or(&hex);
        write!(f, "PushToken({shown}...)")
    }
}

/// Token a device hands over so its passcode can be cleared remotely.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnlockToken(
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub Vec<u8>,
);

impl UnlockToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Never print secret material.
impl fmt::Debug for UnlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnlockToken({} bytes)", self.0.len())
    }
}

fn serialize_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    STANDARD.decode(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_transparent_string() {
        let id = DeviceId::new("00008030-001A2B3C4D5E");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""00008030-001A2B3C4D5E""#);
        let parsed: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string(), "00008030-001A2B3C4D5E");
    }

    #[test]
    fn push_token_serializes_as_base64() {
        let token = PushToken::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#""3q2+7w==""#);
        let parsed: PushToken = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn push_token_hex_and_debug() {
        let token = PushToken::new(vec![0x01, 0xab, 0x00, 0xff, 0x10]);
        assert_eq!(token.to_hex(), "01ab00ff10");
        assert_eq!(format!("{token:?}"), "PushToken(01ab00ff...)");
    }

    #[test]
    fn unlock_token_debug_hides_bytes() {
        let token = UnlockToken::new(vec![7u8; 12]);
        assert_eq!(format!("{token:?}"), "UnlockToken(12 bytes)");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result: Result<PushToken, _> = serde_json::from_str(r#""not base64!""#);
        assert!(result.is_err());
    }
}
