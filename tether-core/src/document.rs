//! Structured key-value documents.
//!
//! Every payload that crosses the engine boundary (checkin bodies, command
//! payloads, recorded results) is a [`Document`]: an ordered map from string
//! keys to JSON values with typed accessors. Shape errors surface as
//! [`DocumentError`] at the point a value is read, never later.
//!
//! Binary values (push tokens, unlock tokens) are carried as standard base64
//! strings and decoded with [`Document::get_bytes`].

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while decoding or reading a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("invalid document encoding: {0}")]
    Encoding(String),

    #[error("document root is not a key-value map")]
    NotAMap,

    #[error("missing key: {0}")]
    MissingKey(String),

    #[error("key '{key}' is not a {expected}")]
    WrongType { key: String, expected: &'static str },
}

impl DocumentError {
    fn wrong_type(key: &str, expected: &'static str) -> Self {
        Self::WrongType {
            key: key.to_string(),
            expected,
        }
    }
}

/// Ordered key-value document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(BTreeMap<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse a document from its wire bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DocumentError::Encoding(e.to_string()))?;
        Self::from_value(value)
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            _ => Err(DocumentError::NotAMap),
        }
    }

    /// Render the document to wire bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    // ── Typed getters ─────────────────────────────────────────────────────
    //
    // A missing key is `Ok(None)`; a present key of the wrong type is an error.

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, DocumentError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(DocumentError::wrong_type(key, "string")),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str, DocumentError> {
        self.get_str(key)?
            .ok_or_else(|| DocumentError::MissingKey(key.to_string()))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, DocumentError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(DocumentError::wrong_type(key, "boolean")),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, DocumentError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| DocumentError::wrong_type(key, "integer")),
            Some(_) => Err(DocumentError::wrong_type(key, "integer")),
        }
    }

    /// Read a base64-encoded binary value.
    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, DocumentError> {
        match self.get_str(key) {
            Ok(None) => Ok(None),
            Ok(Some(s)) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(|_| DocumentError::wrong_type(key, "base64 data")),
            Err(_) => Err(DocumentError::wrong_type(key, "base64 data")),
        }
    }

    /// Read a nested document.
    pub fn get_document(&self, key: &str) -> Result<Option<Document>, DocumentError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(Self(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ))),
            Some(_) => Err(DocumentError::wrong_type(key, "document")),
        }
    }

    // ── Mutation ──────────────────────────────────────────────────────────

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, bytes: &[u8]) {
        self.set(key, STANDARD.encode(bytes));
    }

    pub fn set_document(&mut self, key: impl Into<String>, doc: Document) {
        self.set(key, doc.to_value());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Builder-style `set`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Copy every entry of `other` into `self`, replacing existing keys.
    pub fn merge(&mut self, other: &Document) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Document {
        Document::from_slice(
            br#"{"UDID":"D1","AwaitingConfiguration":true,"Count":3,
                 "Token":"3q2+7w==","QueryResponses":{"DeviceName":"Lab iPad"}}"#,
        )
        .unwrap()
    }

    #[test]
    fn typed_getters_read_present_keys() {
        let doc = sample();
        assert_eq!(doc.get_str("UDID").unwrap(), Some("D1"));
        assert_eq!(doc.get_bool("AwaitingConfiguration").unwrap(), Some(true));
        assert_eq!(doc.get_i64("Count").unwrap(), Some(3));
        assert_eq!(
            doc.get_bytes("Token").unwrap(),
            Some(vec![0xde, 0xad, 0xbe, 0xef])
        );
        let nested = doc.get_document("QueryResponses").unwrap().unwrap();
        assert_eq!(nested.get_str("DeviceName").unwrap(), Some("Lab iPad"));
    }

    #[test]
    fn missing_keys_are_none() {
        let doc = sample();
        assert_eq!(doc.get_str("Nope").unwrap(), None);
        assert_eq!(doc.get_bool("Nope").unwrap(), None);
        assert_eq!(doc.get_bytes("Nope").unwrap(), None);
        assert!(doc.get_document("Nope").unwrap().is_none());
        assert_eq!(
            doc.require_str("Nope"),
            Err(DocumentError::MissingKey("Nope".into()))
        );
    }

    #[test]
    fn wrong_types_are_errors() {
        let doc = sample();
        assert!(matches!(
            doc.get_str("Count"),
            Err(DocumentError::WrongType { expected: "string", .. })
        ));
        assert!(doc.get_bool("UDID").is_err());
        assert!(doc.get_i64("UDID").is_err());
        assert!(doc.get_bytes("Count").is_err());
        assert!(doc.get_document("UDID").is_err());
    }

    #[test]
    fn non_map_root_is_rejected() {
        assert_eq!(Document::from_slice(b"[1,2]"), Err(DocumentError::NotAMap));
        assert!(matches!(
            Document::from_slice(b"{not json"),
            Err(DocumentError::Encoding(_))
        ));
    }

    #[test]
    fn keys_are_ordered_on_render() {
        let doc = Document::new().with("b", 2).with("a", 1);
        assert_eq!(doc.to_vec(), br#"{"a":1,"b":2}"#.to_vec());
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn set_nested_and_bytes() {
        let mut doc = Document::new();
        doc.set_bytes("Blob", &[1, 2, 3]);
        doc.set_document("Inner", Document::new().with("x", json!([1])));
        assert_eq!(doc.get_bytes("Blob").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(
            doc.get_document("Inner").unwrap().unwrap().get("x"),
            Some(&json!([1]))
        );
    }
}
