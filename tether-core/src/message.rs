//! Inbound checkin messages.
//!
//! A verified checkin document declares its kind either through `Status`
//! (command channel) or `MessageType` (checkin channel):
//!
//! | Key           | Values                                          |
//! |---------------|-------------------------------------------------|
//! | `Status`      | `Idle`, `Acknowledged`, `Error`, `NotNow`       |
//! | `MessageType` | `TokenUpdate`, `Authenticate`, `CheckOut`       |
//!
//! Parsing checks shape once so the session layer works with typed fields.

use crate::document::{Document, DocumentError};
use crate::identity::{DeviceId, PushToken, UnlockToken};

/// Errors raised while classifying a checkin document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("document declares neither Status nor MessageType")]
    MissingKind,

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Reported values from a `DeviceInformation` query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResponses {
    pub device_name: Option<String>,
    pub model_name: Option<String>,
    pub os_version: Option<String>,
    pub serial_number: Option<String>,
}

impl QueryResponses {
    fn from_document(doc: &Document) -> Result<Self, DocumentError> {
        Ok(Self {
            device_name: doc.get_str("DeviceName")?.map(str::to_owned),
            model_name: doc.get_str("ModelName")?.map(str::to_owned),
            os_version: doc.get_str("OSVersion")?.map(str::to_owned),
            serial_number: doc.get_str("SerialNumber")?.map(str::to_owned),
        })
    }
}

/// Fields carried by TokenUpdate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUpdate {
    pub push_token: PushToken,
    pub push_magic: String,
    pub unlock_token: Option<UnlockToken>,
    pub awaiting_configuration: bool,
}

/// A device report about a delivered command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReport {
    /// `CommandUUID` exactly as the device sent it.
    pub command_uuid: String,
    pub query_responses: Option<QueryResponses>,
    /// The whole report, kept as the command's result.
    pub document: Document,
}

/// Classified checkin.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckinKind {
    Idle,
    Acknowledged(CommandReport),
    Error(CommandReport),
    NotNow(CommandReport),
    TokenUpdate(TokenUpdate),
    Authenticate,
    CheckOut,
}

impl CheckinKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Acknowledged(_) => "Acknowledged",
            Self::Error(_) => "Error",
            Self::NotNow(_) => "NotNow",
            Self::TokenUpdate(_) => "TokenUpdate",
            Self::Authenticate => "Authenticate",
            Self::CheckOut => "CheckOut",
        }
    }
}

/// A checkin with its device identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckinMessage {
    pub udid: DeviceId,
    pub kind: CheckinKind,
}

impl CheckinMessage {
    /// Classify a verified document.
    pub fn from_document(doc: &Document) -> Result<Self, MessageError> {
        let udid = DeviceId::new(doc.require_str("UDID")?);

        let kind = if let Some(status) = doc.get_str("Status")? {
            match status {
                "Idle" => CheckinKind::Idle,
                "Acknowledged" => CheckinKind::Acknowledged(Self::report(doc)?),
                "Error" | "CommandFormatError" => CheckinKind::Error(Self::report(doc)?),
                "NotNow" => CheckinKind::NotNow(Self::report(doc)?),
                other => return Err(MessageError::UnknownKind(other.to_string())),
            }
        } else if let Some(message_type) = doc.get_str("MessageType")? {
            match message_type {
                "TokenUpdate" => CheckinKind::TokenUpdate(Self::token_update(doc)?),
                "Authenticate" => CheckinKind::Authenticate,
                "CheckOut" => CheckinKind::CheckOut,
                other => return Err(MessageError::UnknownKind(other.to_string())),
            }
        } else {
            return Err(MessageError::MissingKind);
        };

        Ok(Self { udid, kind })
    }

    fn report(doc: &Document) -> Result<CommandReport, DocumentError> {
        let query_responses = doc
            .get_document("QueryResponses")?
            .map(|q| QueryResponses::from_document(&q))
            .transpose()?;

        Ok(CommandReport {
            command_uuid: doc.require_str("CommandUUID")?.to_string(),
            query_responses,
            document: doc.clone(),
        })
    }

    fn token_update(doc: &Document) -> Result<TokenUpdate, DocumentError> {
        let push_token = doc
            .get_bytes("Token")?
            .ok_or_else(|| DocumentError::MissingKey("Token".into()))?;

        Ok(TokenUpdate {
            push_token: PushToken::new(push_token),
            push_magic: doc.require_str("PushMagic")?.to_string(),
            unlock_token: doc.get_bytes("UnlockToken")?.map(UnlockToken::new),
            awaiting_configuration: doc.get_bool("AwaitingConfiguration")?.unwrap_or(false),
        })
    }
}

/// Device identification sent before enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentCheckin {
    pub udid: DeviceId,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    pub os_version: Option<String>,
}

impl EnrollmentCheckin {
    pub fn from_document(doc: &Document) -> Result<Self, MessageError> {
        Ok(Self {
            udid: DeviceId::new(doc.require_str("UDID")?),
            serial_number: doc.get_str("SERIAL")?.map(str::to_owned),
            product: doc.get_str("PRODUCT")?.map(str::to_owned),
            os_version: doc.get_str("VERSION")?.map(str::to_owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn parses_idle() {
        let msg = CheckinMessage::from_document(&doc(json!({"UDID": "D1", "Status": "Idle"})))
            .unwrap();
        assert_eq!(msg.udid, DeviceId::new("D1"));
        assert_eq!(msg.kind, CheckinKind::Idle);
    }

    #[test]
    fn parses_token_update() {
        let msg = CheckinMessage::from_document(&doc(json!({
            "UDID": "D1",
            "MessageType": "TokenUpdate",
            "Token": "AQID",
            "PushMagic": "magic-1",
            "UnlockToken": "BAU=",
            "AwaitingConfiguration": true,
        })))
        .unwrap();

        let CheckinKind::TokenUpdate(update) = msg.kind else {
            panic!("expected TokenUpdate");
        };
        assert_eq!(update.push_token.as_bytes(), &[1, 2, 3]);
        assert_eq!(update.push_magic, "magic-1");
        assert_eq!(update.unlock_token.unwrap().as_bytes(), &[4, 5]);
        assert!(update.awaiting_configuration);
    }

    #[test]
    fn token_update_requires_token_and_magic() {
        let missing_token = doc(json!({"UDID": "D1", "MessageType": "TokenUpdate", "PushMagic": "m"}));
        assert!(matches!(
            CheckinMessage::from_document(&missing_token),
            Err(MessageError::Document(DocumentError::MissingKey(k))) if k == "Token"
        ));

        let missing_magic = doc(json!({"UDID": "D1", "MessageType": "TokenUpdate", "Token": "AQID"}));
        assert!(CheckinMessage::from_document(&missing_magic).is_err());
    }

    #[test]
    fn parses_acknowledgement_with_query_responses() {
        let body = json!({
            "UDID": "D1",
            "Status": "Acknowledged",
            "CommandUUID": "C1",
            "QueryResponses": {"DeviceName": "Lab iPad", "OSVersion": "17.2", "ModelName": "iPad"},
        });
        let msg = CheckinMessage::from_document(&doc(body.clone())).unwrap();
        let CheckinKind::Acknowledged(report) = msg.kind else {
            panic!("expected Acknowledged");
        };
        assert_eq!(report.command_uuid, "C1");
        let q = report.query_responses.unwrap();
        assert_eq!(q.device_name.as_deref(), Some("Lab iPad"));
        assert_eq!(q.os_version.as_deref(), Some("17.2"));
        assert_eq!(report.document, doc(body));
    }

    #[test]
    fn responses_require_command_uuid() {
        for status in ["Acknowledged", "Error", "NotNow"] {
            let d = doc(json!({"UDID": "D1", "Status": status}));
            assert!(CheckinMessage::from_document(&d).is_err(), "{status}");
        }
    }

    #[test]
    fn checkout_and_authenticate() {
        let out = CheckinMessage::from_document(&doc(json!({"UDID": "D1", "MessageType": "CheckOut"})))
            .unwrap();
        assert_eq!(out.kind, CheckinKind::CheckOut);
        let auth = CheckinMessage::from_document(&doc(
            json!({"UDID": "D1", "MessageType": "Authenticate", "Topic": "com.example.mdm"}),
        ))
        .unwrap();
        assert_eq!(auth.kind, CheckinKind::Authenticate);
    }

    #[test]
    fn rejects_unknown_or_missing_kind() {
        assert!(matches!(
            CheckinMessage::from_document(&doc(json!({"UDID": "D1", "Status": "Bogus"}))),
            Err(MessageError::UnknownKind(_))
        ));
        assert_eq!(
            CheckinMessage::from_document(&doc(json!({"UDID": "D1"}))),
            Err(MessageError::MissingKind)
        );
        assert!(CheckinMessage::from_document(&doc(json!({"Status": "Idle"}))).is_err());
    }

    #[test]
    fn parses_enrollment_checkin() {
        let checkin = EnrollmentCheckin::from_document(&doc(json!({
            "UDID": "D9", "SERIAL": "C02XYZ", "PRODUCT": "iPad13,1", "VERSION": "21C62"
        })))
        .unwrap();
        assert_eq!(checkin.udid, DeviceId::new("D9"));
        assert_eq!(checkin.serial_number.as_deref(), Some("C02XYZ"));
        assert_eq!(checkin.product.as_deref(), Some("iPad13,1"));
    }
}
