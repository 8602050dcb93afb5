//! Test harnesses for checkin E2E tests.
//!
//! Devices sign their checkins with certificates issued by a per-test CA, so
//! every message goes through real verification.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use tempfile::TempDir;
use tether_auth::{PrivateKey, SignedMessage, TrustAnchors};
use tether_core::{CommandId, DeviceId, Document, PushToken};
use tether_daemon::{
    CheckinContext, CheckinReply, DaemonConfig, Engine, PushError, PushNotifier, RawCheckin,
};

/// Install delay used by the harness, in seconds.
pub const INSTALL_DELAY_SECS: u64 = 1;

// ============================================================================
// Certificate authority
// ============================================================================

/// A certificate authority that issues device identities.
pub struct TestCa {
    key_pair: KeyPair,
    cert: Certificate,
}

impl TestCa {
    pub fn new(cn: &str) -> Self {
        let key = PrivateKey::generate();
        let key_pair = key_pair_for(&key);
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params
            .self_signed(&key_pair)
            .expect("Failed to build test CA");
        Self { key_pair, cert }
    }

    pub fn anchors(&self) -> TrustAnchors {
        TrustAnchors::from_der(vec![self.cert.der().to_vec()]).expect("Test CA is a valid anchor")
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a signing identity for `udid`.
    pub fn issue(&self, udid: &str) -> TestDevice {
        let key = PrivateKey::generate();
        let key_pair = key_pair_for(&key);
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, udid);
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key_pair)
            .expect("Failed to issue device certificate");

        TestDevice {
            udid: DeviceId::new(udid),
            key,
            chain: vec![cert.der().to_vec()],
            token: vec![0x5a; 32],
        }
    }
}

fn key_pair_for(key: &PrivateKey) -> KeyPair {
    let pkcs8 = key.to_pkcs8_der().expect("Failed to export key");
    KeyPair::try_from(pkcs8.as_bytes()).expect("Failed to load key into rcgen")
}

// ============================================================================
// Device
// ============================================================================

/// A device that produces signed checkins.
pub struct TestDevice {
    pub udid: DeviceId,
    key: PrivateKey,
    chain: Vec<Vec<u8>>,
    pub token: Vec<u8>,
}

impl TestDevice {
    /// Sign an arbitrary document, adding this device's UDID.
    pub fn sign(&self, mut doc: Value) -> RawCheckin {
        if let Value::Object(map) = &mut doc {
            map.entry("UDID")
                .or_insert_with(|| Value::String(self.udid.0.clone()));
        }
        let body = serde_json::to_vec(&doc).expect("Failed to encode checkin");
        let signed = SignedMessage::sign(body, &self.key, self.chain.clone());
        RawCheckin::new(signed.body, signed.signature)
    }

    pub fn push_token(&self) -> PushToken {
        PushToken::new(self.token.clone())
    }

    pub fn push_magic(&self) -> String {
        format!("magic-{}", self.udid)
    }

    pub fn token_update(&self, awaiting_configuration: bool) -> RawCheckin {
        self.sign(json!({
            "MessageType": "TokenUpdate",
            "Token": STANDARD.encode(&self.token),
            "PushMagic": self.push_magic(),
            "UnlockToken": STANDARD.encode(b"unlock"),
            "AwaitingConfiguration": awaiting_configuration,
        }))
    }

    pub fn authenticate(&self) -> RawCheckin {
        self.sign(json!({ "MessageType": "Authenticate", "Topic": "com.example.mdm" }))
    }

    pub fn check_out(&self) -> RawCheckin {
        self.sign(json!({ "MessageType": "CheckOut" }))
    }

    pub fn idle(&self) -> RawCheckin {
        self.sign(json!({ "Status": "Idle" }))
    }

    pub fn acknowledged(&self, command: &CommandId) -> RawCheckin {
        self.sign(self.acknowledged_doc(command, json!({})))
    }

    /// Acknowledgement carrying extra keys (e.g. `QueryResponses`).
    pub fn acknowledged_doc(&self, command: &CommandId, extra: Value) -> Value {
        let mut doc = json!({
            "UDID": self.udid.0,
            "Status": "Acknowledged",
            "CommandUUID": command.to_string(),
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut doc, extra) {
            base.extend(extra);
        }
        doc
    }

    pub fn error(&self, command: &CommandId) -> RawCheckin {
        self.sign(json!({
            "Status": "Error",
            "CommandUUID": command.to_string(),
            "ErrorChain": [{ "ErrorCode": 12021, "ErrorDomain": "MCMDMErrorDomain" }],
        }))
    }

    pub fn not_now(&self, command: &CommandId) -> RawCheckin {
        self.sign(json!({ "Status": "NotNow", "CommandUUID": command.to_string() }))
    }

    pub fn enrollment(&self, serial: &str) -> RawCheckin {
        self.sign(json!({
            "SERIAL": serial,
            "PRODUCT": "iPad8,1",
            "VERSION": "17.2",
            "LANGUAGE": "en-US",
        }))
    }
}

// ============================================================================
// Push notifier
// ============================================================================

/// Notifier that records every wake it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(PushToken, String)>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<(PushToken, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn notify(&self, token: &PushToken, magic: &str) -> Result<(), PushError> {
        self.calls
            .lock()
            .unwrap()
            .push((token.clone(), magic.to_string()));
        Ok(())
    }
}

// ============================================================================
// Daemon
// ============================================================================

/// An engine over a temporary data directory.
pub struct TestDaemon {
    pub engine: Engine,
    pub notifier: Arc<RecordingNotifier>,
    pub ca: Arc<TestCa>,
    pub config: DaemonConfig,
    dir: Arc<TempDir>,
}

impl TestDaemon {
    pub async fn new() -> Self {
        let dir = Arc::new(tempfile::tempdir().expect("Failed to create temp dir"));
        let config = DaemonConfig {
            data_dir: Some(dir.path().to_path_buf()),
            install_delay_secs: INSTALL_DELAY_SECS,
            ..DaemonConfig::default()
        };
        Self::open(config, Arc::new(TestCa::new("Tether Test CA")), dir).await
    }

    async fn open(config: DaemonConfig, ca: Arc<TestCa>, dir: Arc<TempDir>) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::open(&config, ca.anchors(), notifier.clone())
            .await
            .expect("Failed to open engine");
        Self {
            engine,
            notifier,
            ca,
            config,
            dir,
        }
    }

    /// Shut down and reopen over the same data directory.
    pub async fn restart(self) -> Self {
        self.engine.shutdown().await.expect("Final snapshot failed");
        let Self {
            engine,
            config,
            ca,
            dir,
            ..
        } = self;
        drop(engine);
        Self::open(config, ca, dir).await
    }

    pub fn device(&self, udid: &str) -> TestDevice {
        self.ca.issue(udid)
    }

    pub async fn checkin(&self, raw: &RawCheckin) -> CheckinReply {
        self.engine
            .handle_checkin(raw, &CheckinContext::default())
            .await
    }

    /// Enroll `udid` and drain the DeviceInformation query it triggers.
    pub async fn enrolled(&self, udid: &str) -> TestDevice {
        let device = self.device(udid);
        assert!(
            matches!(self.checkin(&device.token_update(false)).await, CheckinReply::Empty(_)),
            "TokenUpdate should succeed"
        );
        let info = self.expect_command(&device).await;
        assert_eq!(info.1, "DeviceInformation");
        let reply = self.checkin(&device.acknowledged(&info.0)).await;
        assert!(matches!(reply, CheckinReply::Empty(_)));
        device
    }

    /// Poll as `device` and return the delivered command's id and type.
    pub async fn expect_command(&self, device: &TestDevice) -> (CommandId, String) {
        match self.checkin(&device.idle()).await {
            CheckinReply::Command(doc) => command_parts(&doc),
            other => panic!("expected a command for {}, got {other:?}", device.udid),
        }
    }

    /// Make every device row write fail until [`TestDaemon::restore_writes`].
    ///
    /// Installs aborting triggers through a second connection, so the
    /// engine's own pool sees an ordinary write error.
    pub async fn fail_writes(&self) {
        self.store_sql(&[
            "CREATE TRIGGER reject_insert BEFORE INSERT ON devices \
             BEGIN SELECT RAISE(ABORT, 'store offline'); END",
            "CREATE TRIGGER reject_update BEFORE UPDATE ON devices \
             BEGIN SELECT RAISE(ABORT, 'store offline'); END",
        ])
        .await;
    }

    pub async fn restore_writes(&self) {
        self.store_sql(&["DROP TRIGGER reject_insert", "DROP TRIGGER reject_update"])
            .await;
    }

    async fn store_sql(&self, statements: &[&str]) {
        let mut conn = SqliteConnectOptions::new()
            .filename(self.config.db_path())
            .connect()
            .await
            .expect("Failed to open side connection");
        for sql in statements {
            sqlx::query(sql)
                .execute(&mut conn)
                .await
                .expect("Failed to change store triggers");
        }
        conn.close().await.expect("Failed to close side connection");
    }

    pub fn transaction_log(&self) -> Vec<Value> {
        let path = self.config.transaction_log_path();
        let text = std::fs::read_to_string(path).unwrap_or_default();
        text.lines()
            .map(|l| serde_json::from_str(l).expect("Transaction log line is JSON"))
            .collect()
    }
}

/// Extract `(CommandUUID, RequestType)` from a command document.
pub fn command_parts(doc: &Document) -> (CommandId, String) {
    let id = doc
        .get_str("CommandUUID")
        .unwrap()
        .and_then(CommandId::parse)
        .expect("command document has a CommandUUID");
    let request_type = doc
        .get_document("Command")
        .unwrap()
        .expect("command document has a Command")
        .require_str("RequestType")
        .unwrap()
        .to_string();
    (id, request_type)
}
