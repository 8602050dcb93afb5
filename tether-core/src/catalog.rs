//! Named command templates operators and the onboarding workflow queue from.

use std::collections::BTreeMap;

use serde_json::json;

use crate::document::Document;

/// Template names referenced by the engine itself.
pub mod names {
    pub const DEVICE_INFORMATION: &str = "DeviceInformation";
    pub const SECURITY_INFO: &str = "SecurityInfo";
    pub const SETUP_CONFIGURATION: &str = "SetupConfiguration";
    pub const DEVICE_CONFIGURED: &str = "DeviceConfigured";
    pub const INSTALL_APPLICATION: &str = "InstallApplication";
    pub const INSTALL_MANAGEMENT_TOOLS: &str = "InstallManagementTools";
}

/// Queries issued by `DeviceInformation`.
const DEVICE_INFORMATION_QUERIES: &[&str] = &[
    "AvailableDeviceCapacity",
    "AwaitingConfiguration",
    "BatteryLevel",
    "BluetoothMAC",
    "BuildVersion",
    "CarrierSettingsVersion",
    "CellularTechnology",
    "CurrentCarrierNetwork",
    "CurrentMCC",
    "CurrentMNC",
    "DataRoamingEnabled",
    "DeviceCapacity",
    "DeviceName",
    "HostName",
    "ICCID",
    "IMEI",
    "IsActivationLockEnabled",
    "IsCloudBackupEnabled",
    "IsDoNotDisturbInEffect",
    "IsRoaming",
    "LocalHostName",
    "MEID",
    "Model",
    "ModelName",
    "ModemFirmwareVersion",
    "OSUpdateSettings",
    "OSVersion",
    "PhoneNumber",
    "Product",
    "ProductName",
    "SIMCarrierNetwork",
    "SIMMCC",
    "SIMMNC",
    "SerialNumber",
    "SubscriberCarrierNetwork",
    "SubscriberMCC",
    "SubscriberMNC",
    "UDID",
    "UnlockToken",
    "VoiceRoamingEnabled",
    "WiFiMAC",
];

const SECURITY_INFO_QUERIES: &[&str] = &[
    "HardwareEncryptionCaps",
    "PasscodePresent",
    "PasscodeCompliant",
    "PasscodeCompliantWithProfiles",
];

/// Request types that take no payload.
const BARE_REQUESTS: &[&str] = &[
    "DeviceLock",
    "ProfileList",
    "Restrictions",
    "CertificateList",
    "InstalledApplicationList",
    "ProvisioningProfileList",
    "ManagedApplicationList",
    "DeviceConfigured",
    "ClearPasscode",
];

/// A reusable command definition.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    pub name: String,
    pub request_type: String,
    pub payload: Document,
}

impl CommandTemplate {
    pub fn new(name: impl Into<String>, request_type: impl Into<String>, payload: Document) -> Self {
        Self {
            name: name.into(),
            request_type: request_type.into(),
            payload,
        }
    }

    /// Template whose name is also its request type.
    pub fn simple(request_type: &str, payload: Document) -> Self {
        Self::new(request_type, request_type, payload)
    }
}

/// Set of templates keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    templates: BTreeMap<String, CommandTemplate>,
}

impl CommandCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in catalog.
    ///
    /// `management_tools_manifest` is the manifest URL the
    /// `InstallManagementTools` template points devices at.
    pub fn standard(management_tools_manifest: &str) -> Self {
        let mut catalog = Self::empty();

        for request in BARE_REQUESTS {
            catalog.insert(CommandTemplate::simple(request, Document::new()));
        }

        catalog.insert(CommandTemplate::simple(
            names::DEVICE_INFORMATION,
            Document::new().with("Queries", json!(DEVICE_INFORMATION_QUERIES)),
        ));
        catalog.insert(CommandTemplate::simple(
            names::SECURITY_INFO,
            Document::new().with("Queries", json!(SECURITY_INFO_QUERIES)),
        ));
        catalog.insert(CommandTemplate::simple(
            names::INSTALL_APPLICATION,
            Document::new()
                // Keep the app when the device unenrolls.
                .with("ManagementFlags", 4)
                .with("iTunesStoreID", 471966214_i64),
        ));
        catalog.insert(CommandTemplate::new(
            names::INSTALL_MANAGEMENT_TOOLS,
            names::INSTALL_APPLICATION,
            Document::new()
                .with("ManifestURL", management_tools_manifest)
                // Remove the app when the device unenrolls.
                .with("ManagementFlags", 1)
                .with("Options", json!({ "NotManaged": true })),
        ));
        catalog.insert(CommandTemplate::simple(
            names::SETUP_CONFIGURATION,
            Document::new().with("SkipPrimarySetupAccountCreation", true),
        ));
        catalog.insert(CommandTemplate::simple(
            "RemoveApplication",
            Document::new().with("Identifier", "com.apple.movietrailers"),
        ));
        catalog.insert(CommandTemplate::simple(
            "Settings",
            Document::new().with(
                "Settings",
                json!([
                    { "Item": "DataRoaming", "Enabled": false },
                    { "Item": "VoiceRoaming", "Enabled": true },
                ]),
            ),
        ));

        catalog
    }

    pub fn insert(&mut self, template: CommandTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&CommandTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
