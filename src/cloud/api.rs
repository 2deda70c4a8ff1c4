// ─── API REST del servidor: registro y reportes de estado ───

use anyhow::{bail, Context, Result};
use embedded_svc::http::Method;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{API_PORT, DEVICE_TYPE};
use crate::error::ErrorCode;
use crate::identity::IdentityStore;
use crate::lighting::{LightingConfig, SystemType};
use crate::platform::{HttpTransport, Telemetry};

/// Tipos que el backend acepta en `lightingSystemType`.
const BACKEND_SYSTEM_TYPES: &[&str] = &["nanoleaf", "wled", "ws2812", "philips_hue"];

pub fn is_backend_system_type(value: &str) -> bool {
    BACKEND_SYSTEM_TYPES.contains(&value)
}

/// Base de la API REST a partir de la URL del canal dúplex.
///
/// `ws` → `http`, `wss` → `https`; se descarta el path y un puerto
/// explícito se reemplaza por `API_PORT`.
pub fn api_base_url(server_url: &str) -> String {
    let server_url = server_url.trim();
    let (scheme, rest) = match server_url.split_once("://") {
        Some(("wss", rest)) | Some(("https", rest)) => ("https", rest),
        Some((_, rest)) => ("http", rest),
        None => ("http", server_url),
    };
    let authority = rest.split('/').next().unwrap_or_default();
    // Un literal IPv6 va entre corchetes y tiene sus propios ':'.
    let (host, has_port) = match authority.find(']') {
        Some(end) if authority.starts_with('[') => {
            (&authority[..=end], authority[end + 1..].starts_with(':'))
        }
        _ => match authority.rsplit_once(':') {
            Some((host, _port)) => (host, true),
            None => (authority, false),
        },
    };
    if has_port {
        format!("{}://{}:{}", scheme, host, API_PORT)
    } else {
        format!("{}://{}", scheme, host)
    }
}

// ─── Errores de registro ───

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration request failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("server answered HTTP {status}")]
    Status { status: u16, body: String },
    #[error("invalid registration reply: {0}")]
    InvalidReply(#[from] serde_json::Error),
    #[error("registration reply carried no device id")]
    MissingDeviceId,
}

impl RegistrationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) => ErrorCode::HttpFailed,
            Self::Status { .. } | Self::MissingDeviceId => ErrorCode::RegistrationFailed,
            Self::InvalidReply(_) => ErrorCode::JsonParseFailed,
        }
    }
}

// ─── Respuesta de registro ───

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationReply {
    pub device_id: String,
    pub pairing_code: Option<String>,
    pub status: Option<String>,
    pub is_provisioned: Option<bool>,
    pub owner_email: Option<String>,
    pub owner_name: Option<String>,
    /// Config de iluminación que el servidor recuerda (recuperación tras un borrado).
    pub lighting: Option<LightingConfig>,
}

impl RegistrationReply {
    /// Acepta el cuerpo plano o envuelto en `{device: …}`.
    pub fn parse(body: &str) -> Result<Self, RegistrationError> {
        let root: Value = serde_json::from_str(body)?;
        let device = match root.get("device") {
            Some(device) if device.is_object() => device,
            _ => &root,
        };

        let text = |key: &str| device.get(key).and_then(Value::as_str).map(str::to_string);
        let device_id = text("id")
            .or_else(|| text("deviceId"))
            .filter(|id| !id.is_empty())
            .ok_or(RegistrationError::MissingDeviceId)?;

        Ok(Self {
            device_id,
            pairing_code: text("pairingCode"),
            status: text("status"),
            is_provisioned: device.get("isProvisioned").and_then(Value::as_bool),
            owner_email: text("ownerEmail"),
            owner_name: text("ownerName"),
            lighting: lighting_from_reply(device),
        })
    }

    /// `status` manda; sin `status` se usa `isProvisioned` si vino.
    pub fn provisioned(&self) -> Option<bool> {
        match self.status.as_deref() {
            Some(status) => Some(status == "claimed"),
            None => self.is_provisioned,
        }
    }
}

fn lighting_from_reply(device: &Value) -> Option<LightingConfig> {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| device.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    };
    let name = text(&["lightingSystem", "lightingSystemType"])?;
    let system_type = match SystemType::parse(&name) {
        Some(system_type) if system_type != SystemType::None => system_type,
        _ => {
            warn!("Server remembers unsupported lighting system '{}', ignoring", name);
            return None;
        }
    };

    let port = device
        .get("lightingPort")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .unwrap_or(0);
    let custom = ["lightingCustomConfig", "customConfig"]
        .iter()
        .find_map(|key| device.get(*key))
        .map(crate::cloud::protocol::parse_custom_config)
        .unwrap_or_default();

    let mut config = LightingConfig {
        system_type,
        host_address: text(&["lightingHost", "lightingHostAddress"]).unwrap_or_default(),
        port,
        auth_token: text(&["lightingAuthToken"]).unwrap_or_default(),
        custom,
    };
    if system_type == SystemType::Ws2812 {
        config.host_address.clear();
        config.port = 0;
        config.auth_token.clear();
    } else if !config.has_host() {
        config.host_address.clear();
    }
    Some(config)
}

/// Vuelca la respuesta del servidor en el store.
///
/// La config de iluminación se escribe antes de que el driver cargue,
/// así un dispositivo borrado recupera su driver sin intervención.
pub fn apply_registration(reply: &RegistrationReply, store: &mut IdentityStore) -> Result<()> {
    store.set_device_id(&reply.device_id)?;
    info!("Server assigned device ID: {}", reply.device_id);

    if let Some(code) = reply.pairing_code.as_deref().filter(|code| !code.is_empty()) {
        store.set_pairing_code(code)?;
        info!("Server assigned pairing code: {}", code);
    }

    if let Some(provisioned) = reply.provisioned() {
        if provisioned != store.is_provisioned() {
            info!(
                "Device is {} according to server",
                if provisioned { "claimed" } else { "not claimed" }
            );
        }
        store.set_provisioned(provisioned)?;
    }

    if let Some(lighting) = &reply.lighting {
        if store.lighting_config()? != *lighting {
            info!("Restoring lighting configuration from server: {:?}", lighting);
            store.save_lighting_config(lighting)?;
        }
    }
    Ok(())
}

// ─── Payloads ───

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    mac_address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware_version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(flatten)]
    lighting: Option<LightingFields>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LightingFields {
    lighting_system_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lighting_host_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lighting_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lighting_auth_token: Option<String>,
}

impl LightingFields {
    fn from_config(config: &LightingConfig) -> Option<Self> {
        let name = config.system_type.as_str();
        if !is_backend_system_type(name) {
            return None;
        }
        Some(Self {
            lighting_system_type: name.to_string(),
            lighting_host_address: Some(config.host_address.clone()).filter(|h| !h.is_empty()),
            lighting_port: Some(config.port).filter(|p| *p > 0),
            lighting_auth_token: Some(config.auth_token.clone()).filter(|t| !t.is_empty()),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
    is_online: bool,
    is_provisioned: bool,
    ip_address: Option<String>,
    firmware_version: &'a str,
    mac_address: &'a str,
    #[serde(rename = "wifiRSSI")]
    wifi_rssi: Option<i8>,
    system_stats: SystemStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemStats {
    free_heap: u32,
    uptime: u64,
}

// ─── Cliente ───

pub struct CloudApi {
    http: Box<dyn HttpTransport>,
    base_url: String,
}

impl CloudApi {
    pub fn new(http: Box<dyn HttpTransport>, server_url: &str) -> Self {
        Self {
            http,
            base_url: api_base_url(server_url),
        }
    }

    pub fn set_server_url(&mut self, server_url: &str) {
        self.base_url = api_base_url(server_url);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Primer contacto: solo la MAC.
    pub fn register_minimal(&mut self, mac_address: &str) -> Result<RegistrationReply, RegistrationError> {
        let request = RegisterRequest {
            mac_address,
            device_type: None,
            firmware_version: None,
            ip_address: None,
            lighting: None,
        };
        self.register(&request)
    }

    /// Registro completo, con la config de iluminación persistida si el
    /// backend la reconoce.
    pub fn register_full(
        &mut self,
        store: &IdentityStore,
        telemetry: &Telemetry,
    ) -> Result<RegistrationReply, RegistrationError> {
        let lighting = store.lighting_config().unwrap_or_else(|e| {
            warn!("Could not read lighting config for registration: {:?}", e);
            LightingConfig::default()
        });
        let identity = store.identity();
        let request = RegisterRequest {
            mac_address: &identity.mac_address,
            device_type: Some(DEVICE_TYPE),
            firmware_version: Some(&identity.firmware_version),
            ip_address: telemetry.ip_address.map(|ip| ip.to_string()),
            lighting: LightingFields::from_config(&lighting),
        };
        self.register(&request)
    }

    fn register(&mut self, request: &RegisterRequest<'_>) -> Result<RegistrationReply, RegistrationError> {
        let url = format!("{}/devices/register", self.base_url);
        let payload = serde_json::to_string(request)?;
        info!("Registering device at {}", url);

        let response = self
            .http
            .request(Method::Post, &url, Some(&payload))
            .map_err(RegistrationError::Transport)?;
        if response.status != 200 && response.status != 201 {
            return Err(RegistrationError::Status {
                status: response.status,
                body: response.body,
            });
        }
        RegistrationReply::parse(&response.body)
    }

    /// `PUT /devices/{id}/status`
    pub fn update_status(&mut self, store: &IdentityStore, telemetry: &Telemetry) -> Result<()> {
        let identity = store.identity();
        if identity.device_id.is_empty() {
            bail!("device has no server id yet");
        }
        let update = StatusUpdate {
            is_online: true,
            is_provisioned: identity.is_provisioned,
            ip_address: telemetry.ip_address.map(|ip| ip.to_string()),
            firmware_version: &identity.firmware_version,
            mac_address: &identity.mac_address,
            wifi_rssi: telemetry.rssi,
            system_stats: SystemStats {
                free_heap: telemetry.free_heap,
                uptime: telemetry.uptime_ms,
            },
        };
        let url = format!("{}/devices/{}/status", self.base_url, identity.device_id);
        self.put(&url, &serde_json::to_string(&update)?)
    }

    /// `PUT /devices/{id}/lighting`
    pub fn push_lighting_config(&mut self, device_id: &str, config: &LightingConfig) -> Result<()> {
        if device_id.is_empty() {
            bail!("device has no server id yet");
        }
        let fields = LightingFields::from_config(config)
            .with_context(|| format!("'{}' is not a backend lighting type", config.system_type))?;
        let url = format!("{}/devices/{}/lighting", self.base_url, device_id);
        self.put(&url, &serde_json::to_string(&fields)?)
    }

    fn put(&mut self, url: &str, payload: &str) -> Result<()> {
        let response = self
            .http
            .request(Method::Put, url, Some(payload))
            .with_context(|| format!("PUT {} failed", url))?;
        if !response.is_success() {
            bail!("PUT {} answered HTTP {}", url, response.status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity_store, MemoryStorage, ScriptedHttp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn base_url_swaps_scheme_and_port() {
        assert_eq!(api_base_url("ws://192.168.178.66:3001/ws"), "http://192.168.178.66:3000");
        assert_eq!(api_base_url("wss://s/ws"), "https://s");
        assert_eq!(api_base_url("wss://api.example.com:443/socket"), "https://api.example.com:3000");
        assert_eq!(api_base_url("http://host"), "http://host");
    }

    #[test]
    fn api_base_url_keeps_ipv6_literals() {
        assert_eq!(api_base_url("ws://[fe80::1]:3001/ws"), "http://[fe80::1]:3000");
        assert_eq!(api_base_url("wss://[2001:db8::7]/ws"), "https://[2001:db8::7]");
    }

    #[test]
    fn reply_accepts_flat_and_wrapped_bodies() {
        let flat = RegistrationReply::parse(r#"{"id":"uuid-A","pairingCode":"482913","status":"unclaimed"}"#)
            .unwrap();
        let wrapped = RegistrationReply::parse(
            r#"{"device":{"deviceId":"uuid-A","pairingCode":"482913","status":"unclaimed"}}"#,
        )
        .unwrap();
        assert_eq!(flat, wrapped);
        assert_eq!(flat.provisioned(), Some(false));
    }

    #[test]
    fn reply_without_id_is_rejected() {
        let err = RegistrationReply::parse(r#"{"pairingCode":"1"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RegistrationFailed);
        let err = RegistrationReply::parse("not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::JsonParseFailed);
    }

    #[test]
    fn provisioned_prefers_status() {
        let reply = RegistrationReply::parse(r#"{"id":"a","status":"claimed","isProvisioned":false}"#).unwrap();
        assert_eq!(reply.provisioned(), Some(true));
        let reply = RegistrationReply::parse(r#"{"id":"a","isProvisioned":true}"#).unwrap();
        assert_eq!(reply.provisioned(), Some(true));
        let reply = RegistrationReply::parse(r#"{"id":"a"}"#).unwrap();
        assert_eq!(reply.provisioned(), None);
    }

    #[test]
    fn registration_reconciles_lighting_namespace() {
        let storage = MemoryStorage::default();
        let mut store = identity_store(&storage);
        let reply = RegistrationReply::parse(
            r#"{"device":{"id":"uuid-B","status":"claimed","lightingSystem":"nanoleaf",
                "lightingHost":"10.0.0.9","lightingPort":16021,"lightingAuthToken":"tok"}}"#,
        )
        .unwrap();

        apply_registration(&reply, &mut store).unwrap();

        assert_eq!(storage.get("lighting", "system_type"), Some("nanoleaf".to_string()));
        assert_eq!(storage.get("lighting", "host_addr"), Some("10.0.0.9".to_string()));
        assert_eq!(store.device_id(), "uuid-B");
        assert!(store.is_provisioned());
    }

    #[test]
    fn full_registration_includes_backend_lighting_fields() {
        let storage = MemoryStorage::default();
        let mut store = identity_store(&storage);
        store
            .save_lighting_config(&LightingConfig::networked(SystemType::Wled, "10.0.0.5", 80, ""))
            .unwrap();
        let http = ScriptedHttp::default();
        http.respond_json("POST", "http://s:3000/devices/register", 201, r#"{"id":"uuid-A"}"#);
        let mut api = CloudApi::new(Box::new(http.clone()), "ws://s:3001/ws");

        api.register_full(&store, &Telemetry::default()).unwrap();

        let body: Value =
            serde_json::from_str(&http.last_body("http://s:3000/devices/register").unwrap()).unwrap();
        assert_eq!(body["deviceType"], "PalPalette");
        assert_eq!(body["lightingSystemType"], "wled");
        assert_eq!(body["lightingHostAddress"], "10.0.0.5");
        assert_eq!(body["lightingPort"], 80);
        assert!(body.get("lightingAuthToken").is_none());
    }

    #[test]
    fn minimal_registration_sends_only_mac() {
        let http = ScriptedHttp::default();
        http.respond_json("POST", "http://s:3000/devices/register", 200, r#"{"id":"uuid-A"}"#);
        let mut api = CloudApi::new(Box::new(http.clone()), "ws://s:3001/ws");

        let reply = api.register_minimal("AA:BB:CC:DD:EE:FF").unwrap();

        assert_eq!(reply.device_id, "uuid-A");
        let body: Value =
            serde_json::from_str(&http.last_body("http://s:3000/devices/register").unwrap()).unwrap();
        assert_eq!(body, json!({ "macAddress": "AA:BB:CC:DD:EE:FF" }));
    }

    #[test]
    fn server_error_is_registration_failure() {
        let http = ScriptedHttp::default();
        http.respond_json("POST", "http://s:3000/devices/register", 500, "oops");
        let mut api = CloudApi::new(Box::new(http), "ws://s:3001/ws");
        let err = api.register_minimal("AA").unwrap_err();
        assert!(matches!(err, RegistrationError::Status { status: 500, .. }));
    }

    #[test]
    fn status_update_puts_to_device_path() {
        let storage = MemoryStorage::default();
        let mut store = identity_store(&storage);
        store.set_device_id("uuid-A").unwrap();
        let http = ScriptedHttp::default();
        http.respond_json("PUT", "http://s:3000/devices/uuid-A/status", 200, "{}");
        let mut api = CloudApi::new(Box::new(http.clone()), "ws://s:3001/ws");

        let telemetry = Telemetry {
            rssi: Some(-61),
            free_heap: 120_000,
            uptime_ms: 5_000,
            ..Telemetry::default()
        };
        api.update_status(&store, &telemetry).unwrap();

        let body: Value =
            serde_json::from_str(&http.last_body("http://s:3000/devices/uuid-A/status").unwrap()).unwrap();
        assert_eq!(body["wifiRSSI"], -61);
        assert_eq!(body["systemStats"], json!({ "freeHeap": 120000, "uptime": 5000 }));
        assert_eq!(body["isOnline"], true);
    }
}
