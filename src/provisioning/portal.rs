// ─── Portal cautivo: rutas HTTP ───
//
// Los handlers corren en el thread del servidor HTTP. No tocan storage
// ni el radio: dejan comandos en `PortalContext` y el loop principal
// los aplica en su próximo tick. Por eso todo acá es Mutex/atómico.

use embedded_svc::http::Method;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::config::FIRMWARE_VERSION;
use crate::identity::WifiCredentials;
use crate::platform::AccessPointInfo;

/// Tope del body de un formulario.
pub const MAX_FORM_BODY: usize = 1024;

// ─── Estado compartido ───

/// Lo que el portal muestra del dispositivo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalInfo {
    pub device_id: String,
    pub mac_address: String,
    pub is_provisioned: bool,
    pub server_url: String,
    pub free_heap: u32,
    pub uptime_ms: u64,
}

/// Pedidos del usuario que el loop principal tiene que aplicar.
pub enum PortalCommand {
    Save {
        credentials: WifiCredentials,
        server_url: Option<String>,
    },
    Reset,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortalError {
    #[error("SSID is required")]
    MissingSsid,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("request body is not valid UTF-8")]
    InvalidBody,
}

impl PortalError {
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingSsid | Self::InvalidBody => 400,
            Self::BodyTooLarge => 413,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl PortalResponse {
    fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "text/html",
            body,
        }
    }

    fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.to_string(),
        }
    }
}

pub struct PortalContext {
    info: Mutex<PortalInfo>,
    networks: Mutex<Vec<AccessPointInfo>>,
    scan_requested: AtomicBool,
    commands: Mutex<VecDeque<PortalCommand>>,
}

// Un handler que paniqueó no invalida el estado: se sigue usando.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PortalContext {
    pub fn new(info: PortalInfo) -> Self {
        Self {
            info: Mutex::new(info),
            networks: Mutex::new(Vec::new()),
            scan_requested: AtomicBool::new(false),
            commands: Mutex::new(VecDeque::new()),
        }
    }

    pub fn update_info(&self, update: impl FnOnce(&mut PortalInfo)) {
        update(&mut lock(&self.info));
    }

    pub fn set_networks(&self, networks: Vec<AccessPointInfo>) {
        *lock(&self.networks) = networks;
    }

    /// Si algún cliente pidió `/scan` desde la última vez.
    pub fn take_scan_request(&self) -> bool {
        self.scan_requested.swap(false, Ordering::AcqRel)
    }

    pub fn next_command(&self) -> Option<PortalCommand> {
        lock(&self.commands).pop_front()
    }

    /// Atiende un request. Cualquier ruta desconocida sirve el formulario.
    pub fn handle(&self, method: Method, uri: &str, body: &[u8]) -> PortalResponse {
        let path = uri.split('?').next().unwrap_or("/");
        match (method, path) {
            (Method::Get, "/status") => self.status(),
            (Method::Get, "/scan") => self.scan(),
            (Method::Post, "/save") => match self.save(body) {
                Ok(ssid) => PortalResponse::html(200, saved_page(&ssid)),
                Err(e) => {
                    warn!("Portal save rejected: {}", e);
                    PortalResponse::html(e.status(), error_page(&e))
                }
            },
            (Method::Post, "/reset") => {
                info!("Portal reset requested");
                lock(&self.commands).push_back(PortalCommand::Reset);
                PortalResponse::html(200, RESET_PAGE.to_string())
            }
            _ => PortalResponse::html(200, setup_page(&lock(&self.info))),
        }
    }

    fn status(&self) -> PortalResponse {
        let info = lock(&self.info);
        let device_id = if info.device_id.is_empty() {
            "Not set"
        } else {
            info.device_id.as_str()
        };
        PortalResponse::json(json!({
            "deviceId": device_id,
            "macAddress": info.mac_address,
            "firmwareVersion": FIRMWARE_VERSION,
            "freeHeap": info.free_heap,
            "uptime": info.uptime_ms,
            "isProvisioned": info.is_provisioned,
        }))
    }

    fn scan(&self) -> PortalResponse {
        self.scan_requested.store(true, Ordering::Release);
        let networks = scan_entries(&lock(&self.networks));
        info!("Serving {} scanned networks", networks.len());
        PortalResponse::json(json!({ "networks": networks }))
    }

    fn save(&self, body: &[u8]) -> Result<String, PortalError> {
        if body.len() > MAX_FORM_BODY {
            return Err(PortalError::BodyTooLarge);
        }
        let body = std::str::from_utf8(body).map_err(|_| PortalError::InvalidBody)?;
        let form = parse_form(body);
        let raw = |name: &str| {
            form.iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        };
        // La contraseña va tal cual: WPA admite espacios en los extremos.
        let field = |name: &str| raw(name).trim().to_string();

        let ssid = field("ssid");
        if ssid.is_empty() {
            return Err(PortalError::MissingSsid);
        }
        let server = field("server");
        let server_url = (!server.is_empty()).then_some(server);

        info!("Portal saved credentials for '{}'", ssid);
        lock(&self.commands).push_back(PortalCommand::Save {
            credentials: WifiCredentials::new(&ssid, &raw("password")),
            server_url,
        });
        Ok(ssid)
    }
}

// ─── Scan ───

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i8,
    pub encryption: bool,
    pub quality: u8,
}

/// Una entrada por SSID (gana la señal más fuerte), sin redes ocultas,
/// ordenadas de mejor a peor señal.
pub fn scan_entries(networks: &[AccessPointInfo]) -> Vec<ScanEntry> {
    let mut entries: Vec<ScanEntry> = Vec::new();
    for network in networks.iter().filter(|n| !n.ssid.is_empty()) {
        match entries.iter_mut().find(|e| e.ssid == network.ssid) {
            Some(existing) if network.rssi > existing.rssi => {
                existing.rssi = network.rssi;
                existing.encryption = network.encrypted;
                existing.quality = signal_quality(network.rssi);
            }
            Some(_) => {}
            None => entries.push(ScanEntry {
                ssid: network.ssid.clone(),
                rssi: network.rssi,
                encryption: network.encrypted,
                quality: signal_quality(network.rssi),
            }),
        }
    }
    entries.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.ssid.cmp(&b.ssid)));
    entries
}

/// Porcentaje 0..=100 a partir del RSSI en dBm.
pub fn signal_quality(rssi: i8) -> u8 {
    (2 * (i32::from(rssi) + 100)).clamp(0, 100) as u8
}

// ─── Formularios ───

/// Parsea `application/x-www-form-urlencoded`.
pub fn parse_form(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (url_decode(key), url_decode(value)))
        .collect()
}

/// Decodifica `%XX` y `+` (los formularios mandan "Mi+Red%21").
///
/// Trabaja sobre bytes para que los SSID con UTF-8 sobrevivan.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ─── HTML ───

const PAGE_STYLE: &str = r#"<style>
        body { font-family: -apple-system, sans-serif; max-width: 420px; margin: 40px auto; padding: 20px; background: #1a1a2e; color: #eee; }
        h1 { color: #00d4ff; text-align: center; }
        form, .card { background: #16213e; padding: 20px; border-radius: 10px; margin-bottom: 20px; }
        label { display: block; margin: 15px 0 5px; color: #00d4ff; }
        input { width: 100%; padding: 12px; border: 1px solid #0f3460; border-radius: 5px; background: #1a1a2e; color: #fff; box-sizing: border-box; }
        button { width: 100%; padding: 15px; margin-top: 20px; background: #00d4ff; color: #1a1a2e; border: none; border-radius: 5px; font-weight: bold; cursor: pointer; }
        button.danger { background: #ff4d6d; color: #fff; }
        .info { font-size: 12px; color: #888; margin-top: 5px; }
        .network { padding: 10px; border-bottom: 1px solid #0f3460; cursor: pointer; }
        a { color: #00d4ff; }
    </style>"#;

const SETUP_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>PalPalette Setup</title>
    {{STYLE}}
</head>
<body>
    <h1>PalPalette Setup</h1>
    <div class="card">
        <div class="info">MAC: {{MAC}}</div>
        <div class="info">Firmware: {{FIRMWARE}}</div>
    </div>
    <div class="card">
        <button type="button" onclick="scan()">Scan networks</button>
        <div id="networks"></div>
    </div>
    <form method="POST" action="/save">
        <label>WiFi Network (SSID)</label>
        <input type="text" id="ssid" name="ssid" required maxlength="32">

        <label>WiFi Password</label>
        <input type="password" name="password" maxlength="64">

        <label>Server URL</label>
        <input type="text" name="server" value="{{SERVER}}" maxlength="128">
        <div class="info">Optional: ws://host:port/ws</div>

        <button type="submit">Save &amp; Connect</button>
    </form>
    <form method="POST" action="/reset" onsubmit="return confirm('Clear all settings?')">
        <button type="submit" class="danger">Factory Reset</button>
    </form>
    <p class="info"><a href="/status">Device status</a></p>
    <script>
        function scan() {
            const list = document.getElementById('networks');
            list.textContent = 'Scanning...';
            fetch('/scan').then(r => r.json()).then(data => {
                list.textContent = '';
                data.networks.forEach(n => {
                    const row = document.createElement('div');
                    row.className = 'network';
                    row.textContent = (n.encryption ? '\u{1F512} ' : '') + n.ssid + ' (' + n.quality + '%, ' + n.rssi + ' dBm)';
                    row.onclick = () => { document.getElementById('ssid').value = n.ssid; };
                    list.appendChild(row);
                });
                if (data.networks.length === 0) { list.textContent = 'No networks found, try again in a few seconds.'; }
            }).catch(() => { list.textContent = 'Scan failed'; });
        }
    </script>
</body>
</html>"#;

const RESET_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta charset="UTF-8"><title>Device Reset</title></head>
<body><h1>Device Reset</h1><p>All settings cleared. Device will restart.</p></body></html>"#;

fn setup_page(info: &PortalInfo) -> String {
    SETUP_TEMPLATE
        .replace("{{STYLE}}", PAGE_STYLE)
        .replace("{{MAC}}", &html_escape(&info.mac_address))
        .replace("{{FIRMWARE}}", FIRMWARE_VERSION)
        .replace("{{SERVER}}", &html_escape(&info.server_url))
}

fn saved_page(ssid: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"><title>Setup Complete</title></head>\
         <body><h1>Setup Complete!</h1><p>Saved network '{}'.</p>\
         <p>Device will restart and connect to your WiFi network.</p></body></html>",
        html_escape(ssid)
    )
}

fn error_page(error: &PortalError) -> String {
    format!(
        "<!DOCTYPE html><html><body><h1>Error</h1><p>{}</p><a href='/'>Go Back</a></body></html>",
        error
    )
}
