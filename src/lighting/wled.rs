// ─── Driver WLED: controlador con API JSON por HTTP ───

use anyhow::{bail, Context, Result};
use embedded_svc::http::Method;
use log::{debug, info, warn};
use serde_json::{json, Value};

use super::color::{stretch_runs, to_hex};
use super::{ColorPalette, DriverStatus, LightingConfig, SystemType};
use crate::platform::HttpTransport;

const DEFAULT_PORT: u16 = 80;

/// `seg.col` admite hasta tres colores (primario, secundario, terciario).
const MAX_SEGMENT_COLORS: usize = 3;

pub struct WledDriver {
    http: Box<dyn HttpTransport>,
    host: String,
    port: u16,
    led_count: Option<u16>,
    status: DriverStatus,
}

impl WledDriver {
    pub fn new(http: Box<dyn HttpTransport>) -> Self {
        Self {
            http,
            host: String::new(),
            port: DEFAULT_PORT,
            led_count: None,
            status: DriverStatus::Unconfigured,
        }
    }

    pub fn configure(&mut self, config: &LightingConfig) -> Result<()> {
        if !config.has_host() {
            self.status = DriverStatus::Error;
            bail!("WLED needs a host address");
        }
        let host = config.host_address.trim().to_string();
        let port = if config.port == 0 { DEFAULT_PORT } else { config.port };

        if self.status == DriverStatus::Ready && self.host == host && self.port == port {
            debug!("WLED already configured at {}:{}", host, port);
            return Ok(());
        }

        info!("Configuring WLED at {}:{}", host, port);
        self.host = host;
        self.port = port;
        self.led_count = None;
        self.test_connection()
    }

    fn base_url(&self) -> String {
        if self.port == DEFAULT_PORT {
            format!("http://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// `GET /json/info`: alcanzabilidad + cantidad de LEDs.
    pub fn test_connection(&mut self) -> Result<()> {
        if self.host.is_empty() {
            bail!("WLED is not configured");
        }
        let url = format!("{}/json/info", self.base_url());
        let response = match self.http.request(Method::Get, &url, None) {
            Ok(response) => response,
            Err(e) => {
                self.status = DriverStatus::Error;
                return Err(e.context(format!("WLED at {} unreachable", self.host)));
            }
        };
        if !response.is_success() {
            self.status = DriverStatus::Error;
            bail!("WLED info request failed with HTTP {}", response.status);
        }

        let info: Value = serde_json::from_str(&response.body).unwrap_or_else(|e| {
            warn!("WLED info is not valid JSON: {}", e);
            Value::Null
        });
        self.led_count = info
            .pointer("/leds/count")
            .and_then(Value::as_u64)
            .and_then(|count| u16::try_from(count).ok())
            .filter(|count| *count > 0);
        match self.led_count {
            Some(count) => info!("WLED reachable, {} LEDs", count),
            None => warn!("WLED reachable but did not report its LED count"),
        }
        self.status = DriverStatus::Ready;
        Ok(())
    }

    pub fn display_palette(&mut self, palette: &ColorPalette) -> Result<()> {
        if self.status != DriverStatus::Ready {
            bail!("WLED is not ready");
        }
        let state = state_payload(palette, self.led_count);
        let url = format!("{}/json/state", self.base_url());
        let response = self
            .http
            .request(Method::Post, &url, Some(&state.to_string()))
            .context("failed to send palette to WLED")?;
        if !response.is_success() {
            bail!("WLED rejected palette with HTTP {}", response.status);
        }
        debug!("WLED palette applied ({} colors)", palette.color_count());
        Ok(())
    }

    pub fn status(&self) -> DriverStatus {
        self.status
    }

    pub fn reset(&mut self) {
        self.host.clear();
        self.port = DEFAULT_PORT;
        self.led_count = None;
        self.status = DriverStatus::Unconfigured;
    }

    pub fn config(&self) -> LightingConfig {
        LightingConfig::networked(SystemType::Wled, &self.host, self.port, "")
    }
}

/// Cuerpo de `POST /json/state`.
///
/// Con la cantidad de LEDs conocida se manda un color por tramo
/// (`seg.i`: `start, stop, "RRGGBB", ...`); si no, hasta tres colores
/// de segmento.
fn state_payload(palette: &ColorPalette, led_count: Option<u16>) -> Value {
    let segment = match led_count {
        Some(count) => {
            let mut individual = Vec::new();
            for (start, stop, color) in stretch_runs(&palette.colors, count as usize) {
                individual.push(json!(start));
                individual.push(json!(stop));
                individual.push(json!(to_hex(color)));
            }
            json!({ "id": 0, "i": individual })
        }
        None => {
            let colors: Vec<Value> = palette
                .colors
                .iter()
                .take(MAX_SEGMENT_COLORS)
                .map(|c| json!([c.r, c.g, c.b]))
                .collect();
            json!({ "id": 0, "col": colors })
        }
    };
    json!({ "on": true, "bri": 255, "seg": [segment] })
}
