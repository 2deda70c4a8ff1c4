// ─── Driver Nanoleaf: API REST local con token ───
//
// Sin token hay que hacer pairing: el usuario mantiene apretado el botón
// de encendido del controlador y mientras tanto `POST /api/v1/new`
// devuelve 403; cuando el controlador entra en modo pairing devuelve el
// token. Sin host se descubre por mDNS (`_nanoleafapi._tcp`).

use anyhow::{bail, Context, Result};
use embedded_svc::http::Method;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::rc::Rc;
use std::time::Duration;

use super::color::to_hsb;
use super::{ColorPalette, DriverStatus, LightingConfig, ServiceDiscovery, SystemType, UserAction};
use crate::platform::{Clock, HttpTransport};
use crate::watchdog;

pub const DEFAULT_PORT: u16 = 16021;

const MDNS_SERVICE: &str = "_nanoleafapi";
const MDNS_PROTOCOL: &str = "_tcp";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const PAIRING_ACTION: &str = "nanoleaf_pairing";
const PAIRING_INSTRUCTIONS: &str =
    "Hold the power button on your Nanoleaf controller for 5-7 seconds until the LEDs start flashing.";
const PAIRING_TIMEOUT_SECS: u32 = 30;
const PAIRING_POLL_MS: u64 = 1_000;

pub struct NanoleafDriver {
    http: Box<dyn HttpTransport>,
    discovery: Box<dyn ServiceDiscovery>,
    clock: Rc<dyn Clock>,
    host: String,
    port: u16,
    token: String,
    status: DriverStatus,
}

impl NanoleafDriver {
    pub fn new(
        http: Box<dyn HttpTransport>,
        discovery: Box<dyn ServiceDiscovery>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            discovery,
            clock,
            host: String::new(),
            port: DEFAULT_PORT,
            token: String::new(),
            status: DriverStatus::Unconfigured,
        }
    }

    pub fn configure(&mut self, config: &LightingConfig) -> Result<()> {
        let host = if config.has_host() {
            config.host_address.trim().to_string()
        } else {
            String::new()
        };
        // El backend manda 80 cuando no sabe el puerto.
        let port = match config.port {
            0 | 80 => DEFAULT_PORT,
            port => port,
        };
        // Token vacío con el mismo host: conservar el que ya negociamos.
        let token = if config.auth_token.is_empty() && host == self.host {
            self.token.clone()
        } else {
            config.auth_token.clone()
        };

        if self.status == DriverStatus::Ready
            && host == self.host
            && port == self.port
            && token == self.token
        {
            debug!("Nanoleaf already configured at {}:{}", host, port);
            return Ok(());
        }

        self.host = host;
        self.port = port;
        self.token = token;

        if self.host.is_empty() || self.token.is_empty() {
            info!(
                "Nanoleaf configured without {}; authentication required",
                if self.host.is_empty() { "host" } else { "token" }
            );
            self.status = DriverStatus::AuthenticationRequired;
            return Ok(());
        }

        info!(
            "Configuring Nanoleaf at {}:{} (token: {} chars)",
            self.host,
            self.port,
            self.token.len()
        );
        match self.test_connection() {
            Ok(()) => Ok(()),
            // Token rechazado: queda pendiente de pairing, no es falla de configuración.
            Err(_) if self.status == DriverStatus::AuthenticationRequired => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("http://{}:{}/api/v1/{}", self.host, self.port, path)
    }

    /// `GET /api/v1/{token}/`. 401/403 borra el token.
    pub fn test_connection(&mut self) -> Result<()> {
        if self.host.is_empty() {
            bail!("Nanoleaf host unknown");
        }
        if self.token.is_empty() {
            self.status = DriverStatus::AuthenticationRequired;
            bail!("Nanoleaf has no auth token");
        }

        let url = self.api_url(&format!("{}/", self.token));
        let response = match self.http.request(Method::Get, &url, None) {
            Ok(response) => response,
            Err(e) => {
                self.status = DriverStatus::Error;
                return Err(e.context(format!("Nanoleaf at {} unreachable", self.host)));
            }
        };

        match response.status {
            200..=299 => {
                self.status = DriverStatus::Ready;
                Ok(())
            }
            401 | 403 => {
                warn!("Nanoleaf rejected the stored token");
                self.token.clear();
                self.status = DriverStatus::AuthenticationRequired;
                bail!("Nanoleaf token rejected (HTTP {})", response.status)
            }
            status => {
                self.status = DriverStatus::Error;
                bail!("Nanoleaf probe failed with HTTP {}", status)
            }
        }
    }

    /// Descubre (si hace falta), valida el token y si no hay uno válido
    /// hace pairing. Bloquea hasta `PAIRING_TIMEOUT_SECS` alimentando el watchdog.
    pub fn authenticate(&mut self, notify: &mut dyn FnMut(&UserAction)) -> Result<()> {
        if self.host.is_empty() {
            self.discover()?;
        }

        if !self.token.is_empty() {
            match self.test_connection() {
                Ok(()) => {
                    info!("Nanoleaf token still valid");
                    return Ok(());
                }
                Err(e) if self.status != DriverStatus::AuthenticationRequired => return Err(e),
                Err(_) => {}
            }
        }

        self.pair(notify)
    }

    fn discover(&mut self) -> Result<()> {
        info!("Searching for Nanoleaf controllers via mDNS...");
        watchdog::feed();
        let found = self
            .discovery
            .discover(MDNS_SERVICE, MDNS_PROTOCOL, DISCOVERY_TIMEOUT)
            .context("mDNS query failed")?;
        watchdog::feed();

        match found {
            Some(service) => {
                info!("Found Nanoleaf at {}:{}", service.host, service.port);
                self.host = service.host;
                self.port = if service.port == 0 { DEFAULT_PORT } else { service.port };
                self.status = DriverStatus::AuthenticationRequired;
                Ok(())
            }
            None => {
                self.status = DriverStatus::Error;
                bail!("no Nanoleaf controller found on the network")
            }
        }
    }

    fn pair(&mut self, notify: &mut dyn FnMut(&UserAction)) -> Result<()> {
        info!("Starting Nanoleaf pairing with {}", self.host);
        notify(&UserAction {
            action: PAIRING_ACTION.to_string(),
            instructions: PAIRING_INSTRUCTIONS.to_string(),
            timeout_secs: PAIRING_TIMEOUT_SECS,
        });

        let url = self.api_url("new");
        let deadline = self.clock.now_ms() + u64::from(PAIRING_TIMEOUT_SECS) * 1_000;

        while self.clock.now_ms() < deadline {
            watchdog::feed();
            match self.http.request(Method::Post, &url, None) {
                Ok(response) if response.is_success() => {
                    let token = serde_json::from_str::<Value>(&response.body)
                        .ok()
                        .and_then(|body| body.get("auth_token")?.as_str().map(str::to_string))
                        .filter(|token| !token.is_empty());
                    if let Some(token) = token {
                        info!("Nanoleaf paired (token: {} chars)", token.len());
                        self.token = token;
                        self.status = DriverStatus::Ready;
                        return Ok(());
                    }
                    warn!("Nanoleaf pairing reply had no auth_token");
                }
                Ok(response) if response.status == 403 => {
                    debug!("Nanoleaf not in pairing mode yet");
                }
                Ok(response) => {
                    warn!("Nanoleaf pairing returned HTTP {}", response.status);
                }
                Err(e) => {
                    debug!("Nanoleaf pairing request failed: {:?}", e);
                }
            }
            self.clock.sleep_ms(PAIRING_POLL_MS);
        }

        self.status = DriverStatus::AuthenticationRequired;
        bail!("Nanoleaf pairing timed out after {} s", PAIRING_TIMEOUT_SECS)
    }

    pub fn display_palette(&mut self, palette: &ColorPalette) -> Result<()> {
        if self.status != DriverStatus::Ready {
            bail!("Nanoleaf is not ready ({})", self.status.as_str());
        }
        let url = self.api_url(&format!("{}/effects", self.token));
        let body = effect_payload(palette).to_string();
        let response = self
            .http
            .request(Method::Put, &url, Some(&body))
            .context("failed to send effect to Nanoleaf")?;
        if !response.is_success() {
            if matches!(response.status, 401 | 403) {
                self.token.clear();
                self.status = DriverStatus::AuthenticationRequired;
            }
            bail!("Nanoleaf rejected effect with HTTP {}", response.status);
        }
        debug!("Nanoleaf effect applied ({} colors)", palette.color_count());
        Ok(())
    }

    pub fn status(&self) -> DriverStatus {
        self.status
    }

    pub fn reset(&mut self) {
        self.host.clear();
        self.port = DEFAULT_PORT;
        self.token.clear();
        self.status = DriverStatus::Unconfigured;
    }

    pub fn config(&self) -> LightingConfig {
        LightingConfig::networked(SystemType::Nanoleaf, &self.host, self.port, &self.token)
    }
}

/// Efecto "random" con la paleta en HSB.
fn effect_payload(palette: &ColorPalette) -> Value {
    let colors: Vec<Value> = palette
        .colors
        .iter()
        .map(|color| {
            let hsb = to_hsb(*color);
            json!({
                "hue": hsb.hue,
                "saturation": hsb.saturation,
                "brightness": hsb.brightness,
            })
        })
        .collect();

    json!({
        "write": {
            "command": "display",
            "version": "2.0",
            "animType": "random",
            "colorType": "HSB",
            "palette": colors,
            "transTime": { "minValue": 50, "maxValue": 100 },
            "delayTime": { "minValue": 50, "maxValue": 100 },
            "loop": true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::DiscoveredService;
    use crate::testing::{FakeClock, FakeDiscovery, ScriptedHttp};
    use pretty_assertions::assert_eq;

    const HOST: &str = "192.168.1.60";

    fn driver(http: &ScriptedHttp, discovery: &FakeDiscovery, clock: &FakeClock) -> NanoleafDriver {
        NanoleafDriver::new(
            Box::new(http.clone()),
            Box::new(discovery.clone()),
            Rc::new(clock.clone()),
        )
    }

    #[test]
    fn configure_without_token_needs_authentication() {
        let http = ScriptedHttp::default();
        let mut leaf = driver(&http, &FakeDiscovery::default(), &FakeClock::new());
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, HOST, 80, ""))
            .unwrap();

        assert_eq!(leaf.status(), DriverStatus::AuthenticationRequired);
        assert_eq!(leaf.config().port, DEFAULT_PORT);
        assert!(http.requests().is_empty());
    }

    #[test]
    fn valid_token_makes_driver_ready() {
        let http = ScriptedHttp::default();
        http.respond_json("GET", "http://192.168.1.60:16021/api/v1/tok/", 200, "{}");
        let mut leaf = driver(&http, &FakeDiscovery::default(), &FakeClock::new());
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, HOST, 16021, "tok"))
            .unwrap();
        assert_eq!(leaf.status(), DriverStatus::Ready);

        // Mismo host sin token: se conserva el negociado.
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, HOST, 16021, ""))
            .unwrap();
        assert_eq!(leaf.config().auth_token, "tok");
        assert_eq!(http.requests().len(), 1);
    }

    #[test]
    fn rejected_token_is_cleared() {
        let http = ScriptedHttp::default();
        http.respond_json("GET", "http://192.168.1.60:16021/api/v1/old/", 401, "");
        let mut leaf = driver(&http, &FakeDiscovery::default(), &FakeClock::new());
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, HOST, 16021, "old"))
            .unwrap();

        assert_eq!(leaf.status(), DriverStatus::AuthenticationRequired);
        assert_eq!(leaf.config().auth_token, "");
    }

    #[test]
    fn pairing_polls_until_button_pressed() {
        let http = ScriptedHttp::default();
        let url = "http://192.168.1.60:16021/api/v1/new";
        http.respond_json("POST", url, 403, "");
        http.respond_json("POST", url, 403, "");
        http.respond_json("POST", url, 200, r#"{"auth_token":"fresh"}"#);
        let clock = FakeClock::new();
        let mut leaf = driver(&http, &FakeDiscovery::default(), &clock);
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, HOST, 0, ""))
            .unwrap();

        let mut actions = Vec::new();
        leaf.authenticate(&mut |action: &UserAction| actions.push(action.clone()))
            .unwrap();

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "nanoleaf_pairing");
        assert_eq!(actions[0].timeout_secs, 30);
        assert_eq!(http.requests_to(url), 3);
        assert_eq!(clock.now_ms(), 2_000);
        assert_eq!(leaf.status(), DriverStatus::Ready);
        assert_eq!(leaf.config().auth_token, "fresh");
    }

    #[test]
    fn pairing_gives_up_after_thirty_seconds() {
        let http = ScriptedHttp::default();
        http.respond_json("POST", "http://192.168.1.60:16021/api/v1/new", 403, "");
        let clock = FakeClock::new();
        let mut leaf = driver(&http, &FakeDiscovery::default(), &clock);
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, HOST, 0, ""))
            .unwrap();

        assert!(leaf.authenticate(&mut |_: &UserAction| {}).is_err());
        assert_eq!(clock.now_ms(), 30_000);
        assert_eq!(leaf.status(), DriverStatus::AuthenticationRequired);
    }

    #[test]
    fn authenticate_discovers_missing_host() {
        let http = ScriptedHttp::default();
        http.respond_json("POST", "http://10.0.0.9:16021/api/v1/new", 200, r#"{"auth_token":"t"}"#);
        let discovery = FakeDiscovery::default();
        discovery.answer(DiscoveredService {
            host: "10.0.0.9".into(),
            port: 16021,
        });
        let mut leaf = driver(&http, &discovery, &FakeClock::new());
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, "undefined", 80, ""))
            .unwrap();

        leaf.authenticate(&mut |_: &UserAction| {}).unwrap();

        assert_eq!(discovery.queries(), vec![("_nanoleafapi".to_string(), "_tcp".to_string())]);
        assert_eq!(leaf.config().host_address, "10.0.0.9");
    }

    #[test]
    fn discovery_without_result_is_error() {
        let mut leaf = driver(&ScriptedHttp::default(), &FakeDiscovery::default(), &FakeClock::new());
        leaf.configure(&LightingConfig::networked(SystemType::Nanoleaf, "", 0, ""))
            .unwrap();
        assert!(leaf.authenticate(&mut |_: &UserAction| {}).is_err());
        assert_eq!(leaf.status(), DriverStatus::Error);
    }

    #[test]
    fn effect_payload_is_hsb_random() {
        let payload = effect_payload(&ColorPalette::from_hex(["FF0000", "0000FF"]));
        assert_eq!(payload["write"]["animType"], "random");
        assert_eq!(payload["write"]["colorType"], "HSB");
        assert_eq!(
            payload["write"]["palette"],
            json!([
                { "hue": 0, "saturation": 100, "brightness": 100 },
                { "hue": 240, "saturation": 100, "brightness": 100 },
            ])
        );
    }
}
