//! Puertos hacia el hardware y la red.
//!
//! La lógica del dispositivo solo conoce estos traits; las
//! implementaciones reales viven en `esp/` y las de test en `testing`.

use anyhow::Result;
use embedded_svc::http::Method;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::provisioning::PortalContext;

// ─── Tiempo ───

pub trait Clock {
    /// Milisegundos desde el arranque.
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

/// Reloj monotónico de `std` (funciona igual en ESP-IDF).
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

// ─── Sistema ───

pub trait SystemControl {
    /// Reinicia el chip. En el dispositivo no retorna.
    fn restart(&mut self);
    fn free_heap(&self) -> u32;
}

/// Foto del estado de red/memoria que se reporta al servidor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub ip_address: Option<Ipv4Addr>,
    pub rssi: Option<i8>,
    pub free_heap: u32,
    pub uptime_ms: u64,
}

// ─── WiFi ───

/// Una red encontrada en el scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointInfo {
    pub ssid: String,
    pub rssi: i8,
    pub encrypted: bool,
}

pub trait WifiControl {
    fn mac_address(&self) -> [u8; 6];

    /// Conecta en modo Station; bloquea hasta `timeout` como máximo.
    fn connect_station(&mut self, ssid: &str, password: &str, timeout: Duration) -> Result<()>;
    fn disconnect_station(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn ip_address(&self) -> Option<Ipv4Addr>;
    fn rssi(&self) -> Option<i8>;

    /// Levanta el Access Point y devuelve su IP.
    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<Ipv4Addr>;
    fn stop_access_point(&mut self) -> Result<()>;
    fn scan(&mut self) -> Result<Vec<AccessPointInfo>>;
}

// ─── HTTP (request/reply) ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpTransport {
    /// Un request JSON. `body` se manda con `Content-Type: application/json`.
    fn request(&mut self, method: Method, url: &str, body: Option<&str>) -> Result<HttpResponse>;
}

// ─── Canal dúplex (WebSocket) ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed(Option<String>),
    Text(String),
    Ping,
    Pong,
    Error(String),
}

pub trait DuplexTransport {
    /// Inicia la conexión. El resultado llega como `Opened`/`Error` en `poll`.
    fn open(&mut self, url: &str) -> Result<()>;
    fn poll(&mut self) -> Option<TransportEvent>;
    fn send_text(&mut self, text: &str) -> Result<()>;
    fn ping(&mut self) -> Result<()>;
    fn close(&mut self);
}

// ─── Hardware de iluminación ───

/// Tira direccionable (WS2812) detrás de un periférico de salida.
pub trait LedStrip {
    /// Toma el GPIO y reserva `led_count` LEDs. Reemplaza la conexión anterior.
    fn attach(&mut self, pin: u8, led_count: usize) -> Result<()>;
    fn write(&mut self, pixels: &[smart_leds::RGB8]) -> Result<()>;
}

/// Un servicio anunciado por mDNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub host: String,
    pub port: u16,
}

pub trait ServiceDiscovery {
    /// Busca la primera instancia de `service`/`protocol` (p. ej. `_nanoleafapi`/`_tcp`).
    fn discover(
        &mut self,
        service: &str,
        protocol: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredService>>;
}

// ─── Portal cautivo ───

/// Servidor HTTP (puerto 80) + DNS comodín del modo AP.
///
/// Los handlers HTTP solo tocan `PortalContext`; el loop principal lee
/// los comandos que dejan ahí.
pub trait PortalBackend {
    fn start(&mut self, ap_address: Ipv4Addr, context: Arc<PortalContext>) -> Result<()>;
    /// Atiende las consultas DNS pendientes sin bloquear.
    fn poll(&mut self);
    /// Libera el servidor HTTP y el socket DNS.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}
