// ─── Configuración del firmware ───
//
// Constantes de compilación (versión, AP de setup, servidor por defecto,
// pines) y los tiempos del ciclo de vida agrupados en `Timing`.

use std::net::Ipv4Addr;

// ─── Identidad del firmware ───

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEVICE_TYPE: &str = "PalPalette";

// ─── Access Point de configuración ───

pub const DEFAULT_AP_SSID: &str = "PalPalette-Setup";
pub const DEFAULT_AP_PASSWORD: &str = "setup123"; // Mínimo 8 chars para WPA2
pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
pub const AP_CHANNEL: u8 = 1;
pub const AP_MAX_CONNECTIONS: u16 = 4;

/// Memoria libre mínima para levantar el servidor HTTP del portal.
pub const PORTAL_MIN_FREE_HEAP: u32 = 15_000;

// ─── Servidor ───

/// URL del canal WebSocket si el usuario no configuró otra.
/// Se puede fijar al compilar con `PALPALETTE_SERVER_URL`.
pub const DEFAULT_SERVER_URL: &str = match option_env!("PALPALETTE_SERVER_URL") {
    Some(url) => url,
    None => "ws://192.168.178.66:3001/ws",
};

/// Puerto de la API REST (registro, status). Vive al lado del servidor WebSocket.
pub const API_PORT: u16 = 3000;

// ─── Hardware de iluminación ───

pub const DEFAULT_LED_PIN: u8 = 2;
pub const DEFAULT_LED_COUNT: u16 = 10;
/// Tope de LEDs por tira: cada frame vive entero en RAM.
pub const MAX_LED_COUNT: u16 = 300;
pub const STRIP_BRIGHTNESS: u8 = 255;

// ─── Tiempos ───

/// Todos los tiempos del ciclo de vida, en milisegundos.
///
/// `Default` da los valores de producción; los tests los achican.
#[derive(Debug, Clone)]
pub struct Timing {
    pub wifi_connect_timeout_ms: u64,
    pub wifi_max_attempts: u32,
    pub wifi_retry_initial_ms: u64,
    pub wifi_retry_max_ms: u64,
    pub registration_max_attempts: u32,
    pub registration_retry_ms: u64,
    pub registration_retry_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub session_retry_base_ms: u64,
    pub session_retry_max_ms: u64,
    pub session_retry_reset_ms: u64,
    pub session_connect_timeout_ms: u64,
    pub status_update_interval_ms: u64,
    pub portal_lifetime_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub watchdog_feed_interval_ms: u64,
    pub factory_reset_grace_ms: u64,
    pub save_reboot_grace_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            wifi_connect_timeout_ms: 30_000,
            wifi_max_attempts: 3,
            wifi_retry_initial_ms: 1_000,
            wifi_retry_max_ms: 60_000,
            registration_max_attempts: 5,
            registration_retry_ms: 5_000,
            registration_retry_max_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            session_retry_base_ms: 5_000,
            session_retry_max_ms: 30_000,
            session_retry_reset_ms: 300_000,
            session_connect_timeout_ms: 10_000,
            status_update_interval_ms: 60_000,
            portal_lifetime_ms: 300_000,
            watchdog_timeout_ms: 30_000,
            watchdog_feed_interval_ms: 5_000,
            factory_reset_grace_ms: 500,
            save_reboot_grace_ms: 2_000,
        }
    }
}

/// Delay exponencial `initial · 2^attempt`, acotado a `max`.
pub fn exponential_delay(initial_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    initial_ms
        .checked_shl(attempt.min(16))
        .unwrap_or(max_ms)
        .min(max_ms)
}
