//! Capa de iluminación: un contrato único sobre backends heterogéneos.
//!
//! Cada variante de `LightingDriver` es dueña de su transporte y de su
//! estado de autenticación. `LightManager` es el registro que elige la
//! variante según la configuración y persiste lo que el driver aprendió
//! (token, host descubierto) en el namespace `lighting`.

mod color;
mod nanoleaf;
mod strip;
mod wled;

pub use color::{parse_hex, stretch, stretch_runs, to_hex, to_hsb, Hsb};
pub use nanoleaf::NanoleafDriver;
pub use strip::StripDriver;
pub use wled::WledDriver;

pub use crate::platform::{DiscoveredService, LedStrip, ServiceDiscovery};

use anyhow::{Context, Result};
use log::{info, warn};
use smart_leds::RGB8;
use std::fmt;
use std::rc::Rc;

use crate::identity::IdentityStore;
use crate::platform::{Clock, HttpTransport};

/// Máximo de colores por paleta.
pub const MAX_COLORS: usize = 10;

// ─── Tipos de sistema ───

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SystemType {
    #[default]
    None,
    /// Tira WS2812 conectada a un GPIO.
    Ws2812,
    /// Controlador WLED (API JSON por HTTP).
    Wled,
    /// Paneles Nanoleaf (API REST con token).
    Nanoleaf,
}

impl SystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ws2812 => "ws2812",
            Self::Wled => "wled",
            Self::Nanoleaf => "nanoleaf",
        }
    }

    /// Nombre en el cable → tipo. Desconocido ⇒ `None` (el Option).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "ws2812" | "strip" => Some(Self::Ws2812),
            "wled" => Some(Self::Wled),
            "nanoleaf" => Some(Self::Nanoleaf),
            _ => None,
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Configuración ───

/// Parámetros propios de la tira (`customConfig` en el cable).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CustomConfig {
    pub led_pin: Option<u8>,
    pub led_count: Option<u16>,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct LightingConfig {
    pub system_type: SystemType,
    pub host_address: String,
    pub port: u16,
    pub auth_token: String,
    pub custom: CustomConfig,
}

impl LightingConfig {
    /// Tira local: sin host, con pin y cantidad.
    pub fn strip(pin: u8, led_count: u16) -> Self {
        Self {
            system_type: SystemType::Ws2812,
            custom: CustomConfig {
                led_pin: Some(pin),
                led_count: Some(led_count),
            },
            ..Self::default()
        }
    }

    pub fn networked(system_type: SystemType, host: &str, port: u16, auth_token: &str) -> Self {
        Self {
            system_type,
            host_address: host.to_string(),
            port,
            auth_token: auth_token.to_string(),
            custom: CustomConfig::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.system_type != SystemType::None
    }

    /// `""`, `"null"` y `"undefined"` significan "descubrir".
    pub fn has_host(&self) -> bool {
        !matches!(self.host_address.trim(), "" | "null" | "undefined")
    }
}

// El token nunca sale en los logs.
impl fmt::Debug for LightingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightingConfig")
            .field("system_type", &self.system_type)
            .field("host_address", &self.host_address)
            .field("port", &self.port)
            .field(
                "auth_token",
                &if self.auth_token.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("custom", &self.custom)
            .finish()
    }
}

// ─── Paleta ───

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorPalette {
    pub message_id: String,
    pub sender_name: String,
    pub timestamp: u64,
    pub colors: heapless::Vec<RGB8, MAX_COLORS>,
}

impl ColorPalette {
    /// Se queda con los primeros `MAX_COLORS`.
    pub fn from_colors<I: IntoIterator<Item = RGB8>>(colors: I) -> Self {
        Self {
            colors: colors.into_iter().take(MAX_COLORS).collect(),
            ..Self::default()
        }
    }

    /// Hex inválido ⇒ negro, para no correr las posiciones.
    pub fn from_hex<'a, I: IntoIterator<Item = &'a str>>(hexes: I) -> Self {
        Self::from_colors(
            hexes
                .into_iter()
                .map(|hex| parse_hex(hex).unwrap_or_default()),
        )
    }

    /// Rojo, verde, azul: lo que muestra el comando de prueba.
    pub fn test_pattern() -> Self {
        let mut palette = Self::from_colors([
            RGB8::new(255, 0, 0),
            RGB8::new(0, 255, 0),
            RGB8::new(0, 0, 255),
        ]);
        palette.message_id = "test".to_string();
        palette.sender_name = "PalPalette".to_string();
        palette
    }

    pub fn color_count(&self) -> usize {
        self.colors.len()
    }
}

// ─── Estado y notificaciones ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Unconfigured,
    Ready,
    AuthenticationRequired,
    Error,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Ready => "ready",
            Self::AuthenticationRequired => "authentication_required",
            Self::Error => "error",
        }
    }
}

/// Pedido de acción física al usuario (p. ej. mantener el botón de encendido).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAction {
    pub action: String,
    pub instructions: String,
    pub timeout_secs: u32,
}

/// Callback que registra la sesión; el driver lo invoca y la sesión lo reenvía.
pub type UserNotifier = Box<dyn FnMut(&UserAction)>;

// ─── Fábrica de transportes ───

/// Entrega a cada driver su propio transporte.
pub trait LightingBackends {
    fn http(&mut self) -> Box<dyn HttpTransport>;
    fn led_strip(&mut self) -> Box<dyn LedStrip>;
    fn discovery(&mut self) -> Box<dyn ServiceDiscovery>;
}

// ─── Dispatch ───

pub enum LightingDriver {
    Strip(StripDriver),
    Wled(WledDriver),
    Nanoleaf(NanoleafDriver),
}

impl LightingDriver {
    pub fn create(
        system_type: SystemType,
        backends: &mut dyn LightingBackends,
        clock: Rc<dyn Clock>,
    ) -> Option<Self> {
        match system_type {
            SystemType::None => None,
            SystemType::Ws2812 => Some(Self::Strip(StripDriver::new(backends.led_strip()))),
            SystemType::Wled => Some(Self::Wled(WledDriver::new(backends.http()))),
            SystemType::Nanoleaf => Some(Self::Nanoleaf(NanoleafDriver::new(
                backends.http(),
                backends.discovery(),
                clock,
            ))),
        }
    }

    pub fn system_type(&self) -> SystemType {
        match self {
            Self::Strip(_) => SystemType::Ws2812,
            Self::Wled(_) => SystemType::Wled,
            Self::Nanoleaf(_) => SystemType::Nanoleaf,
        }
    }

    pub fn configure(&mut self, config: &LightingConfig) -> Result<()> {
        match self {
            Self::Strip(driver) => driver.configure(config),
            Self::Wled(driver) => driver.configure(config),
            Self::Nanoleaf(driver) => driver.configure(config),
        }
    }

    pub fn requires_user_authentication(&self) -> bool {
        matches!(self, Self::Nanoleaf(_))
    }

    pub fn authenticate(&mut self, notify: &mut dyn FnMut(&UserAction)) -> Result<()> {
        match self {
            Self::Strip(driver) => driver.test_connection(),
            Self::Wled(driver) => driver.test_connection(),
            Self::Nanoleaf(driver) => driver.authenticate(notify),
        }
    }

    pub fn test_connection(&mut self) -> Result<()> {
        match self {
            Self::Strip(driver) => driver.test_connection(),
            Self::Wled(driver) => driver.test_connection(),
            Self::Nanoleaf(driver) => driver.test_connection(),
        }
    }

    pub fn display_palette(&mut self, palette: &ColorPalette) -> Result<()> {
        match self {
            Self::Strip(driver) => driver.display_palette(palette),
            Self::Wled(driver) => driver.display_palette(palette),
            Self::Nanoleaf(driver) => driver.display_palette(palette),
        }
    }

    pub fn status(&self) -> DriverStatus {
        match self {
            Self::Strip(driver) => driver.status(),
            Self::Wled(driver) => driver.status(),
            Self::Nanoleaf(driver) => driver.status(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Strip(driver) => driver.reset(),
            Self::Wled(driver) => driver.reset(),
            Self::Nanoleaf(driver) => driver.reset(),
        }
    }

    /// Configuración efectiva (con lo descubierto/negociado).
    pub fn config(&self) -> LightingConfig {
        match self {
            Self::Strip(driver) => driver.config(),
            Self::Wled(driver) => driver.config(),
            Self::Nanoleaf(driver) => driver.config(),
        }
    }
}

// ─── Registro ───

pub struct LightManager {
    backends: Box<dyn LightingBackends>,
    clock: Rc<dyn Clock>,
    driver: Option<LightingDriver>,
    notifier: Option<UserNotifier>,
    last_test_at: Option<u64>,
}

impl LightManager {
    pub fn new(backends: Box<dyn LightingBackends>, clock: Rc<dyn Clock>) -> Self {
        Self {
            backends,
            clock,
            driver: None,
            notifier: None,
            last_test_at: None,
        }
    }

    pub fn set_user_notifier(&mut self, notifier: UserNotifier) {
        self.notifier = Some(notifier);
    }

    /// Levanta el driver guardado. Devuelve si quedó alguno activo.
    ///
    /// Un driver que no configura (host caído, etc.) queda activo en
    /// estado `Error` para que el servidor lo vea y lo pueda reconfigurar.
    pub fn load(&mut self, store: &IdentityStore) -> Result<bool> {
        let config = store.lighting_config()?;
        if !config.is_configured() {
            info!("No lighting system configured");
            self.drop_driver();
            return Ok(false);
        }

        info!("Loading lighting system: {}", config.system_type);
        self.ensure_driver(config.system_type);
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.configure(&config) {
                warn!("Stored {} configuration did not apply: {:?}", config.system_type, e);
            }
        }
        Ok(self.driver.is_some())
    }

    /// Aplica una configuración nueva y la persiste si cambió.
    ///
    /// Dos llamadas con la misma configuración dejan el mismo driver y
    /// el mismo contenido en storage.
    pub fn configure(&mut self, config: LightingConfig, store: &mut IdentityStore) -> Result<()> {
        if !config.is_configured() {
            info!("Lighting system set to none");
            return self.reset(store);
        }

        self.ensure_driver(config.system_type);
        let driver = self
            .driver
            .as_mut()
            .context("no driver for lighting system")?;
        driver
            .configure(&config)
            .with_context(|| format!("failed to configure {}", config.system_type))?;

        let effective = driver.config();
        if store.lighting_config()? != effective {
            store.save_lighting_config(&effective)?;
            info!("Lighting configuration saved: {:?}", effective);
        }
        Ok(())
    }

    /// Corre la autenticación del driver, reenviando los pedidos de
    /// acción al notificador registrado, y persiste el resultado.
    pub fn authenticate(&mut self, store: &mut IdentityStore) -> Result<()> {
        let Self {
            driver, notifier, ..
        } = self;
        let driver = driver.as_mut().context("no lighting system configured")?;

        let mut notify = |action: &UserAction| {
            if let Some(notifier) = notifier.as_mut() {
                notifier(action);
            }
        };
        let result = driver.authenticate(&mut notify);

        let effective = driver.config();
        if store.lighting_config()? != effective {
            store.save_lighting_config(&effective)?;
        }
        result
    }

    pub fn requires_user_authentication(&self) -> bool {
        self.driver
            .as_ref()
            .map(|driver| driver.requires_user_authentication())
            .unwrap_or(false)
    }

    pub fn test_connection(&mut self) -> Result<()> {
        self.last_test_at = Some(self.clock.now_ms());
        self.driver
            .as_mut()
            .context("no lighting system configured")?
            .test_connection()
    }

    pub fn display_palette(&mut self, palette: &ColorPalette) -> Result<()> {
        self.driver
            .as_mut()
            .context("no lighting system configured")?
            .display_palette(palette)
    }

    pub fn status(&self) -> DriverStatus {
        self.driver
            .as_ref()
            .map(|driver| driver.status())
            .unwrap_or(DriverStatus::Unconfigured)
    }

    pub fn is_ready(&self) -> bool {
        self.status() == DriverStatus::Ready
    }

    pub fn system_type(&self) -> SystemType {
        self.driver
            .as_ref()
            .map(|driver| driver.system_type())
            .unwrap_or_default()
    }

    pub fn config(&self) -> Option<LightingConfig> {
        self.driver.as_ref().map(|driver| driver.config())
    }

    /// Momento (ms desde el arranque) de la última prueba de conexión.
    pub fn last_test_at(&self) -> Option<u64> {
        self.last_test_at
    }

    /// Apaga el driver y borra el namespace `lighting`.
    pub fn reset(&mut self, store: &mut IdentityStore) -> Result<()> {
        self.drop_driver();
        store.clear_lighting_config()
    }

    fn ensure_driver(&mut self, system_type: SystemType) {
        let current = self.driver.as_ref().map(|driver| driver.system_type());
        if current == Some(system_type) {
            return;
        }
        self.drop_driver();
        self.driver = LightingDriver::create(system_type, self.backends.as_mut(), self.clock.clone());
    }

    fn drop_driver(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.reset();
        }
    }
}
