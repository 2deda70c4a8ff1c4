// ─── Taxonomía de errores y escalera de recuperación ───
//
// Cada falla se reporta con un `ErrorCode`. El contador de ese código
// elige el escalón de la escalera; superar el umbral de errores
// consecutivos fuerza un reinicio duro sin importar el escalón.

use log::{error, warn};
use std::collections::HashMap;
use std::fmt;

/// Cantidad de reintentos simples antes de escalar.
pub const MAX_ERROR_RETRIES: u32 = 3;

/// Errores consecutivos que fuerzan `HardRestart`.
pub const CRITICAL_ERROR_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    WifiConnectionFailed,
    RegistrationFailed,
    SessionConnectionFailed,
    StorageFault,
    LightingSubsystemFault,
    HttpFailed,
    JsonParseFailed,
    WatchdogInitFailed,
    PortalFailed,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WifiConnectionFailed => "WIFI_CONN_FAILED",
            Self::RegistrationFailed => "REGISTRATION_FAILED",
            Self::SessionConnectionFailed => "SESSION_CONN_FAILED",
            Self::StorageFault => "STORAGE_FAULT",
            Self::LightingSubsystemFault => "LIGHTING_SUBSYSTEM_FAULT",
            Self::HttpFailed => "HTTP_FAILED",
            Self::JsonParseFailed => "JSON_PARSE_FAILED",
            Self::WatchdogInitFailed => "WATCHDOG_INIT_FAILED",
            Self::PortalFailed => "PORTAL_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalones de la escalera, de menor a mayor costo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryStrategy {
    RetryOperation,
    RestartComponent,
    SoftRestart,
    HardRestart,
    FactoryReset,
}

/// Contadores por código + contador de errores consecutivos.
#[derive(Debug, Default)]
pub struct ErrorRecovery {
    attempts: HashMap<ErrorCode, u32>,
    consecutive: u32,
}

impl ErrorRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una falla y devuelve el escalón a aplicar.
    pub fn report(&mut self, code: ErrorCode, context: &str) -> RecoveryStrategy {
        let attempts = self.attempts.entry(code).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        self.consecutive += 1;

        let strategy = if self.consecutive >= CRITICAL_ERROR_THRESHOLD {
            RecoveryStrategy::HardRestart
        } else {
            Self::rung(attempts)
        };

        if strategy >= RecoveryStrategy::SoftRestart {
            error!(
                "{} ({}): attempt {}, {} consecutive errors -> {:?}",
                code, context, attempts, self.consecutive, strategy
            );
        } else {
            warn!("{} ({}): attempt {} -> {:?}", code, context, attempts, strategy);
        }
        strategy
    }

    fn rung(attempts: u32) -> RecoveryStrategy {
        match attempts {
            0..=MAX_ERROR_RETRIES => RecoveryStrategy::RetryOperation,
            4 => RecoveryStrategy::RestartComponent,
            5 => RecoveryStrategy::SoftRestart,
            6 => RecoveryStrategy::HardRestart,
            _ => RecoveryStrategy::FactoryReset,
        }
    }

    /// La operación de `code` volvió a funcionar.
    pub fn clear(&mut self, code: ErrorCode) {
        self.attempts.remove(&code);
    }

    /// El dispositivo llegó a un estado sano (sesión lista).
    pub fn mark_healthy(&mut self) {
        self.consecutive = 0;
    }

    pub fn attempts(&self, code: ErrorCode) -> u32 {
        self.attempts.get(&code).copied().unwrap_or(0)
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
