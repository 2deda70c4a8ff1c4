// ─── Backoff exponencial de reconexión ───

use log::info;

use crate::config::exponential_delay;

/// Duplicaciones máximas del intervalo base.
pub const MAX_DOUBLINGS: u32 = 5;

/// Cuándo reintentar la conexión del canal dúplex.
///
/// El delay se mide desde que empezó la espera (la última falla). Tras
/// `reset_window_ms` desconectado de corrido el contador vuelve a cero,
/// para que un servidor intermitente no quede siempre en el tope.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    reset_window_ms: u64,
    retry_count: u32,
    wait_from: Option<u64>,
    disconnected_since: Option<u64>,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, reset_window_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            reset_window_ms,
            retry_count: 0,
            wait_from: None,
            disconnected_since: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delay que corresponde al contador actual.
    pub fn delay_ms(&self) -> u64 {
        exponential_delay(self.base_ms, self.retry_count.min(MAX_DOUBLINGS), self.max_ms)
    }

    /// Empieza a esperar desde `now` (la conexión se cayó o falló).
    pub fn schedule(&mut self, now_ms: u64) {
        self.wait_from = Some(now_ms);
        if self.disconnected_since.is_none() {
            self.disconnected_since = Some(now_ms);
        }
    }

    /// Si ya pasó el delay desde la última falla.
    pub fn ready(&mut self, now_ms: u64) -> bool {
        if let Some(since) = self.disconnected_since {
            if now_ms.saturating_sub(since) >= self.reset_window_ms && self.retry_count > 0 {
                info!(
                    "Disconnected for {} s, resetting retry counter",
                    now_ms.saturating_sub(since) / 1_000
                );
                self.retry_count = 0;
                self.disconnected_since = Some(now_ms);
            }
        }
        match self.wait_from {
            None => true,
            Some(from) => now_ms.saturating_sub(from) >= self.delay_ms(),
        }
    }

    /// Arrancó un reintento: el próximo delay se duplica.
    pub fn record_attempt(&mut self) {
        self.retry_count = (self.retry_count + 1).min(MAX_DOUBLINGS);
    }

    /// Conexión abierta.
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.wait_from = None;
        self.disconnected_since = None;
    }
}
