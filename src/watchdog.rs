// ─── Hook global del watchdog ───
//
// Las operaciones largas (conexión WiFi, pairing de Nanoleaf, mDNS)
// llaman a `feed()` sin conocer el driver del watchdog. `main` instala
// la función real una sola vez al arrancar.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

static FEED_HOOK: OnceLock<fn()> = OnceLock::new();
static FEED_COUNT: AtomicU32 = AtomicU32::new(0);

/// Instala la función de alimentación. Devuelve `false` si ya había una.
pub fn install_feed_hook(hook: fn()) -> bool {
    FEED_HOOK.set(hook).is_ok()
}

/// Alimenta el watchdog (no-op si no hay hook instalado).
pub fn feed() {
    FEED_COUNT.fetch_add(1, Ordering::Relaxed);
    if let Some(hook) = FEED_HOOK.get() {
        hook();
    }
}

/// Cantidad de veces que se alimentó desde el arranque.
pub fn feed_count() -> u32 {
    FEED_COUNT.load(Ordering::Relaxed)
}

/// Alimentación periódica desde el loop principal.
#[derive(Debug)]
pub struct FeedSchedule {
    interval_ms: u64,
    last_feed_at: Option<u64>,
}

impl FeedSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_feed_at: None,
        }
    }

    /// Alimenta si pasó el intervalo. Devuelve si alimentó.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        let due = match self.last_feed_at {
            None => true,
            Some(at) => now_ms.saturating_sub(at) >= self.interval_ms,
        };
        if due {
            feed();
            self.last_feed_at = Some(now_ms);
        }
        due
    }
}
