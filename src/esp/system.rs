// ─── Chip: reinicio, memoria y task watchdog ───

use anyhow::{anyhow, Result};
use esp_idf_svc::sys;
use log::info;

use crate::platform::SystemControl;

pub struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        info!("esp_restart()");
        unsafe {
            sys::esp_restart();
        }
    }

    fn free_heap(&self) -> u32 {
        unsafe { sys::esp_get_free_heap_size() }
    }
}

// ─── Watchdog ───

/// Configura el task watchdog; si ESP-IDF ya lo había iniciado, se acepta.
pub fn init_watchdog(timeout_ms: u64) -> Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: u32::try_from(timeout_ms).unwrap_or(u32::MAX),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc != sys::ESP_OK as sys::esp_err_t && rc != sys::ESP_ERR_INVALID_STATE as sys::esp_err_t {
        return Err(anyhow!("esp_task_wdt_init failed with code {}", rc));
    }

    // Suscribe la task actual (la del loop principal).
    let rc = unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc != sys::ESP_OK as sys::esp_err_t && rc != sys::ESP_ERR_INVALID_STATE as sys::esp_err_t {
        return Err(anyhow!("esp_task_wdt_add failed with code {}", rc));
    }
    info!("Task watchdog armed ({} ms)", timeout_ms);
    Ok(())
}

/// Hook para `watchdog::install_feed_hook`.
pub fn feed_watchdog() {
    unsafe {
        sys::esp_task_wdt_reset();
    }
}
