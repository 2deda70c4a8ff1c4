// ─── PalPalette: controlador de iluminación ───
//
// Arma los periféricos reales, se los pasa al orquestador y queda en
// el loop principal para siempre.

// ─── Punto de entrada ───
//
// Patrón main() → run(): main() no retorna Result, así que no puede usar ?.
// Delegamos toda la lógica a run() que sí retorna Result.
// Si run() falla, logueamos el error, esperamos 10s y reiniciamos el chip.

#[cfg(target_os = "espidf")]
fn main() {
    use log::error;
    use std::time::Duration;

    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = device::run() {
        error!("Fatal error: {:?}", e);
        error!("Restarting in 10 seconds...");
        std::thread::sleep(Duration::from_secs(10));
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!(
        "palpalette-firmware {} runs on ESP-IDF targets; use `cargo test` on the host.",
        palpalette_firmware::config::FIRMWARE_VERSION
    );
}

#[cfg(target_os = "espidf")]
mod device {
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{info, warn};
    use std::rc::Rc;

    use palpalette_firmware::config::{Timing, FIRMWARE_VERSION};
    use palpalette_firmware::error::ErrorCode;
    use palpalette_firmware::esp::{
        http_client::EspHttpTransport, http_server::EspPortal, nvs::NvsStorage, system, ws::EspDuplex,
        wifi::EspWifiControl, EspLightingBackends,
    };
    use palpalette_firmware::orchestrator::{Board, Orchestrator};
    use palpalette_firmware::platform::SystemClock;
    use palpalette_firmware::watchdog;

    /// Pausa entre ticks: deja correr al idle task y al stack de red.
    const LOOP_DELAY_MS: u32 = 10;

    pub fn run() -> anyhow::Result<()> {
        info!("PalPalette firmware v{} starting", FIRMWARE_VERSION);

        // ─── Inicialización del sistema ───

        let timing = Timing::default();
        match system::init_watchdog(timing.watchdog_timeout_ms) {
            Ok(()) => {
                watchdog::install_feed_hook(system::feed_watchdog);
            }
            Err(e) => warn!("{}: {:?}, continuing without watchdog", ErrorCode::WatchdogInitFailed, e),
        }

        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        // NVS partition: identidad, credenciales y config de iluminación
        let nvs_partition = EspDefaultNvsPartition::take()?;

        let board = Board {
            clock: Rc::new(SystemClock::new()),
            system: Box::new(system::EspSystem),
            wifi: Box::new(EspWifiControl::new(peripherals.modem, sysloop, nvs_partition.clone())?),
            portal: Box::new(EspPortal::default()),
            http: Box::new(EspHttpTransport::default()),
            duplex: Box::new(EspDuplex::default()),
            lighting: Box::new(EspLightingBackends),
            storage: Box::new(NvsStorage::new(nvs_partition)),
        };
        let mut device = Orchestrator::new(board, timing)?;

        // ─── Loop principal ───

        info!("Entering main loop...");
        loop {
            device.tick();
            FreeRtos::delay_ms(LOOP_DELAY_MS);
        }
    }
}
