//! Firmware del controlador de iluminación PalPalette.
//!
//! Toda la lógica (provisioning, sesión con el servidor, drivers de
//! iluminación, recuperación de errores) vive acá y solo habla con el
//! hardware a través de los traits de [`platform`]. Así compila y se
//! testea en el host; `esp` trae las implementaciones para el ESP32.

pub mod cloud;
pub mod config;
pub mod error;
pub mod identity;
pub mod lighting;
pub mod orchestrator;
pub mod platform;
pub mod provisioning;
pub mod storage;
pub mod watchdog;

#[cfg(target_os = "espidf")]
pub mod esp;

#[cfg(test)]
pub(crate) mod testing;
