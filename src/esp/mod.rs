//! Implementaciones de los puertos de `platform` sobre ESP-IDF.

pub mod http_client;
pub mod http_server;
pub mod led_strip;
pub mod mdns;
pub mod nvs;
pub mod system;
pub mod wifi;
pub mod ws;

use crate::lighting::LightingBackends;
use crate::platform::{HttpTransport, LedStrip, ServiceDiscovery};

/// Transportes reales para los drivers de iluminación.
#[derive(Default)]
pub struct EspLightingBackends;

impl LightingBackends for EspLightingBackends {
    fn http(&mut self) -> Box<dyn HttpTransport> {
        Box::new(http_client::EspHttpTransport::default())
    }

    fn led_strip(&mut self) -> Box<dyn LedStrip> {
        Box::new(led_strip::RmtLedStrip::default())
    }

    fn discovery(&mut self) -> Box<dyn ServiceDiscovery> {
        Box::new(mdns::MdnsDiscovery)
    }
}
