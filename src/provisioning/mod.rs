// ─── Provisioning de red: Station o Access Point + portal cautivo ───
//
// Cuando no hay credenciales (o no conectan) el dispositivo levanta su
// propia red "PalPalette-Setup-XXXXXX", un DNS comodín y el formulario
// en http://192.168.4.1. El usuario guarda SSID/password/servidor y el
// dispositivo reinicia como Station.
//
// Exactamente un modo activo a la vez. Antes de cambiar de modo se
// libera todo lo del modo anterior (servidor HTTP + socket DNS).

pub mod dns;
pub mod portal;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

pub use portal::{PortalCommand, PortalContext, PortalError, PortalInfo, PortalResponse};

use crate::config::{Timing, DEFAULT_AP_PASSWORD, DEFAULT_AP_SSID, PORTAL_MIN_FREE_HEAP};
use crate::identity::WifiCredentials;
use crate::platform::{Clock, PortalBackend, WifiControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Disconnected,
    Station,
    AccessPoint,
}

/// Lo que el portal le pide al orquestador.
pub enum ProvisioningEvent {
    CredentialsSaved {
        credentials: WifiCredentials,
        server_url: Option<String>,
    },
    ResetRequested,
    /// Se venció la vida del portal; ya está desmontado.
    Timeout,
}

/// SSID del AP: prefijo + los últimos 3 bytes de la MAC.
pub fn ap_ssid(mac: &[u8; 6]) -> String {
    format!("{}-{:02X}{:02X}{:02X}", DEFAULT_AP_SSID, mac[3], mac[4], mac[5])
}

pub struct NetworkProvisioner {
    wifi: Box<dyn WifiControl>,
    portal: Box<dyn PortalBackend>,
    clock: Rc<dyn Clock>,
    mode: NetworkMode,
    context: Option<Arc<PortalContext>>,
    ap_started_at: u64,
    portal_lifetime_ms: u64,
    connect_timeout: Duration,
}

impl NetworkProvisioner {
    pub fn new(
        wifi: Box<dyn WifiControl>,
        portal: Box<dyn PortalBackend>,
        clock: Rc<dyn Clock>,
        timing: &Timing,
    ) -> Self {
        Self {
            wifi,
            portal,
            clock,
            mode: NetworkMode::Disconnected,
            context: None,
            ap_started_at: 0,
            portal_lifetime_ms: timing.portal_lifetime_ms,
            connect_timeout: Duration::from_millis(timing.wifi_connect_timeout_ms),
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.wifi.mac_address()
    }

    pub fn is_connected(&self) -> bool {
        self.mode == NetworkMode::Station && self.wifi.is_connected()
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        match self.mode {
            NetworkMode::Station => self.wifi.ip_address(),
            _ => None,
        }
    }

    pub fn rssi(&self) -> Option<i8> {
        match self.mode {
            NetworkMode::Station => self.wifi.rssi(),
            _ => None,
        }
    }

    /// Asocia con la red guardada; bloquea hasta el timeout como máximo.
    pub fn connect_station(&mut self, credentials: &WifiCredentials) -> Result<()> {
        if credentials.ssid.is_empty() {
            bail!("WiFi SSID not configured");
        }
        self.stop_ap_mode();
        if self.mode == NetworkMode::Station {
            if let Err(e) = self.wifi.disconnect_station() {
                warn!("Station disconnect failed: {:?}", e);
            }
            self.mode = NetworkMode::Disconnected;
        }

        info!("Connecting to WiFi '{}'", credentials.ssid);
        self.wifi
            .connect_station(&credentials.ssid, &credentials.password, self.connect_timeout)
            .with_context(|| format!("failed to join '{}'", credentials.ssid))?;
        self.mode = NetworkMode::Station;

        match self.wifi.ip_address() {
            Some(ip) => info!("WiFi connected, IP {}", ip),
            None => info!("WiFi connected"),
        }
        Ok(())
    }

    /// Levanta AP + DNS + HTTP. Se niega si no hay memoria para el servidor.
    pub fn start_ap_mode(&mut self, info: PortalInfo, free_heap: u32) -> Result<Arc<PortalContext>> {
        if let (NetworkMode::AccessPoint, Some(context)) = (self.mode, &self.context) {
            warn!("Already in AP mode");
            return Ok(Arc::clone(context));
        }
        if self.mode == NetworkMode::Station {
            if let Err(e) = self.wifi.disconnect_station() {
                warn!("Station disconnect failed: {:?}", e);
            }
            self.mode = NetworkMode::Disconnected;
        }

        if free_heap < PORTAL_MIN_FREE_HEAP {
            bail!(
                "insufficient memory for captive portal: {} bytes free (minimum {})",
                free_heap,
                PORTAL_MIN_FREE_HEAP
            );
        }

        let ssid = ap_ssid(&self.wifi.mac_address());
        info!("Starting Access Point '{}'", ssid);
        let ap_address = self
            .wifi
            .start_access_point(&ssid, DEFAULT_AP_PASSWORD)
            .context("failed to start Access Point")?;

        let context = Arc::new(PortalContext::new(info));
        match self.wifi.scan() {
            Ok(networks) => context.set_networks(networks),
            Err(e) => warn!("Initial WiFi scan failed: {:?}", e),
        }

        if let Err(e) = self.portal.start(ap_address, Arc::clone(&context)) {
            self.portal.stop();
            if let Err(stop) = self.wifi.stop_access_point() {
                warn!("Access Point stop failed: {:?}", stop);
            }
            return Err(e.context("failed to start captive portal"));
        }

        info!("Captive portal active: connect to '{}' / '{}'", ssid, DEFAULT_AP_PASSWORD);
        info!("Then open http://{} in your browser", ap_address);
        self.mode = NetworkMode::AccessPoint;
        self.context = Some(Arc::clone(&context));
        self.ap_started_at = self.clock.now_ms();
        Ok(context)
    }

    /// Desmonta HTTP, DNS y el AP. Idempotente.
    pub fn stop_ap_mode(&mut self) {
        if self.mode != NetworkMode::AccessPoint {
            return;
        }
        info!("Stopping Access Point mode");
        self.portal.stop();
        if let Err(e) = self.wifi.stop_access_point() {
            warn!("Access Point stop failed: {:?}", e);
        }
        self.context = None;
        self.mode = NetworkMode::Disconnected;
        self.ap_started_at = 0;
    }

    pub fn portal_running(&self) -> bool {
        self.mode == NetworkMode::AccessPoint && self.portal.is_running()
    }

    /// Actualiza los datos vivos que muestra `/status`.
    pub fn refresh_portal_info(&self, free_heap: u32, uptime_ms: u64) {
        if let Some(context) = &self.context {
            context.update_info(|info| {
                info.free_heap = free_heap;
                info.uptime_ms = uptime_ms;
            });
        }
    }

    /// Un paso del portal: DNS, scans pedidos, comandos y vencimiento.
    pub fn tick(&mut self) -> Option<ProvisioningEvent> {
        if self.mode != NetworkMode::AccessPoint {
            return None;
        }
        let context = Arc::clone(self.context.as_ref()?);
        self.portal.poll();

        if context.take_scan_request() {
            match self.wifi.scan() {
                Ok(networks) => context.set_networks(networks),
                Err(e) => warn!("WiFi scan failed: {:?}", e),
            }
        }

        if let Some(command) = context.next_command() {
            return Some(match command {
                PortalCommand::Save {
                    credentials,
                    server_url,
                } => ProvisioningEvent::CredentialsSaved {
                    credentials,
                    server_url,
                },
                PortalCommand::Reset => ProvisioningEvent::ResetRequested,
            });
        }

        let elapsed = self.clock.now_ms().saturating_sub(self.ap_started_at);
        if elapsed > self.portal_lifetime_ms {
            warn!("Captive portal timeout reached");
            self.stop_ap_mode();
            return Some(ProvisioningEvent::Timeout);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AccessPointInfo;
    use crate::testing::{FakeClock, FakePortal, FakeWifi, TEST_MAC};
    use embedded_svc::http::Method;
    use pretty_assertions::assert_eq;

    fn provisioner(wifi: &FakeWifi, portal: &FakePortal, clock: &FakeClock) -> NetworkProvisioner {
        NetworkProvisioner::new(
            Box::new(wifi.clone()),
            Box::new(portal.clone()),
            Rc::new(clock.clone()),
            &Timing::default(),
        )
    }

    #[test]
    fn ap_ssid_uses_mac_suffix() {
        assert_eq!(ap_ssid(&TEST_MAC), "PalPalette-Setup-ABCDEF");
    }

    #[test]
    fn station_connect_reports_failure() {
        let wifi = FakeWifi::default();
        wifi.known_network("HomeNet", "pw");
        let mut net = provisioner(&wifi, &FakePortal::default(), &FakeClock::new());

        assert!(net.connect_station(&WifiCredentials::new("HomeNet", "wrong")).is_err());
        assert_eq!(net.mode(), NetworkMode::Disconnected);

        net.connect_station(&WifiCredentials::new("HomeNet", "pw")).unwrap();
        assert_eq!(net.mode(), NetworkMode::Station);
        assert!(net.is_connected());
        assert!(net.ip_address().is_some());
    }

    #[test]
    fn portal_serves_scan_and_save() {
        let wifi = FakeWifi::default();
        wifi.set_scan(vec![AccessPointInfo {
            ssid: "HomeNet".to_string(),
            rssi: -60,
            encrypted: true,
        }]);
        let portal = FakePortal::default();
        let mut net = provisioner(&wifi, &portal, &FakeClock::new());
        net.start_ap_mode(PortalInfo::default(), 100_000).unwrap();

        assert_eq!(net.mode(), NetworkMode::AccessPoint);
        assert!(wifi.ap_running());
        let scan = portal.request(Method::Get, "/scan", b"");
        assert!(scan.body.contains("HomeNet"));

        portal.request(Method::Post, "/save", b"ssid=HomeNet&password=pw&server=wss://s/ws");
        let Some(ProvisioningEvent::CredentialsSaved {
            credentials,
            server_url,
        }) = net.tick()
        else {
            panic!("expected saved credentials");
        };
        assert_eq!(credentials.ssid, "HomeNet");
        assert_eq!(server_url.as_deref(), Some("wss://s/ws"));
        // El scan pedido por /scan se ejecutó en el tick.
        assert_eq!(wifi.scans(), 2);
    }

    #[test]
    fn heap_gate_refuses_portal() {
        let wifi = FakeWifi::default();
        let portal = FakePortal::default();
        let mut net = provisioner(&wifi, &portal, &FakeClock::new());

        assert!(net.start_ap_mode(PortalInfo::default(), 10_000).is_err());
        assert_eq!(net.mode(), NetworkMode::Disconnected);
        assert!(!portal.is_running());
        assert!(!wifi.ap_running());
    }

    #[test]
    fn stop_releases_everything() {
        let wifi = FakeWifi::default();
        let portal = FakePortal::default();
        let mut net = provisioner(&wifi, &portal, &FakeClock::new());
        net.start_ap_mode(PortalInfo::default(), 100_000).unwrap();
        net.stop_ap_mode();
        net.stop_ap_mode();

        assert_eq!(net.mode(), NetworkMode::Disconnected);
        assert!(!portal.is_running());
        assert_eq!(portal.stops(), 1);
        assert!(!wifi.ap_running());
    }

    #[test]
    fn portal_times_out_after_lifetime() {
        let wifi = FakeWifi::default();
        let portal = FakePortal::default();
        let clock = FakeClock::new();
        let mut net = provisioner(&wifi, &portal, &clock);
        net.start_ap_mode(PortalInfo::default(), 100_000).unwrap();

        clock.advance(300_000);
        assert!(net.tick().is_none());
        clock.advance(1);
        assert!(matches!(net.tick(), Some(ProvisioningEvent::Timeout)));
        assert!(!portal.is_running());
    }

    #[test]
    fn station_connect_tears_down_portal() {
        let wifi = FakeWifi::default();
        wifi.known_network("HomeNet", "pw");
        let portal = FakePortal::default();
        let mut net = provisioner(&wifi, &portal, &FakeClock::new());
        net.start_ap_mode(PortalInfo::default(), 100_000).unwrap();

        net.connect_station(&WifiCredentials::new("HomeNet", "pw")).unwrap();
        assert!(!portal.is_running());
        assert!(!wifi.ap_running());
        assert_eq!(net.mode(), NetworkMode::Station);
    }
}
