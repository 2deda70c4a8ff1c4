// ─── Radio WiFi: Station + Access Point ───
//
// Un solo driver para los dos modos. El AP usa una netif propia con IP
// fija 192.168.4.1 y servidor DHCP; mientras está arriba la config es
// `Mixed` para que el scan del portal siga funcionando.

use anyhow::{anyhow, bail, Context, Result};
use embedded_svc::ipv4 as embedded_ipv4;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, peripheral},
    netif::{EspNetif, NetifConfiguration, NetifStack},
    nvs::EspDefaultNvsPartition,
    wifi::{
        AccessPointConfiguration, AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi,
        WifiDeviceId, WifiDriver,
    },
};
use log::{info, warn};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::config::{AP_ADDRESS, AP_CHANNEL, AP_MAX_CONNECTIONS};
use crate::platform::{AccessPointInfo, WifiControl};
use crate::watchdog;

/// Cada cuánto se revisa el estado mientras asocia.
const CONNECT_POLL_MS: u32 = 100;

pub struct EspWifiControl {
    wifi: BlockingWifi<EspWifi<'static>>,
    mac: [u8; 6],
    client: ClientConfiguration,
    ap: Option<AccessPointConfiguration>,
}

impl EspWifiControl {
    pub fn new(
        modem: impl peripheral::Peripheral<P = Modem> + 'static,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> Result<Self> {
        // WifiDriver es el driver de bajo nivel; las netif las armamos nosotros.
        let driver = WifiDriver::new(modem, sysloop.clone(), Some(nvs))?;
        let mac = driver.get_mac(WifiDeviceId::Sta)?;

        let sta_netif = EspNetif::new(NetifStack::Sta)?;
        let ap_netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(embedded_ipv4::Configuration::Router(
                embedded_ipv4::RouterConfiguration {
                    subnet: embedded_ipv4::Subnet {
                        gateway: AP_ADDRESS,
                        mask: embedded_ipv4::Mask(24),
                    },
                    dhcp_enabled: true,
                    // El DNS comodín del portal vive en la misma IP.
                    dns: Some(AP_ADDRESS),
                    secondary_dns: None,
                },
            )),
            ..NetifConfiguration::wifi_default_router()
        })?;

        let esp_wifi = EspWifi::wrap_all(driver, sta_netif, ap_netif)?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;

        // Configuración default para poder hacer start() y scan()
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
        info!("WiFi driver started");

        Ok(Self {
            wifi,
            mac,
            client: ClientConfiguration::default(),
            ap: None,
        })
    }

    fn apply_configuration(&mut self) -> Result<()> {
        let configuration = match &self.ap {
            Some(ap) => Configuration::Mixed(self.client.clone(), ap.clone()),
            None => Configuration::Client(self.client.clone()),
        };
        self.wifi.set_configuration(&configuration)?;
        Ok(())
    }

    /// Canal del AP buscado; con el canal correcto la conexión es más rápida.
    fn find_channel(&mut self, ssid: &str) -> Option<u8> {
        match self.wifi.scan() {
            Ok(aps) => aps.into_iter().find(|ap| ap.ssid == ssid).map(|ap| ap.channel),
            Err(e) => {
                warn!("Scan before connect failed: {:?}", e);
                None
            }
        }
    }
}

impl WifiControl for EspWifiControl {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn connect_station(&mut self, ssid: &str, password: &str, timeout: Duration) -> Result<()> {
        if ssid.is_empty() {
            bail!("WiFi SSID not configured");
        }
        // Nunca el password en sí, solo el largo.
        info!("WiFi password length: {} bytes", password.len());
        let auth_method = if password.is_empty() {
            info!("WiFi password empty, using open network");
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let channel = self.find_channel(ssid);
        info!("Found AP '{}' on channel {:?}", ssid, channel.unwrap_or(0));

        self.client = ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("SSID too long"))?,
            password: password.try_into().map_err(|_| anyhow!("password too long"))?,
            channel,
            auth_method,
            ..Default::default()
        };
        self.apply_configuration()?;

        info!("Connecting to '{}'...", ssid);
        self.wifi.wifi_mut().connect()?;
        let deadline = Instant::now() + timeout;
        while !self.wifi.is_connected()? {
            if Instant::now() >= deadline {
                if let Err(e) = self.wifi.wifi_mut().disconnect() {
                    warn!("Disconnect after timeout failed: {:?}", e);
                }
                bail!("association with '{}' timed out after {:?}", ssid, timeout);
            }
            watchdog::feed();
            FreeRtos::delay_ms(CONNECT_POLL_MS);
        }

        // Sin IP no podemos hacer nada en la red (ni HTTP, ni DNS)
        info!("Waiting for DHCP lease...");
        self.wifi.wait_netif_up().context("no DHCP lease")?;

        let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
        info!("IP: {}", ip_info.ip);
        info!("Gateway: {}", ip_info.subnet.gateway);
        info!("Mask: {}", ip_info.subnet.mask);
        Ok(())
    }

    fn disconnect_station(&mut self) -> Result<()> {
        if self.wifi.is_connected()? {
            self.wifi.disconnect()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn ip_address(&self) -> Option<Ipv4Addr> {
        if !self.is_connected() {
            return None;
        }
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn rssi(&self) -> Option<i8> {
        if !self.is_connected() {
            return None;
        }
        let mut info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut info) };
        (rc == esp_idf_svc::sys::ESP_OK as esp_idf_svc::sys::esp_err_t).then_some(info.rssi)
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<Ipv4Addr> {
        self.ap = Some(AccessPointConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("AP SSID too long"))?,
            password: password.try_into().map_err(|_| anyhow!("AP password too long"))?,
            channel: AP_CHANNEL,
            auth_method: AuthMethod::WPA2Personal,
            max_connections: AP_MAX_CONNECTIONS,
            ..Default::default()
        });
        if let Err(e) = self.apply_configuration() {
            self.ap = None;
            return Err(e.context("failed to configure Access Point"));
        }

        // Esperar a que la interfaz del AP esté lista
        FreeRtos::delay_ms(500);
        let ip = self.wifi.wifi().ap_netif().get_ip_info()?.ip;
        info!("Access Point '{}' up at {}", ssid, ip);
        Ok(ip)
    }

    fn stop_access_point(&mut self) -> Result<()> {
        if self.ap.take().is_none() {
            return Ok(());
        }
        self.apply_configuration()?;
        info!("Access Point stopped");
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<AccessPointInfo>> {
        info!("Scanning for networks...");
        let networks = self
            .wifi
            .scan()?
            .into_iter()
            .map(|ap| AccessPointInfo {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
                encrypted: !matches!(ap.auth_method, None | Some(AuthMethod::None)),
            })
            .collect::<Vec<_>>();
        info!("Scan found {} networks", networks.len());
        Ok(networks)
    }
}
