// ─── Identidad del dispositivo ───
//
// El `deviceId` y el código de pairing los asigna el servidor. Lo único
// derivable localmente es la MAC y la versión de firmware; el UUID y el
// código que salen de la MAC son solo para mostrar antes del primer
// registro y nunca se persisten.

use anyhow::Result;
use log::{debug, error, info};
use std::net::Ipv4Addr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{DEFAULT_SERVER_URL, FIRMWARE_VERSION};
use crate::lighting::{CustomConfig, LightingConfig, SystemType};
use crate::storage::{
    clear_namespace, KvStore, StorageBackend, DEVICE_KEYS, KEY_AUTH_TOKEN, KEY_DEVICE_ID,
    KEY_HOST_ADDRESS, KEY_LED_COUNT, KEY_LED_PIN, KEY_MAC_ADDRESS, KEY_PAIRING_CODE, KEY_PORT,
    KEY_PROVISIONED, KEY_SERVER_URL, KEY_SYSTEM_TYPE, KEY_WIFI_PASS, KEY_WIFI_SSID, LIGHTING_KEYS,
    NAMESPACE_DEVICE, NAMESPACE_LIGHTING,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// UUID asignado por el servidor; vacío antes del primer registro.
    pub device_id: String,
    pub mac_address: String,
    pub pairing_code: String,
    pub is_provisioned: bool,
    pub firmware_version: String,
    pub ip_address: Option<Ipv4Addr>,
    pub is_online: bool,
}

impl DeviceIdentity {
    fn minimal(mac_address: String) -> Self {
        Self {
            device_id: String::new(),
            mac_address,
            pairing_code: String::new(),
            is_provisioned: false,
            firmware_version: FIRMWARE_VERSION.to_string(),
            ip_address: None,
            is_online: false,
        }
    }
}

// ─── Credenciales WiFi ───

/// Se borran de memoria al salir de scope.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        }
    }
}

// ─── Store ───

/// Identidad + configuración de iluminación sobre dos namespaces.
///
/// Los handles se abren una vez en `begin` y se reutilizan: un handler
/// que guarda en medio de otra operación nunca reabre el namespace.
pub struct IdentityStore {
    device: Box<dyn KvStore>,
    lighting: Box<dyn KvStore>,
    identity: DeviceIdentity,
    mac: [u8; 6],
    server_url: Option<String>,
    storage_fault: bool,
}

impl IdentityStore {
    pub fn begin(backend: &dyn StorageBackend, mac: [u8; 6]) -> Result<Self> {
        let device = backend.open(NAMESPACE_DEVICE)?;
        let lighting = backend.open(NAMESPACE_LIGHTING)?;
        Ok(Self {
            device,
            lighting,
            identity: DeviceIdentity::minimal(format_mac(&mac)),
            mac,
            server_url: None,
            storage_fault: false,
        })
    }

    /// Carga la identidad guardada. Devuelve si había un `deviceId`.
    ///
    /// Sin identidad previa guarda la info mínima (solo la MAC) y deja
    /// el `deviceId` vacío hasta que el servidor asigne uno.
    pub fn load(&mut self) -> Result<bool> {
        let device_id = self.device.get_str(KEY_DEVICE_ID)?.unwrap_or_default();
        if device_id.is_empty() {
            info!("No stored identity, waiting for server registration");
            self.identity = DeviceIdentity::minimal(format_mac(&self.mac));
            let result = self.device.set_str(KEY_MAC_ADDRESS, &self.identity.mac_address);
            self.track(result)?;
            return Ok(false);
        }

        self.identity.device_id = device_id;
        self.identity.pairing_code = self.device.get_str(KEY_PAIRING_CODE)?.unwrap_or_default();
        self.identity.is_provisioned = self.device.get_bool(KEY_PROVISIONED)?.unwrap_or(false);

        info!("Device ID: {}", self.identity.device_id);
        info!("MAC Address: {}", self.identity.mac_address);
        if self.identity.is_provisioned {
            info!("Device is provisioned");
        } else {
            info!("Device needs provisioning, pairing code: {}", self.display_pairing_code());
        }
        Ok(true)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn is_provisioned(&self) -> bool {
        self.identity.is_provisioned
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn save_identity(&mut self) -> Result<()> {
        let result = self.write_identity();
        self.track(result)
    }

    fn write_identity(&mut self) -> Result<()> {
        if !self.identity.device_id.is_empty() {
            self.device.set_str(KEY_DEVICE_ID, &self.identity.device_id)?;
        }
        self.device.set_str(KEY_MAC_ADDRESS, &self.identity.mac_address)?;
        self.device.set_bool(KEY_PROVISIONED, self.identity.is_provisioned)?;
        if !self.identity.pairing_code.is_empty() {
            self.device.set_str(KEY_PAIRING_CODE, &self.identity.pairing_code)?;
        }
        debug!("Identity saved");
        Ok(())
    }

    pub fn set_provisioned(&mut self, provisioned: bool) -> Result<()> {
        self.identity.is_provisioned = provisioned;
        let result = self.device.set_bool(KEY_PROVISIONED, provisioned);
        self.track(result)
    }

    pub fn set_device_id(&mut self, device_id: &str) -> Result<()> {
        self.identity.device_id = device_id.to_string();
        let result = self.device.set_str(KEY_DEVICE_ID, device_id);
        self.track(result)
    }

    pub fn set_pairing_code(&mut self, pairing_code: &str) -> Result<()> {
        self.identity.pairing_code = pairing_code.to_string();
        if pairing_code.is_empty() {
            return Ok(());
        }
        let result = self.device.set_str(KEY_PAIRING_CODE, pairing_code);
        self.track(result)
    }

    /// Estado de red del momento; no se persiste.
    pub fn set_network(&mut self, ip_address: Option<Ipv4Addr>) {
        self.identity.ip_address = ip_address;
    }

    pub fn set_online(&mut self, online: bool) {
        self.identity.is_online = online;
    }

    // ─── Iluminación ───

    pub fn lighting_config(&self) -> Result<LightingConfig> {
        let system_type = self
            .lighting
            .get_str(KEY_SYSTEM_TYPE)?
            .and_then(|value| SystemType::parse(&value))
            .unwrap_or_default();
        let port = self.lighting.get_i32(KEY_PORT)?.unwrap_or(0);
        let led_pin = self.lighting.get_i32(KEY_LED_PIN)?;
        let led_count = self.lighting.get_i32(KEY_LED_COUNT)?;

        Ok(LightingConfig {
            system_type,
            host_address: self.lighting.get_str(KEY_HOST_ADDRESS)?.unwrap_or_default(),
            port: u16::try_from(port).unwrap_or(0),
            auth_token: self.lighting.get_str(KEY_AUTH_TOKEN)?.unwrap_or_default(),
            custom: CustomConfig {
                led_pin: led_pin.and_then(|pin| u8::try_from(pin).ok()),
                led_count: led_count.and_then(|count| u16::try_from(count).ok()),
            },
        })
    }

    pub fn save_lighting_config(&mut self, config: &LightingConfig) -> Result<()> {
        let result = write_lighting(self.lighting.as_mut(), config);
        self.track(result)
    }

    pub fn clear_lighting_config(&mut self) -> Result<()> {
        let result = clear_namespace(self.lighting.as_mut(), LIGHTING_KEYS);
        self.track(result)
    }

    // ─── WiFi y servidor ───

    pub fn wifi_credentials(&self) -> Result<Option<WifiCredentials>> {
        let ssid = self.device.get_str(KEY_WIFI_SSID)?.unwrap_or_default();
        if ssid.is_empty() {
            return Ok(None);
        }
        let password = self.device.get_str(KEY_WIFI_PASS)?.unwrap_or_default();
        Ok(Some(WifiCredentials { ssid, password }))
    }

    pub fn save_wifi_credentials(&mut self, credentials: &WifiCredentials) -> Result<()> {
        let result = self
            .device
            .set_str(KEY_WIFI_SSID, &credentials.ssid)
            .and_then(|_| self.device.set_str(KEY_WIFI_PASS, &credentials.password));
        self.track(result)?;
        info!("WiFi credentials saved for '{}'", credentials.ssid);
        Ok(())
    }

    /// URL del canal dúplex; la compilada si no hay una guardada.
    pub fn server_url(&mut self) -> String {
        if let Some(url) = &self.server_url {
            return url.clone();
        }
        let url = match self.device.get_str(KEY_SERVER_URL) {
            Ok(Some(url)) if !url.trim().is_empty() => url,
            Ok(_) => DEFAULT_SERVER_URL.to_string(),
            Err(e) => {
                error!("Failed to read server URL: {:?}", e);
                DEFAULT_SERVER_URL.to_string()
            }
        };
        self.server_url = Some(url.clone());
        url
    }

    pub fn set_server_url(&mut self, url: &str) -> Result<()> {
        let url = url.trim();
        let result = if url.is_empty() {
            self.device.remove(KEY_SERVER_URL).map(|_| ())
        } else {
            self.device.set_str(KEY_SERVER_URL, url)
        };
        self.server_url = None;
        self.track(result)
    }

    // ─── Reset ───

    /// Borra ambos namespaces y vuelve a la identidad mínima.
    pub fn reset(&mut self) -> Result<()> {
        info!("Clearing identity and lighting storage");
        let device = clear_namespace(self.device.as_mut(), DEVICE_KEYS);
        let lighting = clear_namespace(self.lighting.as_mut(), LIGHTING_KEYS);
        self.identity = DeviceIdentity::minimal(format_mac(&self.mac));
        self.server_url = None;
        self.track(device.and(lighting))
    }

    // ─── Valores para mostrar ───

    /// Código del servidor, o el derivado de la MAC antes del primer registro.
    pub fn display_pairing_code(&self) -> String {
        if self.identity.pairing_code.is_empty() {
            fallback_pairing_code(&self.identity.mac_address)
        } else {
            self.identity.pairing_code.clone()
        }
    }

    /// `deviceId` del servidor, o el UUID derivado de la MAC para operar
    /// localmente (p. ej. en el portal) antes del primer registro.
    pub fn effective_device_id(&self) -> String {
        if self.identity.device_id.is_empty() {
            derive_fallback_uuid(&self.identity.mac_address)
        } else {
            self.identity.device_id.clone()
        }
    }

    // ─── Fallas de storage ───

    /// Devuelve y limpia la marca de falla de storage.
    pub fn take_storage_fault(&mut self) -> bool {
        std::mem::take(&mut self.storage_fault)
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!("Storage write failed: {:?}", e);
            self.storage_fault = true;
        }
        result
    }
}

fn write_lighting(store: &mut dyn KvStore, config: &LightingConfig) -> Result<()> {
    store.set_str(KEY_SYSTEM_TYPE, config.system_type.as_str())?;
    set_or_remove_str(store, KEY_HOST_ADDRESS, &config.host_address)?;
    store.set_i32(KEY_PORT, i32::from(config.port))?;
    set_or_remove_str(store, KEY_AUTH_TOKEN, &config.auth_token)?;
    match config.custom.led_pin {
        Some(pin) => store.set_i32(KEY_LED_PIN, i32::from(pin))?,
        None => {
            store.remove(KEY_LED_PIN)?;
        }
    }
    match config.custom.led_count {
        Some(count) => store.set_i32(KEY_LED_COUNT, i32::from(count))?,
        None => {
            store.remove(KEY_LED_COUNT)?;
        }
    }
    Ok(())
}

fn set_or_remove_str(store: &mut dyn KvStore, key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        store.remove(key)?;
        Ok(())
    } else {
        store.set_str(key, value)
    }
}

// ─── Derivaciones desde la MAC ───

/// `AA:BB:CC:DD:EE:FF`
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

fn mac_nibbles(mac_address: &str) -> Vec<u8> {
    mac_address
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|digit| digit as u8)
        .collect()
}

/// UUID con forma de v4, determinístico a partir de la MAC.
///
/// Nibble 12 = `4`, nibble 16 ∈ `89ab`; el resto rota los nibbles de la MAC.
pub fn derive_fallback_uuid(mac_address: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    const VARIANT: &[u8; 4] = b"89ab";

    let nibbles = mac_nibbles(mac_address);
    let mut uuid = String::with_capacity(36);

    for i in 0..32usize {
        if matches!(i, 8 | 12 | 16 | 20) {
            uuid.push('-');
        }
        let c = match i {
            12 => '4',
            16 => {
                let value = nibbles.get((i / 4) % nibbles.len().max(1)).copied().unwrap_or(0);
                VARIANT[usize::from(value) % 4] as char
            }
            _ if nibbles.is_empty() => HEX[(i * 7) % 16] as char,
            _ => HEX[(usize::from(nibbles[i % nibbles.len()]) + i) % 16] as char,
        };
        uuid.push(c);
    }
    uuid
}

/// Seis dígitos a partir de los últimos seis nibbles de la MAC
/// (`a`→1 … `f`→6).
pub fn fallback_pairing_code(mac_address: &str) -> String {
    let hex: Vec<char> = mac_address
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let start = hex.len().saturating_sub(6);

    hex[start..]
        .iter()
        .map(|&c| {
            if c.is_ascii_digit() {
                c
            } else {
                char::from(b'0' + ((c as u8 - b'a' + 1) % 10))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStorage, TEST_MAC};
    use pretty_assertions::assert_eq;

    fn store(storage: &MemoryStorage) -> IdentityStore {
        IdentityStore::begin(storage, TEST_MAC).unwrap()
    }

    #[test]
    fn mac_is_formatted_uppercase() {
        assert_eq!(format_mac(&[0x24, 0x6f, 0x28, 0xab, 0x0c, 0xde]), "24:6F:28:AB:0C:DE");
    }

    #[test]
    fn fallback_uuid_has_v4_shape() {
        let uuid = derive_fallback_uuid("24:6F:28:AB:0C:DE");
        assert_eq!(uuid.len(), 36);
        let groups: Vec<&str> = uuid.split('-').collect();
        assert_eq!(groups.iter().map(|g| g.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
        assert!(groups[2].starts_with('4'));
        assert!("89ab".contains(&groups[3][..1]));
        assert_eq!(uuid, derive_fallback_uuid("24:6f:28:ab:0c:de"));
    }

    #[test]
    fn fallback_uuid_from_empty_mac() {
        let uuid = derive_fallback_uuid("");
        assert_eq!(&uuid[..8], "07e5c3a1");
        assert_eq!(uuid.len(), 36);
    }

    #[test]
    fn fallback_pairing_code_maps_letters_to_digits() {
        // últimos seis: ab0cde → 1 2 0 3 4 5
        assert_eq!(fallback_pairing_code("24:6F:28:AB:0C:DE"), "120345");
        assert_eq!(fallback_pairing_code("00:11:22:33:44:55"), "334455");
    }

    #[test]
    fn first_boot_has_no_identity() {
        let storage = MemoryStorage::default();
        let mut ids = store(&storage);
        assert!(!ids.load().unwrap());
        assert_eq!(ids.device_id(), "");
        assert_eq!(ids.identity().firmware_version, FIRMWARE_VERSION);
        assert_eq!(storage.get("device", "mac_addr"), Some(format_mac(&TEST_MAC)));
        assert_eq!(storage.get("device", "device_id"), None);
    }

    #[test]
    fn server_identity_survives_reboot() {
        let storage = MemoryStorage::default();
        {
            let mut ids = store(&storage);
            ids.load().unwrap();
            ids.set_device_id("uuid-A").unwrap();
            ids.set_pairing_code("482913").unwrap();
            ids.set_provisioned(true).unwrap();
        }

        let mut ids = store(&storage);
        assert!(ids.load().unwrap());
        assert_eq!(ids.device_id(), "uuid-A");
        assert_eq!(ids.display_pairing_code(), "482913");
        assert!(ids.is_provisioned());
    }

    #[test]
    fn fallbacks_are_never_persisted() {
        let storage = MemoryStorage::default();
        let mut ids = store(&storage);
        ids.load().unwrap();
        let _ = ids.effective_device_id();
        let _ = ids.display_pairing_code();
        ids.save_identity().unwrap();

        assert_eq!(storage.get("device", "device_id"), None);
        assert_eq!(storage.get("device", "pairing_code"), None);
    }

    #[test]
    fn lighting_config_round_trips_through_storage() {
        let storage = MemoryStorage::default();
        let mut ids = store(&storage);
        let config = LightingConfig::networked(SystemType::Nanoleaf, "10.0.0.9", 16021, "tok");
        ids.save_lighting_config(&config).unwrap();
        assert_eq!(ids.lighting_config().unwrap(), config);

        let strip = LightingConfig::strip(4, 60);
        ids.save_lighting_config(&strip).unwrap();
        assert_eq!(ids.lighting_config().unwrap(), strip);
        assert_eq!(storage.get("lighting", "auth_token"), None);
    }

    #[test]
    fn server_url_defaults_and_caches() {
        let storage = MemoryStorage::default();
        let mut ids = store(&storage);
        assert_eq!(ids.server_url(), DEFAULT_SERVER_URL);

        ids.set_server_url("wss://s/ws").unwrap();
        assert_eq!(ids.server_url(), "wss://s/ws");
        storage.set("device", "server_url", "ws://other/ws");
        assert_eq!(ids.server_url(), "wss://s/ws");
    }

    #[test]
    fn reset_clears_both_namespaces() {
        let storage = MemoryStorage::default();
        let mut ids = store(&storage);
        ids.set_device_id("uuid-A").unwrap();
        ids.save_wifi_credentials(&WifiCredentials::new("HomeNet", "pw")).unwrap();
        ids.save_lighting_config(&LightingConfig::strip(2, 10)).unwrap();

        ids.reset().unwrap();

        assert!(storage.namespace_snapshot("device").is_empty());
        assert!(storage.namespace_snapshot("lighting").is_empty());
        assert_eq!(ids.device_id(), "");
        assert!(ids.wifi_credentials().unwrap().is_none());
    }

    #[test]
    fn failed_write_marks_storage_fault_once() {
        let storage = MemoryStorage::default();
        let mut ids = store(&storage);
        storage.fail_writes(true);
        assert!(ids.set_provisioned(true).is_err());
        storage.fail_writes(false);

        assert!(ids.take_storage_fault());
        assert!(!ids.take_storage_fault());
    }
}
