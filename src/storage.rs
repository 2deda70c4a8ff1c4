// ─── Almacenamiento clave/valor persistente ───
//
// Dos namespaces lógicos: `device` (identidad + WiFi + servidor) y
// `lighting` (configuración del driver). En el ESP32 cada namespace es
// un handle de NVS; las claves son strings estables (máx. 15 chars).

use anyhow::Result;

// ─── Namespaces ───

pub const NAMESPACE_DEVICE: &str = "device";
pub const NAMESPACE_LIGHTING: &str = "lighting";

// ─── Claves del namespace `device` ───

pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_MAC_ADDRESS: &str = "mac_addr";
pub const KEY_PROVISIONED: &str = "provisioned";
pub const KEY_PAIRING_CODE: &str = "pairing_code";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_SERVER_URL: &str = "server_url";

pub const DEVICE_KEYS: &[&str] = &[
    KEY_DEVICE_ID,
    KEY_MAC_ADDRESS,
    KEY_PROVISIONED,
    KEY_PAIRING_CODE,
    KEY_WIFI_SSID,
    KEY_WIFI_PASS,
    KEY_SERVER_URL,
];

// ─── Claves del namespace `lighting` ───

pub const KEY_SYSTEM_TYPE: &str = "system_type";
pub const KEY_HOST_ADDRESS: &str = "host_addr";
pub const KEY_PORT: &str = "port";
pub const KEY_AUTH_TOKEN: &str = "auth_token";
pub const KEY_LED_PIN: &str = "led_pin";
pub const KEY_LED_COUNT: &str = "led_count";

pub const LIGHTING_KEYS: &[&str] = &[
    KEY_SYSTEM_TYPE,
    KEY_HOST_ADDRESS,
    KEY_PORT,
    KEY_AUTH_TOKEN,
    KEY_LED_PIN,
    KEY_LED_COUNT,
];

/// Un namespace abierto.
///
/// Las escrituras devuelven error si no se escribió nada: eso es una
/// falla de storage y sube a la escalera de recuperación.
pub trait KvStore {
    fn get_str(&self, key: &str) -> Result<Option<String>>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<()>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<()>;
    fn get_i32(&self, key: &str) -> Result<Option<i32>>;
    fn set_i32(&mut self, key: &str, value: i32) -> Result<()>;
    /// Devuelve si la clave existía.
    fn remove(&mut self, key: &str) -> Result<bool>;
}

/// Abre namespaces. Se llama en el `begin` de cada componente y el
/// handle se reutiliza después.
pub trait StorageBackend {
    fn open(&self, namespace: &str) -> Result<Box<dyn KvStore>>;
}

/// Borra todas las claves conocidas de un namespace.
pub fn clear_namespace(store: &mut dyn KvStore, keys: &[&str]) -> Result<()> {
    for key in keys {
        store.remove(key)?;
    }
    Ok(())
}
