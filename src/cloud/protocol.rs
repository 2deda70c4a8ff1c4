// ─── Mensajes del canal dúplex: `{event, data}` ───

use anyhow::{anyhow, bail, Result};
use log::warn;
use serde::Serialize;
use serde_json::Value;

use crate::lighting::{ColorPalette, CustomConfig, LightingConfig, SystemType};

// ─── Entrantes ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ColorPalette(ColorPalette),
    DeviceRegistered {
        device_id: Option<String>,
        pairing_code: Option<String>,
    },
    DeviceClaimed {
        user_email: Option<String>,
        user_name: Option<String>,
    },
    SetupComplete {
        status: Option<String>,
    },
    LightingSystemConfig(LightingConfig),
    TestLightingSystem,
    FactoryReset,
    DeviceStatusAck,
    Unknown(String),
}

impl InboundEvent {
    /// JSON inválido, sin `event` o con una config ilegible ⇒ error (el
    /// mensaje se descarta). Un `event` desconocido no es error.
    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)?;
        let event = root
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("message has no event"))?;
        let data = root.get("data").unwrap_or(&Value::Null);
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);

        Ok(match event {
            "colorPalette" => Self::ColorPalette(parse_palette(&root)),
            "deviceRegistered" => Self::DeviceRegistered {
                device_id: text("deviceId"),
                pairing_code: text("pairingCode"),
            },
            "deviceClaimed" => Self::DeviceClaimed {
                user_email: text("userEmail"),
                user_name: text("userName"),
            },
            "setupComplete" => Self::SetupComplete {
                status: text("status"),
            },
            "lightingSystemConfig" => Self::LightingSystemConfig(parse_lighting_config(data)?),
            "testLightingSystem" => Self::TestLightingSystem,
            "factoryReset" => Self::FactoryReset,
            "deviceStatusAck" => Self::DeviceStatusAck,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// La paleta puede venir al nivel raíz o dentro de `data`; cada color
/// es `{hex}` o directamente el string.
fn parse_palette(root: &Value) -> ColorPalette {
    let source = if root.get("colors").is_some() {
        root
    } else {
        root.get("data").unwrap_or(root)
    };
    let hexes: Vec<&str> = source
        .get("colors")
        .and_then(Value::as_array)
        .map(|colors| {
            colors
                .iter()
                .map(|color| {
                    color
                        .get("hex")
                        .and_then(Value::as_str)
                        .or_else(|| color.as_str())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    let mut palette = ColorPalette::from_hex(hexes);
    let text = |key: &str| {
        source
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    palette.message_id = text("messageId");
    palette.sender_name = text("senderName");
    palette.timestamp = source.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
    palette
}

fn parse_lighting_config(data: &Value) -> Result<LightingConfig> {
    let name = data
        .get("systemType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let system_type = match SystemType::parse(name) {
        Some(system_type) => system_type,
        None => bail!("unknown lighting system type '{}'", name),
    };

    if system_type == SystemType::Ws2812 {
        let custom = data
            .get("customConfig")
            .map(parse_custom_config)
            .unwrap_or_default();
        return Ok(LightingConfig {
            system_type,
            custom,
            ..LightingConfig::default()
        });
    }

    let port = data
        .get("port")
        .and_then(Value::as_u64)
        .map(|port| u16::try_from(port).map_err(|_| anyhow!("port {} out of range", port)))
        .transpose()?
        .unwrap_or(80);
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let mut config = LightingConfig::networked(system_type, &text("hostAddress"), port, &text("authToken"));
    if !config.has_host() {
        config.host_address.clear();
    }
    Ok(config)
}

/// Un pin imposible se descarta solo; el resto de la config se aplica igual.
pub(crate) fn parse_custom_config(custom: &Value) -> CustomConfig {
    let number = |key: &str| custom.get(key).and_then(Value::as_u64);
    let led_pin = number("pin").and_then(|pin| {
        let valid = u8::try_from(pin).ok();
        if valid.is_none() {
            warn!("Ignoring out-of-range LED pin {}", pin);
        }
        valid
    });
    let led_count = number("numLEDs").map(|count| u16::try_from(count).unwrap_or(u16::MAX));
    CustomConfig { led_pin, led_count }
}

// ─── Salientes ───

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundMessage {
    RegisterDevice(RegisterDevice),
    DeviceStatus(DeviceStatus),
    LightingSystemStatus(LightingSystemStatus),
    UserActionRequired(UserActionRequired),
    FactoryResetAcknowledged(FactoryResetAcknowledged),
    LightingSystemTest(LightingSystemTest),
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RegisterDevice(_) => "registerDevice",
            Self::DeviceStatus(_) => "deviceStatus",
            Self::LightingSystemStatus(_) => "lightingSystemStatus",
            Self::UserActionRequired(_) => "userActionRequired",
            Self::FactoryResetAcknowledged(_) => "factoryResetAcknowledged",
            Self::LightingSystemTest(_) => "lightingSystemTest",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    pub device_id: String,
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub firmware_version: String,
    pub is_provisioned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub timestamp: u64,
    pub is_online: bool,
    pub is_provisioned: bool,
    pub firmware_version: String,
    pub ip_address: Option<String>,
    pub mac_address: String,
    #[serde(rename = "wifiRSSI")]
    pub wifi_rssi: Option<i8>,
    pub free_heap: u32,
    /// Segundos.
    pub uptime: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub storage_fault: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightingSystemStatus {
    pub device_id: String,
    pub system_type: String,
    /// `working`, `authentication_required`, `error` o `unknown`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub last_test: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActionRequired {
    pub device_id: String,
    pub action: String,
    pub instructions: String,
    /// Segundos.
    pub timeout: u32,
    pub timestamp: u64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryResetAcknowledged {
    pub device_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightingSystemTest {
    pub device_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use smart_leds::RGB8;

    #[test]
    fn palette_at_root_level() {
        let event = InboundEvent::parse(
            r#"{"event":"colorPalette","messageId":"m1","senderName":"Ana","timestamp":17,
                "colors":[{"hex":"FF0000"},{"hex":"00FF00"},{"hex":"0000FF"}]}"#,
        )
        .unwrap();
        let InboundEvent::ColorPalette(palette) = event else {
            panic!("expected a palette");
        };
        assert_eq!(palette.color_count(), 3);
        assert_eq!(
            palette.colors.as_slice(),
            &[RGB8::new(255, 0, 0), RGB8::new(0, 255, 0), RGB8::new(0, 0, 255)]
        );
        assert_eq!(palette.message_id, "m1");
        assert_eq!(palette.sender_name, "Ana");
        assert_eq!(palette.timestamp, 17);
    }

    #[test]
    fn palette_under_data_is_capped() {
        let colors: Vec<Value> = (0..12).map(|_| json!({ "hex": "#FFFFFF" })).collect();
        let text = json!({ "event": "colorPalette", "data": { "colors": colors } }).to_string();
        let InboundEvent::ColorPalette(palette) = InboundEvent::parse(&text).unwrap() else {
            panic!("expected a palette");
        };
        assert_eq!(palette.color_count(), 10);
    }

    #[test]
    fn claim_carries_owner() {
        let event = InboundEvent::parse(
            r#"{"event":"deviceClaimed","data":{"userEmail":"u@x","userName":"U"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::DeviceClaimed {
                user_email: Some("u@x".into()),
                user_name: Some("U".into()),
            }
        );
    }

    #[test]
    fn lighting_config_defaults_port_and_placeholder_host() {
        let event = InboundEvent::parse(
            r#"{"event":"lightingSystemConfig","data":{"systemType":"nanoleaf","hostAddress":"null"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::LightingSystemConfig(LightingConfig::networked(SystemType::Nanoleaf, "", 80, ""))
        );
    }

    #[test]
    fn strip_config_reads_custom_keys() {
        let event = InboundEvent::parse(
            r#"{"event":"lightingSystemConfig","data":{"systemType":"ws2812","hostAddress":"x",
                "customConfig":{"pin":13,"numLEDs":60}}}"#,
        )
        .unwrap();
        assert_eq!(event, InboundEvent::LightingSystemConfig(LightingConfig::strip(13, 60)));
    }

    #[test]
    fn strip_config_drops_only_a_bad_pin() {
        let event = InboundEvent::parse(
            r#"{"event":"lightingSystemConfig","data":{"systemType":"ws2812",
                "customConfig":{"pin":300,"numLEDs":60}}}"#,
        )
        .unwrap();
        let InboundEvent::LightingSystemConfig(config) = event else {
            panic!("expected a lighting config");
        };
        assert_eq!(config.custom.led_pin, None);
        assert_eq!(config.custom.led_count, Some(60));
        assert_eq!(config.system_type, SystemType::Ws2812);
    }

    #[test]
    fn unknown_event_and_bad_json() {
        assert_eq!(
            InboundEvent::parse(r#"{"event":"firmwareUpdate","data":{}}"#).unwrap(),
            InboundEvent::Unknown("firmwareUpdate".into())
        );
        assert!(InboundEvent::parse("{not json").is_err());
        assert!(InboundEvent::parse(r#"{"data":{}}"#).is_err());
        assert!(InboundEvent::parse(r#"{"event":"lightingSystemConfig","data":{"systemType":"hue"}}"#).is_err());
    }

    #[test]
    fn outbound_is_event_and_data() {
        let message = OutboundMessage::LightingSystemTest(LightingSystemTest {
            device_id: "uuid-A".into(),
            success: false,
            error: Some("Connection test failed".into()),
        });
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "lightingSystemTest",
                "data": { "deviceId": "uuid-A", "success": false, "error": "Connection test failed" }
            })
        );
        assert_eq!(message.event_name(), "lightingSystemTest");
    }

    #[test]
    fn storage_fault_only_when_set() {
        let status = DeviceStatus {
            device_id: "a".into(),
            timestamp: 0,
            is_online: true,
            is_provisioned: false,
            firmware_version: "2.0.0".into(),
            ip_address: None,
            mac_address: "AA".into(),
            wifi_rssi: None,
            free_heap: 0,
            uptime: 0,
            storage_fault: false,
        };
        let value = serde_json::to_value(OutboundMessage::DeviceStatus(status.clone())).unwrap();
        assert!(value["data"].get("storageFault").is_none());

        let value = serde_json::to_value(OutboundMessage::DeviceStatus(DeviceStatus {
            storage_fault: true,
            ..status
        }))
        .unwrap();
        assert_eq!(value["data"]["storageFault"], true);
    }
}
