// ─── Storage sobre NVS ───
//
// NVS (Non-Volatile Storage) es la "flash persistente" del ESP32:
// sobrevive reinicios y power cycles. Cada namespace es un key-value
// store independiente dentro de la partición default.

use anyhow::{Context, Result};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use log::info;
use zeroize::Zeroize;

use crate::storage::{KvStore, StorageBackend};

/// Largo máximo de un valor de texto (URLs del servidor incluidas).
const MAX_STR_LEN: usize = 256;

pub struct NvsStorage {
    partition: EspDefaultNvsPartition,
}

impl NvsStorage {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }
}

impl StorageBackend for NvsStorage {
    /// `true` en EspNvs::new = crear el namespace si no existe.
    fn open(&self, namespace: &str) -> Result<Box<dyn KvStore>> {
        let nvs = EspNvs::new(self.partition.clone(), namespace, true)
            .with_context(|| format!("failed to open NVS namespace '{}'", namespace))?;
        info!("NVS namespace '{}' opened", namespace);
        Ok(Box::new(NvsNamespace { nvs }))
    }
}

struct NvsNamespace {
    nvs: EspNvs<NvsDefault>,
}

impl KvStore for NvsNamespace {
    fn get_str(&self, key: &str) -> Result<Option<String>> {
        // El buffer puede tener la password del WiFi: se borra siempre.
        let mut buf = [0u8; MAX_STR_LEN];
        let value = self
            .nvs
            .get_str(key, &mut buf)
            .with_context(|| format!("failed to read '{}'", key))?
            .map(|value| value.trim_end_matches('\0').to_string());
        buf.zeroize();
        Ok(value)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.nvs
            .set_str(key, value)
            .with_context(|| format!("failed to write '{}'", key))?;
        Ok(())
    }

    /// Los flags se guardan como u8: 1 = sí, 0 = no.
    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        let value = self
            .nvs
            .get_u8(key)
            .with_context(|| format!("failed to read '{}'", key))?;
        Ok(value.map(|v| v == 1))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.nvs
            .set_u8(key, u8::from(value))
            .with_context(|| format!("failed to write '{}'", key))?;
        Ok(())
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>> {
        let value = self
            .nvs
            .get_i32(key)
            .with_context(|| format!("failed to read '{}'", key))?;
        Ok(value)
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<()> {
        self.nvs
            .set_i32(key, value)
            .with_context(|| format!("failed to write '{}'", key))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let removed = self
            .nvs
            .remove(key)
            .with_context(|| format!("failed to remove '{}'", key))?;
        Ok(removed)
    }
}
