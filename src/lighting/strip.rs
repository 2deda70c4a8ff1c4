// ─── Driver WS2812: tira direccionable conectada a un GPIO ───

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use smart_leds::{brightness, gamma, RGB8};

use super::color::stretch;
use super::{ColorPalette, DriverStatus, LedStrip, LightingConfig};
use crate::config::{DEFAULT_LED_COUNT, DEFAULT_LED_PIN, MAX_LED_COUNT, STRIP_BRIGHTNESS};

pub struct StripDriver {
    strip: Box<dyn LedStrip>,
    pin: Option<u8>,
    led_count: u16,
    status: DriverStatus,
}

impl StripDriver {
    pub fn new(strip: Box<dyn LedStrip>) -> Self {
        Self {
            strip,
            pin: None,
            led_count: 0,
            status: DriverStatus::Unconfigured,
        }
    }

    pub fn configure(&mut self, config: &LightingConfig) -> Result<()> {
        let pin = config.custom.led_pin.unwrap_or(DEFAULT_LED_PIN);
        let requested = config.custom.led_count.unwrap_or(DEFAULT_LED_COUNT);
        let led_count = requested.min(MAX_LED_COUNT);
        if led_count < requested {
            warn!("WS2812 strip limited to {} LEDs ({} requested)", MAX_LED_COUNT, requested);
        }

        if led_count == 0 {
            self.status = DriverStatus::Error;
            bail!("WS2812 strip needs at least one LED");
        }

        if self.status == DriverStatus::Ready && self.pin == Some(pin) && self.led_count == led_count {
            debug!("WS2812 already configured on GPIO{} with {} LEDs", pin, led_count);
            return Ok(());
        }

        info!("Configuring WS2812 strip: GPIO{}, {} LEDs", pin, led_count);
        if let Err(e) = self.strip.attach(pin, led_count as usize) {
            self.status = DriverStatus::Error;
            return Err(e.context(format!("failed to attach WS2812 strip on GPIO{}", pin)));
        }

        self.pin = Some(pin);
        self.led_count = led_count;
        self.status = DriverStatus::Ready;
        Ok(())
    }

    /// Un GPIO no tiene "alcanzabilidad": basta con que la tira esté adjunta.
    pub fn test_connection(&mut self) -> Result<()> {
        if self.status != DriverStatus::Ready {
            bail!("WS2812 strip is not configured");
        }
        Ok(())
    }

    pub fn display_palette(&mut self, palette: &ColorPalette) -> Result<()> {
        if self.status != DriverStatus::Ready {
            bail!("WS2812 strip is not configured");
        }
        let pixels: Vec<RGB8> = brightness(
            gamma(stretch(&palette.colors, self.led_count as usize).into_iter()),
            STRIP_BRIGHTNESS,
        )
        .collect();

        self.strip
            .write(&pixels)
            .context("failed to write WS2812 frame")?;
        debug!("WS2812 frame written: {} LEDs", pixels.len());
        Ok(())
    }

    pub fn status(&self) -> DriverStatus {
        self.status
    }

    pub fn reset(&mut self) {
        if self.status == DriverStatus::Ready {
            let off = vec![RGB8::default(); self.led_count as usize];
            if let Err(e) = self.strip.write(&off) {
                warn!("Failed to blank WS2812 strip on reset: {:?}", e);
            }
        }
        self.pin = None;
        self.led_count = 0;
        self.status = DriverStatus::Unconfigured;
    }

    pub fn config(&self) -> LightingConfig {
        LightingConfig::strip(
            self.pin.unwrap_or(DEFAULT_LED_PIN),
            if self.led_count == 0 { DEFAULT_LED_COUNT } else { self.led_count },
        )
    }
}
