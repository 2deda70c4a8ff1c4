// ─── Tira WS2812 sobre RMT ───
//
// Cada bit es un pulso alto + uno bajo; los anchos distinguen 0 de 1.
// Los LEDs esperan GRB, el bit más significativo primero.

use anyhow::{bail, Result};
use esp_idf_hal::gpio::AnyOutputPin;
use esp_idf_hal::rmt::config::TransmitConfig;
use esp_idf_hal::rmt::{PinState, Pulse, TxRmtDriver, VariableLengthSignal, CHANNEL0};
use log::info;
use smart_leds::RGB8;
use std::time::Duration;

use crate::config::MAX_LED_COUNT;
use crate::platform::LedStrip;

const T0H: Duration = Duration::from_nanos(350);
const T0L: Duration = Duration::from_nanos(800);
const T1H: Duration = Duration::from_nanos(700);
const T1L: Duration = Duration::from_nanos(600);

#[derive(Default)]
pub struct RmtLedStrip {
    driver: Option<TxRmtDriver<'static>>,
    led_count: usize,
}

impl LedStrip for RmtLedStrip {
    fn attach(&mut self, pin: u8, led_count: usize) -> Result<()> {
        // Soltar el canal antes de volver a tomarlo.
        self.driver = None;

        // SAFETY: el canal 0 solo lo usa esta tira y el driver anterior ya
        // se liberó; el GPIO viene de la config del usuario.
        let channel = unsafe { CHANNEL0::new() };
        let pin = unsafe { AnyOutputPin::new(i32::from(pin)) };
        let config = TransmitConfig::new().clock_divider(1);
        let driver = TxRmtDriver::new(channel, pin, &config)?;

        let led_count = led_count.min(usize::from(MAX_LED_COUNT));
        info!("RMT channel 0 attached, {} LEDs", led_count);
        self.driver = Some(driver);
        self.led_count = led_count;
        Ok(())
    }

    fn write(&mut self, pixels: &[RGB8]) -> Result<()> {
        let Some(driver) = self.driver.as_mut() else {
            bail!("LED strip is not attached");
        };

        let ticks_hz = driver.counter_clock()?;
        let t0h = Pulse::new_with_duration(ticks_hz, PinState::High, &T0H)?;
        let t0l = Pulse::new_with_duration(ticks_hz, PinState::Low, &T0L)?;
        let t1h = Pulse::new_with_duration(ticks_hz, PinState::High, &T1H)?;
        let t1l = Pulse::new_with_duration(ticks_hz, PinState::Low, &T1L)?;

        let mut signal = VariableLengthSignal::with_capacity(pixels.len().min(self.led_count) * 48);
        for pixel in pixels.iter().take(self.led_count) {
            let grb = (u32::from(pixel.g) << 16) | (u32::from(pixel.r) << 8) | u32::from(pixel.b);
            for bit in (0..24).rev() {
                let (high, low) = if grb & (1 << bit) != 0 {
                    (&t1h, &t1l)
                } else {
                    (&t0h, &t0l)
                };
                signal.push([high, low])?;
            }
        }
        driver.start_blocking(&signal)?;
        Ok(())
    }
}
