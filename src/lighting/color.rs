// ─── Conversiones de color ───

use smart_leds::RGB8;

/// Parsea `RRGGBB` (con o sin `#`).
pub fn parse_hex(hex: &str) -> Option<RGB8> {
    let hex = hex.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some(RGB8::new(
        ((value >> 16) & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (value & 0xFF) as u8,
    ))
}

pub fn to_hex(color: RGB8) -> String {
    format!("{:02X}{:02X}{:02X}", color.r, color.g, color.b)
}

/// Estira `colors` sobre `led_count` LEDs por vecino más cercano:
/// el LED `i` toma el color `i · len / led_count`.
pub fn stretch(colors: &[RGB8], led_count: usize) -> Vec<RGB8> {
    if colors.is_empty() {
        return vec![RGB8::default(); led_count];
    }
    (0..led_count)
        .map(|i| colors[i * colors.len() / led_count])
        .collect()
}

/// Igual que `stretch` pero agrupado en tramos `[start, stop)` contiguos.
pub fn stretch_runs(colors: &[RGB8], led_count: usize) -> Vec<(usize, usize, RGB8)> {
    let mut runs: Vec<(usize, usize, RGB8)> = Vec::new();
    if colors.is_empty() {
        return runs;
    }
    let mut last_index = usize::MAX;
    for i in 0..led_count {
        let index = i * colors.len() / led_count;
        if index == last_index {
            if let Some(run) = runs.last_mut() {
                run.1 = i + 1;
            }
        } else {
            runs.push((i, i + 1, colors[index]));
            last_index = index;
        }
    }
    runs
}

/// Color en el espacio HSB que usa la API de Nanoleaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hsb {
    /// 0..360
    pub hue: u16,
    /// 0..100
    pub saturation: u8,
    /// 0..100
    pub brightness: u8,
}

pub fn to_hsb(color: RGB8) -> Hsb {
    let r = color.r as f32 / 255.0;
    let g = color.g as f32 / 255.0;
    let b = color.b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    Hsb {
        hue: (hue.round() as u16) % 360,
        saturation: (saturation * 100.0).round() as u8,
        brightness: (max * 100.0).round() as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RED: RGB8 = RGB8 { r: 255, g: 0, b: 0 };
    const GREEN: RGB8 = RGB8 { r: 0, g: 255, b: 0 };
    const BLUE: RGB8 = RGB8 { r: 0, g: 0, b: 255 };

    #[test]
    fn parses_hex_with_and_without_hash() {
        assert_eq!(parse_hex("FF0000"), Some(RED));
        assert_eq!(parse_hex("#00ff00"), Some(GREEN));
        assert_eq!(parse_hex("12345"), None);
        assert_eq!(parse_hex("GG0000"), None);
        assert_eq!(to_hex(RGB8::new(1, 171, 255)), "01ABFF");
    }

    #[test]
    fn stretch_distributes_colors_evenly() {
        let leds = stretch(&[RED, GREEN, BLUE], 6);
        assert_eq!(leds, vec![RED, RED, GREEN, GREEN, BLUE, BLUE]);

        let leds = stretch(&[RED, GREEN, BLUE], 10);
        assert_eq!(leds.len(), 10);
        assert_eq!(leds[0], RED);
        assert_eq!(leds[9], BLUE);
    }

    #[test]
    fn stretch_with_fewer_leds_than_colors_samples() {
        assert_eq!(stretch(&[RED, GREEN, BLUE, RED], 2), vec![RED, BLUE]);
        assert_eq!(stretch(&[], 3), vec![RGB8::default(); 3]);
    }

    #[test]
    fn runs_cover_every_led_once() {
        let runs = stretch_runs(&[RED, GREEN, BLUE], 10);
        assert_eq!(runs, vec![(0, 4, RED), (4, 7, GREEN), (7, 10, BLUE)]);
        let covered: usize = runs.iter().map(|(start, stop, _)| stop - start).sum();
        assert_eq!(covered, 10);
    }

    #[test]
    fn hsb_of_primaries() {
        assert_eq!(to_hsb(RED), Hsb { hue: 0, saturation: 100, brightness: 100 });
        assert_eq!(to_hsb(GREEN), Hsb { hue: 120, saturation: 100, brightness: 100 });
        assert_eq!(to_hsb(BLUE), Hsb { hue: 240, saturation: 100, brightness: 100 });
        assert_eq!(to_hsb(RGB8::new(255, 255, 255)), Hsb { hue: 0, saturation: 0, brightness: 100 });
        assert_eq!(to_hsb(RGB8::default()), Hsb { hue: 0, saturation: 0, brightness: 0 });
    }
}
