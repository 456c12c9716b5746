//! How an entity state maps onto a button icon and state.

use crate::{
    hass::{Entity, State},
    icons::{IconRequest, Rgb},
};

/// Warm to cool white, indexed by the normalised colour temperature.
pub const COLOR_TEMP_GRADIENT: [&str; 50] = [
    "#ffa200", "#ffa404", "#fea509", "#fea70d", "#fea811", "#fdaa16", "#fdab1a", "#fdad1e",
    "#fcae23", "#fcb027", "#fcb12b", "#fbb330", "#fbb434", "#fbb638", "#fab73d", "#fab941",
    "#faba45", "#f9bc49", "#f9bd4e", "#f9bf52", "#f8c156", "#f8c25b", "#f8c45f", "#f7c563",
    "#f7c768", "#f7c86c", "#f6ca70", "#f6cb75", "#f6cd79", "#f5ce7d", "#f5d082", "#f4d186",
    "#f4d38a", "#f4d48f", "#f3d693", "#f3d797", "#f3d99c", "#f2daa0", "#f2dca4", "#f2dda9",
    "#f1dfad", "#f1e1b1", "#f1e2b6", "#f0e4ba", "#f0e5be", "#f0e7c2", "#efe8c7", "#efeacb",
    "#efebcf", "#eeedd4",
];

/// `1` when the entity is on, `0` otherwise.
pub fn button_state(state: &State) -> u8 {
    u8::from(state.is_on())
}

/// The icon for `state`, or `None` for domains without icons.
pub fn icon_request(state: &State, variant: usize) -> Option<IconRequest> {
    match Entity::new(&state.entity_id).domain.as_str() {
        "light" => Some(IconRequest::Light {
            variant,
            color: if state.is_on() { light_color(state) } else { None },
        }),
        "switch" => Some(IconRequest::Switch {
            variant,
            on: state.is_on(),
        }),
        _ => None,
    }
}

/// The colour a lit light shows, picked by its reported colour mode.
pub fn light_color(state: &State) -> Option<Rgb> {
    match state.attribute_str("color_mode") {
        Some("hs") => hs_color(state),
        Some("color_temp") => color_temp(state),
        _ => rgb_color(state).or_else(|| color_temp(state)),
    }
}

fn hs_color(state: &State) -> Option<Rgb> {
    let hs = state.attribute("hs_color")?.as_array()?;
    let hue = hs.first()?.as_f64()?;
    let saturation = hs.get(1)?.as_f64()?;
    Some(hsl_to_rgb(hue, saturation / 100.0, 0.5))
}

fn rgb_color(state: &State) -> Option<Rgb> {
    let rgb = state.attribute("rgb_color")?.as_array()?;
    let channel = |at: usize| -> Option<u8> {
        let value = rgb.get(at)?.as_f64()?;
        Some(value.clamp(0.0, 255.0).round() as u8)
    };
    Some(Rgb(channel(0)?, channel(1)?, channel(2)?))
}

fn color_temp(state: &State) -> Option<Rgb> {
    let fraction = match (
        state.attribute_f64("color_temp"),
        state.attribute_f64("min_mireds"),
        state.attribute_f64("max_mireds"),
    ) {
        (Some(mireds), Some(min), Some(max)) => 1.0 - normalise(mireds, min, max),
        _ => normalise(
            state.attribute_f64("color_temp_kelvin")?,
            state.attribute_f64("min_color_temp_kelvin")?,
            state.attribute_f64("max_color_temp_kelvin")?,
        ),
    };
    gradient(fraction)
}

/// Position of `value` within `min..=max`, clamped to `0..=1`. A range
/// without width maps to the middle.
fn normalise(value: f64, min: f64, max: f64) -> f64 {
    let width = max - min;
    if width.is_nan() || width <= 0.0 {
        return 0.5;
    }
    ((value - min) / width).clamp(0.0, 1.0)
}

fn gradient(fraction: f64) -> Option<Rgb> {
    if !fraction.is_finite() {
        return None;
    }
    let last = COLOR_TEMP_GRADIENT.len() - 1;
    let index = ((fraction.clamp(0.0, 1.0) * last as f64).floor() as usize).min(last);
    Rgb::from_hex(COLOR_TEMP_GRADIENT[index])
}

/// `hue` in degrees, `saturation` and `lightness` in `0..=1`.
pub fn hsl_to_rgb(hue: f64, saturation: f64, lightness: f64) -> Rgb {
    let hue = hue.rem_euclid(360.0);
    let saturation = saturation.clamp(0.0, 1.0);
    let lightness = lightness.clamp(0.0, 1.0);

    let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = lightness - chroma / 2.0;
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb(channel(r), channel(g), channel(b))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;

    fn state(entity_id: &str, on: bool, attributes: Value) -> State {
        serde_json::from_value(json!({
            "entity_id": entity_id,
            "state": if on { "on" } else { "off" },
            "attributes": attributes,
        }))
        .unwrap()
    }

    #[test]
    fn hsl_primaries() {
        assert_eq!(hsl_to_rgb(0.0, 1.0, 0.5), Rgb(255, 0, 0));
        assert_eq!(hsl_to_rgb(120.0, 1.0, 0.5), Rgb(0, 255, 0));
        assert_eq!(hsl_to_rgb(240.0, 1.0, 0.5), Rgb(0, 0, 255));
        assert_eq!(hsl_to_rgb(360.0, 0.0, 0.5), Rgb(128, 128, 128));
        assert_eq!(hsl_to_rgb(0.0, 1.0, 0.2), Rgb(102, 0, 0));
        assert_eq!(hsl_to_rgb(-120.0, 1.0, 0.5), Rgb(0, 0, 255));
    }

    #[test]
    fn hs_mode_uses_hue_and_saturation() {
        let kitchen = state("light.kitchen", true, json!({"color_mode": "hs", "hs_color": [30, 80]}));
        assert_eq!(
            icon_request(&kitchen, 0),
            Some(IconRequest::Light { variant: 0, color: Some(hsl_to_rgb(30.0, 0.8, 0.5)) })
        );
        assert_eq!(button_state(&kitchen), 1);
    }

    #[test]
    fn color_temp_walks_the_gradient() {
        let warmest = state("light.a", true, json!({
            "color_mode": "color_temp", "color_temp": 500, "min_mireds": 153, "max_mireds": 500
        }));
        let coolest = state("light.a", true, json!({
            "color_mode": "color_temp", "color_temp": 153, "min_mireds": 153, "max_mireds": 500
        }));
        assert_eq!(light_color(&warmest), Rgb::from_hex("#ffa200"));
        assert_eq!(light_color(&coolest), Rgb::from_hex("#eeedd4"));
    }

    #[test]
    fn kelvin_is_used_without_mireds() {
        let light = state("light.a", true, json!({
            "color_mode": "color_temp", "color_temp_kelvin": 6500,
            "min_color_temp_kelvin": 2000, "max_color_temp_kelvin": 6500
        }));
        assert_eq!(light_color(&light), Rgb::from_hex("#eeedd4"));
    }

    #[test]
    fn degenerate_temperature_ranges_are_clamped() {
        let flat = state("light.a", true, json!({
            "color_mode": "color_temp", "color_temp": 300, "min_mireds": 300, "max_mireds": 300
        }));
        assert_eq!(light_color(&flat), Rgb::from_hex(COLOR_TEMP_GRADIENT[24]));

        let outside = state("light.a", true, json!({
            "color_mode": "color_temp", "color_temp": 900, "min_mireds": 153, "max_mireds": 500
        }));
        assert_eq!(light_color(&outside), Rgb::from_hex("#ffa200"));
    }

    #[test]
    fn other_modes_fall_back_to_rgb() {
        let light = state("light.a", true, json!({"color_mode": "xy", "rgb_color": [10, 20, 300]}));
        assert_eq!(light_color(&light), Some(Rgb(10, 20, 255)));

        let bare = state("light.a", true, json!({"color_mode": "onoff"}));
        assert_eq!(light_color(&bare), None);
    }

    #[test]
    fn lights_off_are_unlit() {
        let light = state("light.a", false, json!({"color_mode": "hs", "hs_color": [30, 80]}));
        assert_eq!(icon_request(&light, 1), Some(IconRequest::Light { variant: 1, color: None }));
        assert_eq!(button_state(&light), 0);
    }

    #[test]
    fn switches_and_other_domains() {
        let switch = state("switch.fan", true, json!({}));
        assert_eq!(icon_request(&switch, 0), Some(IconRequest::Switch { variant: 0, on: true }));

        let sensor = state("sensor.temp", true, json!({}));
        assert_eq!(icon_request(&sensor, 0), None);
        assert_eq!(button_state(&sensor), 1);
    }
}
