//! Button icons.
//!
//! Icons are drawn as SVG and rasterised with resvg into PNG data URLs, the
//! format the device host accepts for `setImage`.

use std::{collections::HashMap, fmt::Write as _, sync::Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use resvg::{tiny_skia, usvg};

use crate::{
    error::{Error, Result},
    sync::lock,
};

pub const DEFAULT_ICON_SIZE: u32 = 128;
pub const DEFAULT_BACKGROUND: &str = "#0a1423";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Parses `#rrggbb`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#')?;
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |at: usize| u8::from_str_radix(&hex[at..at + 2], 16).ok();
        Some(Self(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// What to draw on one button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IconRequest {
    /// A light glyph, filled with `color` when lit.
    Light { variant: usize, color: Option<Rgb> },
    Switch { variant: usize, on: bool },
}

impl IconRequest {
    pub fn variant(&self) -> usize {
        match self {
            Self::Light { variant, .. } | Self::Switch { variant, .. } => *variant,
        }
    }
}

/// Turns an icon request into an encoded image string.
///
/// Implementations must return the same image for equal requests. `None`
/// means the request names a variant the renderer does not have.
#[async_trait]
pub trait IconRenderer: Send + Sync {
    async fn render(&self, request: &IconRequest) -> Result<Option<String>>;
}

/// The built-in renderer. Finished images are cached per request for the
/// lifetime of the renderer.
pub struct SvgIconRenderer {
    size: u32,
    background: String,
    cache: Mutex<HashMap<IconRequest, String>>,
}

impl SvgIconRenderer {
    pub fn new(size: u32, background: impl Into<String>) -> Self {
        Self {
            size,
            background: background.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct glyphs for a domain.
    pub fn variants(request: &IconRequest) -> usize {
        match request {
            IconRequest::Light { .. } => 2,
            IconRequest::Switch { .. } => 1,
        }
    }

    fn svg(&self, request: &IconRequest) -> Option<String> {
        if request.variant() >= Self::variants(request) {
            return None;
        }
        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 128 128"><rect width="128" height="128" fill="{bg}"/>"#,
            size = self.size,
            bg = self.background,
        );
        match *request {
            IconRequest::Light { variant: 0, color } => bulb(&mut svg, 64.0, 56.0, 1.0, color),
            IconRequest::Light { color, .. } => {
                bulb(&mut svg, 40.0, 60.0, 0.62, color);
                bulb(&mut svg, 88.0, 60.0, 0.62, color);
            }
            IconRequest::Switch { on, .. } => toggle(&mut svg, on),
        }
        svg.push_str("</svg>");
        Some(svg)
    }

    fn rasterize(&self, svg: &str) -> Result<String> {
        let tree = usvg::Tree::from_str(svg, &usvg::Options::default())
            .map_err(|e| Error::Render(e.to_string()))?;
        let mut pixmap = tiny_skia::Pixmap::new(self.size, self.size)
            .ok_or_else(|| Error::Render(format!("invalid icon size {}", self.size)))?;
        resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());
        let png = pixmap
            .encode_png()
            .map_err(|e| Error::Render(e.to_string()))?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
    }
}

impl Default for SvgIconRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_ICON_SIZE, DEFAULT_BACKGROUND)
    }
}

#[async_trait]
impl IconRenderer for SvgIconRenderer {
    async fn render(&self, request: &IconRequest) -> Result<Option<String>> {
        if let Some(image) = lock(&self.cache).get(request) {
            return Ok(Some(image.clone()));
        }
        let Some(svg) = self.svg(request) else {
            return Ok(None);
        };
        let image = self.rasterize(&svg)?;
        lock(&self.cache).insert(*request, image.clone());
        Ok(Some(image))
    }
}

const OUTLINE: &str = "#e1e5ea";
const UNLIT: &str = "#2b3646";

/// A bulb centred on (`cx`, `cy`); its glass is filled when lit.
fn bulb(svg: &mut String, cx: f32, cy: f32, scale: f32, color: Option<Rgb>) {
    let fill = color.map_or_else(|| UNLIT.to_string(), Rgb::to_hex);
    let r = 30.0 * scale;
    let base_w = 26.0 * scale;
    let base_h = 16.0 * scale;
    let _ = write!(
        svg,
        r#"<g stroke="{OUTLINE}" stroke-width="{sw}"><circle cx="{cx}" cy="{cy}" r="{r}" fill="{fill}"/><rect x="{bx}" y="{by}" width="{base_w}" height="{base_h}" rx="{rx}" fill="{OUTLINE}"/></g>"#,
        sw = 4.0 * scale,
        bx = cx - base_w / 2.0,
        by = cy + r - 2.0 * scale,
        rx = 3.0 * scale,
    );
}

fn toggle(svg: &mut String, on: bool) {
    let (track, knob_x) = if on { ("#03a9f4", 82.0) } else { (UNLIT, 46.0) };
    let _ = write!(
        svg,
        r#"<rect x="24" y="44" width="80" height="40" rx="20" fill="{track}" stroke="{OUTLINE}" stroke-width="4"/><circle cx="{knob_x}" cy="64" r="14" fill="{OUTLINE}"/>"#,
    );
}
