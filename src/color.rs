//! Color parsing and similarity.
//!
//! Computed style values come back from the page as `#rgb`, `#rrggbb`,
//! `rgb(r, g, b)` or `rgba(r, g, b, a)`. Everything is normalised to a
//! lowercase hex string first, then to an [`Rgb`] triple for comparison.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum Euclidean distance between two colors that still counts as a hit.
///
/// Anti-aliased or sub-pixel rendered colors drift a few units per channel.
pub const COLOR_TOLERANCE: f64 = 50.0;

static HEX_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^#([0-9A-F]{3}){1,2}$").expect("valid hex color pattern"));

static RGB_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^rgb\((\d+),\s*(\d+),\s*(\d+)\)$").expect("valid rgb() pattern")
});

static RGBA_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^rgba\((\d+),\s*(\d+),\s*(\d+),\s*([\d.]+)\)$").expect("valid rgba() pattern")
});

/// An RGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rgb`, `#rrggbb`, `rgb` or `rrggbb`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        let expanded: String = match digits.len() {
            3 => digits.chars().flat_map(|c| [c, c]).collect(),
            6 => digits.to_string(),
            _ => {
                log::debug!("[color] failed to parse hex color: {}", hex);
                return None;
            }
        };
        if !expanded.chars().all(|c| c.is_ascii_hexdigit()) {
            log::debug!("[color] failed to parse hex color: {}", hex);
            return None;
        }

        let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Lowercase, zero-padded `#rrggbb`.
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn distance(self, other: Rgb) -> f64 {
        let dr = f64::from(self.r) - f64::from(other.r);
        let dg = f64::from(self.g) - f64::from(other.g);
        let db = f64::from(self.b) - f64::from(other.b);
        (dr * dr + dg * dg + db * db).sqrt()
    }

    pub fn is_similar(self, other: Rgb) -> bool {
        self.distance(other) <= COLOR_TOLERANCE
    }
}

/// Whether `value` is a `#rgb` / `#rrggbb` color, case-insensitively.
pub fn is_valid_hex_color(value: &str) -> bool {
    HEX_COLOR.is_match(value)
}

/// Normalise a computed style color to hex.
///
/// Returns `None` for absent, transparent or unparsable values. Hex input is
/// passed through lowercased; functional notation is re-encoded as `#rrggbb`.
pub fn css_to_hex(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("transparent") {
        return None;
    }
    if value.starts_with('#') {
        return Some(value.to_lowercase());
    }

    let captures = if let Some(caps) = RGB_FUNCTION.captures(value) {
        caps
    } else if let Some(caps) = RGBA_FUNCTION.captures(value) {
        let alpha: f64 = caps[4].parse().ok()?;
        if alpha == 0.0 {
            return None;
        }
        caps
    } else {
        log::debug!("[color] unparseable color: {}", value);
        return None;
    };

    let channel = |i: usize| captures[i].parse::<u8>().ok();
    match (channel(1), channel(2), channel(3)) {
        (Some(r), Some(g), Some(b)) => Some(Rgb::new(r, g, b).to_hex()),
        _ => {
            log::debug!("[color] channel out of range: {}", value);
            None
        }
    }
}

/// Parse any computed style color straight to [`Rgb`].
pub fn css_to_rgb(value: &str) -> Option<Rgb> {
    css_to_hex(value).and_then(|hex| Rgb::from_hex(&hex))
}
