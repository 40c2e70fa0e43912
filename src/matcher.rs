//! Element predicate: target text first, then target color in the subtree.

use crate::color::{css_to_rgb, Rgb};
use crate::config::{Settings, SettingsError};
use crate::dom::{Dom, NodeId, StyleChannel};

/// Result of checking one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchOutcome {
    pub color_hit: bool,
    pub text_hit: bool,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        self.color_hit && self.text_hit
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    target_color: Rgb,
    // Lowercased once up front.
    target_texts: Vec<String>,
}

impl Matcher {
    pub fn new(target_color: Rgb, target_texts: &[String]) -> Self {
        Self {
            target_color,
            target_texts: target_texts
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| t.to_lowercase())
                .collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let target = Rgb::from_hex(&settings.target_color)
            .ok_or_else(|| SettingsError::InvalidTargetColor(settings.target_color.clone()))?;
        Ok(Self::new(target, &settings.target_texts))
    }

    pub fn target_color(&self) -> Rgb {
        self.target_color
    }

    /// Check `node`. Color is only inspected once the text predicate passed.
    pub fn matches<D: Dom + ?Sized>(&self, dom: &D, node: NodeId) -> MatchOutcome {
        if !self.contains_target_text(dom, node) {
            return MatchOutcome::default();
        }
        MatchOutcome {
            color_hit: self.contains_target_color(dom, node),
            text_hit: true,
        }
    }

    pub fn contains_target_text<D: Dom + ?Sized>(&self, dom: &D, node: NodeId) -> bool {
        if self.target_texts.is_empty() {
            return false;
        }
        let text = normalize_text(&dom.rendered_text(node)).to_lowercase();
        let found = self.target_texts.iter().any(|t| text.contains(t.as_str()));
        if found {
            log::debug!("[match] target text found: {}", text);
        }
        found
    }

    /// Pre-order walk over `node` and its descendants, stopping at the first
    /// style channel within tolerance of the target.
    pub fn contains_target_color<D: Dom + ?Sized>(&self, dom: &D, node: NodeId) -> bool {
        for current in dom.subtree(node) {
            for channel in StyleChannel::ALL {
                let Some(rgb) = dom
                    .computed_style(current, channel)
                    .and_then(|value| css_to_rgb(&value))
                else {
                    continue;
                };
                if self.target_color.is_similar(rgb) {
                    log::debug!(
                        "[match] target color found in {:?} {} ({})",
                        dom.tag_name(current),
                        channel.property(),
                        rgb.to_hex()
                    );
                    return true;
                }
            }
        }
        false
    }
}

/// Trim every line, drop blank ones and join with single spaces.
pub fn normalize_text(raw: &str) -> String {
    raw.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
