use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Preset visual styles a user can pick for the composited shot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StylePreset {
    #[default]
    Studio,
    Editorial,
    Lifestyle,
    Streetwear,
    Minimal,
}

impl StylePreset {
    /// Look up a preset by its stored style value. Unknown values fall back
    /// to the default preset.
    pub fn lookup(style: &str) -> Self {
        style.trim().parse().unwrap_or_default()
    }

    /// Lighting and color-grade direction inserted into the instruction
    /// text. Never mentions the scene, which the template preserves.
    pub fn description(self) -> &'static str {
        match self {
            StylePreset::Studio => {
                "Clean studio product photography: soft even key light, gentle fill, \
                 true-to-life fabric color and texture."
            }
            StylePreset::Editorial => {
                "High-fashion editorial look: dramatic directional lighting, rich contrast, \
                 magazine-cover polish while keeping skin tones natural."
            }
            StylePreset::Lifestyle => {
                "Candid lifestyle photography: warm natural daylight tones, soft shadows, \
                 relaxed everyday color grade."
            }
            StylePreset::Streetwear => {
                "Urban streetwear campaign: crisp punchy colors, slightly cool grade, \
                 hard contrasty light on the garment."
            }
            StylePreset::Minimal => {
                "Minimalist catalogue shot: flat diffuse light, muted low-contrast grade, \
                 even exposure across the garment."
            }
        }
    }
}
