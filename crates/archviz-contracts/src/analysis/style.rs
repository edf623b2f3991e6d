#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StylePreset {
    pub key: &'static str,
    pub label: &'static str,
}

pub const STYLE_PRESETS: &[StylePreset] = &[
    StylePreset {
        key: "glass",
        label: "Modern Glass Curtain Wall",
    },
    StylePreset {
        key: "concrete",
        label: "Exposed Concrete",
    },
    StylePreset {
        key: "brick",
        label: "Brick Industrial",
    },
    StylePreset {
        key: "forest",
        label: "Forest Resort",
    },
];

pub const DEFAULT_STYLE_KEY: &str = "glass";

/// Maps a preset key to its label. Any other non-blank text is used verbatim.
pub fn resolve_style_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if let Some(preset) = STYLE_PRESETS.iter().find(|preset| preset.key == lowered) {
        return Some(preset.label.to_string());
    }
    Some(trimmed.to_string())
}

pub fn default_style_label() -> String {
    resolve_style_label(DEFAULT_STYLE_KEY).unwrap_or_default()
}
