use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::result::SynthesisError;

pub const CLEAN_BACKGROUND_INSTRUCTION: &str =
    "Keep the background clean, minimal and studio-lit. Do not invent surrounding scenery.";

pub const ENVIRONMENT_BACKGROUND_INSTRUCTION: &str =
    "Generate a realistic environment around the building (site, landscape, sky and context) that suits the target style.";

pub const GEOMETRY_IMAGE_TAG: &str = "[GEOMETRY SOURCE] The next image is the authoritative source of the building geometry. Describe its massing, outline, openings and proportions exactly as drawn.";

pub const REFERENCE_IMAGE_TAG: &str = "[STYLE REFERENCE] The next image only donates style, materials, colours and lighting. It must NOT alter the building geometry.";

pub const USER_NOTES_TAG: &str =
    "[USER NOTES] Extra requirements from the user. Translate them into English keywords if they are not in English:";

pub const QUALITY_SUFFIX: &str =
    "photorealistic, 8k, architectural photography, cinematic lighting";

/// Raw image bytes plus the MIME type sent alongside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::new(bytes, guess_image_mime(path)))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn to_part(&self) -> PromptPart {
        PromptPart::InlineData {
            inline_data: InlineData {
                mime_type: self.mime_type.clone(),
                data: self.to_base64(),
            },
        }
    }
}

pub fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        _ => "image/jpeg",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// One entry of a `generateContent` `parts` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

impl PromptPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text { text: value.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            Self::InlineData { .. } => None,
        }
    }
}

/// Everything the vision model needs to write a render prompt.
///
/// The geometry image is always present. The reference image only exists when
/// the user supplied a second image.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    system_instruction: String,
    geometry_image: ImagePayload,
    reference_image: Option<ImagePayload>,
    style_label: String,
    user_notes: Option<String>,
    clean_background: bool,
}

impl AnalysisRequest {
    /// Builds a request from one or two images: geometry first, optional
    /// style reference second.
    pub fn new(
        images: Vec<ImagePayload>,
        style_label: &str,
        user_notes: Option<&str>,
        clean_background: bool,
    ) -> Result<Self, SynthesisError> {
        if images.len() > 2 {
            return Err(SynthesisError::TooManyImages(images.len()));
        }
        let mut images = images.into_iter();
        let Some(geometry_image) = images.next() else {
            return Err(SynthesisError::NoInputImage);
        };
        let reference_image = images.next();

        let style_label = style_label.trim();
        if style_label.is_empty() {
            return Err(SynthesisError::InvalidInput(
                "style label must not be empty".to_string(),
            ));
        }
        let user_notes = user_notes
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(Self {
            system_instruction: task_instruction(style_label, clean_background),
            geometry_image,
            reference_image,
            style_label: style_label.to_string(),
            user_notes,
            clean_background,
        })
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn geometry_image(&self) -> &ImagePayload {
        &self.geometry_image
    }

    pub fn reference_image(&self) -> Option<&ImagePayload> {
        self.reference_image.as_ref()
    }

    pub fn style_label(&self) -> &str {
        &self.style_label
    }

    pub fn user_notes(&self) -> Option<&str> {
        self.user_notes.as_deref()
    }

    pub fn clean_background(&self) -> bool {
        self.clean_background
    }

    /// Parts in the order the model must see them: instruction, geometry,
    /// optional reference, optional notes, output directive.
    pub fn parts(&self) -> Vec<PromptPart> {
        let mut parts = vec![
            PromptPart::text(self.system_instruction.clone()),
            PromptPart::text(GEOMETRY_IMAGE_TAG),
            self.geometry_image.to_part(),
        ];
        if let Some(reference) = self.reference_image.as_ref() {
            parts.push(PromptPart::text(REFERENCE_IMAGE_TAG));
            parts.push(reference.to_part());
        }
        if let Some(notes) = self.user_notes.as_deref() {
            parts.push(PromptPart::text(format!("{USER_NOTES_TAG} {notes}")));
        }
        parts.push(PromptPart::text(output_directive()));
        parts
    }
}

pub fn background_instruction(clean_background: bool) -> &'static str {
    if clean_background {
        CLEAN_BACKGROUND_INSTRUCTION
    } else {
        ENVIRONMENT_BACKGROUND_INSTRUCTION
    }
}

fn task_instruction(style_label: &str, clean_background: bool) -> String {
    format!(
        "You are an architectural visualizer writing a prompt for a ControlNet Stable Diffusion image-to-image render. Study the attached line drawing or white model and describe the building geometry accurately. Target style: {style_label}. Background: {}",
        background_instruction(clean_background)
    )
}

fn output_directive() -> String {
    format!(
        "Output format: English keywords separated by commas. No full sentences, no explanations. Finish the list with: {QUALITY_SUFFIX}"
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn jpeg(bytes: &[u8]) -> ImagePayload {
        ImagePayload::new(bytes.to_vec(), "image/jpeg")
    }

    fn joined_text(request: &AnalysisRequest) -> String {
        request
            .parts()
            .iter()
            .filter_map(PromptPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn background_variant_follows_flag_and_excludes_the_other() {
        for style in ["Modern Glass", "Concrete", "紅磚工業風"] {
            let clean = AnalysisRequest::new(vec![jpeg(b"a")], style, None, true).unwrap();
            assert!(clean
                .system_instruction()
                .contains(CLEAN_BACKGROUND_INSTRUCTION));
            assert!(!joined_text(&clean).contains(ENVIRONMENT_BACKGROUND_INSTRUCTION));
            assert!(clean.system_instruction().contains(style));

            let scenic = AnalysisRequest::new(vec![jpeg(b"a")], style, None, false).unwrap();
            assert!(scenic
                .system_instruction()
                .contains(ENVIRONMENT_BACKGROUND_INSTRUCTION));
            assert!(!joined_text(&scenic).contains(CLEAN_BACKGROUND_INSTRUCTION));
        }
    }

    #[test]
    fn geometry_tag_precedes_reference_tag() {
        let request = AnalysisRequest::new(
            vec![jpeg(b"geometry"), jpeg(b"reference")],
            "Concrete",
            Some("more glass"),
            false,
        )
        .unwrap();
        let parts = request.parts();
        let geometry_at = parts
            .iter()
            .position(|part| part.as_text() == Some(GEOMETRY_IMAGE_TAG))
            .unwrap();
        let reference_at = parts
            .iter()
            .position(|part| part.as_text() == Some(REFERENCE_IMAGE_TAG))
            .unwrap();
        assert!(geometry_at < reference_at);
        assert_eq!(parts[geometry_at + 1], jpeg(b"geometry").to_part());
        assert_eq!(parts[reference_at + 1], jpeg(b"reference").to_part());
    }

    #[test]
    fn reference_tag_absent_without_reference_image() {
        let request = AnalysisRequest::new(vec![jpeg(b"g")], "Brick", None, true).unwrap();
        assert!(request.reference_image().is_none());
        assert!(!joined_text(&request).contains("[STYLE REFERENCE]"));
        assert_eq!(request.parts().len(), 4);
    }

    #[test]
    fn parts_follow_fixed_order_and_wire_shape() {
        let request = AnalysisRequest::new(
            vec![jpeg(b"g"), ImagePayload::new(b"r".to_vec(), "image/png")],
            "Forest Resort",
            Some("  加一點夕陽  "),
            false,
        )
        .unwrap();
        let wire = serde_json::to_value(request.parts()).unwrap();
        let rows = wire.as_array().unwrap();
        assert_eq!(rows.len(), 7);
        assert!(rows[0]["text"].as_str().unwrap().contains("Forest Resort"));
        assert_eq!(rows[1], json!({ "text": GEOMETRY_IMAGE_TAG }));
        assert_eq!(
            rows[2],
            json!({ "inline_data": { "mime_type": "image/jpeg", "data": "Zw==" } })
        );
        assert_eq!(rows[3], json!({ "text": REFERENCE_IMAGE_TAG }));
        assert_eq!(rows[4]["inline_data"]["mime_type"], json!("image/png"));
        assert_eq!(
            rows[5]["text"],
            json!(format!("{USER_NOTES_TAG} 加一點夕陽"))
        );
        assert!(rows[6]["text"].as_str().unwrap().ends_with(QUALITY_SUFFIX));
    }

    #[test]
    fn blank_notes_are_dropped() {
        let request = AnalysisRequest::new(vec![jpeg(b"g")], "Concrete", Some("   "), true).unwrap();
        assert_eq!(request.user_notes(), None);
        assert!(!joined_text(&request).contains("[USER NOTES]"));
    }

    #[test]
    fn rejects_missing_and_extra_images() {
        assert_eq!(
            AnalysisRequest::new(Vec::new(), "Concrete", None, true).unwrap_err(),
            SynthesisError::NoInputImage
        );
        assert_eq!(
            AnalysisRequest::new(vec![jpeg(b"1"), jpeg(b"2"), jpeg(b"3")], "Concrete", None, true)
                .unwrap_err(),
            SynthesisError::TooManyImages(3)
        );
        assert!(matches!(
            AnalysisRequest::new(vec![jpeg(b"1")], "  ", None, true),
            Err(SynthesisError::InvalidInput(_))
        ));
    }

    #[test]
    fn image_payload_reads_file_and_guesses_mime() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("elevation.PNG");
        fs::write(&path, b"\x89PNG")?;
        let payload = ImagePayload::from_path(&path)?;
        assert_eq!(payload.mime_type, "image/png");
        assert_eq!(payload.bytes, b"\x89PNG");
        assert!(payload.to_data_url().starts_with("data:image/png;base64,"));
        assert_eq!(guess_image_mime(Path::new("plan.jpg")), "image/jpeg");
        assert_eq!(guess_image_mime(Path::new("plan")), "image/jpeg");
        Ok(())
    }
}
