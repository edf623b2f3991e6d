mod request;
mod result;
mod style;

pub use request::{
    background_instruction, guess_image_mime, AnalysisRequest, ImagePayload, InlineData,
    PromptPart, CLEAN_BACKGROUND_INSTRUCTION, ENVIRONMENT_BACKGROUND_INSTRUCTION,
    GEOMETRY_IMAGE_TAG, QUALITY_SUFFIX, REFERENCE_IMAGE_TAG, USER_NOTES_TAG,
};
pub use result::{
    AnalysisResult, CandidateError, CandidateFailure, PromptSuggestion, SynthesisError,
};
pub use style::{default_style_label, resolve_style_label, StylePreset, STYLE_PRESETS};
