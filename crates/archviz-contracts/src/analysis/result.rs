use std::fmt;

use thiserror::Error;

/// Why a single candidate model did not produce a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub model: String,
    pub attempts: u32,
    pub error: CandidateError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.attempts == 1 {
            "attempt"
        } else {
            "attempts"
        };
        write!(
            f,
            "{} ({} {noun}): {}",
            self.model, self.attempts, self.error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("missing credential: {0} is not set")]
    MissingCredential(String),
    #[error("no input image: provide a geometry image first")]
    NoInputImage,
    #[error("expected one or two images, got {0}")]
    TooManyImages(usize),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no candidate models configured")]
    NoCandidateModels,
    #[error("{}", describe_exhausted(.0))]
    AllCandidatesFailed(Vec<CandidateFailure>),
}

impl SynthesisError {
    /// True when every attempted model gave up on HTTP 429.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::AllCandidatesFailed(failures) => {
                !failures.is_empty()
                    && failures
                        .iter()
                        .all(|failure| failure.error == CandidateError::RateLimited)
            }
            _ => false,
        }
    }

    pub fn failures(&self) -> &[CandidateFailure] {
        match self {
            Self::AllCandidatesFailed(failures) => failures.as_slice(),
            _ => &[],
        }
    }

    pub fn attempted_models(&self) -> Vec<&str> {
        self.failures()
            .iter()
            .map(|failure| failure.model.as_str())
            .collect()
    }
}

fn describe_exhausted(failures: &[CandidateFailure]) -> String {
    let detail = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    let all_rate_limited = !failures.is_empty()
        && failures
            .iter()
            .all(|failure| failure.error == CandidateError::RateLimited);
    if all_rate_limited {
        format!("all candidate models failed: {detail}. Wait about a minute before trying again.")
    } else {
        format!("all candidate models failed: {detail}")
    }
}

/// A generated render prompt and the model that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSuggestion {
    pub model: String,
    pub prompt: String,
    pub attempts: u32,
}

pub type AnalysisResult = Result<PromptSuggestion, SynthesisError>;
