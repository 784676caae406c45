//! Screenshot judgement: natural-language verification, visual element
//! location and failure-recovery advice.

pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gemini::GeminiJudge;

/// Verdict for a natural-language screen description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub pass: bool,
    pub reason: String,
}

impl Judgment {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            pass: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: reason.into(),
        }
    }
}

/// What went wrong, as handed to the judge for recovery advice
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub action: String,
    pub target: String,
    pub error: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Screen still loading; wait then search again
    Retry { wait_seconds: f64 },
    /// A similar element with different text is visible
    AlternativeTarget(String),
    /// Element found visually, as screen percentages
    AlternativeCoordinates { x_percent: f64, y_percent: f64 },
    Fail,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry { .. } => "retry",
            RecoveryAction::AlternativeTarget(_) | RecoveryAction::AlternativeCoordinates { .. } => {
                "alternative"
            }
            RecoveryAction::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAdvice {
    pub action: RecoveryAction,
    pub reason: String,
}

impl RecoveryAdvice {
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::Fail,
            reason: reason.into(),
        }
    }
}

/// Errors from a vision judge call
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("rate limited by vision service")]
    RateLimited,

    #[error("vision request timed out")]
    Timeout,

    #[error("vision service error (HTTP {status})")]
    Server { status: u16 },

    #[error("connection to vision service failed: {0}")]
    Connection(String),

    #[error("vision request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid vision response: {0}")]
    InvalidResponse(String),

    #[error("vision judge unavailable")]
    Unavailable,
}

impl VisionError {
    /// Transient errors are worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VisionError::RateLimited
                | VisionError::Timeout
                | VisionError::Server { .. }
                | VisionError::Connection(_)
        )
    }
}

/// Interface to a screenshot-understanding model
#[async_trait]
pub trait VisionJudge: Send + Sync {
    /// False when no backend is configured
    fn is_available(&self) -> bool;

    /// Does the screenshot match `description`?
    async fn judge(&self, image: &[u8], description: &str) -> Result<Judgment, VisionError>;

    /// Visually locate an element; returns its centre in pixels
    async fn locate(
        &self,
        image: &[u8],
        description: &str,
        width: u32,
        height: u32,
    ) -> Result<Option<(i32, i32)>, VisionError>;

    /// Check that `description` is what sits at the given screen percentages
    async fn validate_at(
        &self,
        image: &[u8],
        description: &str,
        x_percent: f64,
        y_percent: f64,
    ) -> Result<Judgment, VisionError> {
        let prompt = format!(
            "the element \"{}\" is located at approximately ({:.0}%, {:.0}%) of the screen",
            description, x_percent, y_percent
        );
        self.judge(image, &prompt).await
    }

    /// Advise on a failed lookup
    async fn recover(
        &self,
        image: &[u8],
        failure: &FailureContext,
    ) -> Result<RecoveryAdvice, VisionError>;
}

/// Stand-in used when no API key is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableJudge;

#[async_trait]
impl VisionJudge for UnavailableJudge {
    fn is_available(&self) -> bool {
        false
    }

    async fn judge(&self, _image: &[u8], _description: &str) -> Result<Judgment, VisionError> {
        Ok(Judgment::pass("skipped: vision judge unavailable"))
    }

    async fn locate(
        &self,
        _image: &[u8],
        _description: &str,
        _width: u32,
        _height: u32,
    ) -> Result<Option<(i32, i32)>, VisionError> {
        Ok(None)
    }

    async fn recover(
        &self,
        _image: &[u8],
        _failure: &FailureContext,
    ) -> Result<RecoveryAdvice, VisionError> {
        Ok(RecoveryAdvice::fail("vision judge unavailable"))
    }
}
