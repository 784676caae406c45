use super::resolver::Provenance;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Failure classes a step can end with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TargetNotFound,
    ElementNotFoundAfterScroll,
    Timeout,
    UnknownAction,
    MissingRequiredField,
    DeviceActionFailed,
    VerificationFailed,
    RecoveryExhausted,
}

impl ErrorKind {
    /// Non-recoverable errors bypass AI recovery and step retries
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::UnknownAction | ErrorKind::MissingRequiredField
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TargetNotFound => "TargetNotFound",
            ErrorKind::ElementNotFoundAfterScroll => "ElementNotFoundAfterScroll",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::UnknownAction => "UnknownAction",
            ErrorKind::MissingRequiredField => "MissingRequiredField",
            ErrorKind::DeviceActionFailed => "DeviceActionFailed",
            ErrorKind::VerificationFailed => "VerificationFailed",
            ErrorKind::RecoveryExhausted => "RecoveryExhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step-level error: class plus human readable message
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn target_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TargetNotFound, message)
    }

    pub fn missing_field(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingRequiredField, message)
    }

    /// Wrap a device/capture failure
    pub fn device(action: &str, err: anyhow::Error) -> Self {
        Self::new(
            ErrorKind::DeviceActionFailed,
            format!("{} failed: {:#}", action, err),
        )
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// Test phase a step belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Body,
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Body => "body",
            Phase::Teardown => "teardown",
        }
    }
}

/// What Layer-2 recovery decided for a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryNote {
    pub action: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative: Option<String>,
}

/// Outcome of a deferred screen verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationNote {
    pub passed: bool,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwipeNote {
    pub from: (i32, i32),
    pub to: (i32, i32),
    pub duration_ms: u64,
    /// Swipes issued, when the first left the screen unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

/// Step-scoped diagnostic payload, built locally by handlers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<(i32, i32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryNote>,
    /// Artifact file name of the screenshot attached to this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub provisional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swipe: Option<SwipeNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrolls: Option<u32>,
    /// Whole-step attempts used, when more than one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

/// Result of one executed (or skipped) step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// 1-based execution-order number, nested steps included
    pub index: usize,
    pub action: String,
    pub display: String,
    pub phase: Phase,
    /// Nesting depth inside conditionals/repeat
    pub depth: usize,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub diagnostics: StepDiagnostics,
}

impl StepResult {
    /// Build the result of a step that ran
    pub fn finished(
        index: usize,
        action: &str,
        display: String,
        phase: Phase,
        depth: usize,
        started_at: Instant,
        outcome: Result<(), StepError>,
        diagnostics: StepDiagnostics,
    ) -> Self {
        let (status, error) = match outcome {
            Ok(()) => (StepStatus::Passed, None),
            Err(e) => (StepStatus::Failed, Some(e)),
        };
        Self {
            index,
            action: action.to_string(),
            display,
            phase,
            depth,
            status,
            duration_ms: started_at.elapsed().as_millis() as u64,
            error,
            skip_reason: None,
            diagnostics,
        }
    }

    /// Build the result of a step that was never attempted
    pub fn skipped(
        index: usize,
        action: &str,
        display: String,
        phase: Phase,
        reason: &str,
    ) -> Self {
        Self {
            index,
            action: action.to_string(),
            display,
            phase,
            depth: 0,
            status: StepStatus::Skipped,
            duration_ms: 0,
            error: None,
            skip_reason: Some(reason.to_string()),
            diagnostics: StepDiagnostics::default(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Overall test status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// In-memory file produced during a run (screenshots)
#[derive(Clone, PartialEq)]
pub struct Artifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Aggregate result of one test run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub total_duration_ms: u64,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: String,
    /// Screenshots kept for the caller to persist
    #[serde(skip)]
    pub artifacts: Vec<Artifact>,
}

impl TestResult {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TestStatus::Passed,
            total_duration_ms: 0,
            steps: Vec::new(),
            error: None,
            started_at: chrono::Local::now().to_rfc3339(),
            artifacts: Vec::new(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    /// Mark the test failed, keeping the first recorded error
    pub fn fail(&mut self, error: StepError) {
        self.status = TestStatus::Failed;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Apply a deferred verification outcome to the step with `index`.
    ///
    /// Returns true when the step flipped from provisional pass to failed.
    pub fn reconcile(
        &mut self,
        index: usize,
        note: VerificationNote,
        error: Option<StepError>,
    ) -> bool {
        let Some(step) = self.steps.iter_mut().find(|s| s.index == index) else {
            log::warn!("No step result with index {} to reconcile", index);
            return false;
        };

        step.diagnostics.provisional = false;
        step.diagnostics.verification = Some(note);

        match error {
            Some(err) if step.status == StepStatus::Passed => {
                step.status = StepStatus::Failed;
                step.error = Some(err.clone());
                self.fail(StepError::new(
                    ErrorKind::VerificationFailed,
                    format!("Deferred verification failed at step {}: {}", index, err.message),
                ));
                true
            }
            _ => false,
        }
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
