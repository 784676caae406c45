//! Deferred screen verification.
//!
//! `verify_screen` only captures a screenshot during the run; the judge is
//! consulted after the last step, with bounded concurrency, and the outcome is
//! reconciled into the already-recorded step results.

use super::events::TestEvent;
use super::executor::{StepScope, TestExecutor};
use super::state::{Artifact, ErrorKind, StepError, TestResult, VerificationNote};
use crate::utils::config::VerificationConfig;
use crate::vision::{Judgment, VisionError, VisionJudge};
use futures::stream::{self, StreamExt};
use std::time::Duration;

/// A screenshot waiting for its judgment
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub step_index: usize,
    pub description: String,
    pub screenshot: Vec<u8>,
    /// Milliseconds since the test started
    pub captured_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct VerificationPolicy {
    pub max_concurrency: usize,
    /// Extra attempts for transient judge errors
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl From<&VerificationConfig> for VerificationPolicy {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
        }
    }
}

#[derive(Debug)]
pub struct VerificationOutcome {
    pub step_index: usize,
    pub result: Result<Judgment, VisionError>,
    pub attempts: u32,
}

impl VerificationOutcome {
    /// Fold this outcome into `result`. Returns true when the step passed.
    pub fn apply(&self, result: &mut TestResult) -> bool {
        let (note, error) = match &self.result {
            Ok(judgment) => (
                VerificationNote {
                    passed: judgment.pass,
                    reason: judgment.reason.clone(),
                    attempts: self.attempts,
                },
                (!judgment.pass)
                    .then(|| StepError::new(ErrorKind::VerificationFailed, judgment.reason.clone())),
            ),
            Err(e) => (
                VerificationNote {
                    passed: false,
                    reason: e.to_string(),
                    attempts: self.attempts,
                },
                Some(StepError::new(
                    ErrorKind::VerificationFailed,
                    format!("judge failed after {} attempt(s): {}", self.attempts, e),
                )),
            ),
        };
        let passed = note.passed;
        result.reconcile(self.step_index, note, error);
        passed
    }
}

/// Ask the judge, retrying transient errors with exponential backoff.
///
/// Returns the final outcome and the number of attempts made.
pub async fn judge_with_retry(
    judge: &dyn VisionJudge,
    image: &[u8],
    description: &str,
    policy: &VerificationPolicy,
) -> (Result<Judgment, VisionError>, u32) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match judge.judge(image, description).await {
            Err(e) if e.is_transient() && attempt <= policy.max_retries => {
                let backoff = policy.backoff_base * 2u32.saturating_pow(attempt - 1);
                log::debug!(
                    "Judge attempt {} for \"{}\" failed ({}); retrying in {:?}",
                    attempt,
                    description,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            other => return (other, attempt),
        }
    }
}

/// Judge every pending verification, at most `max_concurrency` at a time.
///
/// Outcomes come back in the order of `pending`, whatever order the judge
/// answers in.
pub async fn run_deferred(
    judge: &dyn VisionJudge,
    pending: &[PendingVerification],
    policy: &VerificationPolicy,
) -> Vec<VerificationOutcome> {
    if pending.is_empty() {
        return Vec::new();
    }
    let workers = policy.max_concurrency.clamp(1, pending.len());

    let mut slots: Vec<Option<VerificationOutcome>> = pending.iter().map(|_| None).collect();
    let mut answers = stream::iter(pending.iter().enumerate())
        .map(|(slot, item)| async move {
            let (result, attempts) =
                judge_with_retry(judge, &item.screenshot, &item.description, policy).await;
            (
                slot,
                VerificationOutcome {
                    step_index: item.step_index,
                    result,
                    attempts,
                },
            )
        })
        .buffer_unordered(workers);

    while let Some((slot, outcome)) = answers.next().await {
        slots[slot] = Some(outcome);
    }
    slots.into_iter().flatten().collect()
}

impl TestExecutor {
    /// Capture the screen now; judgment happens after the test body
    pub(super) async fn queue_verification(
        &mut self,
        description: &str,
        scope: &mut StepScope,
    ) -> Result<(), StepError> {
        let screenshot = self
            .capture
            .screenshot()
            .await
            .map_err(|e| StepError::device("screenshot", e))?;

        let name = format!("step-{:03}-verify.png", scope.index);
        self.artifacts.push(Artifact {
            name: name.clone(),
            bytes: screenshot.clone(),
        });
        scope.diagnostics.screenshot = Some(name);
        scope.diagnostics.provisional = true;

        self.pending.push(PendingVerification {
            step_index: scope.index,
            description: description.to_string(),
            screenshot,
            captured_at_ms: self.context.started_at.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    /// Judge the queued screenshots and reconcile them into `result`
    pub(super) async fn finish_verifications(&mut self, result: &mut TestResult) {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return;
        }
        if !self.judge.is_available() {
            log::warn!(
                "No vision judge configured; {} screen verification(s) pass unchecked",
                pending.len()
            );
        }

        self.events.emit(TestEvent::VerificationStarted {
            count: pending.len(),
        });
        let policy = VerificationPolicy::from(&self.config.verification);
        let outcomes = run_deferred(self.judge.as_ref(), &pending, &policy).await;

        let mut passed = 0;
        for outcome in &outcomes {
            if outcome.apply(result) {
                passed += 1;
            }
        }
        self.events.emit(TestEvent::VerificationFinished {
            passed,
            failed: outcomes.len() - passed,
        });
    }
}
