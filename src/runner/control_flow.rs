use super::executor::{StepScope, TestExecutor};
use super::state::{ErrorKind, Phase, StepError, StepResult, VerificationNote};
use super::verification::{judge_with_retry, VerificationPolicy};
use crate::parser::types::{Step, Target};

impl TestExecutor {
    /// Presence probe for conditionals: short Layer-1 poll, never Layer 2
    async fn is_present(&mut self, target: &Target) -> Result<bool, StepError> {
        match self.poll_for(target, self.config.timeouts.condition).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::TargetNotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `if_present` (`expect_present = true`) and `if_absent`
    pub(super) async fn run_presence(
        &mut self,
        target: &Target,
        expect_present: bool,
        then_steps: &[Step],
        else_steps: &[Step],
        phase: Phase,
        scope: &mut StepScope,
        nested: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        let present = self.is_present(target).await?;
        let taken = present == expect_present;
        log::debug!(
            "{} is {}: running {} branch",
            target.describe(),
            if present { "present" } else { "absent" },
            if taken { "then" } else { "else" }
        );

        let branch = if taken { then_steps } else { else_steps };
        self.run_branch(branch, phase, scope, nested).await
    }

    pub(super) async fn run_if_screen(
        &mut self,
        description: &str,
        then_steps: &[Step],
        else_steps: &[Step],
        phase: Phase,
        scope: &mut StepScope,
        nested: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        let matched = if !self.judge.is_available() {
            log::warn!(
                "No vision judge configured; if_screen \"{}\" evaluates to false",
                description
            );
            false
        } else {
            let image = self
                .capture
                .screenshot()
                .await
                .map_err(|e| StepError::device("screenshot", e))?;
            let policy = VerificationPolicy::from(&self.config.verification);
            let (outcome, attempts) =
                judge_with_retry(self.judge.as_ref(), &image, description, &policy).await;
            match outcome {
                Ok(judgment) => {
                    scope.diagnostics.verification = Some(VerificationNote {
                        passed: judgment.pass,
                        reason: judgment.reason,
                        attempts,
                    });
                    judgment.pass
                }
                Err(e) => {
                    return Err(StepError::new(
                        ErrorKind::VerificationFailed,
                        format!(
                            "could not judge screen \"{}\" after {} attempt(s): {}",
                            description, attempts, e
                        ),
                    ))
                }
            }
        };

        let branch = if matched { then_steps } else { else_steps };
        self.run_branch(branch, phase, scope, nested).await
    }

    pub(super) async fn run_repeat(
        &mut self,
        count: u32,
        steps: &[Step],
        phase: Phase,
        scope: &mut StepScope,
        nested: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        for iteration in 1..=count {
            for step in steps {
                if let Err(e) = self.run_step(step, phase, scope.depth + 1, nested).await {
                    return Err(StepError::new(
                        e.kind,
                        format!("Iteration {}/{} failed: {}", iteration, count, e.message),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Run a branch one level deeper; the first failing child fails the parent
    async fn run_branch(
        &mut self,
        steps: &[Step],
        phase: Phase,
        scope: &mut StepScope,
        nested: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        for step in steps {
            if let Err(e) = self.run_step(step, phase, scope.depth + 1, nested).await {
                return Err(StepError::new(
                    e.kind,
                    format!("{} failed: {}", step.action_name(), e.message),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::types::StepOptions;
    use crate::runner::testing::{executor, fast_config, FakeDevice, ScriptedJudge};
    use crate::vision::VisionError;
    use std::sync::Arc;

    fn tap(text: &str) -> Step {
        Step::Tap {
            target: Target::text(text),
            options: StepOptions {
                ai_recovery: Some(false),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_if_present_runs_then_branch_nested() {
        let device = Arc::new(
            FakeDevice::new()
                .with_element("Accept cookies", (10, 10))
                .with_element("OK", (20, 20)),
        );
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let mut scope = StepScope::new(exec.allocate_index(), 0);
        let mut nested = Vec::new();
        exec.run_presence(
            &Target::text("Accept cookies"),
            true,
            &[tap("OK")],
            &[],
            Phase::Body,
            &mut scope,
            &mut nested,
        )
        .await
        .unwrap();

        assert_eq!(device.taps(), vec![(20, 20)]);
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].index, 2);
        assert_eq!(nested[0].depth, 1);
    }

    #[tokio::test]
    async fn test_if_absent_without_else_is_noop() {
        let device = Arc::new(FakeDevice::new().with_element("Banner", (1, 1)));
        let judge = Arc::new(ScriptedJudge::new());
        let mut exec = executor(&device, &judge, fast_config());

        let mut scope = StepScope::new(1, 0);
        let mut nested = Vec::new();
        exec.run_presence(
            &Target::text("Banner"),
            false,
            &[tap("Banner")],
            &[],
            Phase::Body,
            &mut scope,
            &mut nested,
        )
        .await
        .unwrap();
        assert!(nested.is_empty());
        assert!(device.taps().is_empty());
        assert_eq!(ScriptedJudge::count(&judge.recover_calls), 0);
    }

    #[tokio::test]
    async fn test_if_screen_unavailable_judge_takes_else() {
        let device = Arc::new(FakeDevice::new().with_element("Skip", (3, 3)));
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let mut nested = Vec::new();
        exec.run_if_screen(
            "onboarding carousel",
            &[],
            &[tap("Skip")],
            Phase::Body,
            &mut StepScope::new(1, 0),
            &mut nested,
        )
        .await
        .unwrap();
        assert_eq!(device.taps(), vec![(3, 3)]);
    }

    #[tokio::test]
    async fn test_if_screen_judge_error_fails_step() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(
            ScriptedJudge::new()
                .with_judgment(Err(VisionError::Unavailable))
                .with_judgment(Ok(crate::vision::Judgment::pass("home"))),
        );
        let mut exec = executor(&device, &judge, fast_config());

        let err = exec
            .run_if_screen(
                "home screen",
                &[],
                &[],
                Phase::Body,
                &mut StepScope::new(1, 0),
                &mut Vec::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VerificationFailed);
        // Unavailable is not transient, so no retry
        assert_eq!(ScriptedJudge::count(&judge.judge_calls), 1);
    }

    #[tokio::test]
    async fn test_repeat_stops_at_failing_iteration() {
        let device = Arc::new(FakeDevice::new().with_element("Next", (5, 5)));
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let steps = vec![tap("Next"), tap("Missing")];
        let mut nested = Vec::new();
        let err = exec
            .run_repeat(3, &steps, Phase::Body, &mut StepScope::new(1, 0), &mut nested)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::TargetNotFound);
        assert!(err.message.starts_with("Iteration 1/3 failed"));
        assert_eq!(nested.len(), 2);
        assert!(nested[1].is_failed());
    }
}
