use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::context::TestContext;
use super::events::{EventEmitter, TestEvent};
use super::resolver::ResolvedTarget;
use super::state::{
    Artifact, ErrorKind, Phase, StepDiagnostics, StepError, StepResult, StepStatus, TestResult,
};
use super::verification::PendingVerification;
use crate::driver::traits::{DeviceDriver, ScreenCapture};
use crate::parser::types::{Step, TestSpec};
use crate::utils::config::Config;
use crate::vision::VisionJudge;

/// Scratch state of one step execution, folded into its `StepResult`
#[derive(Debug)]
pub(super) struct StepScope {
    pub index: usize,
    pub depth: usize,
    pub diagnostics: StepDiagnostics,
    /// Layer 2 ran for this step (shared by all of its attempts)
    pub recovery_used: bool,
}

impl StepScope {
    pub fn new(index: usize, depth: usize) -> Self {
        Self {
            index,
            depth,
            diagnostics: StepDiagnostics::default(),
            recovery_used: false,
        }
    }

    pub fn record_target(&mut self, target: &ResolvedTarget) {
        self.diagnostics.provenance = Some(target.provenance);
        self.diagnostics.coordinates = Some((target.x, target.y));
    }
}

/// Runs one test script against a device. One instance per device; `run`
/// resets all per-test state.
pub struct TestExecutor {
    pub(super) device: Arc<dyn DeviceDriver>,
    pub(super) capture: Arc<dyn ScreenCapture>,
    pub(super) judge: Arc<dyn VisionJudge>,
    /// Config as loaded, before per-test overrides
    base_config: Config,
    pub(super) config: Config,
    pub(super) context: TestContext,
    pub(super) events: EventEmitter,
    pub(super) pending: Vec<PendingVerification>,
    pub(super) artifacts: Vec<Artifact>,
    next_index: usize,
    continue_on_failure: bool,
    abort: Option<Arc<AtomicBool>>,
}

impl TestExecutor {
    pub fn new(
        device: Arc<dyn DeviceDriver>,
        capture: Arc<dyn ScreenCapture>,
        judge: Arc<dyn VisionJudge>,
        config: Config,
    ) -> Self {
        Self {
            device,
            capture,
            judge,
            base_config: config.clone(),
            config,
            context: TestContext::default(),
            events: EventEmitter::default(),
            pending: Vec::new(),
            artifacts: Vec::new(),
            next_index: 0,
            continue_on_failure: false,
            abort: None,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Keep running body steps after a failure
    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    /// Flag checked between steps; once set, remaining steps are skipped
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Next 1-based step index in execution order
    pub(super) fn allocate_index(&mut self) -> usize {
        self.next_index += 1;
        self.next_index
    }

    /// Execute a test script. Never fails: every failure ends up in the result.
    pub async fn run(&mut self, spec: &TestSpec) -> TestResult {
        self.config = self.base_config.with_test_overrides(&spec.config);
        self.context = TestContext::for_test(&spec.config, self.config.app.as_deref());
        self.pending.clear();
        self.artifacts.clear();
        self.next_index = 0;

        let started = Instant::now();
        let deadline = self.config.timeouts.test.map(|t| started + t);
        let mut result = TestResult::new(&spec.name);

        self.events.emit(TestEvent::TestStarted {
            name: spec.name.clone(),
            step_count: spec.top_level_count(),
        });

        // Skip reason once setup/body execution has been cut short
        let mut halted: Option<&'static str> = None;

        for (phase, steps) in [(Phase::Setup, &spec.setup), (Phase::Body, &spec.steps)] {
            self.start_phase(phase, steps.len());

            for step in steps {
                if halted.is_none() {
                    if let Some(err) = self.interruption(deadline) {
                        log::warn!("{}", err.message);
                        result.fail(err);
                        halted = Some("interrupted");
                    }
                }
                if let Some(reason) = halted {
                    self.skip_step(step, phase, reason, &mut result);
                    continue;
                }

                if let Err(e) = self.run_step(step, phase, 0, &mut result.steps).await {
                    match phase {
                        Phase::Setup => {
                            result.fail(StepError::new(
                                e.kind,
                                format!("Setup failed: {}", e.message),
                            ));
                            halted = Some("setup failed");
                        }
                        _ => {
                            result.fail(e);
                            if !self.continue_on_failure {
                                halted = Some("previous step failed");
                            }
                        }
                    }
                }
            }
        }

        // Cleanup runs whatever happened before it
        self.start_phase(Phase::Teardown, spec.teardown.len());
        for step in &spec.teardown {
            if let Err(e) = self.run_step(step, Phase::Teardown, 0, &mut result.steps).await {
                log::warn!("Teardown step {} failed: {}", step.action_name(), e);
            }
        }

        self.finish_verifications(&mut result).await;

        result.total_duration_ms = started.elapsed().as_millis() as u64;
        result.artifacts = std::mem::take(&mut self.artifacts);

        self.events.emit(TestEvent::TestFinished {
            name: result.name.clone(),
            status: result.status,
            duration_ms: result.total_duration_ms,
            passed: result.count(StepStatus::Passed),
            failed: result.count(StepStatus::Failed),
            skipped: result.count(StepStatus::Skipped),
        });
        result
    }

    fn start_phase(&self, phase: Phase, step_count: usize) {
        if step_count > 0 {
            log::info!("Phase {} ({} steps)", phase.as_str(), step_count);
        }
        self.events.emit(TestEvent::PhaseStarted { phase, step_count });
    }

    fn interruption(&self, deadline: Option<Instant>) -> Option<StepError> {
        if self
            .abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Some(StepError::new(ErrorKind::Timeout, "test run interrupted"));
        }
        match (deadline, self.config.timeouts.test) {
            (Some(deadline), Some(limit)) if Instant::now() >= deadline => Some(StepError::new(
                ErrorKind::Timeout,
                format!("test exceeded its {}ms timeout", limit.as_millis()),
            )),
            _ => None,
        }
    }

    fn skip_step(&mut self, step: &Step, phase: Phase, reason: &str, result: &mut TestResult) {
        let index = self.allocate_index();
        let display = step.display_name();
        self.events.emit(TestEvent::StepSkipped {
            index,
            display: display.clone(),
            reason: reason.to_string(),
            depth: 0,
        });
        result.steps.push(StepResult::skipped(
            index,
            step.action_name(),
            display,
            phase,
            reason,
        ));
    }

    /// Run one step (and its nested steps), appending results to `sink`
    /// parent first.
    pub(super) async fn run_step(
        &mut self,
        step: &Step,
        phase: Phase,
        depth: usize,
        sink: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        let index = self.allocate_index();
        let display = step.display_name();
        let started = Instant::now();
        self.events.emit(TestEvent::StepStarted {
            index,
            display: display.clone(),
            depth,
        });

        let mut scope = StepScope::new(index, depth);
        let mut nested = Vec::new();

        let max_attempts = if step.is_retryable() {
            1 + step
                .options()
                .and_then(|o| o.retry)
                .unwrap_or(self.config.retry.count)
        } else {
            1
        };

        let mut attempt = 1;
        let outcome = loop {
            match Box::pin(self.dispatch(step, phase, &mut scope, &mut nested)).await {
                Err(e) if attempt < max_attempts && e.is_recoverable() => {
                    log::debug!("Step {} attempt {} failed: {}", index, attempt, e);
                    attempt += 1;
                    self.events.emit(TestEvent::StepRetrying {
                        index,
                        attempt,
                        max_attempts,
                        depth,
                    });
                    tokio::time::sleep(self.config.retry.delay).await;
                }
                other => break other,
            }
        };
        if attempt > 1 {
            scope.diagnostics.attempts = Some(attempt);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(()) => self.events.emit(TestEvent::StepPassed {
                index,
                duration_ms,
                depth,
            }),
            Err(e) => {
                if self.config.snapshot_on_failure {
                    self.capture_failure(&mut scope).await;
                }
                self.events.emit(TestEvent::StepFailed {
                    index,
                    error: e.to_string(),
                    duration_ms,
                    depth,
                });
            }
        }

        sink.push(StepResult::finished(
            index,
            step.action_name(),
            display,
            phase,
            depth,
            started,
            outcome.clone(),
            scope.diagnostics,
        ));
        sink.append(&mut nested);
        outcome
    }

    async fn capture_failure(&mut self, scope: &mut StepScope) {
        match self.capture.screenshot().await {
            Ok(bytes) => {
                let name = format!("step-{:03}-failure.png", scope.index);
                self.artifacts.push(Artifact {
                    name: name.clone(),
                    bytes,
                });
                scope.diagnostics.screenshot = Some(name);
            }
            Err(e) => log::warn!("Failure screenshot for step {} failed: {:#}", scope.index, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::types::{Direction, StepOptions, Target};
    use crate::runner::resolver::Provenance;
    use crate::runner::state::TestStatus;
    use crate::runner::testing::{executor, fast_config, DeviceCall, FakeDevice, ScriptedJudge};
    use crate::vision::{RecoveryAction, RecoveryAdvice};
    use std::time::Duration;

    fn tap(text: &str) -> Step {
        Step::Tap {
            target: Target::text(text),
            options: StepOptions::default(),
        }
    }

    fn verify(description: &str) -> Step {
        Step::VerifyScreen {
            description: description.to_string(),
        }
    }

    fn spec(setup: Vec<Step>, steps: Vec<Step>, teardown: Vec<Step>) -> TestSpec {
        TestSpec {
            name: "login".into(),
            setup,
            steps,
            teardown,
            ..Default::default()
        }
    }

    fn indices(result: &TestResult) -> Vec<usize> {
        result.steps.iter().map(|s| s.index).collect()
    }

    #[tokio::test]
    async fn test_indices_contiguous_with_nesting_and_skips() {
        let device = Arc::new(
            FakeDevice::new()
                .with_element("Banner", (1, 1))
                .with_element("Close", (2, 2)),
        );
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let test = spec(
            vec![Step::Back {
                options: StepOptions::default(),
            }],
            vec![
                Step::IfPresent {
                    target: Target::text("Banner"),
                    then_steps: vec![tap("Close")],
                    else_steps: vec![],
                },
                tap("Missing"),
                tap("Close"),
            ],
            vec![Step::Back {
                options: StepOptions::default(),
            }],
        );
        let result = exec.run(&test).await;

        assert_eq!(indices(&result), vec![1, 2, 3, 4, 5, 6]);
        let statuses: Vec<_> = result.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Passed,
                StepStatus::Passed,
                StepStatus::Passed,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Passed,
            ]
        );
        assert_eq!(result.steps[2].depth, 1);
        assert_eq!(result.steps[5].phase, Phase::Teardown);
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(
            result.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::TargetNotFound)
        );
    }

    #[tokio::test]
    async fn test_setup_failure_skips_body_but_runs_teardown() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let test = spec(
            vec![Step::LaunchApp {
                app: None,
                options: StepOptions::default(),
            }],
            vec![tap("Login"), tap("Submit")],
            vec![Step::TerminateApp {
                app: Some("com.example".into()),
                options: StepOptions::default(),
            }],
        );
        let result = exec.run(&test).await;

        assert_eq!(result.steps.len(), 4);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.steps[1].skip_reason.as_deref(), Some("setup failed"));
        assert_eq!(result.steps[3].status, StepStatus::Passed);
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
        assert!(err.message.starts_with("Setup failed"));
        assert_eq!(device.calls(), vec![DeviceCall::Terminate("com.example".into())]);
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_remaining_body() {
        let device = Arc::new(FakeDevice::new().with_element("Next", (9, 9)));
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config()).continue_on_failure(true);

        let result = exec
            .run(&spec(vec![], vec![tap("Missing"), tap("Next")], vec![]))
            .await;
        assert_eq!(result.steps[1].status, StepStatus::Passed);
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(device.taps(), vec![(9, 9)]);
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_going_and_status() {
        let device = Arc::new(FakeDevice::new().with_element("Logout", (4, 4)));
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec
            .run(&spec(vec![], vec![], vec![tap("Missing"), tap("Logout")]))
            .await;
        assert!(result.is_passed());
        assert!(result.steps[0].is_failed());
        assert_eq!(result.steps[1].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_verify_screen_flips_test_after_body() {
        let device = Arc::new(FakeDevice::new().with_element("Login", (1, 1)));
        let judge = Arc::new(ScriptedJudge::new().with_verdict("dashboard is visible", false));
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec
            .run(&spec(
                vec![],
                vec![tap("Login"), verify("dashboard is visible")],
                vec![],
            ))
            .await;

        assert_eq!(result.status, TestStatus::Failed);
        let step = &result.steps[1];
        assert_eq!(step.status, StepStatus::Failed);
        assert!(!step.diagnostics.provisional);
        assert_eq!(step.diagnostics.screenshot.as_deref(), Some("step-002-verify.png"));
        assert_eq!(step.error.as_ref().map(|e| e.kind), Some(ErrorKind::VerificationFailed));
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(ScriptedJudge::count(&judge.judge_calls), 1);
    }

    #[tokio::test]
    async fn test_verifications_judged_after_teardown() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new());
        let (events, mut rx) = EventEmitter::new();
        let mut exec = executor(&device, &judge, fast_config()).with_events(events);

        let result = exec
            .run(&spec(
                vec![],
                vec![verify("a"), verify("b")],
                vec![Step::Back {
                    options: StepOptions::default(),
                }],
            ))
            .await;
        assert!(result.is_passed());
        assert!(result
            .steps
            .iter()
            .filter_map(|s| s.diagnostics.verification.as_ref())
            .all(|v| v.passed));

        let mut saw_teardown_step = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TestEvent::StepPassed { index: 3, .. } => saw_teardown_step = true,
                TestEvent::VerificationStarted { count } => {
                    assert!(saw_teardown_step);
                    assert_eq!(count, 2);
                }
                _ => {}
            }
        }
        assert!(saw_teardown_step);
    }

    #[tokio::test]
    async fn test_if_present_no_match_no_else() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new());
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec
            .run(&spec(
                vec![],
                vec![Step::IfPresent {
                    target: Target::text("Promo"),
                    then_steps: vec![tap("Dismiss")],
                    else_steps: vec![],
                }],
                vec![],
            ))
            .await;

        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].status, StepStatus::Passed);
        assert!(device.taps().is_empty());
    }

    #[tokio::test]
    async fn test_scroll_to_exhausts_three_scrolls() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec
            .run(&spec(
                vec![],
                vec![Step::ScrollTo {
                    target: Target::text("Terms"),
                    direction: Direction::Down,
                    max_scrolls: Some(3),
                    options: StepOptions::default(),
                }],
                vec![],
            ))
            .await;

        let step = &result.steps[0];
        assert_eq!(
            step.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::ElementNotFoundAfterScroll)
        );
        assert_eq!(device.swipes(), 3);
        assert_eq!(step.diagnostics.scrolls, Some(3));
    }

    #[tokio::test]
    async fn test_scroll_to_finds_after_two_scrolls() {
        let device = Arc::new(FakeDevice::new().with_element_after_swipes("Terms", (500, 1500), 2));
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec
            .run(&spec(
                vec![],
                vec![Step::ScrollTo {
                    target: Target::text("Terms"),
                    direction: Direction::Down,
                    max_scrolls: None,
                    options: StepOptions::default(),
                }],
                vec![],
            ))
            .await;

        assert!(result.is_passed());
        assert_eq!(result.steps[0].diagnostics.scrolls, Some(2));
        assert_eq!(result.steps[0].diagnostics.coordinates, Some((500, 1500)));
    }

    #[tokio::test]
    async fn test_alternative_target_taps_once() {
        let device = Arc::new(FakeDevice::new().with_element("Sign In", (320, 880)));
        let judge = Arc::new(ScriptedJudge::new().with_recovery(RecoveryAdvice {
            action: RecoveryAction::AlternativeTarget("Sign In".into()),
            reason: "button was renamed".into(),
        }));
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec.run(&spec(vec![], vec![tap("Login")], vec![])).await;

        assert!(result.is_passed());
        assert_eq!(result.steps.len(), 1);
        let diagnostics = &result.steps[0].diagnostics;
        let recovery = diagnostics.recovery.as_ref().unwrap();
        assert_eq!(recovery.action, "alternative");
        assert_eq!(recovery.alternative.as_deref(), Some("Sign In"));
        assert_eq!(diagnostics.provenance, Some(Provenance::FromElementLookup));
        assert_eq!(device.taps(), vec![(320, 880)]);
    }

    #[tokio::test]
    async fn test_repeat_fails_in_second_iteration() {
        let device = Arc::new(
            FakeDevice::new()
                .with_element("Next", (10, 20))
                .with_tap_failure_at(2),
        );
        let judge = Arc::new(ScriptedJudge::new());
        let mut exec = executor(&device, &judge, fast_config());

        let result = exec
            .run(&spec(
                vec![],
                vec![Step::Repeat {
                    count: 3,
                    steps: vec![tap("Next")],
                }],
                vec![],
            ))
            .await;

        assert_eq!(indices(&result), vec![1, 2, 3]);
        let repeat = &result.steps[0];
        assert!(repeat.is_failed());
        assert!(repeat
            .error
            .as_ref()
            .is_some_and(|e| e.message.starts_with("Iteration 2/3 failed")));
        assert_eq!(result.steps[1].status, StepStatus::Passed);
        assert!(result.steps[2].is_failed());
        assert_eq!(result.steps[2].depth, 1);
        assert_eq!(device.taps(), vec![(10, 20)]);
    }

    #[tokio::test]
    async fn test_step_retry_after_device_failure() {
        let device = Arc::new(
            FakeDevice::new()
                .with_element("Pay", (7, 7))
                .with_failing_taps(1),
        );
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let step = Step::Tap {
            target: Target::text("Pay"),
            options: StepOptions {
                retry: Some(1),
                ..Default::default()
            },
        };
        let result = exec.run(&spec(vec![], vec![step], vec![])).await;

        assert!(result.is_passed());
        assert_eq!(result.steps[0].diagnostics.attempts, Some(2));
        assert_eq!(device.taps(), vec![(7, 7)]);
    }

    #[tokio::test]
    async fn test_failure_snapshot_artifact() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut config = fast_config();
        config.snapshot_on_failure = true;
        let mut exec = executor(&device, &judge, config);

        let result = exec.run(&spec(vec![], vec![tap("Ghost")], vec![])).await;
        assert_eq!(
            result.steps[0].diagnostics.screenshot.as_deref(),
            Some("step-001-failure.png")
        );
        assert_eq!(result.artifacts[0].name, "step-001-failure.png");
    }

    #[tokio::test]
    async fn test_abort_flag_skips_remaining_steps() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new());
        let flag = Arc::new(AtomicBool::new(true));
        let mut exec = executor(&device, &judge, fast_config()).with_abort_flag(flag);

        let result = exec
            .run(&spec(
                vec![],
                vec![tap("A"), tap("B")],
                vec![Step::Back {
                    options: StepOptions::default(),
                }],
            ))
            .await;

        assert_eq!(result.count(StepStatus::Skipped), 2);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
        // Teardown still ran
        assert_eq!(device.calls(), vec![DeviceCall::Key("back".into())]);
    }

    #[tokio::test]
    async fn test_test_timeout_checked_between_steps() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut config = fast_config();
        config.timeouts.test = Some(Duration::from_millis(20));
        let mut exec = executor(&device, &judge, config);

        let result = exec
            .run(&spec(
                vec![],
                vec![
                    Step::Wait {
                        duration: Duration::from_millis(40),
                    },
                    tap("Never"),
                ],
                vec![],
            ))
            .await;

        assert_eq!(result.steps[0].status, StepStatus::Passed);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.steps[1].skip_reason.as_deref(), Some("interrupted"));
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_run_resets_state_between_tests() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new());
        let mut exec = executor(&device, &judge, fast_config());

        let first = exec.run(&spec(vec![], vec![verify("a")], vec![])).await;
        let second = exec.run(&spec(vec![], vec![verify("b")], vec![])).await;
        assert_eq!(indices(&first), vec![1]);
        assert_eq!(indices(&second), vec![1]);
        assert_eq!(second.artifacts.len(), 1);
    }
}
