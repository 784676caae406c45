use super::events::TestEvent;
use super::executor::{StepScope, TestExecutor};
use super::resolver::{Provenance, Resolution, ResolvedTarget};
use super::state::{ErrorKind, RecoveryNote, StepError};
use crate::parser::types::{Direction, Target};
use crate::vision::{FailureContext, RecoveryAction, RecoveryAdvice};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// How Layer 1 looks for a target
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum SearchMode {
    /// Poll the current screen until the timeout
    Poll { timeout: Duration },
    /// Alternate lookups with scroll gestures
    Scroll {
        direction: Direction,
        max_scrolls: u32,
    },
}

pub(super) fn frame_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

impl TestExecutor {
    /// Layer 1: poll until the target resolves on a stable screen.
    ///
    /// Timing out yields `TargetNotFound`, which is what triggers Layer 2.
    pub(super) async fn poll_for(
        &mut self,
        target: &Target,
        timeout: Duration,
    ) -> Result<ResolvedTarget, StepError> {
        // Literal coordinates need no screen at all
        if target.text.is_none() {
            return match self.resolve_once(target, None).await? {
                Resolution::Found(r) => Ok(r),
                Resolution::NotFound => Err(StepError::target_not_found(target.describe())),
                Resolution::Rejected(reason) => Err(StepError::target_not_found(reason)),
            };
        }

        let deadline = Instant::now() + timeout;
        let poll_interval = self.config.resilience.poll_interval;
        let required = self.config.resilience.stability_frames.max(1);

        let mut last_hash = None;
        let mut identical_frames = 0u32;
        let mut attempts = 0u32;

        loop {
            let frame = match self.capture.screenshot().await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::debug!("Screenshot failed during polling: {:#}", e);
                    None
                }
            };

            // Without screenshots stability cannot be judged, so search anyway
            let stable = match &frame {
                Some(bytes) => {
                    let hash = frame_hash(bytes);
                    if last_hash == Some(hash) {
                        identical_frames += 1;
                    } else {
                        identical_frames = 1;
                        last_hash = Some(hash);
                    }
                    identical_frames >= required
                }
                None => true,
            };

            let last_chance = Instant::now() >= deadline;
            if stable || last_chance {
                attempts += 1;
                match self.resolve_once(target, frame.as_deref()).await? {
                    Resolution::Found(r) => {
                        log::debug!(
                            "{} resolved at ({}, {}) via {:?} after {} attempt(s)",
                            target.describe(),
                            r.x,
                            r.y,
                            r.provenance,
                            attempts
                        );
                        return Ok(r);
                    }
                    Resolution::Rejected(reason) => {
                        return Err(StepError::target_not_found(reason));
                    }
                    Resolution::NotFound => {}
                }
            }

            if last_chance {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }

        Err(StepError::target_not_found(format!(
            "{} not found after {}ms ({} attempts)",
            target.describe(),
            timeout.as_millis(),
            attempts
        )))
    }

    /// Layer 1 for scroll_to: look, then scroll, up to `max_scrolls` gestures
    async fn scroll_for(
        &mut self,
        target: &Target,
        direction: Direction,
        max_scrolls: u32,
        scope: &mut StepScope,
    ) -> Result<ResolvedTarget, StepError> {
        let mut scrolls = 0u32;

        loop {
            let frame = self.capture.screenshot().await.ok();
            match self.resolve_once(target, frame.as_deref()).await? {
                Resolution::Found(r) => {
                    scope.diagnostics.scrolls = Some(scrolls);
                    return Ok(r);
                }
                Resolution::Rejected(reason) => {
                    scope.diagnostics.scrolls = Some(scrolls);
                    return Err(StepError::target_not_found(reason));
                }
                Resolution::NotFound => {}
            }

            if scrolls >= max_scrolls {
                break;
            }
            self.scroll_once(direction).await?;
            scrolls += 1;
            tokio::time::sleep(self.config.resilience.poll_interval).await;
        }

        scope.diagnostics.scrolls = Some(scrolls);
        Err(StepError::new(
            ErrorKind::ElementNotFoundAfterScroll,
            format!(
                "{} not found after {} scroll(s) {}",
                target.describe(),
                scrolls,
                direction.as_str()
            ),
        ))
    }

    /// One content scroll: the finger moves against the content direction
    pub(super) async fn scroll_once(&mut self, direction: Direction) -> Result<(), StepError> {
        let (w, h) = self.screen_size().await?;
        let from = ((w / 2) as i32, (h / 2) as i32);
        let to = gesture_end(
            from,
            direction.opposite(),
            self.config.scroll.distance_percent,
            w,
            h,
        );
        let duration_ms = self.config.swipe.duration.as_millis() as u64;
        self.device
            .swipe(from.0, from.1, to.0, to.1, duration_ms)
            .await
            .map_err(|e| StepError::device("scroll", e))
    }

    /// Find `target` with Layer 1, escalating once to Layer 2 when allowed
    pub(super) async fn acquire(
        &mut self,
        action: &str,
        target: &Target,
        mode: SearchMode,
        allow_recovery: bool,
        scope: &mut StepScope,
    ) -> Result<ResolvedTarget, StepError> {
        let first = match mode {
            SearchMode::Poll { timeout } => self.poll_for(target, timeout).await,
            SearchMode::Scroll {
                direction,
                max_scrolls,
            } => self.scroll_for(target, direction, max_scrolls, scope).await,
        };

        let error = match first {
            Ok(resolved) => {
                scope.record_target(&resolved);
                return Ok(resolved);
            }
            Err(e) => e,
        };

        if !allow_recovery
            || !error.is_recoverable()
            || scope.recovery_used
            || !self.judge.is_available()
        {
            return Err(error);
        }
        scope.recovery_used = true;

        let advice = self.ask_recovery(action, target, &error, scope).await;
        let window = self.config.timeouts.recovery_retry;

        let second = match &advice.action {
            RecoveryAction::Fail => {
                return Err(StepError::new(
                    error.kind,
                    format!("{} (AI: {})", error.message, advice.reason),
                ));
            }
            RecoveryAction::Retry { wait_seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(*wait_seconds)).await;
                self.poll_for(target, window).await
            }
            RecoveryAction::AlternativeTarget(text) => {
                self.poll_for(&Target::text(text.clone()), window).await
            }
            RecoveryAction::AlternativeCoordinates {
                x_percent,
                y_percent,
            } => {
                let (w, h) = self.screen_size().await?;
                Ok(ResolvedTarget::new(
                    (x_percent.clamp(0.0, 100.0) * w as f64 / 100.0) as i32,
                    (y_percent.clamp(0.0, 100.0) * h as f64 / 100.0) as i32,
                    Provenance::FromVisionFallback,
                ))
            }
        };

        match second {
            Ok(resolved) => {
                scope.record_target(&resolved);
                Ok(resolved)
            }
            Err(e) => Err(StepError::new(
                ErrorKind::RecoveryExhausted,
                format!("{}; after AI {}: {}", error.message, advice.action.as_str(), e.message),
            )),
        }
    }

    /// Single Layer-2 consultation; any failure to get advice means `fail`
    async fn ask_recovery(
        &mut self,
        action: &str,
        target: &Target,
        error: &StepError,
        scope: &mut StepScope,
    ) -> RecoveryAdvice {
        let advice = match self.capture.screenshot().await {
            Err(e) => RecoveryAdvice::fail(format!("no screenshot for recovery: {:#}", e)),
            Ok(image) => {
                let (screen_width, screen_height) = self.context.screen_size().unwrap_or((0, 0));
                let failure = FailureContext {
                    action: action.to_string(),
                    target: target.describe(),
                    error: error.to_string(),
                    screen_width,
                    screen_height,
                };
                match self.judge.recover(&image, &failure).await {
                    Ok(advice) => advice,
                    Err(e) => RecoveryAdvice::fail(format!("recovery unavailable: {}", e)),
                }
            }
        };

        let alternative = match &advice.action {
            RecoveryAction::AlternativeTarget(text) => Some(text.clone()),
            RecoveryAction::AlternativeCoordinates {
                x_percent,
                y_percent,
            } => Some(format!("({}%, {}%)", x_percent, y_percent)),
            _ => None,
        };
        log::debug!(
            "Recovery for {} {}: {} ({})",
            action,
            target.describe(),
            advice.action.as_str(),
            advice.reason
        );

        self.events.emit(TestEvent::RecoveryAttempted {
            index: scope.index,
            action: advice.action.as_str().to_string(),
            reason: advice.reason.clone(),
            depth: scope.depth,
        });
        scope.diagnostics.recovery = Some(RecoveryNote {
            action: advice.action.as_str().to_string(),
            reason: advice.reason.clone(),
            alternative,
        });

        advice
    }
}

/// End point of a gesture moving `distance_pct` of the screen from `from`
pub(super) fn gesture_end(
    from: (i32, i32),
    finger: Direction,
    distance_pct: f64,
    width: u32,
    height: u32,
) -> (i32, i32) {
    let dx = (width as f64 * distance_pct / 100.0) as i32;
    let dy = (height as f64 * distance_pct / 100.0) as i32;
    let max_x = width.saturating_sub(1) as i32;
    let max_y = height.saturating_sub(1) as i32;
    let (x, y) = match finger {
        Direction::Up => (from.0, from.1 - dy),
        Direction::Down => (from.0, from.1 + dy),
        Direction::Left => (from.0 - dx, from.1),
        Direction::Right => (from.0 + dx, from.1),
    };
    (x.clamp(0, max_x), y.clamp(0, max_y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{executor, fast_config, DeviceCall, FakeDevice, ScriptedJudge};
    use std::sync::Arc;

    #[test]
    fn test_gesture_end_clamps() {
        assert_eq!(gesture_end((500, 1000), Direction::Up, 30.0, 1000, 2000), (500, 400));
        assert_eq!(gesture_end((500, 1000), Direction::Right, 80.0, 1000, 2000), (999, 1000));
        assert_eq!(gesture_end((500, 1000), Direction::Left, 80.0, 1000, 2000), (0, 1000));
    }

    #[tokio::test]
    async fn test_poll_finds_late_element() {
        let device = Arc::new(FakeDevice::new().with_element_after_lookups("Next", (5, 6), 3));
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let r = exec
            .poll_for(&Target::text("Next"), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!((r.x, r.y), (5, 6));
        assert_eq!(device.lookups("Next"), 4);
    }

    #[tokio::test]
    async fn test_poll_waits_for_stable_frames() {
        let device = Arc::new(
            FakeDevice::new()
                .with_element("Done", (1, 2))
                .with_frames(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]),
        );
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut config = fast_config();
        config.resilience.stability_frames = 2;
        let mut exec = executor(&device, &judge, config);

        exec.poll_for(&Target::text("Done"), Duration::from_millis(200))
            .await
            .unwrap();
        // a, b, c all differ; the static frame must repeat once before lookup
        assert_eq!(device.lookups("Done"), 1);
    }

    #[tokio::test]
    async fn test_poll_times_out_with_target_not_found() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());

        let err = exec
            .poll_for(&Target::text("Ghost"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
        assert!(device.lookups("Ghost") >= 2);
    }

    #[tokio::test]
    async fn test_layer_two_retry_then_found() {
        let device = Arc::new(FakeDevice::new().with_element_after_lookups("Feed", (7, 8), 1000));
        let judge = Arc::new(ScriptedJudge::new().with_recovery(RecoveryAdvice {
            action: RecoveryAction::Retry { wait_seconds: 0.01 },
            reason: "spinner".into(),
        }));
        let mut exec = executor(&device, &judge, fast_config());
        let mut scope = StepScope::new(1, 0);

        let err = exec
            .acquire(
                "tap",
                &Target::text("Feed"),
                SearchMode::Poll {
                    timeout: Duration::from_millis(10),
                },
                true,
                &mut scope,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RecoveryExhausted);
        assert_eq!(ScriptedJudge::count(&judge.recover_calls), 1);
        assert_eq!(scope.diagnostics.recovery.as_ref().unwrap().action, "retry");
    }

    #[tokio::test]
    async fn test_layer_two_fail_keeps_kind() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new().with_recovery(RecoveryAdvice::fail("wrong screen")));
        let mut exec = executor(&device, &judge, fast_config());
        let mut scope = StepScope::new(1, 0);

        let err = exec
            .acquire(
                "tap",
                &Target::text("Submit"),
                SearchMode::Poll {
                    timeout: Duration::from_millis(10),
                },
                true,
                &mut scope,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
        assert!(err.message.contains("AI: wrong screen"));
    }

    #[tokio::test]
    async fn test_layer_two_only_once_per_step() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new());
        let mut exec = executor(&device, &judge, fast_config());
        let mut scope = StepScope::new(1, 0);
        scope.recovery_used = true;

        let err = exec
            .acquire(
                "tap",
                &Target::text("Submit"),
                SearchMode::Poll {
                    timeout: Duration::from_millis(10),
                },
                true,
                &mut scope,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
        assert_eq!(ScriptedJudge::count(&judge.recover_calls), 0);
    }

    #[tokio::test]
    async fn test_layer_two_alternative_coordinates() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new().with_recovery(RecoveryAdvice {
            action: RecoveryAction::AlternativeCoordinates {
                x_percent: 25.0,
                y_percent: 50.0,
            },
            reason: "icon without label".into(),
        }));
        let mut exec = executor(&device, &judge, fast_config());
        let mut scope = StepScope::new(1, 0);

        let r = exec
            .acquire(
                "tap",
                &Target::text("Menu"),
                SearchMode::Poll {
                    timeout: Duration::from_millis(10),
                },
                true,
                &mut scope,
            )
            .await
            .unwrap();
        assert_eq!((r.x, r.y), (250, 1000));
        assert_eq!(scope.diagnostics.provenance, Some(Provenance::FromVisionFallback));
    }

    #[tokio::test]
    async fn test_layer_two_alternative_target_not_found() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::new().with_recovery(RecoveryAdvice {
            action: RecoveryAction::AlternativeTarget("Sign In".into()),
            reason: "button was renamed".into(),
        }));
        let mut exec = executor(&device, &judge, fast_config());
        let mut scope = StepScope::new(1, 0);

        let err = exec
            .acquire(
                "tap",
                &Target::text("Login"),
                SearchMode::Poll {
                    timeout: Duration::from_millis(10),
                },
                true,
                &mut scope,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RecoveryExhausted);
        assert!(err.message.contains("after AI alternative"));
        assert!(device.lookups("Sign In") >= 1);
        assert!(device.taps().is_empty());
        let note = scope.diagnostics.recovery.as_ref().unwrap();
        assert_eq!(note.alternative.as_deref(), Some("Sign In"));
    }

    #[tokio::test]
    async fn test_scroll_exhaustion_counts_swipes() {
        let device = Arc::new(FakeDevice::new());
        let judge = Arc::new(ScriptedJudge::unavailable());
        let mut exec = executor(&device, &judge, fast_config());
        let mut scope = StepScope::new(1, 0);

        let err = exec
            .acquire(
                "scroll_to",
                &Target::text("Footer"),
                SearchMode::Scroll {
                    direction: Direction::Down,
                    max_scrolls: 3,
                },
                true,
                &mut scope,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ElementNotFoundAfterScroll);
        assert_eq!(device.swipes(), 3);
        assert_eq!(scope.diagnostics.scrolls, Some(3));

        // Content "down" means the finger moves up
        match &device.calls()[0] {
            DeviceCall::Swipe { from, to, .. } => assert!(to.1 < from.1),
            other => panic!("unexpected call {:?}", other),
        }
    }
}
