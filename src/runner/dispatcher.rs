use super::executor::{StepScope, TestExecutor};
use super::resilience::{frame_hash, gesture_end, SearchMode};
use super::resolver::ResolvedTarget;
use super::state::{ErrorKind, Phase, StepError, StepResult, SwipeNote};
use crate::parser::types::{Direction, Step, StepOptions, SwipeParams, Target};
use std::time::Duration;

const DOUBLE_TAP_GAP: Duration = Duration::from_millis(100);

impl TestExecutor {
    /// Execute one step. Nested results of control-flow steps go to `nested`.
    pub(super) async fn dispatch(
        &mut self,
        step: &Step,
        phase: Phase,
        scope: &mut StepScope,
        nested: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        match step {
            Step::Tap { target, options } => {
                let at = self.locate("tap", target, options, scope).await?;
                self.device
                    .tap(at.x, at.y)
                    .await
                    .map_err(|e| StepError::device("tap", e))
            }

            Step::DoubleTap { target, options } => {
                let at = self.locate("double_tap", target, options, scope).await?;
                self.device
                    .tap(at.x, at.y)
                    .await
                    .map_err(|e| StepError::device("double_tap", e))?;
                tokio::time::sleep(DOUBLE_TAP_GAP).await;
                self.device
                    .tap(at.x, at.y)
                    .await
                    .map_err(|e| StepError::device("double_tap", e))
            }

            Step::LongPress {
                target,
                duration,
                options,
            } => {
                let at = self.locate("long_press", target, options, scope).await?;
                let ms = duration.unwrap_or(self.config.long_press.duration).as_millis() as u64;
                self.device
                    .swipe(at.x, at.y, at.x, at.y, ms)
                    .await
                    .map_err(|e| StepError::device("long_press", e))
            }

            Step::Type {
                text,
                field,
                options,
            } => {
                if let Some(field) = field {
                    let at = self.locate("type", field, options, scope).await?;
                    self.device
                        .tap(at.x, at.y)
                        .await
                        .map_err(|e| StepError::device("focus field", e))?;
                }
                let text = self.context.substitute_vars(text);
                self.device
                    .type_text(&text)
                    .await
                    .map_err(|e| StepError::device("type", e))
            }

            Step::Swipe { params, .. } => self.swipe(params, scope).await,

            Step::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }

            Step::WaitFor { target, options } => {
                let timeout = options.timeout.unwrap_or(self.config.timeouts.wait_for);
                // Absence is a valid outcome here, so no Layer 2
                match self.poll_for(target, timeout).await {
                    Ok(found) => {
                        scope.record_target(&found);
                        Ok(())
                    }
                    Err(e) if e.kind == ErrorKind::TargetNotFound => Err(StepError::new(
                        ErrorKind::Timeout,
                        format!(
                            "{} did not appear within {}ms",
                            target.describe(),
                            timeout.as_millis()
                        ),
                    )),
                    Err(e) => Err(e),
                }
            }

            Step::ScrollTo {
                target,
                direction,
                max_scrolls,
                options,
            } => {
                let mode = SearchMode::Scroll {
                    direction: *direction,
                    max_scrolls: max_scrolls.unwrap_or(self.config.scroll.max_scrolls),
                };
                let allow = self.recovery_allowed(options);
                self.acquire("scroll_to", target, mode, allow, scope)
                    .await
                    .map(|_| ())
            }

            Step::LaunchApp { app, .. } => {
                let app_id = self.app_id(app.as_deref(), "launch_app")?;
                self.device
                    .launch_app(&app_id)
                    .await
                    .map_err(|e| StepError::device("launch_app", e))?;
                // Orientation may differ in the new app
                self.context.invalidate_screen_size();
                Ok(())
            }

            Step::TerminateApp { app, .. } => {
                let app_id = self.app_id(app.as_deref(), "terminate_app")?;
                self.device
                    .terminate_app(&app_id)
                    .await
                    .map_err(|e| StepError::device("terminate_app", e))
            }

            Step::Back { .. } | Step::HideKeyboard { .. } => self
                .device
                .press_key("back")
                .await
                .map_err(|e| StepError::device(step.action_name(), e)),

            Step::VerifyScreen { description } => {
                self.queue_verification(description, scope).await
            }

            Step::IfPresent {
                target,
                then_steps,
                else_steps,
            } => {
                self.run_presence(target, true, then_steps, else_steps, phase, scope, nested)
                    .await
            }

            Step::IfAbsent {
                target,
                then_steps,
                else_steps,
            } => {
                self.run_presence(target, false, then_steps, else_steps, phase, scope, nested)
                    .await
            }

            Step::IfScreen {
                description,
                then_steps,
                else_steps,
            } => {
                self.run_if_screen(description, then_steps, else_steps, phase, scope, nested)
                    .await
            }

            Step::Repeat { count, steps } => {
                self.run_repeat(*count, steps, phase, scope, nested).await
            }
        }
    }

    fn recovery_allowed(&self, options: &StepOptions) -> bool {
        options
            .ai_recovery
            .unwrap_or(self.config.resilience.ai_recovery)
    }

    /// Resolve the target of a tap-like action with both resilience layers
    async fn locate(
        &mut self,
        action: &str,
        target: &Target,
        options: &StepOptions,
        scope: &mut StepScope,
    ) -> Result<ResolvedTarget, StepError> {
        let mode = SearchMode::Poll {
            timeout: options.timeout.unwrap_or(self.config.action_timeout()),
        };
        let allow = self.recovery_allowed(options);
        self.acquire(action, target, mode, allow, scope).await
    }

    fn app_id(&self, explicit: Option<&str>, action: &str) -> Result<String, StepError> {
        explicit
            .map(str::to_string)
            .or_else(|| self.context.app_id.clone())
            .ok_or_else(|| {
                StepError::missing_field(format!(
                    "{} needs an app id: set it on the step, in the test config or globally",
                    action
                ))
            })
    }

    async fn swipe(&mut self, params: &SwipeParams, scope: &mut StepScope) -> Result<(), StepError> {
        let (w, h) = self.screen_size().await?;
        let from = params
            .from
            .map(|c| c.to_pixels(w, h))
            .unwrap_or(((w / 2) as i32, (h / 2) as i32));
        let to = match params.to {
            Some(c) => c.to_pixels(w, h),
            None => gesture_end(
                from,
                params.direction.unwrap_or(Direction::Up),
                params.distance.unwrap_or(self.config.swipe.distance_percent),
                w,
                h,
            ),
        };
        let duration_ms = params.duration.unwrap_or(self.config.swipe.duration).as_millis() as u64;

        let retry = params
            .retry_if_no_change
            .unwrap_or(self.config.swipe.retry_if_no_change);
        let max_attempts = if retry {
            self.config.swipe.retry_limit.max(1)
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            let before = match max_attempts {
                1 => None,
                _ => self.frame().await,
            };
            self.device
                .swipe(from.0, from.1, to.0, to.1, duration_ms)
                .await
                .map_err(|e| StepError::device("swipe", e))?;

            let Some(before) = before else { break };
            tokio::time::sleep(self.config.swipe.settle).await;
            match self.frame().await {
                Some(after) if after == before => {}
                // Changed, or no screenshot to compare with
                _ => break,
            }
            if attempt >= max_attempts {
                log::debug!("Screen unchanged after {} swipes", attempt);
                break;
            }
            log::debug!("Screen unchanged after swipe, retrying ({}/{})", attempt, max_attempts);
            attempt += 1;
        }

        scope.diagnostics.swipe = Some(SwipeNote {
            from,
            to,
            duration_ms,
            attempts: (attempt > 1).then_some(attempt),
        });
        Ok(())
    }

    /// Hash of the current screen, `None` when it cannot be captured
    async fn frame(&self) -> Option<u64> {
        match self.capture.screenshot().await {
            Ok(bytes) => Some(frame_hash(&bytes)),
            Err(e) => {
                log::debug!("No screenshot for swipe check: {:#}", e);
                None
            }
        }
    }
}
