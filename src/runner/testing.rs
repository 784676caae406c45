//! In-memory device and vision fakes for engine tests.

use crate::driver::traits::{DeviceDriver, ScreenCapture};
use crate::runner::executor::TestExecutor;
use crate::utils::config::Config;
use crate::vision::{FailureContext, Judgment, RecoveryAdvice, VisionError, VisionJudge};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Tap(i32, i32),
    Swipe {
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    },
    Type(String),
    Key(String),
    Launch(String),
    Terminate(String),
}

#[derive(Debug, Clone)]
struct ElementScript {
    at: (i32, i32),
    after_lookups: usize,
    after_swipes: usize,
}

/// Scripted device: elements become visible after N lookups or N swipes
pub struct FakeDevice {
    calls: Mutex<Vec<DeviceCall>>,
    elements: Mutex<HashMap<String, ElementScript>>,
    lookups: Mutex<HashMap<String, usize>>,
    frames: Mutex<VecDeque<Vec<u8>>>,
    failing_taps: AtomicUsize,
    /// 1-based tap attempt that fails, 0 for none
    fail_tap_at: AtomicUsize,
    tap_attempts: AtomicUsize,
    screenshot_fails: AtomicUsize,
    size: (u32, u32),
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            elements: Mutex::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
            frames: Mutex::new(VecDeque::new()),
            failing_taps: AtomicUsize::new(0),
            fail_tap_at: AtomicUsize::new(0),
            tap_attempts: AtomicUsize::new(0),
            screenshot_fails: AtomicUsize::new(0),
            size: (1000, 2000),
        }
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(self, text: &str, at: (i32, i32), after_lookups: usize, after_swipes: usize) -> Self {
        self.elements.lock().unwrap().insert(
            text.to_string(),
            ElementScript {
                at,
                after_lookups,
                after_swipes,
            },
        );
        self
    }

    pub fn with_element(self, text: &str, at: (i32, i32)) -> Self {
        self.script(text, at, 0, 0)
    }

    /// Element answers lookups only after `n` misses
    pub fn with_element_after_lookups(self, text: &str, at: (i32, i32), n: usize) -> Self {
        self.script(text, at, n, 0)
    }

    pub fn with_element_after_swipes(self, text: &str, at: (i32, i32), n: usize) -> Self {
        self.script(text, at, 0, n)
    }

    /// Screenshots served in order before falling back to a static frame
    pub fn with_frames(self, frames: Vec<Vec<u8>>) -> Self {
        *self.frames.lock().unwrap() = frames.into();
        self
    }

    /// The next `n` taps fail
    pub fn with_failing_taps(self, n: usize) -> Self {
        self.failing_taps.store(n, Ordering::SeqCst);
        self
    }

    /// Only the `n`-th tap fails
    pub fn with_tap_failure_at(self, n: usize) -> Self {
        self.fail_tap_at.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_failing_screenshots(self, n: usize) -> Self {
        self.screenshot_fails.store(n, Ordering::SeqCst);
        self
    }

    pub fn remove_element(&self, text: &str) {
        self.elements.lock().unwrap().remove(text);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn taps(&self) -> Vec<(i32, i32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Tap(x, y) => Some((x, y)),
                _ => None,
            })
            .collect()
    }

    pub fn swipes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Swipe { .. }))
            .count()
    }

    pub fn lookups(&self, text: &str) -> usize {
        self.lookups.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DeviceDriver for FakeDevice {
    fn serial(&self) -> Option<&str> {
        Some("fake-device")
    }

    async fn tap(&self, x: i32, y: i32) -> Result<()> {
        let attempt = self.tap_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_tap_at.load(Ordering::SeqCst) {
            anyhow::bail!("injected failure on tap {}", attempt);
        }
        if Self::take_failure(&self.failing_taps) {
            anyhow::bail!("injected tap failure");
        }
        self.record(DeviceCall::Tap(x, y));
        Ok(())
    }

    async fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64) -> Result<()> {
        self.record(DeviceCall::Swipe {
            from: (x1, y1),
            to: (x2, y2),
            duration_ms,
        });
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.record(DeviceCall::Type(text.to_string()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(DeviceCall::Key(key.to_string()));
        Ok(())
    }

    async fn launch_app(&self, app_id: &str) -> Result<()> {
        self.record(DeviceCall::Launch(app_id.to_string()));
        Ok(())
    }

    async fn terminate_app(&self, app_id: &str) -> Result<()> {
        self.record(DeviceCall::Terminate(app_id.to_string()));
        Ok(())
    }

    async fn find_element_by_text(&self, text: &str) -> Result<Option<(i32, i32)>> {
        let seen = {
            let mut lookups = self.lookups.lock().unwrap();
            let count = lookups.entry(text.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let swipes = self.swipes();
        let elements = self.elements.lock().unwrap();
        Ok(elements
            .get(text)
            .filter(|e| seen >= e.after_lookups && swipes >= e.after_swipes)
            .map(|e| e.at))
    }

    async fn screen_size(&self) -> Result<(u32, u32)> {
        Ok(self.size)
    }
}

#[async_trait]
impl ScreenCapture for FakeDevice {
    async fn screenshot(&self) -> Result<Vec<u8>> {
        if Self::take_failure(&self.screenshot_fails) {
            anyhow::bail!("injected screenshot failure");
        }
        Ok(self
            .frames
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| b"\x89PNG static frame".to_vec()))
    }
}

/// Vision judge returning queued answers; falls back to defaults when empty
pub struct ScriptedJudge {
    available: bool,
    judgments: Mutex<VecDeque<Result<Judgment, VisionError>>>,
    /// Verdicts by description, used when the queue is empty
    verdicts: Mutex<HashMap<String, bool>>,
    locations: Mutex<HashMap<String, (i32, i32)>>,
    recoveries: Mutex<VecDeque<RecoveryAdvice>>,
    pub judge_calls: AtomicUsize,
    pub locate_calls: AtomicUsize,
    pub recover_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self {
            available: true,
            judgments: Mutex::new(VecDeque::new()),
            verdicts: Mutex::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
            recoveries: Mutex::new(VecDeque::new()),
            judge_calls: AtomicUsize::new(0),
            locate_calls: AtomicUsize::new(0),
            recover_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    pub fn with_judgment(self, judgment: Result<Judgment, VisionError>) -> Self {
        self.judgments.lock().unwrap().push_back(judgment);
        self
    }

    /// Fixed verdict for a description (order independent)
    pub fn with_verdict(self, description: &str, pass: bool) -> Self {
        self.verdicts
            .lock()
            .unwrap()
            .insert(description.to_string(), pass);
        self
    }

    pub fn with_location(self, description: &str, at: (i32, i32)) -> Self {
        self.locations
            .lock()
            .unwrap()
            .insert(description.to_string(), at);
        self
    }

    pub fn with_recovery(self, advice: RecoveryAdvice) -> Self {
        self.recoveries.lock().unwrap().push_back(advice);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionJudge for ScriptedJudge {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn judge(&self, _image: &[u8], description: &str) -> Result<Judgment, VisionError> {
        self.judge_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.judgments.lock().unwrap().pop_front() {
            return next;
        }
        let pass = self
            .verdicts
            .lock()
            .unwrap()
            .get(description)
            .copied()
            .unwrap_or(true);
        Ok(Judgment {
            pass,
            reason: format!("scripted verdict for '{}'", description),
        })
    }

    async fn locate(
        &self,
        _image: &[u8],
        description: &str,
        _width: u32,
        _height: u32,
    ) -> Result<Option<(i32, i32)>, VisionError> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.locations.lock().unwrap().get(description).copied())
    }

    async fn validate_at(
        &self,
        image: &[u8],
        description: &str,
        _x_percent: f64,
        _y_percent: f64,
    ) -> Result<Judgment, VisionError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.judge(image, description).await
    }

    async fn recover(
        &self,
        _image: &[u8],
        _failure: &FailureContext,
    ) -> Result<RecoveryAdvice, VisionError> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .recoveries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| RecoveryAdvice::fail("no scripted recovery")))
    }
}

/// Config with timings shrunk for tests
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.resilience.implicit_wait = Duration::from_millis(60);
    config.resilience.poll_interval = Duration::from_millis(5);
    config.timeouts.wait_for = Duration::from_millis(60);
    config.timeouts.condition = Duration::from_millis(30);
    config.timeouts.recovery_retry = Duration::from_millis(30);
    config.retry.delay = Duration::from_millis(1);
    config.swipe.settle = Duration::from_millis(1);
    config.verification.backoff_base = Duration::from_millis(1);
    config
}

/// Executor wired to shared fakes
pub fn executor(
    device: &Arc<FakeDevice>,
    judge: &Arc<ScriptedJudge>,
    config: Config,
) -> TestExecutor {
    TestExecutor::new(device.clone(), device.clone(), judge.clone(), config)
}
