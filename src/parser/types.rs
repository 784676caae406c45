use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A parsed test script: header config plus the three phases
#[derive(Debug, Clone, Default)]
pub struct TestSpec {
    /// Test name (file stem)
    pub name: String,
    pub config: TestConfig,
    pub setup: Vec<Step>,
    pub steps: Vec<Step>,
    pub teardown: Vec<Step>,
}

impl TestSpec {
    /// Total number of top-level steps across all phases
    pub fn top_level_count(&self) -> usize {
        self.setup.len() + self.steps.len() + self.teardown.len()
    }
}

/// The `config:` section of a test script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestConfig {
    /// Application package used by launch_app/terminate_app when a step omits one
    pub app: Option<String>,
    pub device: Option<String>,
    /// Per-test timeout overrides keyed by name (tap, wait_for, condition, ...)
    pub timeouts: HashMap<String, Duration>,
    /// Values available to `${name}` placeholders
    pub vars: HashMap<String, String>,
}

/// Unit of a coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordUnit {
    Percent,
    Pixel,
}

/// A coordinate pair as written in the script
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub unit: CoordUnit,
}

impl Coordinates {
    pub fn percent(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            unit: CoordUnit::Percent,
        }
    }

    pub fn pixel(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            unit: CoordUnit::Pixel,
        }
    }

    /// Convert to absolute pixels. Percent values are clamped to [0, 100].
    pub fn to_pixels(&self, width: u32, height: u32) -> (i32, i32) {
        match self.unit {
            CoordUnit::Pixel => (self.x.round() as i32, self.y.round() as i32),
            CoordUnit::Percent => {
                let px = self.x.clamp(0.0, 100.0);
                let py = self.y.clamp(0.0, 100.0);
                (
                    (px * width as f64 / 100.0) as i32,
                    (py * height as f64 / 100.0) as i32,
                )
            }
        }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            CoordUnit::Percent => write!(f, "({}%, {}%)", self.x, self.y),
            CoordUnit::Pixel => write!(f, "({}, {})", self.x, self.y),
        }
    }
}

/// What a step points at: element text, coordinates, or both
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub text: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl Target {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            coordinates: None,
        }
    }

    pub fn coordinates(coordinates: Coordinates) -> Self {
        Self {
            text: None,
            coordinates: Some(coordinates),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.coordinates.is_none()
    }

    /// Human readable description used in logs and AI prompts
    pub fn describe(&self) -> String {
        match (&self.text, &self.coordinates) {
            (Some(t), Some(c)) => format!("\"{}\" at {}", t, c),
            (Some(t), None) => format!("\"{}\"", t),
            (None, Some(c)) => c.to_string(),
            (None, None) => "<none>".to_string(),
        }
    }
}

/// Per-step overrides shared by action steps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOptions {
    pub timeout: Option<Duration>,
    /// Extra whole-step attempts
    pub retry: Option<u32>,
    /// Disable or force Layer-2 recovery for this step
    pub ai_recovery: Option<bool>,
}

/// Gesture / scroll direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Swipe gesture parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwipeParams {
    /// Finger movement direction (default: up)
    pub direction: Option<Direction>,
    /// Distance as percent of screen height (up/down) or width (left/right)
    pub distance: Option<f64>,
    /// Start point, defaults to screen centre
    pub from: Option<Coordinates>,
    /// Explicit end point; overrides direction + distance
    pub to: Option<Coordinates>,
    pub duration: Option<Duration>,
    /// Overrides `swipe.retry_if_no_change`
    pub retry_if_no_change: Option<bool>,
}

/// A single step of the step tree
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Tap {
        target: Target,
        options: StepOptions,
    },
    DoubleTap {
        target: Target,
        options: StepOptions,
    },
    LongPress {
        target: Target,
        duration: Option<Duration>,
        options: StepOptions,
    },
    Type {
        text: String,
        /// Field to focus (tap) before typing
        field: Option<Target>,
        options: StepOptions,
    },
    Swipe {
        params: SwipeParams,
        options: StepOptions,
    },
    Wait {
        duration: Duration,
    },
    WaitFor {
        target: Target,
        options: StepOptions,
    },
    ScrollTo {
        target: Target,
        /// Content scroll direction; `down` reveals content below
        direction: Direction,
        max_scrolls: Option<u32>,
        options: StepOptions,
    },
    LaunchApp {
        app: Option<String>,
        options: StepOptions,
    },
    TerminateApp {
        app: Option<String>,
        options: StepOptions,
    },
    Back {
        options: StepOptions,
    },
    HideKeyboard {
        options: StepOptions,
    },
    VerifyScreen {
        description: String,
    },
    IfPresent {
        target: Target,
        then_steps: Vec<Step>,
        else_steps: Vec<Step>,
    },
    IfAbsent {
        target: Target,
        then_steps: Vec<Step>,
        else_steps: Vec<Step>,
    },
    IfScreen {
        description: String,
        then_steps: Vec<Step>,
        else_steps: Vec<Step>,
    },
    Repeat {
        count: u32,
        steps: Vec<Step>,
    },
}

impl Step {
    /// Script keyword of this step
    pub fn action_name(&self) -> &'static str {
        match self {
            Step::Tap { .. } => "tap",
            Step::DoubleTap { .. } => "double_tap",
            Step::LongPress { .. } => "long_press",
            Step::Type { .. } => "type",
            Step::Swipe { .. } => "swipe",
            Step::Wait { .. } => "wait",
            Step::WaitFor { .. } => "wait_for",
            Step::ScrollTo { .. } => "scroll_to",
            Step::LaunchApp { .. } => "launch_app",
            Step::TerminateApp { .. } => "terminate_app",
            Step::Back { .. } => "back",
            Step::HideKeyboard { .. } => "hide_keyboard",
            Step::VerifyScreen { .. } => "verify_screen",
            Step::IfPresent { .. } => "if_present",
            Step::IfAbsent { .. } => "if_absent",
            Step::IfScreen { .. } => "if_screen",
            Step::Repeat { .. } => "repeat",
        }
    }

    /// Get a display name for the step
    pub fn display_name(&self) -> String {
        match self {
            Step::Tap { target, .. }
            | Step::DoubleTap { target, .. }
            | Step::LongPress { target, .. }
            | Step::WaitFor { target, .. }
            | Step::IfPresent { target, .. }
            | Step::IfAbsent { target, .. } => {
                format!("{} {}", self.action_name(), target.describe())
            }
            Step::ScrollTo {
                target, direction, ..
            } => format!("scroll_to {} ({})", target.describe(), direction.as_str()),
            Step::Type { text, field, .. } => match field {
                Some(f) => format!("type \"{}\" into {}", text, f.describe()),
                None => format!("type \"{}\"", text),
            },
            Step::Swipe { params, .. } => match (&params.from, &params.to) {
                (_, Some(to)) => format!("swipe to {}", to),
                _ => format!(
                    "swipe {}",
                    params.direction.unwrap_or(Direction::Up).as_str()
                ),
            },
            Step::Wait { duration } => format!("wait {}ms", duration.as_millis()),
            Step::LaunchApp { app, .. } | Step::TerminateApp { app, .. } => match app {
                Some(a) => format!("{} {}", self.action_name(), a),
                None => self.action_name().to_string(),
            },
            Step::Back { .. } | Step::HideKeyboard { .. } => self.action_name().to_string(),
            Step::VerifyScreen { description } | Step::IfScreen { description, .. } => {
                format!("{} \"{}\"", self.action_name(), description)
            }
            Step::Repeat { count, steps } => {
                format!("repeat {}x ({} steps)", count, steps.len())
            }
        }
    }

    /// Per-step options, if the step kind carries them
    pub fn options(&self) -> Option<&StepOptions> {
        match self {
            Step::Tap { options, .. }
            | Step::DoubleTap { options, .. }
            | Step::LongPress { options, .. }
            | Step::Type { options, .. }
            | Step::Swipe { options, .. }
            | Step::WaitFor { options, .. }
            | Step::ScrollTo { options, .. }
            | Step::LaunchApp { options, .. }
            | Step::TerminateApp { options, .. }
            | Step::Back { options }
            | Step::HideKeyboard { options } => Some(options),
            Step::Wait { .. }
            | Step::VerifyScreen { .. }
            | Step::IfPresent { .. }
            | Step::IfAbsent { .. }
            | Step::IfScreen { .. }
            | Step::Repeat { .. } => None,
        }
    }

    /// Conditionals and repeat own nested step lists
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Step::IfPresent { .. } | Step::IfAbsent { .. } | Step::IfScreen { .. } | Step::Repeat { .. }
        )
    }

    /// Whether a failed attempt of this step may be retried as a whole
    pub fn is_retryable(&self) -> bool {
        !self.is_control_flow()
            && !matches!(
                self,
                Step::Wait { .. } | Step::WaitFor { .. } | Step::VerifyScreen { .. }
            )
    }
}
