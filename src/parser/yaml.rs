use super::types::{
    Coordinates, Direction, Step, StepOptions, SwipeParams, Target, TestConfig, TestSpec,
};
use super::ParseError;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const ACTIONS: &[&str] = &[
    "tap",
    "double_tap",
    "long_press",
    "type",
    "swipe",
    "wait",
    "wait_for",
    "scroll_to",
    "launch_app",
    "terminate_app",
    "back",
    "hide_keyboard",
    "verify_screen",
];

const CONDITIONALS: &[&str] = &["if_present", "if_absent", "if_screen"];

/// Parse a YAML test file into a TestSpec
pub fn parse_test_file(path: &Path) -> Result<TestSpec, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "test".to_string());

    parse_yaml_content(&content, &name)
}

/// Parse YAML content into a TestSpec
pub fn parse_yaml_content(content: &str, name: &str) -> Result<TestSpec, ParseError> {
    let value: Value = serde_yaml::from_str(content)?;

    let mut spec = TestSpec {
        name: name.to_string(),
        ..Default::default()
    };

    match value {
        // Bare list of steps
        Value::Sequence(_) => {
            spec.steps = parse_steps(&value)?;
        }
        Value::Mapping(map) => {
            for (key, val) in &map {
                let key = key
                    .as_str()
                    .ok_or_else(|| ParseError::Invalid("top-level keys must be strings".into()))?;
                match key {
                    "config" => spec.config = parse_config(val)?,
                    "setup" => spec.setup = parse_steps(val)?,
                    "steps" => spec.steps = parse_steps(val)?,
                    "teardown" => spec.teardown = parse_steps(val)?,
                    "name" => {
                        if let Some(n) = val.as_str() {
                            spec.name = n.to_string();
                        }
                    }
                    other => log::warn!("Ignoring unknown top-level key '{}' in {}", other, name),
                }
            }
        }
        Value::Null => {}
        other => {
            return Err(ParseError::Invalid(format!(
                "expected a mapping or a list of steps, got {:?}",
                other
            )))
        }
    }

    Ok(spec)
}

fn parse_config(value: &Value) -> Result<TestConfig, ParseError> {
    let mut config = TestConfig::default();
    let map = match value {
        Value::Null => return Ok(config),
        Value::Mapping(m) => m,
        _ => return Err(ParseError::Invalid("config must be a mapping".into())),
    };

    if let Some(app) = get(map, "app") {
        config.app = scalar_string(app);
    }
    if let Some(device) = get(map, "device") {
        config.device = scalar_string(device);
    }
    if let Some(Value::Mapping(timeouts)) = get(map, "timeouts") {
        for (k, v) in timeouts {
            let key = k.as_str().unwrap_or_default().to_string();
            let duration = parse_duration(v)
                .ok_or_else(|| ParseError::Invalid(format!("invalid timeout for '{}'", key)))?;
            config.timeouts.insert(key, duration);
        }
    }
    if let Some(Value::Mapping(vars)) = get(map, "vars") {
        let mut out = HashMap::new();
        for (k, v) in vars {
            if let (Some(k), Some(v)) = (k.as_str(), scalar_string(v)) {
                out.insert(k.to_string(), v);
            }
        }
        config.vars = out;
    }

    Ok(config)
}

/// Parse a list of steps (null means empty)
pub fn parse_steps(value: &Value) -> Result<Vec<Step>, ParseError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.iter().map(parse_step).collect(),
        _ => Err(ParseError::Invalid(format!(
            "expected a list of steps, got {:?}",
            value
        ))),
    }
}

/// Parse a single step
pub fn parse_step(value: &Value) -> Result<Step, ParseError> {
    match value {
        // Simple action like "- back" or "- launch_app"
        Value::String(s) => parse_action(s.trim(), &Value::Null),

        Value::Mapping(map) => {
            for cond in CONDITIONALS {
                if let Some(condition) = get(map, cond) {
                    return parse_conditional(cond, condition, map);
                }
            }

            if let Some(count) = get(map, "repeat") {
                return parse_repeat(count, map);
            }

            let action = map
                .keys()
                .filter_map(|k| k.as_str())
                .find(|k| ACTIONS.contains(k));

            match action {
                Some(name) => parse_action(name, get(map, name).unwrap_or(&Value::Null)),
                None => {
                    let first = map
                        .keys()
                        .next()
                        .and_then(|k| k.as_str())
                        .unwrap_or("<empty>");
                    Err(ParseError::UnknownAction(first.to_string()))
                }
            }
        }

        _ => Err(ParseError::Invalid(format!("{:?}", value))),
    }
}

/// Rich form of an action: `tap: { element: "OK", timeout: 3s }`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RichArgs {
    element: Option<String>,
    coordinates: Option<Value>,
    timeout: Option<Value>,
    retry: Option<u32>,
    ai_recovery: Option<bool>,
    text: Option<String>,
    field: Option<String>,
    description: Option<String>,
    direction: Option<String>,
    distance: Option<Value>,
    from: Option<Value>,
    to: Option<Value>,
    duration: Option<Value>,
    max_scrolls: Option<u32>,
    app: Option<String>,
    retry_if_no_change: Option<bool>,
}

enum Args {
    None,
    Simple(String),
    Rich(Box<RichArgs>),
}

impl Args {
    fn from_value(action: &str, value: &Value) -> Result<Self, ParseError> {
        match value {
            Value::Null => Ok(Args::None),
            Value::Mapping(m) if m.is_empty() => Ok(Args::None),
            Value::Mapping(_) => serde_yaml::from_value::<RichArgs>(value.clone())
                .map(|r| Args::Rich(Box::new(r)))
                .map_err(|e| ParseError::Invalid(format!("{}: {}", action, e))),
            other => scalar_string(other)
                .map(Args::Simple)
                .ok_or_else(|| ParseError::Invalid(format!("{}: unsupported value", action))),
        }
    }

    fn options(&self, action: &str) -> Result<StepOptions, ParseError> {
        match self {
            Args::Rich(r) => Ok(StepOptions {
                timeout: match &r.timeout {
                    Some(v) => Some(parse_duration(v).ok_or_else(|| {
                        ParseError::Invalid(format!("{}: invalid timeout", action))
                    })?),
                    None => None,
                },
                retry: r.retry,
                ai_recovery: r.ai_recovery,
            }),
            _ => Ok(StepOptions::default()),
        }
    }

    /// Target from `action: "Text"` or `element`/`coordinates`
    fn target(&self, action: &str) -> Result<Target, ParseError> {
        let target = match self {
            Args::None => Target::default(),
            Args::Simple(s) => Target::text(s.clone()),
            Args::Rich(r) => Target {
                text: r.element.clone(),
                coordinates: r
                    .coordinates
                    .as_ref()
                    .map(|c| parse_coordinates(action, c))
                    .transpose()?,
            },
        };

        if matches!(&target.text, Some(t) if t.trim().is_empty()) {
            return Err(ParseError::missing(action, "element"));
        }
        if target.is_empty() {
            return Err(ParseError::missing(action, "element"));
        }
        Ok(target)
    }

    /// Like `target` but the element text is mandatory
    fn text_target(&self, action: &str) -> Result<Target, ParseError> {
        let target = self.target(action)?;
        if target.text.is_none() {
            return Err(ParseError::missing(action, "element"));
        }
        Ok(target)
    }
}

fn parse_action(name: &str, value: &Value) -> Result<Step, ParseError> {
    if !ACTIONS.contains(&name) {
        return Err(ParseError::UnknownAction(name.to_string()));
    }

    let args = Args::from_value(name, value)?;
    let options = args.options(name)?;

    let step = match name {
        "tap" => Step::Tap {
            target: args.target(name)?,
            options,
        },
        "double_tap" => Step::DoubleTap {
            target: args.target(name)?,
            options,
        },
        "long_press" => Step::LongPress {
            target: args.target(name)?,
            duration: match &args {
                Args::Rich(r) => r
                    .duration
                    .as_ref()
                    .map(|d| parse_gesture_duration(name, d))
                    .transpose()?,
                _ => None,
            },
            options,
        },
        "type" => {
            let (text, field) = match &args {
                Args::Simple(s) => (Some(s.clone()), None),
                Args::Rich(r) => (r.text.clone(), r.field.clone().map(Target::text)),
                Args::None => (None, None),
            };
            let text = text.ok_or_else(|| ParseError::missing(name, "text"))?;
            Step::Type {
                text,
                field,
                options,
            }
        }
        "swipe" => Step::Swipe {
            params: parse_swipe(&args)?,
            options,
        },
        "wait" => {
            let duration = match &args {
                Args::None => Duration::from_secs(1),
                Args::Simple(s) => parse_duration_str(s)
                    .ok_or_else(|| ParseError::Invalid(format!("wait: invalid duration '{}'", s)))?,
                Args::Rich(r) => r
                    .duration
                    .as_ref()
                    .or(r.timeout.as_ref())
                    .and_then(parse_duration)
                    .ok_or_else(|| ParseError::missing(name, "duration"))?,
            };
            Step::Wait { duration }
        }
        "wait_for" => Step::WaitFor {
            target: args.text_target(name)?,
            options,
        },
        "scroll_to" => {
            let (direction, max_scrolls) = match &args {
                Args::Rich(r) => (
                    r.direction
                        .as_deref()
                        .map(str::parse::<Direction>)
                        .transpose()
                        .map_err(|e| ParseError::Invalid(format!("scroll_to: {}", e)))?,
                    r.max_scrolls,
                ),
                _ => (None, None),
            };
            Step::ScrollTo {
                target: args.text_target(name)?,
                direction: direction.unwrap_or(Direction::Down),
                max_scrolls,
                options,
            }
        }
        "launch_app" | "terminate_app" => {
            let app = match &args {
                Args::Simple(s) => Some(s.clone()),
                Args::Rich(r) => r.app.clone().or_else(|| r.element.clone()),
                Args::None => None,
            };
            if name == "launch_app" {
                Step::LaunchApp { app, options }
            } else {
                Step::TerminateApp { app, options }
            }
        }
        "back" => Step::Back { options },
        "hide_keyboard" => Step::HideKeyboard { options },
        "verify_screen" => {
            let description = match &args {
                Args::Simple(s) => Some(s.clone()),
                Args::Rich(r) => r.description.clone().or_else(|| r.element.clone()),
                Args::None => None,
            }
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| ParseError::missing(name, "description"))?;
            Step::VerifyScreen { description }
        }
        other => return Err(ParseError::UnknownAction(other.to_string())),
    };

    Ok(step)
}

fn parse_swipe(args: &Args) -> Result<SwipeParams, ParseError> {
    let parse_dir = |s: &str| {
        s.parse::<Direction>()
            .map_err(|e| ParseError::Invalid(format!("swipe: {}", e)))
    };

    match args {
        Args::None => Ok(SwipeParams::default()),
        Args::Simple(s) => Ok(SwipeParams {
            direction: Some(parse_dir(s)?),
            ..Default::default()
        }),
        Args::Rich(r) => Ok(SwipeParams {
            direction: r.direction.as_deref().map(parse_dir).transpose()?,
            distance: r
                .distance
                .as_ref()
                .map(|d| {
                    parse_percent(d)
                        .ok_or_else(|| ParseError::Invalid("swipe: invalid distance".into()))
                })
                .transpose()?,
            from: r
                .from
                .as_ref()
                .map(|c| parse_coordinates("swipe", c))
                .transpose()?,
            to: r
                .to
                .as_ref()
                .map(|c| parse_coordinates("swipe", c))
                .transpose()?,
            duration: r
                .duration
                .as_ref()
                .map(|d| parse_gesture_duration("swipe", d))
                .transpose()?,
            retry_if_no_change: r.retry_if_no_change,
        }),
    }
}

fn parse_conditional(kind: &str, condition: &Value, map: &Mapping) -> Result<Step, ParseError> {
    let then_steps = get(map, "then").map(parse_steps).transpose()?.unwrap_or_default();
    let else_steps = get(map, "else").map(parse_steps).transpose()?.unwrap_or_default();

    if kind == "if_screen" {
        let description = scalar_string(condition)
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| ParseError::missing(kind, "description"))?;
        return Ok(Step::IfScreen {
            description,
            then_steps,
            else_steps,
        });
    }

    let target = Args::from_value(kind, condition)?.text_target(kind)?;
    if kind == "if_present" {
        Ok(Step::IfPresent {
            target,
            then_steps,
            else_steps,
        })
    } else {
        Ok(Step::IfAbsent {
            target,
            then_steps,
            else_steps,
        })
    }
}

fn parse_repeat(count: &Value, map: &Mapping) -> Result<Step, ParseError> {
    let count = count
        .as_u64()
        .or_else(|| count.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| ParseError::Invalid("repeat: count must be a non-negative integer".into()))?;
    let steps = get(map, "steps")
        .map(parse_steps)
        .transpose()?
        .ok_or_else(|| ParseError::missing("repeat", "steps"))?;

    let count = u32::try_from(count)
        .map_err(|_| ParseError::Invalid(format!("repeat: count {} is too large", count)))?;

    Ok(Step::Repeat {
        count,
        steps,
    })
}

/// Parse coordinates like `["50%", "75%"]` or `[540, 1200]`
fn parse_coordinates(action: &str, value: &Value) -> Result<Coordinates, ParseError> {
    let invalid = || ParseError::Invalid(format!("{}: coordinates must have 2 values", action));
    let items = value.as_sequence().ok_or_else(invalid)?;
    if items.len() != 2 {
        return Err(invalid());
    }

    let is_percent = items
        .iter()
        .any(|v| v.as_str().map_or(false, |s| s.contains('%')));

    let x = parse_percent(&items[0]).ok_or_else(invalid)?;
    let y = parse_percent(&items[1]).ok_or_else(invalid)?;

    Ok(if is_percent {
        Coordinates::percent(x, y)
    } else {
        Coordinates::pixel(x, y)
    })
}

/// Parse `50%`, `"50"` or `50` into a number
fn parse_percent(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Parse a duration from a YAML number (seconds) or string
pub fn parse_duration(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|s| *s >= 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok()),
        Value::String(s) => parse_duration_str(s),
        _ => None,
    }
}

/// Parse `"5s"`, `"500ms"`, `"1.5s"` or a plain number of seconds
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim().to_lowercase();
    let secs = if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<f64>().ok()? / 1000.0
    } else if let Some(sec) = s.strip_suffix('s') {
        sec.trim().parse::<f64>().ok()?
    } else {
        s.parse::<f64>().ok()?
    };

    if secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Gesture durations: a bare number is milliseconds, strings may carry a unit
fn parse_gesture_duration(action: &str, value: &Value) -> Result<Duration, ParseError> {
    let millis = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let duration = match millis {
        Some(ms) if ms >= 0.0 => Duration::try_from_secs_f64(ms / 1000.0).ok(),
        Some(_) => None,
        None => value.as_str().and_then(parse_duration_str),
    };
    duration.ok_or_else(|| ParseError::Invalid(format!("{}: invalid duration {:?}", action, value)))
}

fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::String(key.to_string()))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
