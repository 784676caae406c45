use super::state::{Phase, TestStatus};
use crate::report::types::RunSummary;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration as StdDuration;
use tokio::sync::broadcast;

/// Test execution events for real-time updates
#[derive(Debug, Clone)]
pub enum TestEvent {
    // Session events
    SessionStarted {
        session_id: String,
        test_count: usize,
    },
    SessionFinished {
        summary: RunSummary,
    },

    // Test events
    TestStarted {
        name: String,
        step_count: usize,
    },
    TestFinished {
        name: String,
        status: TestStatus,
        duration_ms: u64,
        passed: usize,
        failed: usize,
        skipped: usize,
    },
    PhaseStarted {
        phase: Phase,
        step_count: usize,
    },

    // Step events
    StepStarted {
        index: usize,
        display: String,
        depth: usize,
    },
    StepPassed {
        index: usize,
        duration_ms: u64,
        depth: usize,
    },
    StepFailed {
        index: usize,
        error: String,
        duration_ms: u64,
        depth: usize,
    },
    StepRetrying {
        index: usize,
        attempt: u32,
        max_attempts: u32,
        depth: usize,
    },
    StepSkipped {
        index: usize,
        display: String,
        reason: String,
        depth: usize,
    },
    RecoveryAttempted {
        index: usize,
        action: String,
        reason: String,
        depth: usize,
    },

    // Deferred verification
    VerificationStarted {
        count: usize,
    },
    VerificationFinished {
        passed: usize,
        failed: usize,
    },

    // Log event for coordinated output
    Log {
        message: String,
        depth: usize,
    },
}

/// Event emitter for broadcasting test events
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<TestEvent>,
}

impl EventEmitter {
    pub fn new() -> (Self, broadcast::Receiver<TestEvent>) {
        let (sender, receiver) = broadcast::channel(256);
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: TestEvent) {
        // No receivers is fine (quiet runs, tests)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

fn spinner_style(indent: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
        .template(&format!("{}    {{spinner}} {{msg}}", indent))
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Console event listener for printing real-time updates
pub struct ConsoleEventListener;

impl ConsoleEventListener {
    pub async fn listen(mut receiver: broadcast::Receiver<TestEvent>) {
        use colored::Colorize;
        use indicatif::ProgressDrawTarget;
        use std::io::IsTerminal;

        // Piped output gets no spinners, only final lines
        let multi = if std::io::stdout().is_terminal() {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        // One spinner per nesting depth
        let mut spinners: Vec<Option<ProgressBar>> = Vec::new();
        let mut step_texts: Vec<String> = Vec::new();

        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Console listener skipped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                TestEvent::SessionStarted {
                    session_id,
                    test_count,
                } => {
                    println!(
                        "\n{} Session {} ({} test(s))",
                        "▶".green().bold(),
                        session_id.cyan(),
                        test_count
                    );
                }

                TestEvent::SessionFinished { summary } => {
                    for pb in spinners.drain(..).flatten() {
                        pb.finish();
                    }
                    println!("\n{} Session finished", "■".blue().bold());
                    println!(
                        "  {} passed, {} failed ({} total)",
                        summary.passed.to_string().green(),
                        summary.failed.to_string().red(),
                        summary.total
                    );
                    println!("  Duration: {}ms", summary.duration_ms);
                }

                TestEvent::TestStarted { name, step_count } => {
                    println!(
                        "\n  {} Test: {} ({} steps)",
                        "→".blue(),
                        name.white().bold(),
                        step_count
                    );
                }

                TestEvent::TestFinished {
                    name,
                    status,
                    duration_ms,
                    passed,
                    failed,
                    skipped,
                } => {
                    for pb in spinners.iter_mut().filter_map(Option::take) {
                        pb.finish();
                    }
                    let status_str = match status {
                        TestStatus::Passed => "PASSED".green().bold(),
                        TestStatus::Failed => "FAILED".red().bold(),
                    };
                    println!("  {} Test {} [{}]", "←".blue(), name, status_str);
                    println!(
                        "    {} passed, {} failed, {} skipped in {}ms",
                        passed, failed, skipped, duration_ms
                    );
                }

                TestEvent::PhaseStarted { phase, step_count } => {
                    if step_count > 0 && phase != Phase::Body {
                        println!("    {}", format!("[{}]", phase.as_str()).dimmed());
                    }
                }

                TestEvent::StepStarted {
                    index,
                    display,
                    depth,
                } => {
                    if depth >= spinners.len() {
                        spinners.resize(depth + 1, None);
                        step_texts.resize(depth + 1, String::new());
                    }

                    // A nested step started: stop the parent's spinner, its
                    // final line is printed when it finishes
                    for pb in spinners[..depth].iter_mut().filter_map(Option::take) {
                        pb.finish_and_clear();
                    }

                    let indent = "    ".repeat(depth);
                    let pb = multi.add(ProgressBar::new_spinner());
                    pb.set_style(spinner_style(&indent));

                    let body = format!("[{}] {}... ", index, display.dimmed());
                    pb.set_message(body.clone());
                    pb.enable_steady_tick(StdDuration::from_millis(100));

                    spinners[depth] = Some(pb);
                    step_texts[depth] = body;
                }

                TestEvent::StepPassed {
                    duration_ms, depth, ..
                } => {
                    if depth < spinners.len() {
                        if let Some(pb) = spinners[depth].take() {
                            pb.finish_and_clear();
                        }
                        println!(
                            "{}    {} {}({}ms)",
                            "    ".repeat(depth),
                            "✓".green(),
                            step_texts[depth],
                            duration_ms
                        );
                    }
                }

                TestEvent::StepFailed {
                    error,
                    duration_ms,
                    depth,
                    ..
                } => {
                    if depth < spinners.len() {
                        if let Some(pb) = spinners[depth].take() {
                            pb.finish_and_clear();
                        }
                        let indent = "    ".repeat(depth);
                        println!(
                            "{}    {} {}({}ms)",
                            indent,
                            "✗".red(),
                            step_texts[depth],
                            duration_ms
                        );
                        println!("{}      {}", indent, error.red());
                    }
                }

                TestEvent::StepRetrying {
                    attempt,
                    max_attempts,
                    depth,
                    ..
                } => {
                    if let Some(Some(pb)) = spinners.get(depth) {
                        pb.set_message(format!(
                            "{} {}",
                            step_texts[depth],
                            format!("↻ retry {}/{}", attempt, max_attempts).yellow()
                        ));
                    }
                }

                TestEvent::StepSkipped {
                    index,
                    display,
                    reason,
                    depth,
                } => {
                    println!(
                        "{}    {} [{}] {} ({})",
                        "    ".repeat(depth),
                        "○".yellow(),
                        index,
                        display.dimmed(),
                        reason.dimmed()
                    );
                }

                TestEvent::RecoveryAttempted {
                    action,
                    reason,
                    depth,
                    ..
                } => {
                    multi
                        .println(format!(
                            "{}      {} AI recovery: {} ({})",
                            "    ".repeat(depth),
                            "⚡".yellow(),
                            action.yellow(),
                            reason
                        ))
                        .ok();
                }

                TestEvent::VerificationStarted { count } => {
                    if count > 0 {
                        println!(
                            "    {} Analyzing {} deferred verification(s)...",
                            "◆".cyan(),
                            count
                        );
                    }
                }

                TestEvent::VerificationFinished { passed, failed } => {
                    if passed + failed > 0 {
                        println!(
                            "    {} Verifications: {} passed, {} failed",
                            "◆".cyan(),
                            passed.to_string().green(),
                            failed.to_string().red()
                        );
                    }
                }

                TestEvent::Log { message, depth } => {
                    multi
                        .println(format!("{}      {}", "    ".repeat(depth), message))
                        .ok();
                }
            }
        }
    }
}
