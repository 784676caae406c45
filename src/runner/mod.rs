pub mod context;
pub mod control_flow;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod resilience;
pub mod resolver;
pub mod state;
pub mod verification;

#[cfg(test)]
pub mod testing;

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::driver::android::AndroidDriver;
use crate::parser::types::TestSpec;
use crate::report::types::TestResults;
use crate::utils::config::Config;
use crate::vision::{GeminiJudge, UnavailableJudge, VisionJudge};

pub use events::*;
pub use executor::TestExecutor;
pub use state::*;

/// Options of `mut run` that are not part of `Config`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub path: PathBuf,
    pub output: PathBuf,
    pub continue_on_failure: bool,
    /// Also write `junit.xml`
    pub report: bool,
}

/// Collect test scripts: a single file, or every `*.yaml`/`*.yml` under a directory
pub fn collect_test_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        anyhow::bail!("Test path not found: {}", path.display());
    }
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    Ok(files)
}

fn vision_judge(config: &Config) -> Result<Arc<dyn VisionJudge>> {
    match config.google_api_key.as_deref() {
        Some(key) => {
            let judge = GeminiJudge::new(key, &config.model, config.timeouts.verify_screen)?;
            Ok(Arc::new(judge))
        }
        None => {
            log::warn!("GOOGLE_API_KEY not set: vision checks and AI recovery are disabled");
            Ok(Arc::new(UnavailableJudge))
        }
    }
}

/// Persist screenshots of one test under `<output>/<test name>/`
fn write_artifacts(output: &Path, result: &TestResult) -> Result<()> {
    if result.artifacts.is_empty() {
        return Ok(());
    }
    let safe_name: String = result
        .name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let dir = output.join(safe_name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    for artifact in &result.artifacts {
        let path = dir.join(&artifact.name);
        std::fs::write(&path, &artifact.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Run every test under `options.path` on one device.
///
/// Errors are environment problems (bad script, no device); test failures
/// are reported in the returned results.
pub async fn run_tests(config: Config, options: &RunOptions) -> Result<TestResults> {
    // Parse everything first so a typo fails before touching the device
    let files = collect_test_files(&options.path)?;
    if files.is_empty() {
        anyhow::bail!("No test files found in {}", options.path.display());
    }
    let specs: Vec<TestSpec> = files
        .iter()
        .map(|f| {
            crate::parser::parse_test_file(f).with_context(|| format!("Invalid test file: {}", f.display()))
        })
        .collect::<Result<_>>()?;

    std::fs::create_dir_all(&options.output)
        .with_context(|| format!("Failed to create output dir {}", options.output.display()))?;

    let device = Arc::new(AndroidDriver::new(config.device.as_deref()).await?);
    let judge = vision_judge(&config)?;

    let abort = Arc::new(AtomicBool::new(false));
    let flag = abort.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\n{} Interrupted, finishing current step...", "⏹".yellow());
        flag.store(true, Ordering::SeqCst);
    }) {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }

    let (events, receiver) = EventEmitter::new();
    let listener = tokio::spawn(ConsoleEventListener::listen(receiver));

    let session_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    events.emit(TestEvent::SessionStarted {
        session_id: session_id.clone(),
        test_count: specs.len(),
    });

    let mut executor = TestExecutor::new(device.clone(), device, judge, config)
        .with_events(events.clone())
        .continue_on_failure(options.continue_on_failure)
        .with_abort_flag(abort.clone());

    let mut tests = Vec::with_capacity(specs.len());
    for spec in &specs {
        if abort.load(Ordering::SeqCst) {
            log::info!("Run interrupted, not starting {}", spec.name);
            break;
        }
        let result = executor.run(spec).await;
        if let Err(e) = write_artifacts(&options.output, &result) {
            log::warn!("{:#}", e);
        }
        tests.push(result);
    }
    drop(executor);

    let results = TestResults::new(&session_id, tests, started.elapsed().as_millis() as u64);
    events.emit(TestEvent::SessionFinished {
        summary: results.summary.clone(),
    });
    drop(events);
    // Let the console catch up before printing report paths
    listener.await.ok();

    let json_path = crate::report::json::write_report(&results, &options.output)?;
    println!("  Results: {}", json_path.display().to_string().cyan());
    if options.report {
        let junit_path = crate::report::junit::write_report(&results, &options.output)?;
        println!("  JUnit report: {}", junit_path.display().to_string().cyan());
    }

    Ok(results)
}
