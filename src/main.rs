use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use mut_tester::runner::RunOptions;
use mut_tester::utils::config::{parse_bool, Config};
use mut_tester::{driver, report, runner};

/// Exit code for environment problems: bad script, missing file, no device
const EXIT_ENVIRONMENT: i32 = 2;

#[derive(Parser)]
#[command(name = "mut")]
#[command(version)]
#[command(about = "Mobile UI test runner with AI-assisted recovery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test file(s) or directory
    Run {
        /// Path to test file or directory
        path: PathBuf,

        /// Device serial (defaults to the only connected device)
        #[arg(short, long)]
        device: Option<String>,

        /// Output directory for reports and artifacts
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Keep running body steps after a failure
        #[arg(long, default_value = "false")]
        continue_on_failure: bool,

        /// Capture a screenshot of each failed step
        #[arg(long, short = 's', default_value = "false")]
        snapshot: bool,

        /// Also write a JUnit report
        #[arg(long, default_value = "false")]
        report: bool,

        /// Disable AI-assisted recovery
        #[arg(long, default_value = "false")]
        no_ai_recovery: bool,

        /// Debug logging
        #[arg(short, long, default_value = "false")]
        verbose: bool,
    },

    /// List connected devices
    Devices,

    /// Generate report from test results
    Report {
        /// Path to results.json
        results: PathBuf,

        /// Output format (junit, json)
        #[arg(short, long, default_value = "junit")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            EXIT_ENVIRONMENT
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run {
            path,
            device,
            output,
            continue_on_failure,
            snapshot,
            report,
            no_ai_recovery,
            verbose,
        } => {
            let env_verbose = std::env::var("MUT_VERBOSE").is_ok_and(|v| parse_bool(v.trim()));
            init_logging(verbose || env_verbose);

            let mut config = Config::load()?;
            if device.is_some() {
                config.device = device;
            }
            if no_ai_recovery {
                config.resilience.ai_recovery = false;
            }
            if snapshot {
                config.snapshot_on_failure = true;
            }
            config.verbose = config.verbose || verbose;

            println!(
                "{} Running tests from: {}",
                "▶".green().bold(),
                path.display()
            );
            if let Some(ref serial) = config.device {
                println!("  Device: {}", serial.cyan());
            }
            println!("  Output: {}", output.display().to_string().cyan());
            if config.snapshot_on_failure {
                println!("  Snapshots: {}", "Enabled".green());
            }
            if !config.resilience.ai_recovery {
                println!("  AI recovery: {}", "Disabled".yellow());
            }

            let options = RunOptions {
                path,
                output,
                continue_on_failure,
                report,
            };
            let results = runner::run_tests(config, &options).await?;
            Ok(if results.all_passed() { 0 } else { 1 })
        }

        Commands::Devices => {
            init_logging(false);
            println!("{} Listing android devices...", "🔍".to_string().blue());
            driver::list_devices().await?;
            Ok(0)
        }

        Commands::Report {
            results,
            format,
            output,
        } => {
            init_logging(false);
            report::generate_report(&results, &format, output.as_deref()).await?;
            Ok(0)
        }
    }
}
