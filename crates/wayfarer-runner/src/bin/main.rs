use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use wayfarer_runner::{AgentHistory, BrowserConfig, RunResult, TaskSettings};

#[derive(Parser)]
#[command(name = "wayfarer-runner")]
#[command(about = "Run scripted agent plans and replay recorded histories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a YAML plan
    Run {
        /// Plan file to run
        plan: PathBuf,

        /// Write the step history to this file
        #[arg(long, value_name = "FILE")]
        history: Option<PathBuf>,

        /// Set a parameter (can be used multiple times)
        #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Run in headless mode (overrides plan)
        #[arg(long)]
        headless: bool,

        /// Validate plan without running
        #[arg(long)]
        check: bool,
    },

    /// Replay a saved history
    Replay {
        /// History file written by `run --history`
        history: PathBuf,

        /// Settings (YAML) for retries, delays and URL policy
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,

        /// Run in headless mode
        #[arg(long)]
        headless: bool,
    },
}

#[tokio::main]
async fn main() -> wayfarer_runner::Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let result = match cli.command {
        Command::Run {
            plan,
            history,
            params,
            headless,
            check,
        } => {
            let params = wayfarer_runner::Params::from_args(&params)?;
            let mut config = wayfarer_runner::Config::load_with_params(&plan, &params)?;

            if check {
                println!("Plan valid: {}", config.name);
                println!("  Target: {}", config.target.url);
                println!("  Steps: {}", config.steps.len());
                println!("  Actions: {}", config.action_count());
                if !config.params.is_empty() {
                    println!("  Parameters: {}", config.params.len());
                    for (name, def) in &config.params {
                        let req = if def.required { " (required)" } else { "" };
                        let desc = def.description.as_deref().unwrap_or("");
                        println!("    - {}{}: {}", name, req, desc);
                    }
                }
                println!("  Max actions per step: {}", config.settings.max_actions_per_step);
                return Ok(());
            }

            if headless {
                config.browser.headless = true;
            }

            println!("Running: {}", config.name);

            let runner = wayfarer_runner::Runner::new(&config.browser).await?;
            let (result, steps) = runner.run(&config).await?;
            if let Some(path) = history {
                steps.save(&path)?;
                println!("History written to {}", path.display());
            }
            runner.close().await?;
            result
        }
        Command::Replay {
            history,
            settings,
            headless,
        } => {
            let recorded = AgentHistory::load(&history)?;
            let settings: TaskSettings = match settings {
                Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
                None => TaskSettings::default(),
            };

            println!("Replaying: {} ({} steps)", history.display(), recorded.steps.len());

            let browser = BrowserConfig {
                headless,
                ..Default::default()
            };
            let runner = wayfarer_runner::Runner::new(&browser).await?;
            let (result, _) = runner.replay(&recorded, settings).await?;
            runner.close().await?;
            result
        }
    };

    print_result(&result);
    if !result.success {
        std::process::exit(1);
    }

    Ok(())
}

fn print_result(result: &RunResult) {
    println!();
    if result.success {
        println!("✓ Success");
    } else {
        println!("✗ Failed");
        if let Some(ref error) = result.error {
            println!("  Error: {}", error);
        }
    }
    if let Some(ref text) = result.final_result {
        println!("  Result: {}", text);
    }
    println!("  Steps: {}", result.steps_executed);
    println!("  Actions: {}", result.actions_executed);
    println!("  Duration: {}ms", result.duration_ms);
}
