use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use mahavishnu_cli::{config, dlq_cmd, plan_cmds, serve_cmd};

#[derive(Parser)]
#[command(name = "mahavishnu", about = "Multi-pool workflow orchestration control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a mahavishnu config file (no running gateway required)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Boot the subscription gateway
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
        /// Pre-load this scenario file's tasks and pools on startup
        #[arg(long)]
        scenario: Option<PathBuf>,
    },
    /// Scenario plan inspection and local simulation
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Dead-letter queue simulation
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Print a shell completion script to stdout
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Parse and validate a scenario file, printing a summary
    Validate { file: PathBuf },
    /// Simulate running a scenario file to completion
    Run {
        file: PathBuf,
        #[arg(long)]
        strategy: Option<String>,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// Replay a scripted dead-letter scenario and print the outcome
    Simulate { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => cmd_init(force)?,
        Commands::Serve { bind, port, scenario } => {
            serve_cmd::run(&bind, port, scenario.as_deref()).await?;
        }
        Commands::Plan { command } => match command {
            PlanCommands::Validate { file } => {
                let now = Utc::now();
                let resolved = plan_cmds::load_and_resolve(&file, now)?;
                print!("{}", plan_cmds::validate_report(&resolved, now)?);
            }
            PlanCommands::Run { file, strategy } => {
                let now = Utc::now();
                let mut resolved = plan_cmds::load_and_resolve(&file, now)?;
                if let Some(strategy) = strategy {
                    resolved.strategy = strategy
                        .parse()
                        .with_context(|| format!("unrecognized ordering strategy {strategy:?}"))?;
                }
                let report = plan_cmds::run(&resolved, now)?;
                for (i, step) in report.steps.iter().enumerate() {
                    match &step.worker {
                        Some((pool, worker)) => println!("{}. {} (pool={pool}, worker={worker})", i + 1, step.task_name),
                        None => println!("{}. {}", i + 1, step.task_name),
                    }
                }
                println!(
                    "estimated completion: {:.1}s",
                    report.initial_ordering.estimated_completion_secs
                );
            }
        },
        Commands::Dlq { command } => match command {
            DlqCommands::Simulate { file } => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read dlq scenario file at {}", file.display()))?;
                let scenario = dlq_cmd::parse_dlq_scenario(&content)?;
                let (outcomes, stats) = dlq_cmd::simulate(&scenario).await?;
                for outcome in &outcomes {
                    println!("{}: {} after {} attempt(s)", outcome.task, outcome.final_status, outcome.attempts);
                }
                println!(
                    "lifetime: enqueued={} succeeded={} failed={} exhausted={} archived={}",
                    stats.lifetime_enqueued,
                    stats.lifetime_retried_success,
                    stats.lifetime_retried_failed,
                    stats.lifetime_exhausted,
                    stats.lifetime_archived,
                );
            }
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }

    Ok(())
}

fn cmd_init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let signing_secret = config::generate_signing_secret();
    let cfg = config::ConfigFile {
        control_plane: mahavishnu_core::Config::default(),
        gateway: config::GatewaySection {
            signing_secret: signing_secret.clone(),
            bind_addr: "127.0.0.1:8787".to_string(),
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  gateway.bind_addr = {}", cfg.gateway.bind_addr);
    println!("  gateway.signing_secret = {}...{}", &signing_secret[..8], &signing_secret[56..]);
    println!();
    println!("Next: run `mahavishnu serve` to start the gateway.");
    Ok(())
}
