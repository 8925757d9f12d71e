//! `botbox` application entry point.
//!
//! This binary supervises user scripts running inside a proot guest. It uses
//! `eyre` for opaque error handling at the application boundary, converting
//! domain-specific errors into human-readable reports.
//!
//! Configuration is loaded with layered precedence via `OrthoConfig`:
//! 1. Application defaults
//! 2. Configuration file (`~/.config/botbox/config.toml` or path from `BOTBOX_CONFIG_PATH`)
//! 3. Environment variables (`BOTBOX_*`)
//! 4. Command-line arguments
//!
//! Logs go to stderr; stdout carries command output and, for `serve` and
//! `run`, host effects as JSON lines.

use std::process::ExitCode;

use botbox::api::{self, CommandOutcome, StatusReport};
use botbox::config::{AppConfig, Cli, Commands, load_config};
use botbox::environment::Readiness;
use botbox::error::Result as BotboxResult;
use clap::Parser;
use eyre::{Report, Result as EyreResult};
use tokio::io::BufReader;

/// Application entry point.
///
/// Loads configuration, installs the tracing subscriber and dispatches to
/// the subcommand handler.
#[tokio::main]
async fn main() -> EyreResult<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli).map_err(Report::from)?;
    init_tracing(config.log_filter.as_deref());

    let outcome = run(&cli, &config).await.map_err(Report::from)?;
    Ok(match outcome {
        CommandOutcome::Success => ExitCode::SUCCESS,
        CommandOutcome::CommandExit { code } => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    })
}

/// Install a stderr subscriber. `RUST_LOG` wins over the configured filter.
fn init_tracing(configured: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(configured.unwrap_or("botbox=info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Execute the CLI command, returning domain-specific errors.
///
/// Keeps semantic errors inside the run loop so the CLI boundary owns
/// conversion to `eyre::Report`.
async fn run(cli: &Cli, config: &AppConfig) -> BotboxResult<CommandOutcome> {
    match &cli.command {
        Commands::Provision => {
            let readiness = api::provision(config).await?;
            print_readiness(&readiness);
            Ok(CommandOutcome::Success)
        }
        Commands::Reset => api::reset(config).await,
        Commands::Status => {
            print_status(&api::status(config)?);
            Ok(CommandOutcome::Success)
        }
        Commands::Run(args) => api::run_bot(config, &args.bot).await,
        Commands::Serve => {
            let input = BufReader::new(tokio::io::stdin());
            let shutdown = async {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %error, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            let summary = api::serve(config, input, shutdown).await?;
            tracing::info!(?summary, "serve finished");
            Ok(CommandOutcome::Success)
        }
        Commands::Stop(args) => api::stop(config, &args.bot, args.pause).await,
    }
}

#[expect(clippy::print_stdout, reason = "CLI output is the intended behaviour")]
fn print_readiness(readiness: &Readiness) {
    println!("guest: {:?}", readiness.provision);
    println!("runtime: {:?}", readiness.runtime);
}

#[expect(clippy::print_stdout, reason = "CLI output is the intended behaviour")]
fn print_status(report: &StatusReport) {
    let state = if report.provisioned { "ready" } else { "not provisioned" };
    println!("guest {}: {state}", report.guest_root);
    for bot in &report.bots {
        let workspace = bot
            .workspace
            .as_ref()
            .map_or("missing", |path| path.as_str());
        println!(
            "{:<20} {:<10} enabled={:<5} auto_start={:<5} workspace={workspace}",
            bot.tenant.id,
            bot.tenant.language.interpreter(),
            bot.tenant.enabled,
            bot.tenant.auto_start,
        );
    }
}
