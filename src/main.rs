// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod build;
mod cli;
mod output;
mod toolcmd;

use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use cli::{Cli, Commands};
use output::{write_stderr, EXIT_VALIDATION_ERROR};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match iteratr_config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            write_stderr(&format!("[iteratr:error] {e:#}"));
            std::process::exit(EXIT_VALIDATION_ERROR);
        }
    };

    let exit_code = match cli.command {
        Commands::Build {
            session,
            spec,
            iterations,
            model,
            auto_commit,
            reset,
            dry_run,
            vars,
            extra,
        } => {
            build::run_build(build::BuildArgs {
                config,
                session,
                spec,
                iterations,
                model,
                auto_commit,
                reset,
                dry_run,
                vars,
                extra,
            })
            .await
        }
        Commands::Spec => build::scaffold_spec(&config),
        Commands::Doctor => build::run_doctor(&config).await,
        Commands::GenTemplate => build::gen_template(),
        Commands::Config => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            0
        }
        Commands::Tool { command } => toolcmd::run_tool(command, &config).await,
    };

    std::process::exit(exit_code)
}

/// ITERATR_LOG_LEVEL seeds the filter (debug|info|warn|error); the -v count
/// is the fallback.  ITERATR_LOG_FILE redirects the sink to a file, which is
/// the only safe choice when a TUI owns the terminal.
fn init_logging(verbose: u8) {
    let level = std::env::var("ITERATR_LOG_LEVEL").ok().unwrap_or_else(|| {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
        .to_string()
    });
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn"));

    if let Ok(path) = std::env::var("ITERATR_LOG_FILE") {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(file)
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("[iteratr:warn] cannot open ITERATR_LOG_FILE {path}: {e}"),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
