// Main CLI entrypoint
// (c) 2024 Ross Younger

use std::process::ExitCode;

use super::args::CliArgs;

use crate::{
    client::client_main,
    config::{Configuration, Manager},
    server::server_main,
    util::setup_tracing,
};
use anyhow::Context as _;
use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use tracing::info_span;

/// Main CLI entrypoint
pub fn cli() -> anyhow::Result<ExitCode> {
    let args = CliArgs::parse();
    if args.config_files {
        for f in Manager::config_files() {
            println!("{f}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut manager = Manager::new();
    manager.merge_provider(args.config.clone());
    if args.show_config {
        println!("{}", manager.to_display_adapter::<Configuration>(true));
        return Ok(ExitCode::SUCCESS);
    }
    let config = manager
        .get::<Configuration>()
        .context("invalid configuration")?;

    if args.server {
        return run_server(&args, &config);
    }
    run_client(&args, &config)
}

#[tokio::main(flavor = "current_thread")]
async fn run_client(args: &CliArgs, config: &Configuration) -> anyhow::Result<ExitCode> {
    let progress = if args.quiet || args.json {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new() // This writes to stderr
    };
    let trace_level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };
    setup_tracing(trace_level, Some(&progress), config.log_file())
        .inspect_err(|e| eprintln!("{e:?}"))?;

    client_main(args, config, &progress)
        .await
        .inspect_err(|e| tracing::error!("{e:#}"))
        .or_else(|_| Ok(false))
        .map(|success| {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        })
}

#[tokio::main]
async fn run_server(args: &CliArgs, config: &Configuration) -> anyhow::Result<ExitCode> {
    let trace_level = if args.debug { "debug" } else { "info" };
    setup_tracing(trace_level, None, config.log_file()).inspect_err(|e| eprintln!("{e:?}"))?;
    let _span = info_span!("SERVER").entered();

    server_main(config)
        .await
        .map(|()| ExitCode::SUCCESS)
        .inspect_err(|e| tracing::error!("{e:#}"))
}
