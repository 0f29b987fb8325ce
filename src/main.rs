//! ktls-bench: compare user-space TLS, kernel TLS offload and zero-copy
//! strategies for sending one file over TCP, verifying every copy

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ktls_bench::cli::{Cli, Command};
use ktls_bench::config::BenchConfig;
use ktls_bench::harness;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ktls_bench=debug"
    } else {
        "ktls_bench=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("installing Ctrl-C handler")?;

    let mut cfg = match &cli.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };
    cli.command.opts().apply(&mut cfg);

    let ok = match &cli.command {
        Command::Run(_) => {
            let run = harness::run_local(&cfg)?;
            info!(
                server_passed = run.server.passed(),
                client_passed = run.client.passed(),
                rounds = cfg.rounds,
                "local run finished"
            );
            run.is_success()
        }
        Command::Serve(_) => harness::serve(&cfg)?.is_success(),
        Command::Fetch(_) => harness::fetch(&cfg)?.is_success(),
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
