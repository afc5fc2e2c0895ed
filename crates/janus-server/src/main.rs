// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! Janus supervisor binary.
//!
//! Loads configuration, builds one gateway per configured port sharing a
//! single process-wide request limit, runs them all concurrently, and tears
//! everything down on SIGINT or on the first gateway failure. Shutdown is
//! two-phase: the trigger fires, a one second grace period lets in-flight
//! flushes quiesce, then the gateway scope is cancelled.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use janus_gateway::{Gateway, RequestLimit};

mod config;
use config::Config;

/// Delay between the shutdown trigger and cancelling the gateway scope.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(
    name = "janus-server",
    version,
    about = "UDP-to-HTTP line telemetry forwarding gateway"
)]
struct Cli {
    /// Configuration files to load in order; `-` or no arguments reads one
    /// configuration from standard input.
    #[arg(value_name = "CONFIG")]
    configs: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    if cli.configs.is_empty() || cli.configs.iter().any(|path| path == "-") {
        info!("reading config from standard input...");
    }

    let config = match Config::load(&cli.configs) {
        Ok(config) => config,
        Err(err) => {
            error!("unable to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if config.ports.is_empty() {
        error!("configuration defines no ports");
        return ExitCode::FAILURE;
    }

    run(config).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("JANUS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run(config: Config) -> ExitCode {
    let limit = RequestLimit::new(config.max_requests);
    let scope = CancellationToken::new();
    let shutdown = CancellationToken::new();

    let mut gateways = Vec::with_capacity(config.ports.len());
    for port in &config.ports {
        match Gateway::new(port, limit.clone()) {
            Ok(gateway) => gateways.push(gateway),
            Err(err) => {
                error!("error configuring gateway: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    // Shutdown trigger: wait out the grace period before cancelling the
    // gateway scope so in-flight flushes can quiesce.
    {
        let shutdown = shutdown.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            scope.cancel();
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt signal: shutting down");
                shutdown.cancel();
            }
        });
    }

    info!("started");

    let mut running = JoinSet::new();
    for gateway in gateways {
        let scope = scope.clone();
        running.spawn(async move {
            let id = gateway.to_string();
            info!("starting gateway {id}");
            let result = gateway.start(&scope).await;
            (id, result)
        });
    }

    // Any gateway failing non-cleanly takes the whole process down; running
    // with partial capacity would silently drop traffic.
    let mut failed = false;
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((id, Ok(()))) => info!("gateway {id} closed"),
            Ok((id, Err(err))) => {
                error!("gateway {id} failed: {err}");
                failed = true;
                shutdown.cancel();
            }
            Err(join_error) => {
                error!("gateway task failed: {join_error}");
                failed = true;
                shutdown.cancel();
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
