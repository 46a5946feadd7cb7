//! CLI entrypoint (§6).
//!
//! Shaped like `pageserver`'s binary: parse arguments, initialize logging,
//! build the typed config, wire up the long-lived pieces, then block on a
//! `signal_hook` listener the same way `pageserver::bin::pageserver` does,
//! translating SIGINT/SIGTERM into a graceful cancellation instead of an
//! immediate `process::exit`.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wal_relay::http;
use wal_relay::logging;
use wal_relay::metrics;
use wal_relay::settings::Settings;
use wal_relay::sink::{KinesisSink, Sink};
use wal_relay::supervisor::{self, LeaderState};

/// Postgres logical-replication-to-Kinesis relay.
///
/// All configuration is read from the environment (see README); this
/// binary takes no arguments beyond the standard `--help`/`--version`.
#[derive(Parser, Debug)]
#[command(name = "wal-relay", version, about)]
struct Cli {}

fn main() -> anyhow::Result<()> {
    let _cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            // Before logging is initialized, a plain stderr message is more
            // reliable than a tracing event that might not flush in time.
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    logging::init(&settings.log_level, settings.log_format)?;
    metrics::preinitialize();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    let signal_handle = std::thread::spawn(move || wait_for_shutdown_signal(signal_shutdown));

    let result = runtime.block_on(run(settings, shutdown));

    // The signal-listening thread blocks on `Signals::forever()`, which
    // only returns once a signal actually arrives; if the runtime exited
    // some other way (e.g. a fatal config error further down the line)
    // there is no clean way to unblock it, so it is left to die with the
    // process rather than joined.
    drop(signal_handle);

    if let Err(err) = &result {
        error!(error = %err, "wal-relay exiting with error");
    }
    result
}

async fn run(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let metrics_addr = settings
        .metrics_listen_addr
        .parse()
        .context("invalid METRICS_LISTEN_ADDR")?;

    let sink: Arc<dyn Sink> = Arc::new(build_kinesis_sink(&settings).await?);
    let leader_state = Arc::new(LeaderState::default());

    let http_shutdown = shutdown.clone();
    let http_leader_state = leader_state.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = http_shutdown.cancelled() => {}
            result = http::serve(metrics_addr, http_leader_state) => {
                if let Err(err) = result {
                    error!(error = %err, "metrics HTTP listener exited");
                }
            }
        }
    });

    supervisor::run(settings, sink, leader_state, shutdown).await
}

async fn build_kinesis_sink(settings: &Settings) -> anyhow::Result<KinesisSink> {
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(settings.aws_region.clone()))
        .load()
        .await;
    let client = aws_sdk_kinesis::Client::new(&aws_config);
    Ok(KinesisSink::new(client, settings.kinesis_stream.clone()))
}

/// Block the calling (non-async) thread until SIGINT/SIGTERM/SIGQUIT,
/// then cancel `shutdown`. SIGQUIT requests an immediate exit, matching
/// `pageserver`'s distinction between fast and immediate shutdown modes.
fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    use signal_hook::consts::*;

    let mut signals = match signal_hook::iterator::Signals::new([SIGINT, SIGTERM, SIGQUIT]) {
        Ok(signals) => signals,
        Err(err) => {
            error!(error = %err, "failed to install signal handler");
            return;
        }
    };

    if let Some(signal) = signals.forever().next() {
        match signal {
            SIGQUIT => {
                info!(signal, "received signal, terminating immediately");
                std::process::exit(111);
            }
            _ => {
                info!(signal, "received signal, shutting down gracefully");
                shutdown.cancel();
            }
        }
    }
}
