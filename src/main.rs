use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use relay_engine::app::{AppConfig, AppState};
use relay_engine::channels::{BatchImportMode, ChannelStore};
use relay_engine::cli::{Cli, Commands};
use relay_engine::monitor::{LogNotifier, SweepScope};
use relay_engine::server;

fn init_logging(config: &AppConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::from_default_env().add_directive(
        format!("relay_engine={}", level)
            .parse()
            .with_context(|| format!("invalid log level: {}", level))?,
    );

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relay-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

/// The database may still be coming up when the service starts.
async fn warm_channel_cache(store: &ChannelStore) -> Result<usize> {
    let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(5);
    let count = Retry::spawn(strategy, || async {
        store.refresh().await.map_err(|e| {
            warn!("Channel cache load failed, retrying: {}", e);
            e
        })
    })
    .await
    .context("failed to load channels")?;
    Ok(count)
}

async fn serve(state: AppState, signals: tokio::sync::mpsc::Receiver<relay_engine::monitor::HealthSignal>) -> Result<()> {
    let config = Arc::clone(&state.config);

    Arc::clone(&state.monitor).spawn_worker(signals);
    Arc::clone(&state.store).spawn_sync(Duration::from_secs(config.relay.channel_sync_interval_secs.max(1)));
    if let Some(minutes) = config.health.auto_test_interval_minutes.filter(|m| *m > 0) {
        Arc::clone(&state.tester).spawn_periodic(Duration::from_secs(minutes * 60));
    }
    if config.tasks.poll_interval_secs > 0 {
        Arc::clone(&state.poller).spawn(Duration::from_secs(config.tasks.poll_interval_secs));
    }

    server::serve(state).await.context("server failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .await
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
    let _log_guard = init_logging(&config, cli.debug)?;

    info!("Starting relay-engine {}", env!("CARGO_PKG_VERSION"));

    let (state, signals, _database) = AppState::initialize(config, Arc::new(LogNotifier)).await?;
    let channels = warm_channel_cache(&state.store).await?;
    info!("Loaded {} channels", channels);

    match cli.command() {
        Commands::Serve => serve(state, signals).await,
        Commands::TestChannels { scope } => {
            let scope: SweepScope = scope.parse()?;
            Arc::clone(&state.monitor).spawn_worker(signals);
            let sweep = state.tester.start_sweep(scope, false)?;
            sweep.await.context("channel sweep aborted")?;
            Ok(())
        }
        Commands::ImportKeys { channel, file, mode } => {
            let mode: BatchImportMode = mode.parse()?;
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {:?}", file))?;
            let updated = state.keys.import_keys(channel, &raw, mode).await?;
            let key_count = updated.multi_key.as_ref().map(|info| info.key_count).unwrap_or(1);
            info!("Channel {} now has {} keys", channel, key_count);
            println!("Imported keys into channel {} ({} total)", channel, key_count);
            Ok(())
        }
    }
}
