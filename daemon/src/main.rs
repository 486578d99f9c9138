mod classifier;
mod config;
mod document;
mod event;
mod inspector;
mod paths;
mod process_monitor;
mod shutdown;
mod sink;
mod subscription;
#[cfg(windows)]
mod wmi;

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{MonitorConfig, SourceKind};
use crate::event::NotificationBatch;
use crate::inspector::{OsProcesses, ProcessSource};
use crate::process_monitor::PollingBackend;
use crate::shutdown::ShutdownSignal;
use crate::sink::{EventSink, SinkWorker};
use crate::subscription::{EventBackend, SubscriptionManager};

/// Environment variable overriding the configured log filter.
const LOG_ENV_VAR: &str = "PROCWATCH_LOG";
const NOTIFICATION_QUEUE_DEPTH: usize = 32;

#[tokio::main]
async fn main() {
    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let (config, config_error) = match config::load_or_default(&config_path) {
        Ok(c) => (c, None),
        Err(e) => (config::Config::default(), Some(e)),
    };

    // ── Logging ───────────────────────────────────────────────────────────────
    if let Err(e) = init_logging(&config.log.filter) {
        eprintln!("[log] Failed to initialize logging: {e:#}");
    }
    if let Some(e) = config_error {
        warn!("config error (using defaults): {e:#}");
    }

    // ── Termination handlers, before anything is acquired ────────────────────
    let shutdown = ShutdownSignal::new();
    if let Err(e) = shutdown.install() {
        error!("Failed to register termination handlers: {e}");
        std::process::exit(1);
    }

    info!("procwatch v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event sink ────────────────────────────────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel::<NotificationBatch>(NOTIFICATION_QUEUE_DEPTH);
    let sink = EventSink::new(OsProcesses::new(), paths::output_file_path());
    let worker = SinkWorker::start(sink, event_rx);

    // ── Subscription ──────────────────────────────────────────────────────────
    let subscription = match make_backend(&config.monitor, event_tx)
        .map_err(|e| e.to_string())
        .and_then(|backend| SubscriptionManager::start(backend).map_err(|e| e.to_string()))
    {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            let _ = worker.drain().await;
            std::process::exit(1);
        }
    };

    info!("Listening for new processes...");
    let sink = run(
        subscription,
        worker,
        &shutdown,
        config.monitor.shutdown_poll_interval(),
    )
    .await;
    drop(sink);

    info!("Program terminated.");
}

/// Waits for a shutdown request, then tears the subscription down and drains
/// the sink. The sink is handed back so it is released last.
async fn run<S>(
    mut subscription: SubscriptionManager,
    worker: SinkWorker<S>,
    shutdown: &ShutdownSignal,
    poll: Duration,
) -> Option<EventSink<S>>
where
    S: ProcessSource + Send + 'static,
    S::Handle: 'static,
{
    shutdown.wait(poll).await;
    info!(
        reason = shutdown.reason().unwrap_or("unknown"),
        "shutting down"
    );

    // Teardown stays on this thread: COM must be uninitialized on the thread
    // that initialized it. The blocking part is joining the polling thread,
    // which wakes as soon as its stop channel is dropped.
    let failures = subscription.teardown();
    if failures > 0 {
        warn!(failures, "teardown finished with errors");
    }
    drop(subscription);

    worker.drain().await
}

fn make_backend(
    monitor: &MonitorConfig,
    tx: mpsc::Sender<NotificationBatch>,
) -> Result<Box<dyn EventBackend>> {
    let within = monitor.within();
    match monitor.effective_source() {
        SourceKind::Poll | SourceKind::Auto => Ok(Box::new(PollingBackend::new(within, tx))),
        #[cfg(windows)]
        SourceKind::Wmi => Ok(Box::new(wmi::WmiBackend::new(within, tx))),
        #[cfg(not(windows))]
        SourceKind::Wmi => anyhow::bail!("the WMI event source is only available on Windows"),
    }
}

/// Installs a stderr `fmt` subscriber. `PROCWATCH_LOG` wins over `default_filter`.
fn init_logging(default_filter: &str) -> Result<()> {
    let filter = match std::env::var(LOG_ENV_VAR) {
        Ok(v) if !v.trim().is_empty() => EnvFilter::try_new(v)?,
        _ => EnvFilter::try_new(default_filter)?,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}
