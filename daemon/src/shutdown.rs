/// Process-wide shutdown request, set by OS termination notifications and
/// polled by the main loop.
///
/// Listeners only set the flag. Logging and teardown happen in the main loop
/// once [`ShutdownSignal::wait`] returns.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    /// Name of the notification that first requested shutdown.
    reason: Arc<OnceLock<&'static str>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: &'static str) {
        let _ = self.reason.set(reason);
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<&'static str> {
        self.reason.get().copied()
    }

    /// Registers listeners for every termination notification the platform
    /// delivers. Must be called from within the tokio runtime.
    pub fn install(&self) -> io::Result<()> {
        imp::install(self.clone())
    }

    /// Returns once shutdown has been requested, checking every `poll`.
    pub async fn wait(&self, poll: Duration) {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while !self.is_requested() {
            ticker.tick().await;
        }
    }
}

// ── Windows: console control events ───────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::io;
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_logoff, ctrl_shutdown};

    use super::ShutdownSignal;

    pub fn install(signal: ShutdownSignal) -> io::Result<()> {
        let mut c = ctrl_c()?;
        let mut brk = ctrl_break()?;
        let mut close = ctrl_close()?;
        let mut logoff = ctrl_logoff()?;
        let mut shutdown = ctrl_shutdown()?;
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = c.recv() => "ctrl-c",
                _ = brk.recv() => "ctrl-break",
                _ = close.recv() => "console close",
                _ = logoff.recv() => "logoff",
                _ = shutdown.recv() => "system shutdown",
            };
            signal.request(reason);
        });
        Ok(())
    }
}

// ── Unix: SIGINT / SIGTERM / SIGHUP ───────────────────────────────────────────

#[cfg(unix)]
mod imp {
    use std::io;
    use tokio::signal::unix::{signal, SignalKind};

    use super::ShutdownSignal;

    pub fn install(shutdown: ShutdownSignal) -> io::Result<()> {
        let mut int = signal(SignalKind::interrupt())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut hup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = term.recv() => "SIGTERM",
                _ = hup.recv() => "SIGHUP",
            };
            shutdown.request(reason);
        });
        Ok(())
    }
}
