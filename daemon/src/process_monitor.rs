use std::collections::HashSet;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::event::{CreationNotification, NotificationBatch};
use crate::subscription::{EventBackend, Step};

/// Detects process creation by diffing the OS process list every `within`.
///
/// The first scan (taken while connecting) is the baseline and produces no
/// notifications. Every later scan delivers the pids that were not present in
/// the previous scan as one batch, ordered by pid.
///
/// Works on every platform `sysinfo` supports; used when WMI is unavailable
/// or not selected.
pub struct PollingBackend {
    within: Duration,
    pending_tx: Option<mpsc::Sender<NotificationBatch>>,
    sys: Option<System>,
    known: HashSet<u32>,
    stub: Option<mpsc::Sender<NotificationBatch>>,
    poller: Option<Poller>,
}

/// The scanning thread and the channel that stops it.
struct Poller {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<System>,
}

impl PollingBackend {
    pub fn new(within: Duration, tx: mpsc::Sender<NotificationBatch>) -> Self {
        Self {
            within,
            pending_tx: Some(tx),
            sys: None,
            known: HashSet::new(),
            stub: None,
            poller: None,
        }
    }
}

impl EventBackend for PollingBackend {
    fn acquire(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Runtime => {
                self.sys = Some(System::new());
            }
            // The process table needs no locator or connection security.
            Step::Locator | Step::Security => {}
            Step::Connection => {
                let sys = self.sys.as_mut().context("runtime not initialized")?;
                refresh(sys);
                if sys.processes().is_empty() {
                    bail!("process table is empty or unreadable");
                }
                self.known = pid_set(sys);
                debug!(baseline = self.known.len(), "process table baseline taken");
            }
            Step::Stub => {
                self.stub = Some(
                    self.pending_tx
                        .take()
                        .context("notification channel already consumed")?,
                );
            }
            Step::Subscription => {
                let sys = self.sys.take().context("runtime not initialized")?;
                let tx = self.stub.clone().context("no notification stub")?;
                let known = std::mem::take(&mut self.known);
                let within = self.within;
                let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
                let thread = std::thread::Builder::new()
                    .name("process-poll".into())
                    .spawn(move || poll_loop(sys, known, within, tx, stop_rx))
                    .context("failed to spawn polling thread")?;
                self.poller = Some(Poller { stop_tx, thread });
            }
        }
        Ok(())
    }

    fn release(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Subscription => {
                let poller = self.poller.take().context("not subscribed")?;
                drop(poller.stop_tx);
                let sys = poller
                    .thread
                    .join()
                    .map_err(|_| anyhow!("polling thread panicked"))?;
                self.sys = Some(sys);
            }
            Step::Stub => self.stub = None,
            Step::Connection => self.known.clear(),
            Step::Locator | Step::Security => {}
            Step::Runtime => self.sys = None,
        }
        Ok(())
    }
}

/// Refreshes the process table. Threads (Linux tasks) are not listed.
fn refresh(sys: &mut System) {
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().without_tasks(),
    );
}

/// Pids of real processes; thread entries are left out.
fn pid_set(sys: &System) -> HashSet<u32> {
    sys.processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none())
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Pids in `current` that are not in `known`, sorted.
pub fn new_pids(known: &HashSet<u32>, current: &HashSet<u32>) -> Vec<u32> {
    let mut fresh: Vec<u32> = current.difference(known).copied().collect();
    fresh.sort_unstable();
    fresh
}

/// Scans every `within` until `stop_rx` is dropped or the receiver goes away.
/// Hands the `System` back so the runtime step can release it.
fn poll_loop(
    mut sys: System,
    mut known: HashSet<u32>,
    within: Duration,
    tx: mpsc::Sender<NotificationBatch>,
    stop_rx: std_mpsc::Receiver<()>,
) -> System {
    loop {
        match stop_rx.recv_timeout(within) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }

        refresh(&mut sys);
        let current = pid_set(&sys);
        let fresh = new_pids(&known, &current);
        known = current;
        trace!(new = fresh.len(), "process table scanned");

        if fresh.is_empty() {
            continue;
        }
        let batch = fresh.into_iter().map(CreationNotification::new).collect();
        if tx.blocking_send(batch).is_err() {
            break;
        }
    }
    sys
}
