/// The event sink: turns notification batches into records and keeps
/// `apps.json` in step with everything seen so far.
///
/// A [`SinkWorker`] owns the sink on its own task and feeds it batches from the
/// notification channel one at a time, so `indicate` never runs concurrently
/// with itself.
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::{self, Classification};
use crate::document::{self, ProcessRecord, ProcessSnapshot};
use crate::event::{CreationNotification, NotificationBatch};
use crate::inspector::{self, InspectError, ProcessHandle, ProcessSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    ProcessingBatch,
}

/// Outcome of one `indicate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    /// Notifications that produced a record.
    pub recorded: usize,
    /// Notifications dropped during inspection.
    pub skipped: usize,
    /// Whether the document write succeeded.
    pub written: bool,
}

pub type Classifier<H> = fn(&H, &Path) -> Classification;

pub struct EventSink<S: ProcessSource> {
    source: S,
    classifier: Classifier<S::Handle>,
    snapshot: ProcessSnapshot,
    output: PathBuf,
    state: SinkState,
}

impl<S: ProcessSource> EventSink<S> {
    /// Creates a sink that inspects processes through `source` and writes to `output`.
    pub fn new(source: S, output: PathBuf) -> Self {
        Self {
            source,
            classifier: classifier::classify::<S::Handle>,
            snapshot: ProcessSnapshot::new(),
            output,
            state: SinkState::Idle,
        }
    }

    /// Replaces the classification step.
    #[cfg(test)]
    pub fn with_classifier(mut self, classifier: Classifier<S::Handle>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn snapshot(&self) -> &ProcessSnapshot {
        &self.snapshot
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Processes one batch in order, then rewrites the whole document.
    ///
    /// Per-notification failures skip that notification only; a failed write
    /// is logged and the snapshot keeps the batch for the next write. There is
    /// no failure for the caller to handle.
    pub fn indicate(&mut self, batch: &[CreationNotification]) -> BatchReport {
        self.state = SinkState::ProcessingBatch;
        debug!(count = batch.len(), "event batch received");

        let mut report = BatchReport::default();
        for notification in batch {
            match self.record(notification.pid) {
                Ok(record) => {
                    info!(
                        pid = record.pid,
                        name = %record.name,
                        gui = record.is_gui,
                        service = record.is_service,
                        "new process detected"
                    );
                    self.snapshot.insert(record);
                    report.recorded += 1;
                }
                Err(err @ InspectError::PathUnavailable { .. }) => {
                    warn!("{err}");
                    report.skipped += 1;
                }
                Err(err) => {
                    debug!("{err}");
                    report.skipped += 1;
                }
            }
        }

        match document::write_document(&self.output, &self.snapshot) {
            Ok(()) => report.written = true,
            Err(e) => error!("failed to write {}: {e}", self.output.display()),
        }

        self.state = SinkState::Idle;
        report
    }

    /// Inspects and classifies `pid`. The process handle is closed before this returns.
    fn record(&mut self, pid: u32) -> Result<ProcessRecord, InspectError> {
        let inspected = inspector::inspect(&mut self.source, pid)?;
        let Classification { is_gui, is_service } =
            (self.classifier)(&inspected.handle, &inspected.path);
        Ok(ProcessRecord {
            pid: inspected.handle.pid(),
            name: inspected.path.to_string_lossy().into_owned(),
            is_gui,
            is_service,
        })
    }
}

/// Runs an [`EventSink`] on a dedicated task fed by the notification channel.
pub struct SinkWorker<S: ProcessSource> {
    /// Setting this to `true` asks the worker to drain and stop.
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<EventSink<S>>,
}

impl<S> SinkWorker<S>
where
    S: ProcessSource + Send + 'static,
    S::Handle: 'static,
{
    pub fn start(sink: EventSink<S>, rx: mpsc::Receiver<NotificationBatch>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(sink, rx, stop_rx));
        SinkWorker { stop_tx, handle }
    }

    /// Stops accepting batches, processes every batch already queued, and
    /// hands the sink back. Returns `None` if the worker task panicked.
    pub async fn drain(self) -> Option<EventSink<S>> {
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(sink) => Some(sink),
            Err(e) => {
                error!("event sink worker failed: {e}");
                None
            }
        }
    }
}

async fn run_worker<S: ProcessSource>(
    mut sink: EventSink<S>,
    mut rx: mpsc::Receiver<NotificationBatch>,
    mut stop_rx: watch::Receiver<bool>,
) -> EventSink<S> {
    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                handle_batch(&mut sink, &batch);
            }
            _ = stop_rx.changed() => {
                rx.close();
                while let Some(batch) = rx.recv().await {
                    handle_batch(&mut sink, &batch);
                }
                break;
            }
        }
    }
    if sink.snapshot().is_empty() {
        debug!("event sink worker stopped with no records");
    } else {
        debug!(records = sink.snapshot().len(), "event sink worker stopped");
    }
    sink
}

fn handle_batch<S: ProcessSource>(sink: &mut EventSink<S>, batch: &[CreationNotification]) {
    let report = sink.indicate(batch);
    debug!(
        recorded = report.recorded,
        skipped = report.skipped,
        written = report.written,
        state = ?sink.state(),
        "batch processed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::fake::{FakeHandle, FakeProcess, FakeProcesses};

    fn gui_classifier(_: &FakeHandle, _: &Path) -> Classification {
        Classification {
            is_gui: true,
            is_service: false,
        }
    }

    fn batch(pids: &[u32]) -> Vec<CreationNotification> {
        pids.iter().copied().map(CreationNotification::new).collect()
    }

    fn read_doc(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn sink_in(dir: &Path, source: FakeProcesses) -> EventSink<FakeProcesses> {
        EventSink::new(source, dir.join("apps.json"))
    }

    // ── indicate ──────────────────────────────────────────────────────────────

    #[test]
    fn exited_process_is_dropped_and_valid_one_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeProcesses::default()
            .running(100, "C:\\a.exe", 1)
            .with(200, FakeProcess::Exited);
        let mut sink = sink_in(dir.path(), source).with_classifier(gui_classifier);

        let report = sink.indicate(&batch(&[100, 200]));
        assert_eq!(
            report,
            BatchReport {
                recorded: 1,
                skipped: 1,
                written: true
            }
        );

        assert_eq!(
            read_doc(&dir.path().join("apps.json")),
            serde_json::json!({
                "apps": {
                    "100": { "pid": 100, "name": "C:\\a.exe", "GUI": true, "service": false }
                }
            })
        );
    }

    #[test]
    fn denied_process_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeProcesses::default()
            .with(1, FakeProcess::Denied)
            .running(2, "/bin/two", 1)
            .with(3, FakeProcess::NoPath)
            .running(4, "/bin/four", 1);
        let mut sink = sink_in(dir.path(), source);

        let report = sink.indicate(&batch(&[1, 2, 3, 4]));
        assert_eq!(report.recorded, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(sink.source().opened, vec![1, 2, 3, 4]);

        let doc = read_doc(&dir.path().join("apps.json"));
        let apps = doc["apps"].as_object().unwrap();
        assert_eq!(apps.len(), 2);
        assert!(apps.contains_key("2"));
        assert!(apps.contains_key("4"));
        assert!(!apps.contains_key("1"));
    }

    #[test]
    fn later_batch_overwrites_same_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink_in(dir.path(), FakeProcesses::default().running(100, "C:\\old.exe", 1));
        sink.indicate(&batch(&[100]));

        sink.source.table.insert(
            100,
            FakeProcess::Running {
                path: PathBuf::from("C:\\new.exe"),
                session: Some(1),
            },
        );
        sink.indicate(&batch(&[100]));

        let doc = read_doc(&dir.path().join("apps.json"));
        let apps = doc["apps"].as_object().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps["100"]["name"], "C:\\new.exe");
    }

    #[test]
    fn duplicate_pid_within_one_batch_keeps_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink_in(dir.path(), FakeProcesses::default().running(5, "/bin/five", 1));
        let report = sink.indicate(&batch(&[5, 5]));
        assert_eq!(report.recorded, 2);
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[test]
    fn empty_batch_rewrites_unchanged_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        let mut sink = sink_in(dir.path(), FakeProcesses::default().running(9, "/bin/nine", 1));
        sink.indicate(&batch(&[9]));
        let before = std::fs::read_to_string(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        let report = sink.indicate(&[]);
        assert_eq!(
            report,
            BatchReport {
                recorded: 0,
                skipped: 0,
                written: true
            }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[test]
    fn empty_first_batch_writes_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink_in(dir.path(), FakeProcesses::default());
        sink.indicate(&[]);
        assert_eq!(
            read_doc(&dir.path().join("apps.json")),
            serde_json::json!({ "apps": {} })
        );
    }

    #[test]
    fn write_failure_keeps_snapshot_for_next_batch() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        let source = FakeProcesses::default()
            .running(1, "/bin/one", 1)
            .running(2, "/bin/two", 1);
        let mut sink = EventSink::new(source, out_dir.join("apps.json"));

        let report = sink.indicate(&batch(&[1]));
        assert!(!report.written);
        assert_eq!(report.recorded, 1);
        assert_eq!(sink.state(), SinkState::Idle);

        std::fs::create_dir(&out_dir).unwrap();
        assert!(sink.indicate(&batch(&[2])).written);

        let doc = read_doc(&out_dir.join("apps.json"));
        let apps = doc["apps"].as_object().unwrap();
        assert!(apps.contains_key("1"));
        assert!(apps.contains_key("2"));
    }

    #[test]
    fn handles_are_released_after_each_batch() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeProcesses::default()
            .running(1, "/bin/one", 1)
            .with(2, FakeProcess::Exited)
            .with(3, FakeProcess::NoPath);
        let mut sink = sink_in(dir.path(), source);
        sink.indicate(&batch(&[1, 2, 3]));
        assert_eq!(sink.source().live_handles(), 0);
    }

    #[test]
    fn sink_is_idle_outside_indicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink_in(dir.path(), FakeProcesses::default());
        assert_eq!(sink.state(), SinkState::Idle);
        sink.indicate(&batch(&[1]));
        assert_eq!(sink.state(), SinkState::Idle);
    }

    #[test]
    fn flags_match_classifier_output_for_real_images() {
        let dir = tempfile::tempdir().unwrap();
        // Not a PE image, so GUI detection degrades to false.
        let image = dir.path().join("tool");
        std::fs::write(&image, b"#!/bin/sh\n").unwrap();
        let source = FakeProcesses::default()
            .running(30, image.to_str().unwrap(), 0)
            .running(31, image.to_str().unwrap(), 1);
        let mut sink = sink_in(dir.path(), source);
        sink.indicate(&batch(&[30, 31]));

        let doc = read_doc(&dir.path().join("apps.json"));
        assert_eq!(doc["apps"]["30"]["service"], true);
        assert_eq!(doc["apps"]["30"]["GUI"], false);
        assert_eq!(doc["apps"]["31"]["service"], false);
        assert_eq!(doc["apps"]["31"]["GUI"], false);
    }

    // ── SinkWorker ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn worker_processes_batches_and_returns_sink_on_drain() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeProcesses::default()
            .running(1, "/bin/one", 1)
            .running(2, "/bin/two", 1);
        let (tx, rx) = mpsc::channel(8);
        let worker = SinkWorker::start(sink_in(dir.path(), source), rx);

        tx.send(batch(&[1])).await.unwrap();
        tx.send(batch(&[2])).await.unwrap();

        let sink = worker.drain().await.unwrap();
        assert_eq!(sink.snapshot().len(), 2);
        assert_eq!(sink.state(), SinkState::Idle);

        let doc = read_doc(&dir.path().join("apps.json"));
        assert_eq!(doc["apps"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn drain_rejects_batches_sent_afterwards() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let worker = SinkWorker::start(sink_in(dir.path(), FakeProcesses::default()), rx);
        let sink = worker.drain().await.unwrap();
        assert!(sink.snapshot().is_empty());
        assert!(tx.send(batch(&[1])).await.is_err());
    }

    #[tokio::test]
    async fn worker_stops_when_all_senders_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let worker = SinkWorker::start(
            sink_in(dir.path(), FakeProcesses::default().running(3, "/bin/three", 1)),
            rx,
        );
        tx.send(batch(&[3])).await.unwrap();
        drop(tx);
        let sink = worker.drain().await.unwrap();
        assert_eq!(sink.snapshot().get(3).unwrap().name, "/bin/three");
    }
}
