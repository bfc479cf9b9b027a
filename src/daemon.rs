//! Background daemon: watcher + scheduler + worker pool around one pipeline
//!
//! ```text
//!                  ┌──────────── scheduler thread ─────────────┐
//!                  │ reconcile / sweep    flush / evict / prune │
//!                  └──────┬─────────────────────────────────────┘
//! notify callback ──→ Offerer ──→ sync_channel(capacity) ──→ hookq-worker-0..N
//!                                                               │
//!                                                        Pipeline::process_file
//! ```
//!
//! Everything here is plain OS threads; the only async part of the binary is
//! the health server. `DaemonHandle::stop()` completes the shared
//! [`CompletionSignal`], which wakes backoff sleeps and scheduler ticks.

use crate::correlator::{Correlator, CorrelatorConfig};
use crate::health::HealthState;
use crate::pipeline::{CompletionSignal, InFlight, Pipeline, PipelineOptions};
use crate::queue::QueueLayout;
use crate::store::PersistenceAdapter;
use crate::util::lock;
use crate::watcher::{self, IncomingWatcher, Offerer};
use anyhow::Context;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often idle workers re-check the shutdown signal
const WORKER_POLL: Duration = Duration::from_millis(250);
/// Scheduler granularity; individual jobs run on their own intervals
const SCHEDULER_TICK: Duration = Duration::from_millis(500);
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub queue_root: PathBuf,
    pub workers: usize,
    /// Bound of the work channel; offers beyond it are dropped and re-offered
    /// by the next reconcile
    pub work_queue_capacity: usize,
    pub reconcile_interval: Duration,
    pub pipeline: PipelineOptions,
    pub correlator: CorrelatorConfig,
    /// Delete archived files older than this
    pub archive_max_age: Option<Duration>,
    /// Use OS notifications; false = reconcile polling only
    pub watch: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue_root: PathBuf::from("queue"),
            workers: 4,
            work_queue_capacity: 1024,
            reconcile_interval: Duration::from_secs(5),
            pipeline: PipelineOptions::default(),
            correlator: CorrelatorConfig::default(),
            archive_max_age: None,
            watch: true,
        }
    }
}

pub struct Daemon {
    config: DaemonConfig,
    store: Arc<dyn PersistenceAdapter>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, store: Arc<dyn PersistenceAdapter>) -> Self {
        Self { config, store }
    }

    /// Prepare the queue, recover leftovers from the last run and start all
    /// threads
    pub fn start(self) -> anyhow::Result<DaemonHandle> {
        let config = self.config;
        let layout = QueueLayout::new(&config.queue_root);
        layout
            .ensure()
            .with_context(|| format!("Failed to prepare queue at {}", layout.root().display()))?;

        let correlator = Arc::new(Correlator::new(self.store, config.correlator.clone()));
        if let Err(e) = correlator.recover_pending() {
            // Held envelopes load again the next time their session is touched
            tracing::warn!("Could not recover held envelopes: {}", e);
        }

        let pipeline = Arc::new(Pipeline::new(
            layout.clone(),
            correlator,
            config.pipeline.clone(),
        ));
        let health = HealthState::new(pipeline.clone());
        let shutdown = Arc::new(CompletionSignal::new());
        let in_flight = Arc::new(InFlight::new());

        // Claims abandoned by a previous run
        match pipeline.sweep_stale(&in_flight) {
            Ok(report) if report.recovered + report.dead_lettered > 0 => tracing::info!(
                "Startup sweep: {} recovered, {} dead-lettered",
                report.recovered,
                report.dead_lettered
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Startup sweep failed: {}", e),
        }

        let (tx, rx) = mpsc::sync_channel(config.work_queue_capacity.max(1));
        let offerer = Offerer::new(tx, in_flight.clone());
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::with_capacity(config.workers + 1);
        for id in 0..config.workers.max(1) {
            let worker = Worker {
                rx: rx.clone(),
                pipeline: pipeline.clone(),
                in_flight: in_flight.clone(),
                shutdown: shutdown.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("hookq-worker-{id}"))
                .spawn(move || worker.run())
                .context("Failed to spawn worker thread")?;
            threads.push(handle);
        }

        let watcher = if config.watch {
            match IncomingWatcher::start(&layout, offerer.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(
                        "File notifications unavailable ({}), polling every {:?}",
                        e,
                        config.reconcile_interval
                    );
                    None
                }
            }
        } else {
            None
        };

        // Anything that arrived while we were down
        if let Err(e) = watcher::reconcile(&layout, &offerer) {
            tracing::warn!("Initial reconcile failed: {}", e);
        }

        let scheduler = Scheduler {
            pipeline: pipeline.clone(),
            offerer,
            in_flight: in_flight.clone(),
            shutdown: shutdown.clone(),
            reconcile_interval: config.reconcile_interval,
            archive_max_age: config.archive_max_age,
        };
        threads.push(
            thread::Builder::new()
                .name("hookq-scheduler".into())
                .spawn(move || scheduler.run())
                .context("Failed to spawn scheduler thread")?,
        );

        tracing::info!(
            "Daemon started: {} worker(s), queue at {}",
            config.workers.max(1),
            layout.root().display()
        );

        Ok(DaemonHandle {
            watcher,
            shutdown,
            threads,
            pipeline,
            health,
        })
    }
}

/// Running daemon; stops on [`DaemonHandle::stop`] or drop
pub struct DaemonHandle {
    watcher: Option<IncomingWatcher>,
    shutdown: Arc<CompletionSignal>,
    threads: Vec<JoinHandle<()>>,
    pipeline: Arc<Pipeline>,
    health: HealthState,
}

impl DaemonHandle {
    pub fn health_state(&self) -> HealthState {
        self.health.clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Stop offering work, let workers finish their current attempt and join
    /// every thread. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        tracing::debug!("Stopping daemon...");
        self.watcher.take();
        self.shutdown.complete();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("hookq").to_string();
            if handle.join().is_err() {
                tracing::error!("Thread {} panicked", name);
            }
        }
        tracing::info!("Daemon stopped");
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    rx: Arc<Mutex<Receiver<String>>>,
    pipeline: Arc<Pipeline>,
    in_flight: Arc<InFlight>,
    shutdown: Arc<CompletionSignal>,
}

impl Worker {
    fn run(self) {
        while !self.shutdown.is_complete() {
            // Lock only for the receive; processing runs unlocked
            let next = lock(&self.rx).recv_timeout(WORKER_POLL);
            match next {
                Ok(name) => {
                    self.process(&name);
                    self.in_flight.remove(&name);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process(&self, name: &str) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pipeline.process_file(name, &self.shutdown)
        }));
        match result {
            Ok(Ok(outcome)) => tracing::trace!(file = name, "Outcome {:?}", outcome),
            Ok(Err(e)) => tracing::error!(file = name, "Queue error: {}", e),
            // Left in processing/; the stale sweep picks it up again
            Err(_) => tracing::error!(file = name, "Worker panicked while processing"),
        }
    }
}

struct Scheduler {
    pipeline: Arc<Pipeline>,
    offerer: Offerer,
    in_flight: Arc<InFlight>,
    shutdown: Arc<CompletionSignal>,
    reconcile_interval: Duration,
    archive_max_age: Option<Duration>,
}

impl Scheduler {
    fn run(self) {
        let mut next_reconcile = Instant::now() + self.reconcile_interval;
        let mut next_prune = Instant::now();

        while !self.shutdown.wait(SCHEDULER_TICK) {
            let now = Instant::now();

            if now >= next_reconcile {
                next_reconcile = now + self.reconcile_interval;
                if let Err(e) = self.pipeline.sweep_stale(&self.in_flight) {
                    tracing::warn!("Stale sweep failed: {}", e);
                }
                if let Err(e) = watcher::reconcile(self.pipeline.layout(), &self.offerer) {
                    tracing::warn!("Reconcile failed: {}", e);
                }
            }

            let correlator = self.pipeline.correlator();
            correlator.flush_expired();
            correlator.evict_idle(now);

            if let Some(max_age) = self.archive_max_age {
                if now >= next_prune {
                    next_prune = now + PRUNE_INTERVAL;
                    match self.pipeline.layout().prune_archive(max_age) {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Pruned {} archived file(s)", n),
                        Err(e) => tracing::warn!("Archive pruning failed: {}", e),
                    }
                }
            }
        }
        tracing::debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::*;
    use crate::queue::{QueueState, QueueWriter};
    use crate::store::testing::temp_store;
    use chrono::Utc;

    fn config(root: &std::path::Path, watch: bool) -> DaemonConfig {
        DaemonConfig {
            queue_root: root.to_path_buf(),
            workers: 2,
            work_queue_capacity: 16,
            reconcile_interval: Duration::from_millis(100),
            watch,
            ..Default::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn envelope(seq: u64, payload: EventPayload) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("evt-{seq}"),
            session_id: "D".to_string(),
            sequence_hint: seq,
            captured_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn test_start_stop_is_idempotent() {
        let (_db_dir, store) = temp_store();
        let dir = tempfile::tempdir().unwrap();
        let mut handle = Daemon::new(config(dir.path(), true), Arc::new(store))
            .start()
            .unwrap();

        for state in QueueState::ALL {
            assert!(dir.path().join(state.dir_name()).is_dir());
        }
        handle.stop();
        handle.stop();
    }

    #[test]
    fn test_processes_backlog_and_new_files() {
        let (_db_dir, store) = temp_store();
        let store = Arc::new(store);
        let dir = tempfile::tempdir().unwrap();
        let writer = QueueWriter::new(QueueLayout::new(dir.path())).unwrap();

        // Written before the daemon starts
        writer
            .write(&envelope(
                1,
                EventPayload::PromptSubmitted(PromptSubmitted {
                    prompt: "hello".to_string(),
                    context: SessionContext::default(),
                }),
            ))
            .unwrap();

        // Polling only, so the test does not depend on a notify backend
        let mut handle = Daemon::new(config(dir.path(), false), store.clone())
            .start()
            .unwrap();

        writer
            .write(&envelope(
                2,
                EventPayload::ResponseEmitted(ResponseEmitted {
                    text: Some("hi".to_string()),
                    ..Default::default()
                }),
            ))
            .unwrap();

        let layout = writer.layout().clone();
        assert!(wait_for(|| layout.list(QueueState::Archive).unwrap().len() == 2));
        handle.stop();

        let view = store.conversation("D").unwrap().unwrap();
        assert_eq!(view.exchanges.len(), 1);
        assert_eq!(view.exchanges[0].status, "closed");
        assert_eq!(handle.health_state().snapshot().pipeline.archived, 2);
    }
}
