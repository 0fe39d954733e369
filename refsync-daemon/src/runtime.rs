//! Daemon runtime: scheduled detection cycles, operator triggers, one
//! subscriber per consumer, and processing-record retention.
//!
//! Every long-running task shares one broadcast shutdown channel and sends on
//! it when it exits, so the failure of any task stops the daemon.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use refsync_broker::{Broker, MemoryBroker};
use refsync_core::config::{self, Config, LogFormat};
use refsync_core::{ConsumerId, Tier};
use refsync_sync::{
    CycleReport, CycleRunner, DetectMode, FileFingerprintStore, FingerprintStore, Publisher,
    SnapshotSource, SyncError,
};

use crate::alert::{AlertSink, LogAlertSink};
use crate::dlq::DeadLetterQueue;
use crate::error::{io_err, DaemonError};
use crate::paths::PRUNE_INTERVAL;
use crate::processing::{FileProcessingStore, MemoryProcessingStore, ProcessingStore};
use crate::subscriber::{ConsumerContext, Subscriber};
use crate::target::{Projection, Target};

/// One downstream consumer to run inside the daemon.
pub struct ConsumerSpec {
    pub id: ConsumerId,
    pub target: Arc<dyn Target>,
    pub projection: Arc<dyn Projection>,
    pub processing: Arc<dyn ProcessingStore>,
}

impl ConsumerSpec {
    pub fn new(
        id: impl Into<ConsumerId>,
        target: Arc<dyn Target>,
        projection: Arc<dyn Projection>,
        processing: Arc<dyn ProcessingStore>,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            projection,
            processing,
        }
    }

    /// Consumer with an in-memory processing store.
    pub fn in_memory(
        id: impl Into<ConsumerId>,
        target: Arc<dyn Target>,
        projection: Arc<dyn Projection>,
    ) -> Self {
        Self::new(id, target, projection, Arc::new(MemoryProcessingStore::new()))
    }

    /// Consumer whose processing records live under `home`.
    pub fn file_backed(
        home: &Path,
        id: impl Into<ConsumerId>,
        target: Arc<dyn Target>,
        projection: Arc<dyn Projection>,
    ) -> Result<Self, DaemonError> {
        let id = id.into();
        let processing = FileProcessingStore::open(home, &id)?;
        Ok(Self::new(id, target, projection, Arc::new(processing)))
    }
}

struct CycleJob {
    mode: DetectMode,
    source: &'static str,
    respond_to: oneshot::Sender<Result<CycleReport, SyncError>>,
}

/// State read by [`DaemonHandle::status`].
struct Shared {
    started_at: DateTime<Utc>,
    tier: Tier,
    broker: Arc<dyn Broker>,
    consumers: Vec<ConsumerId>,
    dead_letters: Arc<DeadLetterQueue>,
    last_cycle: RwLock<Option<CycleReport>>,
}

/// Daemon builder.
pub struct Daemon {
    config: Config,
    source: Arc<dyn SnapshotSource>,
    fingerprints: Arc<dyn FingerprintStore>,
    broker: Arc<dyn Broker>,
    consumers: Vec<ConsumerSpec>,
    alerts: Arc<dyn AlertSink>,
    schedule: bool,
}

impl Daemon {
    pub fn new(
        config: Config,
        source: Arc<dyn SnapshotSource>,
        fingerprints: Arc<dyn FingerprintStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            config,
            source,
            fingerprints,
            broker,
            consumers: Vec::new(),
            alerts: Arc::new(LogAlertSink),
            schedule: true,
        }
    }

    /// Daemon configured from `<home>/.refsync/config.yaml`, with the file
    /// fingerprint store and an in-process broker of the configured tier.
    pub fn from_home(home: &Path, source: Arc<dyn SnapshotSource>) -> Result<Self, DaemonError> {
        let config = config::load_at(home)?;
        let broker = MemoryBroker::new(config.tier, &config.broker);
        Ok(Self::new(
            config,
            source,
            Arc::new(FileFingerprintStore::at(home)),
            Arc::new(broker),
        ))
    }

    pub fn with_consumer(mut self, consumer: ConsumerSpec) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Only run cycles on [`DaemonHandle::trigger`].
    pub fn without_schedule(mut self) -> Self {
        self.schedule = false;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every task and return once all consumers are subscribed.
    pub async fn spawn(self) -> Result<DaemonHandle, DaemonError> {
        let Daemon {
            config,
            source,
            fingerprints,
            broker,
            consumers,
            alerts,
            schedule,
        } = self;

        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let (job_tx, job_rx) = mpsc::channel::<CycleJob>(16);
        let dead_letters = Arc::new(DeadLetterQueue::new(config.consumer.dead_letter_capacity));
        let shared = Arc::new(Shared {
            started_at: Utc::now(),
            tier: broker.tier(),
            broker: broker.clone(),
            consumers: consumers.iter().map(|c| c.id.clone()).collect(),
            dead_letters: dead_letters.clone(),
            last_cycle: RwLock::new(None),
        });
        let mut tasks: Vec<(String, JoinHandle<Result<(), DaemonError>>)> = Vec::new();

        // Subscribe before the first cycle so nothing published is missed.
        let mut stores = Vec::with_capacity(consumers.len());
        for spec in consumers {
            stores.push((spec.id.clone(), spec.processing.clone()));
            let subscriber = Subscriber::new(
                ConsumerContext {
                    consumer: spec.id.clone(),
                    target: spec.target,
                    projection: spec.projection,
                    processing: spec.processing,
                    dead_letters: dead_letters.clone(),
                    alerts: alerts.clone(),
                },
                broker.clone(),
                config.consumer.clone(),
                config.broker.claim_timeout(),
            );
            let subscription = match subscriber.subscribe().await {
                Ok(subscription) => subscription,
                Err(err) => {
                    let _ = shutdown_tx.send(());
                    return Err(err);
                }
            };
            let shutdown = shutdown_tx.clone();
            let shutdown_rx = shutdown.subscribe();
            let handle = tokio::spawn(async move {
                let result = subscriber.consume(subscription, shutdown_rx).await;
                let _ = shutdown.send(());
                result
            });
            tasks.push((format!("subscriber:{}", spec.id), handle));
        }

        let runner = Arc::new(CycleRunner::new(
            source,
            fingerprints,
            Publisher::new(broker.clone(), config.publish.clone(), config.source.clone()),
        ));

        let processor_handle = {
            let shutdown = shutdown_tx.clone();
            let runner = runner.clone();
            let shared = shared.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let result = processor_task(runner, shared, job_rx, shutdown_rx).await;
                let _ = shutdown.send(());
                result
            })
        };
        tasks.push(("cycle_processor".to_string(), processor_handle));

        if schedule {
            let shutdown = shutdown_tx.clone();
            let runner = runner.clone();
            let shared = shared.clone();
            let every = config.cycle_interval();
            let shutdown_rx = shutdown.subscribe();
            let handle = tokio::spawn(async move {
                let result = scheduler_task(runner, shared, every, shutdown_rx).await;
                let _ = shutdown.send(());
                result
            });
            tasks.push(("scheduler".to_string(), handle));
        }

        let maintenance_handle = {
            let shutdown = shutdown_tx.clone();
            let retention = chrono::Duration::days(config.consumer.processing_retention_days);
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let result = maintenance_task(stores, retention, PRUNE_INTERVAL, shutdown_rx).await;
                let _ = shutdown.send(());
                result
            })
        };
        tasks.push(("maintenance".to_string(), maintenance_handle));

        tracing::info!(
            tier = ?shared.tier,
            consumers = shared.consumers.len(),
            scheduled = schedule,
            interval_secs = config.cycle_interval_secs,
            "daemon started",
        );

        let supervisor = tokio::spawn(async move {
            let mut first_err = None;
            for (name, handle) in tasks {
                if let Err(err) = handle_join(&name, handle.await) {
                    tracing::error!(task = %name, error = %err, "daemon task failed");
                    first_err.get_or_insert(err);
                }
            }
            tracing::info!("daemon stopped");
            first_err.map_or(Ok(()), Err)
        });

        Ok(DaemonHandle {
            jobs: job_tx,
            shutdown: shutdown_tx,
            shared,
            supervisor,
        })
    }

    /// Run until ctrl-c or until any task stops.
    pub async fn run(self) -> Result<(), DaemonError> {
        let handle = self.spawn().await?;
        let shutdown = handle.shutdown.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let signal = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        let _ = shutdown.send(());
                    }
                    Err(err) => tracing::error!(error = %err, "ctrl-c handler failed"),
                }
            }
        });
        let result = handle.wait().await;
        signal.abort();
        result
    }
}

/// Control surface of a running daemon.
pub struct DaemonHandle {
    jobs: mpsc::Sender<CycleJob>,
    shutdown: broadcast::Sender<()>,
    shared: Arc<Shared>,
    supervisor: JoinHandle<Result<(), DaemonError>>,
}

impl DaemonHandle {
    /// Run a cycle now and wait for its report. Fails with
    /// [`SyncError::AlreadyRunning`] while a scheduled cycle is in progress.
    pub async fn trigger(&self, mode: DetectMode) -> Result<CycleReport, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(CycleJob {
                mode,
                source: "operator",
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed("cycle queue"))?;
        let report = rx
            .await
            .map_err(|_| DaemonError::ChannelClosed("cycle reply"))??;
        Ok(report)
    }

    /// Last cycle summary, per-consumer lag, dead-letter and parked counts.
    pub async fn status(&self) -> Value {
        let shared = &self.shared;
        let last_cycle = shared.last_cycle.read().await.clone();

        let mut consumers = Vec::with_capacity(shared.consumers.len());
        for id in &shared.consumers {
            let lag = match shared.broker.lag(&id.0).await {
                Ok(lag) => json!({ "unread": lag.unread, "pending": lag.pending }),
                Err(err) => {
                    tracing::warn!(consumer = %id, error = %err, "lag query failed");
                    Value::Null
                }
            };
            let dead_letters = shared.dead_letters.count_for(id).await;
            consumers.push(json!({
                "id": id,
                "lag": lag,
                "dead_letters": dead_letters,
            }));
        }

        let dead_letters = shared.dead_letters.len().await;
        let parked = shared.dead_letters.parked_len().await;
        json!({
            "running": !self.supervisor.is_finished(),
            "started_at": shared.started_at,
            "tier": shared.tier,
            "last_cycle": last_cycle,
            "consumers": consumers,
            "dead_letters": dead_letters,
            "parked": parked,
        })
    }

    /// Dead letters and parked messages of every consumer.
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.shared.dead_letters
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<(), DaemonError> {
        let _ = self.shutdown.send(());
        self.wait().await
    }

    /// Wait for the daemon to stop on its own.
    pub async fn wait(self) -> Result<(), DaemonError> {
        match self.supervisor.await {
            Ok(result) => result,
            Err(err) => Err(DaemonError::Task(format!("supervisor join failure: {err}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn scheduler_task(
    runner: Arc<CycleRunner>,
    shared: Arc<Shared>,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match runner.run(DetectMode::Incremental).await {
                    Ok(report) => record_cycle(&shared, report, "schedule").await,
                    Err(SyncError::AlreadyRunning) => {
                        tracing::info!("previous cycle still running; tick skipped");
                    }
                    Err(err) => tracing::error!(error = %err, "scheduled cycle failed"),
                }
            }
        }
    }
    Ok(())
}

async fn processor_task(
    runner: Arc<CycleRunner>,
    shared: Arc<Shared>,
    mut jobs: mpsc::Receiver<CycleJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = jobs.recv() => {
                let Some(job) = maybe_job else { break };
                let outcome = runner.run(job.mode).await;
                match &outcome {
                    Ok(report) => record_cycle(&shared, report.clone(), job.source).await,
                    Err(err) => {
                        tracing::warn!(source = job.source, error = %err, "triggered cycle failed")
                    }
                }
                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(())
}

async fn record_cycle(shared: &Shared, report: CycleReport, source: &'static str) {
    tracing::info!(
        source,
        mode = report.mode,
        outcome = ?report.outcome,
        new = report.new,
        updated = report.updated,
        removed = report.removed,
        committed = report.committed,
        failed = report.failed.len(),
        duration_ms = report.duration_ms,
        "cycle completed",
    );
    *shared.last_cycle.write().await = Some(report);
}

async fn maintenance_task(
    stores: Vec<(ConsumerId, Arc<dyn ProcessingStore>)>,
    retention: chrono::Duration,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let cutoff = Utc::now() - retention;
                for (consumer, store) in &stores {
                    let store = store.clone();
                    let pruned = tokio::task::spawn_blocking(move || store.prune(cutoff))
                        .await
                        .map_err(|err| DaemonError::Task(format!("prune join error: {err}")))?;
                    match pruned {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(
                            consumer = %consumer,
                            pruned = count,
                            "processing records pruned",
                        ),
                        Err(err) => tracing::warn!(
                            consumer = %consumer,
                            error = %err,
                            "processing record prune failed",
                        ),
                    }
                }
            }
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Task(format!("{task} task join failure: {err}"))),
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Run `daemon` on a new multi-threaded runtime, blocking until it exits.
pub fn start_blocking(daemon: Daemon) -> Result<(), DaemonError> {
    init_tracing(daemon.config().log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(daemon.run())
}
