//! The polling loop.
//!
//! One cycle per source: backoff gate, fetch, classify, detect, trigger,
//! persist. Rounds visit every enabled source with bounded parallelism; a
//! source is never cycled twice at once because each round completes before
//! the next begins. Worker runs are never awaited by the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use changewatch_fetcher::{Backoff, LightFetcher};
use changewatch_shared::{
    AppConfig, ChangeWatchError, DefaultsConfig, FetchResult, FetchStatus, Result, SourceConfig,
};
use changewatch_storage::PersistenceGateway;

use crate::detector::ChangeDetector;
use crate::recorder::PublishPatternRecorder;
use crate::trigger::{TriggerCoordinator, TriggerDecision, WorkerReport};
use crate::worker::{CommandLauncher, processing_trigger};

/// Loop pacing and limits.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub max_parallel: usize,
    pub fetch_timeout: Duration,
}

impl From<&DefaultsConfig> for SchedulerSettings {
    fn from(d: &DefaultsConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(d.poll_interval_secs),
            poll_jitter: Duration::from_secs(d.poll_jitter_secs),
            max_parallel: d.max_parallel_sources as usize,
            fetch_timeout: Duration::from_secs(d.fetch_timeout_secs),
        }
    }
}

impl SchedulerSettings {
    /// Pause between rounds: the poll interval shifted by up to ± jitter.
    fn next_pause(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        let offset = rand::thread_rng().gen_range(0..=2 * jitter_ms);
        (self.poll_interval + Duration::from_millis(offset))
            .saturating_sub(self.poll_jitter)
    }
}

/// What a single cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Source is backing off; nothing was fetched.
    Skipped { remaining: Duration },
    /// The listing matched a block signature.
    Blocked { diagnostic: String, backoff: Duration },
    /// Network, HTTP, or timeout failure.
    Failed { diagnostic: String },
    /// Listing fetched, nothing new.
    NoChange { listed: usize },
    /// Worker launched and the baseline advanced.
    Triggered {
        run_id: Uuid,
        new_items: usize,
        worker: JoinHandle<WorkerReport>,
    },
    /// A worker for the source was still running; items stay new.
    InFlight { new_items: usize },
    /// The worker could not be started; items stay new.
    LaunchFailed { new_items: usize, error: String },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "error",
            Self::NoChange { .. } => "no_change",
            Self::Triggered { .. } => "triggered",
            Self::InFlight { .. } => "in_flight",
            Self::LaunchFailed { .. } => "launch_failed",
        }
    }
}

#[derive(Debug)]
pub struct CycleReport {
    pub source_id: String,
    pub outcome: CycleOutcome,
    /// Soft persistence failures during the cycle.
    pub persistence_errors: usize,
    pub elapsed: Duration,
}

/// Counts of cycle outcomes in one round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub cycles: usize,
    pub triggered: usize,
    pub blocked: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RoundSummary {
    fn tally(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Triggered { .. } => self.triggered += 1,
            CycleOutcome::Blocked { .. } => self.blocked += 1,
            CycleOutcome::Failed { .. } => self.failed += 1,
            CycleOutcome::Skipped { .. } => self.skipped += 1,
            _ => {}
        }
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    sources: Vec<Arc<SourceConfig>>,
    fetcher: LightFetcher,
    backoff: Backoff,
    detector: ChangeDetector,
    recorder: PublishPatternRecorder,
    trigger: TriggerCoordinator,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        sources: Vec<SourceConfig>,
        backoff: Backoff,
        gateway: Arc<dyn PersistenceGateway>,
        trigger: TriggerCoordinator,
    ) -> Result<Self> {
        let fetcher = LightFetcher::new(&sources)?;
        Ok(Self {
            settings,
            sources: sources.into_iter().map(Arc::new).collect(),
            fetcher,
            backoff,
            detector: ChangeDetector::new(Arc::clone(&gateway)),
            recorder: PublishPatternRecorder::new(gateway),
            trigger,
        })
    }

    /// Wire a scheduler from a loaded config: validate sources, compile
    /// extraction rules, and build the worker launcher and processing trigger.
    pub fn from_config(config: &AppConfig, gateway: Arc<dyn PersistenceGateway>) -> Result<Self> {
        let sources = config.validate()?;
        let launcher = Arc::new(CommandLauncher::new(&config.worker)?);
        let mut trigger =
            TriggerCoordinator::new(launcher, Duration::from_secs(config.worker.timeout_secs));
        if let Some(processing) = processing_trigger(&config.processing)? {
            trigger = trigger.with_processing(
                processing,
                Duration::from_secs(config.processing.timeout_secs),
            );
        }

        Self::new(
            SchedulerSettings::from(&config.defaults),
            sources,
            Backoff::new(config.backoff.clone()),
            gateway,
            trigger,
        )
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().map(|s| s.as_ref())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources()
            .find(|s| s.source_id == source_id)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn trigger(&self) -> &TriggerCoordinator {
        &self.trigger
    }

    /// Run one detection cycle for `source`. `force` ignores backoff.
    #[instrument(skip_all, fields(source_id = %source.source_id, force = force))]
    pub async fn run_cycle(&self, source: &SourceConfig, force: bool) -> CycleReport {
        let started = Instant::now();
        let source_id = source.source_id.as_str();
        let mut persistence_errors = 0;

        let outcome = 'cycle: {
            if !force {
                if let Some(remaining) = self.backoff.remaining(source_id, Instant::now()) {
                    debug!(remaining_secs = remaining.as_secs(), "backing off, cycle skipped");
                    break 'cycle CycleOutcome::Skipped { remaining };
                }
            }

            let result = match tokio::time::timeout(
                self.settings.fetch_timeout,
                self.fetcher.fetch(source),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => FetchResult::error(
                    format!("fetch exceeded {:?}", self.settings.fetch_timeout),
                    None,
                ),
            };

            match result.status {
                FetchStatus::Blocked => {
                    let delay = self.backoff.record_blocked(source_id, Instant::now());
                    let err = ChangeWatchError::FetchBlocked(result.diagnostic.clone());
                    warn!(
                        kind = err.kind(),
                        step = self.backoff.step(source_id),
                        backoff_secs = delay.as_secs(),
                        error = %err,
                        "source blocked, backing off"
                    );
                    break 'cycle CycleOutcome::Blocked {
                        diagnostic: result.diagnostic,
                        backoff: delay,
                    };
                }
                FetchStatus::Error => {
                    let err = ChangeWatchError::Fetch(result.diagnostic.clone());
                    warn!(kind = err.kind(), error = %err, "fetch failed, cycle aborted");
                    break 'cycle CycleOutcome::Failed {
                        diagnostic: result.diagnostic,
                    };
                }
                FetchStatus::Ok => self.backoff.record_ok(source_id),
            }

            let baseline = self.detector.get_last_known_id(source_id).await;
            let new_items =
                self.detector
                    .find_new_items(source_id, &result.items, baseline.as_deref());

            let Some(newest) = new_items.first() else {
                if let Err(e) = self.detector.touch_last_check(source_id).await {
                    warn!(error = %e, "failed to record check time");
                    persistence_errors += 1;
                }
                break 'cycle CycleOutcome::NoChange {
                    listed: result.items.len(),
                };
            };

            info!(new_items = new_items.len(), newest = %newest.item_id, "new items detected");

            match self.trigger.try_trigger(source_id, &new_items) {
                TriggerDecision::Accepted { run_id, handle } => {
                    if let Err(e) = self
                        .detector
                        .update_state(source_id, newest, new_items.len() as u64)
                        .await
                    {
                        warn!(error = %e, "failed to advance baseline");
                        persistence_errors += 1;
                    }
                    for item in &new_items {
                        if !self.recorder.record(source_id, item.date).await {
                            persistence_errors += 1;
                        }
                    }
                    CycleOutcome::Triggered {
                        run_id,
                        new_items: new_items.len(),
                        worker: handle,
                    }
                }
                decision => {
                    if let Err(e) = self.detector.touch_last_check(source_id).await {
                        warn!(error = %e, "failed to record check time");
                        persistence_errors += 1;
                    }
                    match decision {
                        TriggerDecision::LaunchFailed(error) => CycleOutcome::LaunchFailed {
                            new_items: new_items.len(),
                            error,
                        },
                        _ => CycleOutcome::InFlight {
                            new_items: new_items.len(),
                        },
                    }
                }
            }
        };

        let report = CycleReport {
            source_id: source_id.to_string(),
            outcome,
            persistence_errors,
            elapsed: started.elapsed(),
        };
        debug!(
            outcome = report.outcome.label(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "cycle complete"
        );
        report
    }

    /// Cycle every enabled source once, at most `max_parallel` at a time.
    pub async fn run_round(self: &Arc<Self>) -> RoundSummary {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut tasks = JoinSet::new();

        for source in self.sources.iter().filter(|s| s.enabled) {
            let this = Arc::clone(self);
            let source = Arc::clone(source);
            let permits = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                Some(this.run_cycle(&source, false).await)
            });
        }

        let mut summary = RoundSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(report)) => summary.tally(&report.outcome),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cycle task failed"),
            }
        }
        summary
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            sources = self.sources.iter().filter(|s| s.enabled).count(),
            interval_secs = self.settings.poll_interval.as_secs(),
            max_parallel = self.settings.max_parallel,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let summary = self.run_round().await;
            info!(
                cycles = summary.cycles,
                triggered = summary.triggered,
                blocked = summary.blocked,
                failed = summary.failed,
                skipped = summary.skipped,
                in_flight = ?self.trigger.in_flight(),
                "round complete"
            );

            let pause = self.settings.next_pause();
            debug!(pause_secs = pause.as_secs(), "sleeping until next round");
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}
