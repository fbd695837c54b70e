//! At-most-one extraction run per source.
//!
//! Each source is either idle or has exactly one worker in flight. A trigger
//! for an in-flight source is dropped, not queued: the items it carried are
//! still ahead of the unchanged baseline and will be seen again next cycle.
//!
//! Launching is fire-and-forget. The worker future runs on its own task under
//! a hard timeout; the per-source lock is released as soon as the worker
//! finishes, whatever the outcome. On success the processing trigger is
//! spawned as a second detached task with its own timeout, outside the lock.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use changewatch_shared::{ListingItem, Result};

/// Resolves when the worker exits. `Err` means it ran and failed.
pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Payload handed to the extraction worker and the processing trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub run_id: Uuid,
    pub source_id: String,
    /// New items, newest first.
    pub items: Vec<ListingItem>,
    pub triggered_at: DateTime<Utc>,
}

impl ExtractionJob {
    pub fn new(source_id: impl Into<String>, items: Vec<ListingItem>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            source_id: source_id.into(),
            items,
            triggered_at: Utc::now(),
        }
    }
}

/// Starts extraction workers.
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `job`. An `Err` here is a launch failure; the
    /// returned future tracks the running worker. Dropping the future must
    /// stop the worker.
    fn launch(&self, job: &ExtractionJob) -> Result<WorkerFuture>;
}

/// Downstream hook fired after a worker succeeds.
#[async_trait]
pub trait ProcessingTrigger: Send + Sync {
    async fn fire(&self, job: &ExtractionJob) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        })
    }
}

/// Outcome of one worker run, yielded by the accepted trigger's handle.
#[derive(Debug, Serialize)]
pub struct WorkerReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub status: WorkerStatus,
    pub error: Option<String>,
    pub elapsed: Duration,
    /// Detached processing task, present when processing was fired.
    #[serde(skip)]
    pub processing: Option<JoinHandle<ProcessingReport>>,
}

/// Outcome of the processing trigger for one successful run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub run_id: Uuid,
    pub source_id: String,
    /// `None` when the trigger completed in time.
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Result of [`TriggerCoordinator::try_trigger`].
#[derive(Debug)]
pub enum TriggerDecision {
    /// The worker was launched. Awaiting `handle` waits for it; dropping
    /// the handle detaches.
    Accepted {
        run_id: Uuid,
        handle: JoinHandle<WorkerReport>,
    },
    /// A worker for this source is already running; the trigger was dropped.
    InFlight,
    /// The worker could not be started; the lock was released.
    LaunchFailed(String),
}

impl TriggerDecision {
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

type LockSet = Arc<Mutex<HashSet<String>>>;

/// Releases the source's lock on drop.
struct InFlightGuard {
    set: LockSet,
    source_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.source_id);
    }
}

/// Per-source launch gate for extraction workers.
pub struct TriggerCoordinator {
    launcher: Arc<dyn WorkerLauncher>,
    processing: Option<(Arc<dyn ProcessingTrigger>, Duration)>,
    worker_timeout: Duration,
    in_flight: LockSet,
}

impl TriggerCoordinator {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, worker_timeout: Duration) -> Self {
        Self {
            launcher,
            processing: None,
            worker_timeout,
            in_flight: Arc::default(),
        }
    }

    /// Fire `trigger` after every successful worker run, abandoning it after `timeout`.
    pub fn with_processing(
        mut self,
        trigger: Arc<dyn ProcessingTrigger>,
        timeout: Duration,
    ) -> Self {
        self.processing = Some((trigger, timeout));
        self
    }

    /// Launch a worker for `new_items` unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn try_trigger(&self, source_id: &str, new_items: &[ListingItem]) -> TriggerDecision {
        let Some(guard) = self.acquire(source_id) else {
            info!(source_id, items = new_items.len(), "extraction in flight, trigger dropped");
            return TriggerDecision::InFlight;
        };

        let job = ExtractionJob::new(source_id, new_items.to_vec());
        let run_id = job.run_id;

        let worker = match self.launcher.launch(&job) {
            Ok(fut) => fut,
            Err(e) => {
                drop(guard);
                error!(source_id, %run_id, error = %e, "failed to launch extraction worker");
                return TriggerDecision::LaunchFailed(e.to_string());
            }
        };

        info!(source_id, %run_id, items = job.items.len(), "extraction worker launched");

        let timeout = self.worker_timeout;
        let processing = self.processing.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, worker).await;
            drop(guard);
            let elapsed = started.elapsed();

            let (status, error) = match outcome {
                Ok(Ok(())) => (WorkerStatus::Succeeded, None),
                Ok(Err(e)) => (WorkerStatus::Failed, Some(e.to_string())),
                Err(_) => (
                    WorkerStatus::TimedOut,
                    Some(format!("worker exceeded {}s and was killed", timeout.as_secs())),
                ),
            };

            match &error {
                None => info!(
                    source_id = %job.source_id,
                    %run_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "extraction worker finished"
                ),
                Some(e) => warn!(
                    source_id = %job.source_id,
                    %run_id,
                    %status,
                    error = %e,
                    "extraction worker did not complete"
                ),
            }

            let processing = match processing {
                Some((trigger, limit)) if status == WorkerStatus::Succeeded => {
                    Some(tokio::spawn(fire_processing(trigger, job.clone(), limit)))
                }
                _ => None,
            };

            WorkerReport {
                run_id,
                source_id: job.source_id,
                status,
                error,
                elapsed,
                processing,
            }
        });

        TriggerDecision::Accepted { run_id, handle }
    }

    pub fn is_in_flight(&self, source_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(source_id)
    }

    /// Sources with a running worker, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn acquire(&self, source_id: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(source_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            source_id: source_id.to_string(),
        })
    }
}

async fn fire_processing(
    trigger: Arc<dyn ProcessingTrigger>,
    job: ExtractionJob,
    limit: Duration,
) -> ProcessingReport {
    let started = Instant::now();
    let error = match tokio::time::timeout(limit, trigger.fire(&job)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("processing exceeded {limit:?} and was abandoned")),
    };
    if let Some(e) = &error {
        warn!(
            source_id = %job.source_id,
            run_id = %job.run_id,
            error = %e,
            "processing trigger failed"
        );
    }
    ProcessingReport {
        run_id: job.run_id,
        source_id: job.source_id,
        error,
        elapsed: started.elapsed(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use changewatch_shared::ChangeWatchError;
    use std::sync::atomic::Ordering;

    fn items(ids: &[&str]) -> Vec<ListingItem> {
        ids.iter()
            .map(|id| ListingItem {
                item_id: (*id).into(),
                title: format!("Item {id}"),
                url: format!("https://news.example.com/posts/{id}"),
                date: None,
            })
            .collect()
    }

    fn accepted(decision: TriggerDecision) -> (Uuid, JoinHandle<WorkerReport>) {
        match decision {
            TriggerDecision::Accepted { run_id, handle } => (run_id, handle),
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_flight_drops_then_accepts_after_completion() {
        let launcher = Arc::new(ChannelLauncher::default());
        let coord = TriggerCoordinator::new(launcher.clone(), Duration::from_secs(5));

        let (run_id, handle) = accepted(coord.try_trigger("demo", &items(&["I3"])));
        assert!(coord.is_in_flight("demo"));
        assert_eq!(launcher.jobs()[0].run_id, run_id);

        let second = coord.try_trigger("demo", &items(&["I4", "I3"]));
        assert!(matches!(second, TriggerDecision::InFlight));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        launcher.complete(Ok(()));
        let report = handle.await.unwrap();
        assert_eq!(report.status, WorkerStatus::Succeeded);
        assert_eq!(report.run_id, run_id);
        assert!(!coord.is_in_flight("demo"));

        assert!(coord.try_trigger("demo", &items(&["I4"])).accepted());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sources_run_in_parallel() {
        let launcher = Arc::new(ChannelLauncher::default());
        let coord = TriggerCoordinator::new(launcher.clone(), Duration::from_secs(5));

        assert!(coord.try_trigger("b", &items(&["1"])).accepted());
        assert!(coord.try_trigger("a", &items(&["1"])).accepted());
        assert_eq!(coord.in_flight(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn launch_failure_releases_lock() {
        let coord = TriggerCoordinator::new(Arc::new(FailingLauncher), Duration::from_secs(5));

        let decision = coord.try_trigger("demo", &items(&["I1"]));
        match decision {
            TriggerDecision::LaunchFailed(msg) => assert!(msg.contains("worker binary missing")),
            other => panic!("expected LaunchFailed, got {other:?}"),
        }
        assert!(!coord.is_in_flight("demo"));
        assert!(coord.in_flight().is_empty());
    }

    #[tokio::test]
    async fn timeout_releases_lock_and_skips_processing() {
        let launcher = Arc::new(ChannelLauncher::default());
        let processing = Arc::new(RecordingTrigger::default());
        let coord = TriggerCoordinator::new(launcher.clone(), Duration::from_millis(50))
            .with_processing(processing.clone(), Duration::from_secs(5));

        let (_, handle) = accepted(coord.try_trigger("demo", &items(&["I1"])));
        let report = handle.await.unwrap();

        assert_eq!(report.status, WorkerStatus::TimedOut);
        assert!(report.processing.is_none());
        assert!(!coord.is_in_flight("demo"));
        assert!(processing.fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn processing_fires_only_on_success() {
        let launcher = Arc::new(ChannelLauncher::default());
        let processing = Arc::new(RecordingTrigger::default());
        let coord = TriggerCoordinator::new(launcher.clone(), Duration::from_secs(5))
            .with_processing(processing.clone(), Duration::from_secs(5));

        let (_, handle) = accepted(coord.try_trigger("demo", &items(&["I1"])));
        launcher.complete(Err(ChangeWatchError::WorkerRuntime("exit status 2".into())));
        let report = handle.await.unwrap();
        assert_eq!(report.status, WorkerStatus::Failed);
        assert!(report.error.unwrap().contains("exit status 2"));
        assert!(report.processing.is_none());
        assert!(!coord.is_in_flight("demo"));

        let (run_id, handle) = accepted(coord.try_trigger("demo", &items(&["I1"])));
        launcher.complete(Ok(()));
        let report = handle.await.unwrap();
        let outcome = report.processing.expect("processing dispatched").await.unwrap();
        assert_eq!(outcome.run_id, run_id);
        assert!(outcome.error.is_none());
        assert_eq!(*processing.fired.lock().unwrap(), vec![run_id]);
    }

    #[tokio::test]
    async fn hung_processing_does_not_hold_worker_report() {
        let launcher = Arc::new(InstantLauncher::default());
        let coord = TriggerCoordinator::new(launcher, Duration::from_secs(5))
            .with_processing(Arc::new(HangingTrigger), Duration::from_secs(60));

        let (_, handle) = accepted(coord.try_trigger("demo", &items(&["I1"])));
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker report held by processing")
            .unwrap();
        assert_eq!(report.status, WorkerStatus::Succeeded);
        assert!(!coord.is_in_flight("demo"));

        let processing = report.processing.expect("processing dispatched");
        assert!(!processing.is_finished());
        processing.abort();

        // the next run is accepted while the previous processing is still pending
        assert!(coord.try_trigger("demo", &items(&["I2"])).accepted());
    }

    #[tokio::test]
    async fn hung_processing_is_abandoned_after_timeout() {
        let launcher = Arc::new(InstantLauncher::default());
        let coord = TriggerCoordinator::new(launcher, Duration::from_secs(5))
            .with_processing(Arc::new(HangingTrigger), Duration::from_millis(50));

        let (_, handle) = accepted(coord.try_trigger("demo", &items(&["I1"])));
        let report = handle.await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), report.processing.unwrap())
            .await
            .expect("processing timeout not enforced")
            .unwrap();
        assert!(outcome.error.unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn detached_handle_still_releases() {
        let launcher = Arc::new(InstantLauncher::default());
        let coord = TriggerCoordinator::new(launcher.clone(), Duration::from_secs(5));

        let decision = coord.try_trigger("demo", &items(&["I1"]));
        assert!(decision.accepted());
        drop(decision);

        tokio::time::timeout(Duration::from_secs(1), async {
            while coord.is_in_flight("demo") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("lock not released");
    }

    #[test]
    fn job_serializes_items() {
        let job = ExtractionJob::new("demo", items(&["I2", "I1"]));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["source_id"], "demo");
        assert_eq!(json["items"][0]["item_id"], "I2");
        assert_eq!(json["items"].as_array().unwrap().len(), 2);
    }
}
