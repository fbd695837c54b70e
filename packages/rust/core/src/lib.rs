//! Change detection and extraction triggering for changewatch.
//!
//! This crate ties the fetcher and the persistence gateway together:
//! - [`detector`]: compares listings with the stored baseline
//! - [`trigger`]: at-most-one worker per source, fire-and-forget
//! - [`worker`]: command and webhook launchers
//! - [`recorder`]: publish time observations
//! - [`scheduler`]: the polling loop

pub mod detector;
pub mod recorder;
pub mod scheduler;
pub mod trigger;
pub mod worker;

pub use detector::ChangeDetector;
pub use recorder::PublishPatternRecorder;
pub use scheduler::{CycleOutcome, CycleReport, RoundSummary, Scheduler, SchedulerSettings};
pub use trigger::{
    ExtractionJob, ProcessingReport, ProcessingTrigger, TriggerCoordinator, TriggerDecision,
    WorkerFuture, WorkerLauncher, WorkerReport, WorkerStatus,
};
pub use worker::{
    CommandLauncher, CommandProcessingTrigger, JOB_ENV, WebhookProcessingTrigger,
    processing_trigger,
};
