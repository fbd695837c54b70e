//! Shared types, error model, and configuration for changewatch.
//!
//! This crate is the foundation depended on by all other changewatch crates.
//! It provides:
//! - [`ChangeWatchError`]: the unified error type
//! - Domain types ([`SourceState`], [`ListingItem`], [`FetchResult`], [`PublishPatternRecord`])
//! - Configuration ([`AppConfig`], [`SourceConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BackoffConfig, BlockSignatureSet, DefaultsConfig, ExtractionRule, HeaderPool,
    MAX_BACKOFF_CEILING_SECS, ProcessingConfig, SourceConfig, SourceEntry, TimingProfile,
    WorkerConfig, config_dir, config_file_path, init_config, init_config_at, load_config,
    load_config_from,
};
pub use error::{ChangeWatchError, Result};
pub use types::{
    FetchResult, FetchStatus, ListingItem, PublishPatternRecord, SourceState, StateUpsert,
};
