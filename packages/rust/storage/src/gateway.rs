//! The datastore contract used by the detection core.
//!
//! One gateway instance is built at process start and shared (behind an
//! `Arc`) by the change detector and the publish pattern recorder.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use changewatch_shared::{PublishPatternRecord, Result, SourceState, StateUpsert};

/// Access to persisted per-source state and publish-time records.
///
/// All writes are keyed by `source_id`, so concurrent cycles for different
/// sources never conflict and retried writes converge.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Read a source's state; `None` if the source has never been checked.
    async fn get_source_state(&self, source_id: &str) -> Result<Option<SourceState>>;

    /// Advance the baseline. Merges on conflict; `increment` is added to
    /// `total_items_seen`, never deduplicated.
    async fn upsert_source_state(&self, upsert: &StateUpsert) -> Result<()>;

    /// Record a check without touching the baseline. Creates a
    /// baseline-less row when the source has none yet.
    async fn touch_source_state(&self, source_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Append one observed publish time.
    async fn insert_publish_pattern(&self, record: &PublishPatternRecord) -> Result<()>;

    /// All persisted states, ordered by source id.
    async fn list_source_states(&self) -> Result<Vec<SourceState>>;
}
