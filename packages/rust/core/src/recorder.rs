//! Append-only log of observed publish times.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use changewatch_shared::PublishPatternRecord;
use changewatch_storage::PersistenceGateway;

pub struct PublishPatternRecorder {
    gateway: Arc<dyn PersistenceGateway>,
}

impl PublishPatternRecorder {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Append one observation. Returns whether it was stored; failures are
    /// logged and never propagate.
    pub async fn record(&self, source_id: &str, observed: Option<DateTime<Utc>>) -> bool {
        let record = PublishPatternRecord::new(source_id, observed.unwrap_or_else(Utc::now));
        match self.gateway.insert_publish_pattern(&record).await {
            Ok(()) => {
                debug!(source_id, observed = %record.observed_publish_time, "publish time recorded");
                true
            }
            Err(e) => {
                warn!(source_id, error = %e, "failed to record publish time");
                false
            }
        }
    }
}
