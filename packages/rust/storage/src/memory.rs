//! In-process [`PersistenceGateway`] for tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use changewatch_shared::{
    ChangeWatchError, PublishPatternRecord, Result, SourceState, StateUpsert,
};

use crate::gateway::PersistenceGateway;

/// Gateway backed by in-memory maps. State is lost on drop.
///
/// Reads and writes can be made to fail on demand to exercise the
/// soft-failure paths of callers.
#[derive(Default)]
pub struct MemoryGateway {
    states: Mutex<BTreeMap<String, SourceState>>,
    patterns: Mutex<Vec<PublishPatternRecord>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read return a persistence error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write return a persistence error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all appended publish records.
    pub fn publish_patterns(&self) -> Vec<PublishPatternRecord> {
        self.patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ChangeWatchError::Persistence("injected read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChangeWatchError::Persistence("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn get_source_state(&self, source_id: &str) -> Result<Option<SourceState>> {
        self.check_read()?;
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.get(source_id).cloned())
    }

    async fn upsert_source_state(&self, upsert: &StateUpsert) -> Result<()> {
        self.check_write()?;
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let entry = states
            .entry(upsert.source_id.clone())
            .or_insert_with(|| SourceState {
                source_id: upsert.source_id.clone(),
                last_known_item_id: None,
                last_known_item_url: None,
                last_check_at: upsert.at,
                last_item_at: None,
                total_items_seen: 0,
                updated_at: upsert.at,
            });
        entry.last_known_item_id = Some(upsert.last_known_item_id.clone());
        entry.last_known_item_url = Some(upsert.last_known_item_url.clone());
        entry.last_check_at = upsert.at;
        entry.last_item_at = Some(upsert.at);
        entry.total_items_seen = entry.total_items_seen.saturating_add(upsert.increment);
        entry.updated_at = upsert.at;
        Ok(())
    }

    async fn touch_source_state(&self, source_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.check_write()?;
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .entry(source_id.to_string())
            .and_modify(|s| {
                s.last_check_at = at;
                s.updated_at = at;
            })
            .or_insert_with(|| SourceState {
                source_id: source_id.to_string(),
                last_known_item_id: None,
                last_known_item_url: None,
                last_check_at: at,
                last_item_at: None,
                total_items_seen: 0,
                updated_at: at,
            });
        Ok(())
    }

    async fn insert_publish_pattern(&self, record: &PublishPatternRecord) -> Result<()> {
        self.check_write()?;
        self.patterns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn list_source_states(&self) -> Result<Vec<SourceState>> {
        self.check_read()?;
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.values().cloned().collect())
    }
}
