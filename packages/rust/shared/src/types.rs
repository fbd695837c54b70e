//! Core domain types for change detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SourceState
// ---------------------------------------------------------------------------

/// Persisted per-source detection state (one row per `source_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    /// Configured source identifier.
    pub source_id: String,
    /// Baseline item id. `None` means the source was polled but has no baseline yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_item_id: Option<String>,
    /// URL of the baseline item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_item_url: Option<String>,
    /// Last time the listing was successfully checked.
    pub last_check_at: DateTime<Utc>,
    /// Last time new items were detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_item_at: Option<DateTime<Utc>>,
    /// Running total of new items seen; never decreases.
    pub total_items_seen: u64,
    /// Last write to this row.
    pub updated_at: DateTime<Utc>,
}

impl SourceState {
    /// Whether this row carries a comparison baseline.
    pub fn has_baseline(&self) -> bool {
        self.last_known_item_id.is_some()
    }
}

/// Fields written by a baseline-advancing upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpsert {
    pub source_id: String,
    pub last_known_item_id: String,
    pub last_known_item_url: String,
    pub at: DateTime<Utc>,
    /// Added to `total_items_seen`.
    pub increment: u64,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// One entry of a source's listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingItem {
    /// Source-local id (from the URL, or a content hash fallback).
    pub item_id: String,
    pub title: String,
    /// Absolute item URL.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// Classification of a listing fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Ok,
    Blocked,
    Error,
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Blocked => "BLOCKED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Outcome of a single listing fetch. `items` is empty unless `status` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub status: FetchStatus,
    /// Newest first.
    pub items: Vec<ListingItem>,
    /// Human-readable explanation of the classification.
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl FetchResult {
    pub fn ok(items: Vec<ListingItem>, http_status: u16) -> Self {
        Self {
            status: FetchStatus::Ok,
            diagnostic: format!("{} items", items.len()),
            items,
            http_status: Some(http_status),
        }
    }

    pub fn blocked(diagnostic: impl Into<String>, http_status: Option<u16>) -> Self {
        Self {
            status: FetchStatus::Blocked,
            items: Vec::new(),
            diagnostic: diagnostic.into(),
            http_status,
        }
    }

    pub fn error(diagnostic: impl Into<String>, http_status: Option<u16>) -> Self {
        Self {
            status: FetchStatus::Error,
            items: Vec::new(),
            diagnostic: diagnostic.into(),
            http_status,
        }
    }
}

// ---------------------------------------------------------------------------
// PublishPatternRecord
// ---------------------------------------------------------------------------

/// An observed publish time, appended for external interval tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPatternRecord {
    /// UUID v7 (time-sortable).
    pub id: Uuid,
    pub source_id: String,
    pub observed_publish_time: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl PublishPatternRecord {
    pub fn new(source_id: impl Into<String>, observed_publish_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source_id: source_id.into(),
            observed_publish_time,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> ListingItem {
        ListingItem {
            item_id: id.into(),
            title: format!("Item {id}"),
            url: format!("https://news.example.com/posts/{id}"),
            date: None,
        }
    }

    #[test]
    fn fetch_status_serializes_screaming() {
        let json = serde_json::to_string(&FetchStatus::Blocked).expect("serialize");
        assert_eq!(json, "\"BLOCKED\"");
        assert_eq!(FetchStatus::Error.to_string(), "ERROR");
    }

    #[test]
    fn non_ok_results_carry_no_items() {
        let blocked = FetchResult::blocked("HTTP 429", Some(429));
        assert!(blocked.items.is_empty());
        assert_eq!(blocked.status, FetchStatus::Blocked);

        let ok = FetchResult::ok(vec![item("3"), item("2")], 200);
        assert_eq!(ok.status, FetchStatus::Ok);
        assert_eq!(ok.diagnostic, "2 items");
    }

    #[test]
    fn state_without_baseline() {
        let state = SourceState {
            source_id: "demo".into(),
            last_known_item_id: None,
            last_known_item_url: None,
            last_check_at: Utc::now(),
            last_item_at: None,
            total_items_seen: 0,
            updated_at: Utc::now(),
        };
        assert!(!state.has_baseline());
        let json = serde_json::to_string(&state).expect("serialize");
        assert!(!json.contains("last_known_item_id"));
    }
}
