//! Change detection against the persisted baseline.
//!
//! A listing is newest-first. Everything before the baseline item is new.
//! With no baseline only the single newest item counts, so a fresh source
//! never floods the worker with its whole backlog.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use changewatch_shared::{ListingItem, Result, StateUpsert};
use changewatch_storage::PersistenceGateway;

/// Compares fresh listings with the baseline and advances it.
pub struct ChangeDetector {
    gateway: Arc<dyn PersistenceGateway>,
}

impl ChangeDetector {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// The baseline item id, if any.
    ///
    /// A read failure is logged and treated as "no baseline".
    pub async fn get_last_known_id(&self, source_id: &str) -> Option<String> {
        match self.gateway.get_source_state(source_id).await {
            Ok(state) => state.and_then(|s| s.last_known_item_id),
            Err(e) => {
                warn!(source_id, error = %e, "state read failed, treating source as new");
                None
            }
        }
    }

    /// Items in `items` that are newer than `last_known_id`, in input order.
    pub fn find_new_items(
        &self,
        source_id: &str,
        items: &[ListingItem],
        last_known_id: Option<&str>,
    ) -> Vec<ListingItem> {
        if let Some(pos) = ordering_anomaly(items) {
            warn!(
                source_id,
                position = pos,
                "listing dates are not newest-first; new-item detection may be inaccurate"
            );
        }

        let Some(baseline) = last_known_id else {
            debug!(source_id, "no baseline, taking newest item only");
            return items.iter().take(1).cloned().collect();
        };

        match new_items_before(items, baseline) {
            Some(new) => new,
            None => {
                warn!(
                    source_id,
                    baseline,
                    listed = items.len(),
                    "baseline not found in listing, treating every listed item as new"
                );
                items.to_vec()
            }
        }
    }

    /// Move the baseline to `newest` and add `increment` to the seen counter.
    pub async fn update_state(
        &self,
        source_id: &str,
        newest: &ListingItem,
        increment: u64,
    ) -> Result<()> {
        let upsert = StateUpsert {
            source_id: source_id.to_string(),
            last_known_item_id: newest.item_id.clone(),
            last_known_item_url: newest.url.clone(),
            at: Utc::now(),
            increment,
        };
        self.gateway.upsert_source_state(&upsert).await
    }

    /// Record a check without moving the baseline.
    pub async fn touch_last_check(&self, source_id: &str) -> Result<()> {
        self.gateway.touch_source_state(source_id, Utc::now()).await
    }
}

/// The prefix strictly before `baseline`, or `None` if the baseline is not listed.
fn new_items_before(items: &[ListingItem], baseline: &str) -> Option<Vec<ListingItem>> {
    let pos = items.iter().position(|i| i.item_id == baseline)?;
    Some(items[..pos].to_vec())
}

/// Index of the first dated item that is newer than the dated item before it.
fn ordering_anomaly(items: &[ListingItem]) -> Option<usize> {
    let mut previous = None;
    for (idx, item) in items.iter().enumerate() {
        let Some(date) = item.date else { continue };
        if previous.is_some_and(|p| date > p) {
            return Some(idx);
        }
        previous = Some(date);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use changewatch_storage::MemoryGateway;

    fn item(id: &str) -> ListingItem {
        ListingItem {
            item_id: id.into(),
            title: format!("Item {id}"),
            url: format!("https://news.example.com/posts/{id}"),
            date: None,
        }
    }

    fn dated(id: &str, day: u32) -> ListingItem {
        let date: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap();
        ListingItem {
            date: Some(date),
            ..item(id)
        }
    }

    fn ids(items: &[ListingItem]) -> Vec<&str> {
        items.iter().map(|i| i.item_id.as_str()).collect()
    }

    fn detector() -> (Arc<MemoryGateway>, ChangeDetector) {
        let gw = Arc::new(MemoryGateway::new());
        let det = ChangeDetector::new(gw.clone());
        (gw, det)
    }

    #[test]
    fn bootstrap_takes_only_newest() {
        let (_, det) = detector();
        let listing = vec![item("I3"), item("I2"), item("I1")];
        assert_eq!(ids(&det.find_new_items("demo", &listing, None)), vec!["I3"]);
        assert!(det.find_new_items("demo", &[], None).is_empty());
    }

    #[test]
    fn prefix_before_baseline_in_order() {
        let (_, det) = detector();
        let listing = vec![item("I5"), item("I4"), item("I3"), item("I2")];
        let new = det.find_new_items("demo", &listing, Some("I3"));
        assert_eq!(ids(&new), vec!["I5", "I4"]);
    }

    #[test]
    fn baseline_on_top_means_nothing_new() {
        let (_, det) = detector();
        let listing = vec![item("I3"), item("I2")];
        assert!(det.find_new_items("demo", &listing, Some("I3")).is_empty());
    }

    #[test]
    fn missing_baseline_returns_full_listing() {
        let (_, det) = detector();
        let listing = vec![item("I9"), item("I8"), item("I7")];
        let new = det.find_new_items("demo", &listing, Some("I3"));
        assert_eq!(ids(&new), vec!["I9", "I8", "I7"]);
    }

    #[test]
    fn anomaly_detection() {
        let ordered = vec![dated("a", 3), item("b"), dated("c", 2), dated("d", 1)];
        assert_eq!(ordering_anomaly(&ordered), None);

        let shuffled = vec![dated("a", 2), dated("b", 3), dated("c", 1)];
        assert_eq!(ordering_anomaly(&shuffled), Some(1));
    }

    #[test]
    fn anomaly_does_not_change_classification() {
        let (_, det) = detector();
        let shuffled = vec![dated("a", 2), dated("b", 3), dated("c", 1)];
        assert_eq!(ids(&det.find_new_items("demo", &shuffled, Some("c"))), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn double_update_is_additive() {
        let (gw, det) = detector();
        det.update_state("demo", &item("I3"), 1).await.unwrap();
        det.update_state("demo", &item("I5"), 2).await.unwrap();

        let state = gw.get_source_state("demo").await.unwrap().unwrap();
        assert_eq!(state.last_known_item_id.as_deref(), Some("I5"));
        assert_eq!(
            state.last_known_item_url.as_deref(),
            Some("https://news.example.com/posts/I5")
        );
        assert_eq!(state.total_items_seen, 3);
        assert_eq!(det.get_last_known_id("demo").await.as_deref(), Some("I5"));
    }

    #[tokio::test]
    async fn touch_keeps_baseline() {
        let (gw, det) = detector();
        det.update_state("demo", &item("I3"), 1).await.unwrap();
        let before = gw.get_source_state("demo").await.unwrap().unwrap();

        det.touch_last_check("demo").await.unwrap();
        let after = gw.get_source_state("demo").await.unwrap().unwrap();
        assert_eq!(after.last_known_item_id.as_deref(), Some("I3"));
        assert_eq!(after.total_items_seen, 1);
        assert!(after.last_check_at >= before.last_check_at);
    }

    #[tokio::test]
    async fn touch_creates_baseline_less_row() {
        let (gw, det) = detector();
        det.touch_last_check("fresh").await.unwrap();
        let state = gw.get_source_state("fresh").await.unwrap().unwrap();
        assert!(!state.has_baseline());
        assert_eq!(det.get_last_known_id("fresh").await, None);
    }

    #[tokio::test]
    async fn read_failure_degrades_to_bootstrap() {
        let (gw, det) = detector();
        det.update_state("demo", &item("I3"), 1).await.unwrap();
        gw.set_fail_reads(true);
        assert_eq!(det.get_last_known_id("demo").await, None);
    }

    #[tokio::test]
    async fn write_failure_is_returned() {
        let (gw, det) = detector();
        gw.set_fail_writes(true);
        assert!(det.update_state("demo", &item("I3"), 1).await.is_err());
        assert!(det.touch_last_check("demo").await.is_err());
    }
}
