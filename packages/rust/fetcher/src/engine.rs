//! Lightweight listing fetcher.
//!
//! One GET per poll: random pre-request delay, rotated identifying headers,
//! a per-request timeout, then classification into OK / BLOCKED / ERROR.
//! The fetcher never raises; every outcome is a [`FetchResult`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use tracing::{debug, info, instrument, warn};

use changewatch_shared::{ChangeWatchError, FetchResult, Result, SourceConfig};

use crate::block::{body_blocked, status_blocked};
use crate::extract::ListingExtractor;
use crate::headers::{self, ACCEPT_HTML};
use crate::timing::jitter_delay;

/// Fetches and classifies listing pages.
pub struct LightFetcher {
    client: Client,
    extractors: RwLock<HashMap<String, Arc<ListingExtractor>>>,
}

impl LightFetcher {
    /// Build the HTTP client and compile the extraction rule of every source.
    pub fn new(sources: &[SourceConfig]) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ChangeWatchError::Fetch(format!("failed to build HTTP client: {e}")))?;

        let mut extractors = HashMap::with_capacity(sources.len());
        for source in sources {
            let extractor = ListingExtractor::compile(&source.extraction_rule).map_err(|e| {
                ChangeWatchError::config(format!("source '{}': {e}", source.source_id))
            })?;
            extractors.insert(source.source_id.clone(), Arc::new(extractor));
        }

        Ok(Self {
            client,
            extractors: RwLock::new(extractors),
        })
    }

    /// Fetch one listing page and classify the outcome.
    #[instrument(skip_all, fields(source_id = %source.source_id, url = %source.listing_url))]
    pub async fn fetch(&self, source: &SourceConfig) -> FetchResult {
        let delay = jitter_delay(&source.timing_profile);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "pre-request delay");
            tokio::time::sleep(delay).await;
        }

        let identity = headers::pick(&source.header_pool);
        let timeout = Duration::from_secs(source.timing_profile.request_timeout_secs);
        let sigs = &source.block_signature_set;

        let response = match self
            .client
            .get(source.listing_url.clone())
            .header(USER_AGENT, identity.user_agent)
            .header(ACCEPT_LANGUAGE, identity.accept_language)
            .header(ACCEPT, ACCEPT_HTML)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let diagnostic = describe_transport_error(&e, timeout);
                warn!(%diagnostic, "listing fetch failed");
                return FetchResult::error(diagnostic, None);
            }
        };

        let status = response.status();
        let code = status.as_u16();

        if let Some(reason) = status_blocked(code, sigs) {
            warn!(status = code, %reason, "listing fetch blocked");
            return FetchResult::blocked(reason.to_string(), Some(code));
        }
        if !status.is_success() {
            warn!(status = code, "listing fetch returned non-success status");
            return FetchResult::error(format!("HTTP {status}"), Some(code));
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                let diagnostic = describe_transport_error(&e, timeout);
                warn!(%diagnostic, "listing body read failed");
                return FetchResult::error(diagnostic, Some(code));
            }
        };

        if let Some(reason) = body_blocked(&body, sigs) {
            warn!(status = code, body_len = body.len(), %reason, "listing fetch blocked");
            return FetchResult::blocked(reason.to_string(), Some(code));
        }

        let extractor = match self.extractor(source) {
            Ok(ex) => ex,
            Err(e) => {
                warn!(error = %e, "extraction rule unusable");
                return FetchResult::error(e.to_string(), Some(code));
            }
        };

        let items = extractor.extract(&body, &source.listing_url);
        if items.is_empty() {
            warn!(
                body_len = body.len(),
                "listing parsed but no items matched; check the item selector"
            );
        } else {
            info!(items = items.len(), "listing fetched");
        }

        FetchResult::ok(items, code)
    }

    /// Cached extractor for the source, compiled on first use.
    fn extractor(&self, source: &SourceConfig) -> Result<Arc<ListingExtractor>> {
        if let Some(ex) = self
            .extractors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&source.source_id)
        {
            return Ok(Arc::clone(ex));
        }

        let compiled = Arc::new(ListingExtractor::compile(&source.extraction_rule)?);
        self.extractors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.source_id.clone(), Arc::clone(&compiled));
        Ok(compiled)
    }
}

fn describe_transport_error(e: &reqwest::Error, timeout: Duration) -> String {
    if e.is_timeout() {
        format!("request timed out after {}s", timeout.as_secs())
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        format!("transport error: {e}")
    }
}
