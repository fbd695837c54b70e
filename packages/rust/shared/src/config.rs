//! Application configuration for changewatch.
//!
//! User config lives at `~/.changewatch/changewatch.toml` unless a path is
//! given explicitly. The file is validated once at load time via
//! [`AppConfig::validate`], which also resolves every `[[sources]]` entry into
//! a [`SourceConfig`] carrying its effective timing, header and block settings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ChangeWatchError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "changewatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".changewatch";

/// Largest accepted `[backoff] ceiling_secs` (one week).
pub const MAX_BACKOFF_CEILING_SECS: u64 = 7 * 24 * 3600;

// ---------------------------------------------------------------------------
// Config structs (matching changewatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduler defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Backoff applied to blocked sources.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Extraction worker invocation.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Downstream processing trigger, fired after a successful worker run.
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Default timing profile for sources without an override.
    #[serde(default)]
    pub timing: TimingProfile,

    /// Default header pool for sources without an override.
    #[serde(default)]
    pub headers: HeaderPool,

    /// Default block signature set for sources without an override.
    #[serde(default)]
    pub block_signatures: BlockSignatureSet,

    /// Polled sources.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Seconds between scheduler rounds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Each round's sleep is shifted by a random offset within ±jitter seconds.
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_secs: u64,

    /// Sources cycled concurrently within a round.
    #[serde(default = "default_parallel_sources")]
    pub max_parallel_sources: u32,

    /// Hard upper bound on one listing fetch, including its jitter delay.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// libSQL database file. A leading `~` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_jitter_secs: default_poll_jitter(),
            max_parallel_sources: default_parallel_sources(),
            fetch_timeout_secs: default_fetch_timeout(),
            database_path: default_database_path(),
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}
fn default_poll_jitter() -> u64 {
    30
}
fn default_parallel_sources() -> u32 {
    4
}
fn default_fetch_timeout() -> u64 {
    45
}
fn default_database_path() -> String {
    "~/.changewatch/changewatch.db".into()
}

/// `[backoff]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a block.
    #[serde(default = "default_backoff_floor")]
    pub floor_secs: u64,

    /// Maximum delay.
    #[serde(default = "default_backoff_ceiling")]
    pub ceiling_secs: u64,

    /// Growth factor per consecutive block.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Additive jitter as a fraction of the raw delay.
    #[serde(default = "default_backoff_jitter")]
    pub jitter_ratio: f64,

    /// Escalation is forgotten this long after the last block.
    #[serde(default = "default_backoff_reset")]
    pub reset_after_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor_secs: default_backoff_floor(),
            ceiling_secs: default_backoff_ceiling(),
            multiplier: default_backoff_multiplier(),
            jitter_ratio: default_backoff_jitter(),
            reset_after_secs: default_backoff_reset(),
        }
    }
}

fn default_backoff_floor() -> u64 {
    60
}
fn default_backoff_ceiling() -> u64 {
    3600
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_jitter() -> f64 {
    0.25
}
fn default_backoff_reset() -> u64 {
    6 * 3600
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program and leading arguments, e.g. `["node", "extract.js"]`.
    #[serde(default)]
    pub command: Vec<String>,

    /// Hard timeout after which the worker is killed.
    #[serde(default = "default_worker_timeout")]
    pub timeout_secs: u64,

    /// Working directory for the worker process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_worker_timeout(),
            working_dir: None,
        }
    }
}

fn default_worker_timeout() -> u64 {
    900
}

/// `[processing]` section. At most one of `command` / `webhook_url` is used;
/// with neither set, no processing is triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Processing still running after this long is abandoned (the command is killed).
    #[serde(default = "default_processing_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            webhook_url: None,
            timeout_secs: default_processing_timeout(),
        }
    }
}

fn default_processing_timeout() -> u64 {
    300
}

/// Randomized request pacing for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingProfile {
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_min_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    2500
}
fn default_request_timeout() -> u64 {
    20
}

/// Identifying headers rotated per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPool {
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    #[serde(default = "default_accept_languages")]
    pub accept_languages: Vec<String>,
}

impl Default for HeaderPool {
    fn default() -> Self {
        Self {
            user_agents: default_user_agents(),
            accept_languages: default_accept_languages(),
        }
    }
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_accept_languages() -> Vec<String> {
    ["en-US,en;q=0.9", "en-GB,en;q=0.8", "en-US,en;q=0.8,de;q=0.6"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Patterns that mark a response as refused rather than served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignatureSet {
    /// Rate-limit / refusal status codes.
    #[serde(default = "default_block_statuses")]
    pub status_codes: Vec<u16>,

    /// Case-insensitive interstitial markers searched in the body.
    #[serde(default = "default_block_markers")]
    pub body_markers: Vec<String>,

    /// Bodies shorter than this are treated as anomalous.
    #[serde(default = "default_min_body_bytes")]
    pub min_body_bytes: usize,
}

impl Default for BlockSignatureSet {
    fn default() -> Self {
        Self {
            status_codes: default_block_statuses(),
            body_markers: default_block_markers(),
            min_body_bytes: default_min_body_bytes(),
        }
    }
}

fn default_block_statuses() -> Vec<u16> {
    vec![403, 429, 503]
}
fn default_block_markers() -> Vec<String> {
    [
        "cf-challenge",
        "challenge-platform",
        "_incapsula_resource",
        "px-captcha",
        "unusual traffic",
        "verify you are human",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_min_body_bytes() -> usize {
    256
}

/// How items are extracted from a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// CSS selector matching one element per item, newest first.
    pub item_selector: String,

    /// Link selector relative to the item (default: the item or its first `a[href]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_selector: Option<String>,

    /// Title selector relative to the item (default: link text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_selector: Option<String>,

    /// Date selector relative to the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_selector: Option<String>,

    /// Attribute holding the date (default: element text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_attr: Option<String>,

    /// Regex with one capture group extracting the item id from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,

    /// Items beyond this many are ignored.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_max_items() -> usize {
    50
}

fn default_true() -> bool {
    true
}

/// `[[sources]]` entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Unique source identifier.
    pub id: String,
    /// Listing page URL.
    pub listing_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub extraction: ExtractionRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderPool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_signatures: Option<BlockSignatureSet>,
}

// ---------------------------------------------------------------------------
// Resolved source config
// ---------------------------------------------------------------------------

/// A validated source with all overrides applied.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source_id: String,
    pub listing_url: Url,
    pub extraction_rule: ExtractionRule,
    pub block_signature_set: BlockSignatureSet,
    pub timing_profile: TimingProfile,
    pub header_pool: HeaderPool,
    pub enabled: bool,
}

impl SourceConfig {
    /// A source using the global defaults for everything but its rule.
    pub fn new(
        source_id: impl Into<String>,
        listing_url: Url,
        extraction_rule: ExtractionRule,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url,
            extraction_rule,
            block_signature_set: BlockSignatureSet::default(),
            timing_profile: TimingProfile::default(),
            header_pool: HeaderPool::default(),
            enabled: true,
        }
    }
}

impl AppConfig {
    /// Validate the whole file. Call once after loading.
    pub fn validate(&self) -> Result<Vec<SourceConfig>> {
        if self.worker.command.is_empty() {
            return Err(ChangeWatchError::config(
                "[worker] command must name the extraction worker program",
            ));
        }
        if self.worker.timeout_secs == 0 {
            return Err(ChangeWatchError::config("[worker] timeout_secs must be > 0"));
        }
        if self.processing.timeout_secs == 0 {
            return Err(ChangeWatchError::config("[processing] timeout_secs must be > 0"));
        }
        if !self.processing.command.is_empty() && self.processing.webhook_url.is_some() {
            return Err(ChangeWatchError::config(
                "[processing] set either command or webhook_url, not both",
            ));
        }
        if let Some(hook) = &self.processing.webhook_url {
            Url::parse(hook).map_err(|e| {
                ChangeWatchError::config(format!("[processing] invalid webhook_url '{hook}': {e}"))
            })?;
        }
        if self.defaults.max_parallel_sources == 0 {
            return Err(ChangeWatchError::config(
                "[defaults] max_parallel_sources must be > 0",
            ));
        }
        if self.defaults.fetch_timeout_secs == 0 {
            return Err(ChangeWatchError::config(
                "[defaults] fetch_timeout_secs must be > 0",
            ));
        }
        validate_backoff(&self.backoff)?;
        self.resolve_sources()
    }

    /// Resolve `[[sources]]` into [`SourceConfig`]s, applying global defaults.
    pub fn resolve_sources(&self) -> Result<Vec<SourceConfig>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.sources.len());

        for entry in &self.sources {
            let id = entry.id.trim();
            if id.is_empty() {
                return Err(ChangeWatchError::config("source id must not be empty"));
            }
            if !seen.insert(id.to_string()) {
                return Err(ChangeWatchError::config(format!(
                    "duplicate source id '{id}'"
                )));
            }

            let listing_url = Url::parse(&entry.listing_url).map_err(|e| {
                ChangeWatchError::config(format!(
                    "source '{id}': invalid listing_url '{}': {e}",
                    entry.listing_url
                ))
            })?;
            if !matches!(listing_url.scheme(), "http" | "https") {
                return Err(ChangeWatchError::config(format!(
                    "source '{id}': listing_url must be http or https"
                )));
            }

            validate_rule(id, &entry.extraction)?;

            let timing = entry.timing.clone().unwrap_or_else(|| self.timing.clone());
            if timing.min_delay_ms > timing.max_delay_ms {
                return Err(ChangeWatchError::config(format!(
                    "source '{id}': min_delay_ms exceeds max_delay_ms"
                )));
            }
            if timing.request_timeout_secs == 0 {
                return Err(ChangeWatchError::config(format!(
                    "source '{id}': request_timeout_secs must be > 0"
                )));
            }

            let headers = entry.headers.clone().unwrap_or_else(|| self.headers.clone());
            if headers.user_agents.is_empty() || headers.accept_languages.is_empty() {
                return Err(ChangeWatchError::config(format!(
                    "source '{id}': header pool needs at least one user agent and one accept-language"
                )));
            }

            resolved.push(SourceConfig {
                source_id: id.to_string(),
                listing_url,
                extraction_rule: entry.extraction.clone(),
                block_signature_set: entry
                    .block_signatures
                    .clone()
                    .unwrap_or_else(|| self.block_signatures.clone()),
                timing_profile: timing,
                header_pool: headers,
                enabled: entry.enabled,
            });
        }

        Ok(resolved)
    }

    /// Resolved database path with `~` expanded.
    pub fn database_path(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.database_path)
    }
}

fn validate_backoff(backoff: &BackoffConfig) -> Result<()> {
    if backoff.floor_secs == 0 || backoff.floor_secs > backoff.ceiling_secs {
        return Err(ChangeWatchError::config(
            "[backoff] floor_secs must be > 0 and <= ceiling_secs",
        ));
    }
    if backoff.ceiling_secs > MAX_BACKOFF_CEILING_SECS {
        return Err(ChangeWatchError::config(format!(
            "[backoff] ceiling_secs must be <= {MAX_BACKOFF_CEILING_SECS}"
        )));
    }
    if backoff.multiplier < 1.0 {
        return Err(ChangeWatchError::config("[backoff] multiplier must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&backoff.jitter_ratio) {
        return Err(ChangeWatchError::config(
            "[backoff] jitter_ratio must be within 0.0..=1.0",
        ));
    }
    Ok(())
}

fn validate_rule(id: &str, rule: &ExtractionRule) -> Result<()> {
    if rule.item_selector.trim().is_empty() {
        return Err(ChangeWatchError::config(format!(
            "source '{id}': extraction.item_selector must not be empty"
        )));
    }
    if rule.max_items == 0 {
        return Err(ChangeWatchError::config(format!(
            "source '{id}': extraction.max_items must be > 0"
        )));
    }
    if let Some(pattern) = &rule.id_pattern {
        let re = regex::Regex::new(pattern).map_err(|e| {
            ChangeWatchError::config(format!("source '{id}': invalid id_pattern: {e}"))
        })?;
        if re.captures_len() < 2 {
            return Err(ChangeWatchError::config(format!(
                "source '{id}': id_pattern needs one capture group"
            )));
        }
    }
    Ok(())
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ChangeWatchError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.changewatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ChangeWatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.changewatch/changewatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ChangeWatchError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ChangeWatchError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| ChangeWatchError::io(dir, e))?;
    }

    let path = path.to_path_buf();
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ChangeWatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ChangeWatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
