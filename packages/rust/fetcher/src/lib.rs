//! Listing fetcher, block detection, and backoff.
//!
//! This crate provides:
//! - [`LightFetcher`]: one-request listing fetch classified as OK / BLOCKED / ERROR
//! - [`ListingExtractor`]: selector-driven extraction of ordered listing items
//! - [`Backoff`]: per-source exponential backoff for blocked sources
//! - [`headers`] and [`timing`]: request identity rotation and jitter

pub mod backoff;
pub mod block;
pub mod engine;
pub mod extract;
pub mod headers;
pub mod timing;

pub use backoff::Backoff;
pub use block::{BlockReason, body_blocked, status_blocked};
pub use engine::LightFetcher;
pub use extract::{ListingExtractor, item_id_for};
