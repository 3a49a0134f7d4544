//! # Case Index
//!
//! Ingestion of scraped court-case records into a search index.
//!
//! Each case directory holds a `manifest.json` and one or more timestamped
//! HTML snapshots. Every snapshot is turned into one versioned document:
//! its tables are extracted, normalized through a declarative rule set and
//! delivered in calendar buckets, with exactly one document per case
//! flagged as the latest.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌──────────┐   ┌───────────────┐
//! │ traverse  │──▶│ extract+normalize │──▶│ delivery │──▶│ Elasticsearch │
//! │ manifests │   │  (worker pool)    │   │ buckets  │   │  _bulk / ubq  │
//! └───────────┘   └──────────────────┘   └──────────┘   └───────────────┘
//! ```
//!
//! The pure logic (extraction, rules, normalization, versioning, backend
//! trait) lives in `case_index_core`; this crate adds I/O and concurrency.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`traverse`] | Case directory discovery |
//! | [`ingest`] | Import orchestration, worker pool, backpressure |
//! | [`delivery`] | Bucketing, batching, retry/backoff |
//! | [`elastic`] | Elasticsearch backend |
//! | [`metrics`] | Run counters |
//! | [`progress`] | Progress reporting on stderr |

pub mod config;
pub mod delivery;
pub mod elastic;
pub mod ingest;
pub mod metrics;
pub mod progress;
pub mod traverse;
