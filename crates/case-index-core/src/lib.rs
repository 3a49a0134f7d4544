//! # Case Index Core
//!
//! Pure pipeline logic for case-index: HTML table extraction, rule-driven
//! normalization, snapshot versioning and the index backend trait.
//!
//! This crate contains no tokio runtime, HTTP client or filesystem I/O.
//! The `case-index` application crate supplies those.

pub mod backend;
pub mod document;
pub mod empty;
pub mod extract;
pub mod manifest;
pub mod models;
pub mod normalize;
pub mod path;
pub mod rules;
pub mod versioning;
