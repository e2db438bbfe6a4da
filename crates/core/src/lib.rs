//! Core domain logic for phased job caching.
//!
//! Fingerprinting, the per-job metadata record, deliverable verification,
//! and the profiler. Everything here is filesystem- or memory-backed and
//! free of any execution backend.

pub mod config;
pub mod deliverable;
pub mod descriptor;
pub mod error;
pub mod estimation;
pub mod fingerprint;
pub mod metadata;
pub mod profiler;
pub mod types;
