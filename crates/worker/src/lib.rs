//! `stagehand-worker` library: configuration and argument parsing for the
//! one-job-per-process worker binary.

pub mod cli;
pub mod config;
