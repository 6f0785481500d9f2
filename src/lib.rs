//! Passport Sync - clinical observation sync from OpenMRS to the patient portal
//!
//! This crate provides the sync engine behind the `psync` CLI.
//!
//! # Architecture
//!
//! - [`source`] - Observation sources (OpenMRS database or REST API)
//! - [`identity`] - Source subject to portal patient resolution
//! - [`materialize`] - Observation to portal record conversion
//! - [`storage`] - SQLite portal datastore with dedup and audit trail
//! - [`sync`] - Polling orchestrator, cursor and retry policy
//! - [`config`] - Settings file, environment and path resolution
//! - [`cli`] - Command-line interface using clap
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod materialize;
pub mod model;
pub mod source;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};
