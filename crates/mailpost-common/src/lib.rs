//! mailpost Common - Shared types and configuration
//!
//! This crate provides the configuration model, error taxonomy and the
//! envelope types shared by the staging store, the ingestion pipeline and
//! the server binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
