//! mailpost Storage - Staging store
//!
//! Durable scratch space for messages while they move through the
//! ingestion pipeline. Each message lives in its own file, addressed by a
//! random identifier, and is removed once its pipeline finishes.

pub mod staging;

pub use staging::{StagedMessage, StagingId, StagingStore, StagingWriter};
