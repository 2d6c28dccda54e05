//! stemforge library crate.
//!
//! Drives tracks through Download → Processing (stem separation) →
//! Analysis by invoking native runner scripts, with durable per-stage
//! queues, bounded worker pools and batch fan-out.

pub mod batch;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod source;

pub use error::{Error, Result, StageError};
