//! Ephemeral image conversion service
//!
//! Accepts batches of uploaded images, converts them to JPEG, PNG or WebP under
//! a fixed concurrency ceiling, and serves the results for a limited time
//! before deleting them.

pub mod app;
pub mod codec;
pub mod engine;
pub mod error;
pub mod models;
pub mod retention;
pub mod server;

pub use error::{Error, Result};
