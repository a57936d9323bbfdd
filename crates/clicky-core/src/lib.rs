//! `clicky` Core Library
//!
//! Shared functionality for the clicky gateway:
//! - Event model for the engine's NDJSON lifecycle stream
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod event;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use event::Event;
