//! Mediopt API Library
//!
//! This crate provides the HTTP handlers and application setup for the
//! optimize-and-upload service.

pub mod error;
pub mod handlers;
pub mod setup;
pub mod state;
pub mod telemetry;

// Re-exports
pub use error::{ErrorResponse, HttpAppError};
pub use state::AppState;
