//! Shared configuration and error types for the snapsched workspace.

pub mod config;
pub mod error;

pub use config::SnapschedConfig;
pub use error::{CoreError, Result};
