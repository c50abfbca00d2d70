//! Chatdesk Common - Shared types and utilities
//!
//! This crate provides configuration, error types and identifiers
//! shared across all Chatdesk components.

pub mod config;
pub mod error;
pub mod types;

pub use self::config::Config;
pub use error::{Error, Result};
