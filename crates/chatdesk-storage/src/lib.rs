//! Chatdesk Storage - Persistence for blast campaigns
//!
//! This crate provides the campaign, recipient and contact repositories
//! used by the blast engine. Two backends implement the same traits:
//! PostgreSQL through sqlx, and an in-process store for development and tests.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::{DatabasePool, MEMORY_BACKEND, POSTGRES_BACKEND};
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
