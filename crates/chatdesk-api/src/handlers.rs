//! API request handlers

pub mod campaigns;
pub mod health;
pub mod recipients;

pub use health::*;
