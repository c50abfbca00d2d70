//! Repository layer for data access
//!
//! Each repository is a trait with a PostgreSQL implementation here and an
//! in-process implementation in [`crate::memory`].

pub mod campaigns;
pub mod contacts;
pub mod recipients;

// Re-export concrete repository implementations
pub use campaigns::DbCampaignRepository;
pub use contacts::DbContactDirectory;
pub use recipients::DbRecipientRepository;

// Re-export repository traits
pub use campaigns::CampaignRepository;
pub use contacts::ContactDirectory;
pub use recipients::RecipientRepository;

pub(crate) fn db_err(e: sqlx::Error) -> chatdesk_common::Error {
    chatdesk_common::Error::Database(e.to_string())
}
