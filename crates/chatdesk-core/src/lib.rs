//! Chatdesk Core - Blast campaign engine
//!
//! This crate turns a campaign definition into individually generated
//! messages, holds them for operator review and dispatches the approved ones
//! through the channel adapter at randomized intervals.

pub mod ai;
pub mod blast;
pub mod channel;
pub mod metrics;

pub use ai::{ContactContext, HttpTextGenerator, TextGenerator};
pub use blast::{
    BatchReport, BlastEngine, BlastError, BlastResult, CampaignManager, CampaignStats,
    EngineContext, EngineSettings, GenerationScheduler, NewCampaign, PacerRegistry, QueueView,
    Recovery, RecoveryReport, ReviewGate, Supervisor,
};
pub use channel::{ChannelAdapter, HttpChannelAdapter, OutboundMessage};
pub use metrics::BlastMetrics;
