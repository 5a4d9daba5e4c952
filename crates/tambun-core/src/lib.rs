//! ============================================================================
//! TAMBUN-CORE: Donation bot engine
//! ============================================================================
//! Everything behind the `tambun` binary:
//! - Webhook parsing, signature checks and event dedup
//! - Conversation state machine and the confirmation lock
//! - Donation ledger and project accounting on an embedded redb store
//! - Messaging platform client, reply composer and daily summary
//! ============================================================================

pub mod composer;
pub mod config;
pub mod db;
pub mod dedup;
pub mod events;
pub mod handler;
pub mod ledger;
pub mod locking;
pub mod messaging;
pub mod server;
pub mod summary;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use types::*;
pub use config::BotConfig;
pub use db::{DbStats, DonationFilter, LedgerDb};
pub use dedup::{DedupGuard, RecentIds};
pub use events::{parse_webhook, verify_signature, EventKind, EventSource, InboundEvent, PostbackAction};
pub use handler::EventHandler;
pub use ledger::{DonationLedger, ProjectBalance, ProjectDayTotal};
pub use locking::{ConfirmationLock, LockOutcome};
pub use messaging::{LineClient, MessagingClient, OutboundMessage};
pub use server::WebhookServer;
pub use summary::SummaryScheduler;
