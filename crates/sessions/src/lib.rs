//! Multi-account session lifecycle manager.
//!
//! Keeps N independent venue sessions alive:
//! - connect/authenticate with persisted auth-state reuse
//! - one poll loop per session refreshing an atomic snapshot
//! - bulk fan-out (buy/sell/close) with per-account failure isolation
//! - working-quantity adjustment and status queries

mod manager;

pub use manager::SessionManager;

use serde::{Deserialize, Serialize};

use fleet_broker::BrokerError;
use fleet_core::AccountId;

/// Handle returned by a successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    /// The account the session belongs to
    pub account_id: AccountId,
}

/// Error types for session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session already exists for the account.
    #[error("account {0} is already connected")]
    AlreadyConnected(AccountId),

    /// The operation requires a connected session.
    #[error("account {0} is not connected")]
    NotConnected(AccountId),

    /// Channel acquisition or the login sequence failed; nothing stays
    /// registered.
    #[error("connect failed for {account_id}: {reason}")]
    ConnectFailed { account_id: AccountId, reason: String },

    /// The configured account cap is reached.
    #[error("account limit reached ({0})")]
    AccountLimitReached(usize),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Module version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
