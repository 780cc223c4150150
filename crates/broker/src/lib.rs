//! Broker automation interface for the fleet controller.
//!
//! The mechanics of talking to the trading venue (locating UI elements,
//! clicking, filling, waiting for page state) live behind the traits in this
//! crate:
//! - [`BrokerChannel`]: order execution and state reads for one session
//! - [`BrokerConnector`]: channel acquisition with restored auth state
//! - [`AuthStateStore`]: persisted per-account authentication blobs
//! - [`sim::SimBroker`]: in-memory venue for tests and the CLI demo

mod auth;
mod channel;
pub mod sim;

pub use auth::AuthStateStore;
pub use channel::{
    with_timeout, AccountState, AuthOutcome, AuthStateBlob, BrokerChannel, BrokerConnector,
    Credentials, OrderRef,
};

/// Error types for broker automation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A venue interaction outlived its deadline.
    #[error("broker call timed out: {operation}")]
    Timeout { operation: String },

    /// A UI landmark the automation relies on was missing.
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// The underlying session is permanently gone.
    #[error("automation channel closed")]
    ChannelClosed,

    /// The credential sequence was rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the failure is worth retrying on the next scheduled tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. } | BrokerError::ElementNotFound(_) | BrokerError::Other(_)
        )
    }

    /// Whether the underlying session is permanently gone and the owning
    /// session should be deregistered.
    pub fn is_channel_gone(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed)
    }
}

/// Module version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Timeout {
            operation: "read".into()
        }
        .is_transient());
        assert!(BrokerError::ElementNotFound("panel".into()).is_transient());
        assert!(!BrokerError::ChannelClosed.is_transient());
        assert!(!BrokerError::AuthenticationFailed("bad password".into()).is_transient());
    }

    #[test]
    fn channel_gone_classification() {
        assert!(BrokerError::ChannelClosed.is_channel_gone());
        assert!(!BrokerError::Timeout {
            operation: "read".into()
        }
        .is_channel_gone());
    }
}
