use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_core::{OrderSide, Position};

use crate::BrokerError;

/// Login credentials for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Login username
    pub username: String,

    /// Login password
    pub password: String,
}

/// Result of running the authentication sequence on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The venue already considered the channel authenticated; no credential
    /// round-trip was performed.
    AlreadyAuthenticated,

    /// Credentials were submitted and accepted. The channel's auth state
    /// should be persisted for reuse.
    NewlyAuthenticated,
}

/// Account-level state read from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    /// Display name reported by the venue
    pub account_name: String,

    /// Account equity
    pub equity: f64,

    /// Open profit/loss
    pub pnl: f64,
}

/// Opaque reference to a working order, usable to modify or link it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef(pub String);

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque persisted authentication state for one account.
///
/// Written after a fresh authentication, read back at connect time. The core
/// never inspects its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthStateBlob(pub serde_json::Value);

/// One automation channel to the venue for a single account.
///
/// Every method is a potentially blocking interaction with the venue; callers
/// wrap each call in [`with_timeout`]. Implementations report recoverable
/// trouble (selector not found, slow page) through transient errors and a
/// dead underlying session through [`BrokerError::ChannelClosed`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Run the authentication sequence, short-circuiting when the venue
    /// already considers the channel logged in.
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthOutcome, BrokerError>;

    /// Read account name, equity and open PnL.
    async fn read_account_state(&self) -> Result<AccountState, BrokerError>;

    /// Read the open-position list.
    async fn read_positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Place a market order.
    async fn place_market_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: OrderSide,
    ) -> Result<OrderRef, BrokerError>;

    /// Place a stop order, optionally trailing at the given distance.
    async fn place_stop_order(
        &self,
        symbol: &str,
        quantity: u32,
        price: f64,
        side: OrderSide,
        trailing: Option<f64>,
    ) -> Result<OrderRef, BrokerError>;

    /// Place a limit order.
    async fn place_limit_order(
        &self,
        symbol: &str,
        quantity: u32,
        price: f64,
        side: OrderSide,
    ) -> Result<OrderRef, BrokerError>;

    /// Link working orders so that filling one cancels the others.
    async fn link_as_oco(&self, orders: &[OrderRef]) -> Result<(), BrokerError>;

    /// Move a working order to a new price.
    async fn modify_order_price(&self, order: &OrderRef, new_price: f64)
        -> Result<(), BrokerError>;

    /// Read the last traded price for a symbol.
    async fn read_last_price(&self, symbol: &str) -> Result<f64, BrokerError>;

    /// Flatten every open position and cancel working orders.
    async fn close_all_positions(&self) -> Result<(), BrokerError>;

    /// Read the configured working order quantity.
    async fn working_quantity(&self) -> Result<u32, BrokerError>;

    /// Set the working order quantity.
    async fn set_working_quantity(&self, quantity: u32) -> Result<(), BrokerError>;

    /// Export the channel's authentication state for persistence.
    async fn export_auth_state(&self) -> Result<AuthStateBlob, BrokerError>;

    /// Release the channel. Further calls fail with
    /// [`BrokerError::ChannelClosed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Factory for automation channels.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Acquire a fresh channel for the account, restoring prior persisted
    /// authentication state when available.
    async fn open_channel(
        &self,
        account_id: &str,
        prior_auth: Option<&AuthStateBlob>,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Run a broker call under a deadline, mapping expiry to
/// [`BrokerError::Timeout`] tagged with the operation name.
pub async fn with_timeout<T, F>(
    duration: Duration,
    operation: &str,
    fut: F,
) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout {
            operation: operation.to_string(),
        }),
    }
}
