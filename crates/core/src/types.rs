use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-assigned, stable identifier for a trading account.
pub type AccountId = String;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy order
    Buy,

    /// Sell order
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened on this side.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type for entry orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Market order
    Market,

    /// Limit order
    Limit,
}

/// An open position as read from the venue.
///
/// Positions carry no identity beyond `(account, symbol)`; the whole list is
/// replaced on every poll and a position exists only while it appears in the
/// latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Contract symbol
    pub symbol: String,

    /// Signed quantity: positive = long, negative = short
    pub quantity: f64,

    /// Average entry price
    pub avg_price: f64,

    /// Unrealized profit/loss
    pub unrealized_pnl: f64,
}

impl Position {
    /// Whether the position is long.
    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// No session exists for the account
    Disconnected,

    /// Automation channel is being acquired
    Connecting,

    /// Credential sequence is running
    Authenticating,

    /// Session is live and polled
    Connected,

    /// Setup failed; terminal for that connect attempt
    Error,

    /// Session was shut down
    Closed,
}

/// The most recently polled state of one account session.
///
/// Replaced wholesale on every successful poll tick; readers always observe a
/// complete snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Display name reported by the venue
    pub account_name: String,

    /// Account equity
    pub equity: f64,

    /// Open profit/loss across the account
    pub unrealized_pnl: f64,

    /// Alias of equity, kept for backward compatibility
    pub balance: f64,

    /// Open positions, in venue order
    pub positions: Vec<Position>,

    /// When this snapshot was taken
    pub last_update: DateTime<Utc>,
}

impl AccountSnapshot {
    /// An empty snapshot for a session that has not completed a poll yet.
    pub fn empty() -> Self {
        Self {
            account_name: String::new(),
            equity: 0.0,
            unrealized_pnl: 0.0,
            balance: 0.0,
            positions: Vec::new(),
            last_update: Utc::now(),
        }
    }
}

/// Status record returned by the status query, one per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatusRecord {
    /// Account identifier
    pub account_id: AccountId,

    /// Login username
    pub username: String,

    /// Display name reported by the venue
    pub account_name: String,

    /// Lifecycle status
    pub status: SessionStatus,

    /// Alias of equity, kept for backward compatibility
    pub balance: f64,

    /// Account equity
    pub equity: f64,

    /// Open profit/loss
    pub pnl: f64,

    /// Open positions
    pub positions: Vec<Position>,

    /// Last snapshot time
    pub last_update: DateTime<Utc>,
}

/// Receipt for a placed entry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    /// Contract symbol
    pub symbol: String,

    /// Contracts placed
    pub quantity: u32,

    /// Order side
    pub side: OrderSide,

    /// Placement time
    pub placed_at: DateTime<Utc>,
}

/// Receipt for a close-all request against one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseAllReceipt {
    /// Completion time
    pub closed_at: DateTime<Utc>,
}

/// Result of a working-quantity adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityChange {
    /// Quantity before the adjustment
    pub old_quantity: u32,

    /// Quantity after clamping
    pub new_quantity: u32,
}

/// Per-account outcome of a bulk operation.
///
/// Bulk fan-out never escalates one account's failure to the batch; every
/// account gets exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountOutcome<T> {
    /// Account identifier
    pub account_id: AccountId,

    /// Login username
    pub username: String,

    /// Whether the per-account operation succeeded
    pub success: bool,

    /// Operation result, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,

    /// Failure reason, present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> AccountOutcome<T> {
    /// Successful outcome for one account.
    pub fn ok(account_id: impl Into<AccountId>, username: impl Into<String>, result: T) -> Self {
        Self {
            account_id: account_id.into(),
            username: username.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed outcome for one account.
    pub fn failed(
        account_id: impl Into<AccountId>,
        username: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            username: username.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
