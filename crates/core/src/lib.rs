//! Shared domain types for the fleet controller.
//!
//! This crate holds what every other fleet crate agrees on:
//! - Account, position and snapshot types
//! - Session lifecycle statuses and per-account operation outcomes
//! - The outward event contract and its broadcast bus
//! - Process configuration

mod config;
mod events;
mod types;

pub use config::FleetConfig;
pub use events::{EventBus, FleetEvent};
pub use types::{
    AccountId, AccountOutcome, AccountSnapshot, AccountStatusRecord, CloseAllReceipt,
    OrderReceipt, OrderSide, OrderType, Position, QuantityChange, SessionStatus,
};

/// Module version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
