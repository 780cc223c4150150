//! Automatic risk-control engine.
//!
//! Watches the session manager's snapshots and protects every open position:
//! - stop-loss / take-profit placement with per-symbol overrides
//! - break-even promotion and trailing-stop ratcheting
//! - partial take-profit scaling across configured levels
//! - account-wide daily loss/profit limits with global close-all

mod engine;
mod pricing;
mod settings;

pub use engine::{RiskEngine, RiskStatistics, TrackedOrder};
pub use pricing::{protective_prices, ProtectivePrices};
pub use settings::{
    GeneralSettings, ResolvedSymbolSettings, RiskSettings, RiskSettingsPatch, StopLossSettings,
    SymbolOverride, TakeProfitLevel, TakeProfitSettings, ValuationMode,
};

/// Module version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
