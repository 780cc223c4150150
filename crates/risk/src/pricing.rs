//! Protective-price computation.
//!
//! Pure functions: given an entry price, direction and the current settings,
//! derive where the stop and the target sit. The stop is always on the loss
//! side of the entry, the target always on the profit side.

use crate::settings::{RiskSettings, ValuationMode};

/// Computed protective prices for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectivePrices {
    pub stop_price: f64,
    pub take_profit_price: f64,
}

/// Compute stop and target prices for a position.
pub fn protective_prices(
    entry_price: f64,
    is_long: bool,
    settings: &RiskSettings,
    symbol: &str,
) -> ProtectivePrices {
    let resolved = settings.resolve_symbol(symbol);

    let stop_distance = distance(
        settings.stop_loss.mode,
        settings.stop_loss.value,
        resolved.stop_points,
        entry_price,
        resolved.tick_value,
    );
    let target_distance = distance(
        settings.take_profit.mode,
        settings.take_profit.value,
        resolved.take_profit_points,
        entry_price,
        resolved.tick_value,
    );

    let stop_price = if is_long {
        entry_price - stop_distance
    } else {
        entry_price + stop_distance
    };
    let take_profit_price = if is_long {
        entry_price + target_distance
    } else {
        entry_price - target_distance
    };

    ProtectivePrices {
        stop_price,
        take_profit_price,
    }
}

/// Distance in points for one valuation mode. Symbol overrides apply in
/// POINTS mode; the other modes size from the global value, with the
/// override's tick value feeding the DOLLAR conversion.
fn distance(
    mode: ValuationMode,
    value: f64,
    resolved_points: f64,
    entry_price: f64,
    tick_value: f64,
) -> f64 {
    match mode {
        ValuationMode::Points => resolved_points,
        ValuationMode::Percentage => entry_price * (value / 100.0),
        ValuationMode::Dollar => value / tick_value,
    }
}
