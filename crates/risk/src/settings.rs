//! Risk settings.
//!
//! Process-wide, hot-reconfigurable: the engine reads them on every
//! reconciliation tick, and `update_settings` replaces whole sections without
//! a restart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unit used to size a stop or target distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValuationMode {
    /// The configured value is a point distance
    Points,

    /// The configured value is a percentage of the entry price
    Percentage,

    /// The configured value is a currency amount, converted via tick value
    Dollar,
}

/// Stop-loss configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossSettings {
    /// Whether stops are placed at all
    pub enabled: bool,

    /// How `value` is interpreted
    pub mode: ValuationMode,

    /// Stop distance in the unit selected by `mode`
    pub value: f64,

    /// Whether the engine ratchets the stop behind favorable price movement
    pub trailing: bool,

    /// Trail distance in points
    pub trailing_distance: f64,
}

impl Default for StopLossSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ValuationMode::Points,
            value: 10.0,
            trailing: false,
            trailing_distance: 5.0,
        }
    }
}

/// One partial take-profit level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// Offset from the entry price, in points, in the position's favor
    pub points: f64,

    /// Share of the total quantity to exit at this level
    pub percent: f64,
}

/// Take-profit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitSettings {
    /// Whether targets are placed at all
    pub enabled: bool,

    /// How `value` is interpreted
    pub mode: ValuationMode,

    /// Target distance in the unit selected by `mode`
    pub value: f64,

    /// Whether to scale out across `levels` instead of one target
    pub partial: bool,

    /// Scaling-out levels. Percentages need not sum to 100; the split is
    /// applied as configured.
    pub levels: Vec<TakeProfitLevel>,
}

impl Default for TakeProfitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ValuationMode::Points,
            value: 20.0,
            partial: false,
            levels: vec![
                TakeProfitLevel {
                    points: 10.0,
                    percent: 33.0,
                },
                TakeProfitLevel {
                    points: 20.0,
                    percent: 33.0,
                },
                TakeProfitLevel {
                    points: 30.0,
                    percent: 34.0,
                },
            ],
        }
    }
}

/// Account-wide limits and behavior switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Maximum aggregate daily loss, as a positive magnitude in currency units
    pub max_daily_loss: f64,

    /// Maximum aggregate daily profit in currency units
    pub max_daily_profit: f64,

    /// Points in profit after which the stop moves to break-even; 0 disables
    pub break_even_after_points: f64,

    /// Whether to link stop and target one-cancels-other
    pub use_oco: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            max_daily_loss: 500.0,
            max_daily_profit: 1000.0,
            break_even_after_points: 10.0,
            use_oco: true,
        }
    }
}

/// Per-symbol override of stop/target distances and tick value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolOverride {
    /// Stop distance in points
    pub stop_points: f64,

    /// Target distance in points
    pub take_profit_points: f64,

    /// Currency value of one point per contract
    pub tick_value: f64,
}

/// Symbol parameters after override resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedSymbolSettings {
    pub stop_points: f64,
    pub take_profit_points: f64,
    pub tick_value: f64,
}

/// Full risk configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    pub stop_loss: StopLossSettings,
    pub take_profit: TakeProfitSettings,
    pub general: GeneralSettings,
    pub symbol_overrides: HashMap<String, SymbolOverride>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        let mut symbol_overrides = HashMap::new();
        symbol_overrides.insert(
            "MNQ".to_string(),
            SymbolOverride {
                stop_points: 10.0,
                take_profit_points: 20.0,
                tick_value: 0.5,
            },
        );
        symbol_overrides.insert(
            "NQ".to_string(),
            SymbolOverride {
                stop_points: 40.0,
                take_profit_points: 80.0,
                tick_value: 5.0,
            },
        );
        symbol_overrides.insert(
            "ES".to_string(),
            SymbolOverride {
                stop_points: 10.0,
                take_profit_points: 20.0,
                tick_value: 12.5,
            },
        );
        symbol_overrides.insert(
            "MES".to_string(),
            SymbolOverride {
                stop_points: 10.0,
                take_profit_points: 20.0,
                tick_value: 1.25,
            },
        );
        Self {
            stop_loss: StopLossSettings::default(),
            take_profit: TakeProfitSettings::default(),
            general: GeneralSettings::default(),
            symbol_overrides,
        }
    }
}

impl RiskSettings {
    /// Resolve the parameters for a symbol, falling back to the generic
    /// settings (and tick value 1) when it has no override.
    pub fn resolve_symbol(&self, symbol: &str) -> ResolvedSymbolSettings {
        match self.symbol_overrides.get(symbol) {
            Some(over) => ResolvedSymbolSettings {
                stop_points: over.stop_points,
                take_profit_points: over.take_profit_points,
                tick_value: if over.tick_value > 0.0 {
                    over.tick_value
                } else {
                    1.0
                },
            },
            None => ResolvedSymbolSettings {
                stop_points: self.stop_loss.value,
                take_profit_points: self.take_profit.value,
                tick_value: 1.0,
            },
        }
    }

    /// Apply a patch, replacing every section it provides.
    pub fn apply(&mut self, patch: RiskSettingsPatch) {
        if let Some(stop_loss) = patch.stop_loss {
            self.stop_loss = stop_loss;
        }
        if let Some(take_profit) = patch.take_profit {
            self.take_profit = take_profit;
        }
        if let Some(general) = patch.general {
            self.general = general;
        }
        if let Some(symbol_overrides) = patch.symbol_overrides {
            self.symbol_overrides = symbol_overrides;
        }
    }
}

/// Partial update to [`RiskSettings`]; provided sections replace the current
/// ones wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<StopLossSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<TakeProfitSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general: Option<GeneralSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_overrides: Option<HashMap<String, SymbolOverride>>,
}
