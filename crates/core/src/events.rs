//! Outward event contract.
//!
//! The risk engine reports its decisions on an explicit bus rather than an
//! ambient emitter; consumers subscribe and receive every event published
//! after the subscription.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Events emitted by the core toward its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FleetEvent {
    /// Risk settings were replaced or patched
    SettingsUpdated,

    /// Protective orders were attached to a new position
    SlTpAdded {
        symbol: String,
        stop_price: f64,
        take_profit_price: f64,
    },

    /// A stop was promoted to break-even
    BreakevenMoved { symbol: String, new_stop_price: f64 },

    /// Aggregate daily PnL crossed the loss bound
    MaxDailyLossReached { amount: f64 },

    /// Aggregate daily PnL crossed the profit bound
    MaxDailyProfitReached { amount: f64 },

    /// The reconciliation loop started
    MonitoringStarted,

    /// The reconciliation loop stopped
    MonitoringStopped,
}

/// Broadcast bus carrying [`FleetEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// Create a bus with the given buffered capacity per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Events published with no subscribers are dropped.
    pub fn publish(&self, event: FleetEvent) {
        debug!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
