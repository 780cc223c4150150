//! Command dispatcher.
//!
//! Routes an inbound command (bulk or single-account) to the session manager
//! or risk engine and normalizes the result. The transport that delivers
//! commands (HTTP, push channel, shell) lives outside this crate; every
//! command yields a definitive, serializable response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fleet_broker::Credentials;
use fleet_core::{
    AccountOutcome, AccountStatusRecord, CloseAllReceipt, OrderReceipt, OrderType, QuantityChange,
};
use fleet_risk::{RiskEngine, RiskSettings, RiskSettingsPatch, RiskStatistics};
use fleet_sessions::{SessionError, SessionHandle, SessionManager};

/// Commands accepted from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Connect and register one account
    Connect {
        account_id: String,
        credentials: Credentials,
    },

    /// Disconnect one account
    Disconnect { account_id: String },

    /// Market-buy on every connected account
    BuyAll {
        symbol: String,
        quantity: u32,
        order_type: OrderType,
    },

    /// Market-sell on every connected account
    SellAll {
        symbol: String,
        quantity: u32,
        order_type: OrderType,
    },

    /// Flatten every position on every connected account
    CloseAll,

    /// Adjust one account's working order quantity
    ChangeQuantity { account_id: String, delta: i32 },

    /// Patch the risk settings
    UpdateRiskSettings(RiskSettingsPatch),

    /// Start the risk reconciliation loop
    StartMonitoring,

    /// Stop the risk reconciliation loop
    StopMonitoring,

    /// Read the status of every registered account
    AccountsStatus,

    /// Read the risk engine counters
    RiskStatistics,
}

/// Normalized command responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CommandResponse {
    Connected {
        handle: SessionHandle,
    },
    Disconnected {
        account_id: String,
    },
    OrderOutcomes {
        outcomes: Vec<AccountOutcome<OrderReceipt>>,
    },
    CloseOutcomes {
        outcomes: Vec<AccountOutcome<CloseAllReceipt>>,
    },
    QuantityChanged {
        account_id: String,
        change: QuantityChange,
    },
    RiskSettingsUpdated {
        settings: RiskSettings,
    },
    MonitoringStarted,
    MonitoringStopped,
    AccountsStatus {
        accounts: Vec<AccountStatusRecord>,
    },
    RiskStatistics {
        statistics: RiskStatistics,
    },
}

/// Thin router in front of the session manager and risk engine.
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    risk: Arc<RiskEngine>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionManager>, risk: Arc<RiskEngine>) -> Self {
        Self { sessions, risk }
    }

    /// Route one command and normalize its outcome.
    pub async fn dispatch(&self, command: Command) -> Result<CommandResponse, SessionError> {
        match command {
            Command::Connect {
                account_id,
                credentials,
            } => {
                let handle = self.sessions.connect(&account_id, credentials).await?;
                Ok(CommandResponse::Connected { handle })
            }
            Command::Disconnect { account_id } => {
                self.sessions.disconnect(&account_id).await;
                Ok(CommandResponse::Disconnected { account_id })
            }
            Command::BuyAll {
                symbol,
                quantity,
                order_type,
            } => {
                let outcomes = self.sessions.bulk_buy(&symbol, quantity, order_type).await;
                Ok(CommandResponse::OrderOutcomes { outcomes })
            }
            Command::SellAll {
                symbol,
                quantity,
                order_type,
            } => {
                let outcomes = self.sessions.bulk_sell(&symbol, quantity, order_type).await;
                Ok(CommandResponse::OrderOutcomes { outcomes })
            }
            Command::CloseAll => {
                let outcomes = self.sessions.close_all().await;
                Ok(CommandResponse::CloseOutcomes { outcomes })
            }
            Command::ChangeQuantity { account_id, delta } => {
                let change = self.sessions.change_quantity(&account_id, delta).await?;
                Ok(CommandResponse::QuantityChanged { account_id, change })
            }
            Command::UpdateRiskSettings(patch) => {
                self.risk.update_settings(patch);
                Ok(CommandResponse::RiskSettingsUpdated {
                    settings: self.risk.settings(),
                })
            }
            Command::StartMonitoring => {
                Arc::clone(&self.risk).start_monitoring();
                Ok(CommandResponse::MonitoringStarted)
            }
            Command::StopMonitoring => {
                self.risk.stop_monitoring();
                Ok(CommandResponse::MonitoringStopped)
            }
            Command::AccountsStatus => Ok(CommandResponse::AccountsStatus {
                accounts: self.sessions.status_snapshot_all(),
            }),
            Command::RiskStatistics => Ok(CommandResponse::RiskStatistics {
                statistics: self.risk.get_statistics(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_broker::sim::SimBroker;
    use fleet_core::{EventBus, FleetConfig, Position, SessionStatus};

    struct Harness {
        dispatcher: Dispatcher,
        broker: Arc<SimBroker>,
        _auth_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let auth_dir = tempfile::tempdir().unwrap();
        let config = FleetConfig {
            poll_interval_ms: 10,
            broker_call_timeout_ms: 500,
            login_timeout_ms: 500,
            auth_state_dir: auth_dir.path().to_path_buf(),
            ..FleetConfig::default()
        };
        let broker = Arc::new(SimBroker::new());
        let sessions = Arc::new(SessionManager::new(config.clone(), broker.clone()));
        let risk = Arc::new(RiskEngine::new(&config, sessions.clone(), EventBus::default()));
        Harness {
            dispatcher: Dispatcher::new(sessions, risk),
            broker,
            _auth_dir: auth_dir,
        }
    }

    fn connect_command(account_id: &str) -> Command {
        Command::Connect {
            account_id: account_id.to_string(),
            credentials: Credentials {
                username: account_id.to_string(),
                password: "secret".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn connect_then_status_round_trip() {
        let h = harness();
        let response = h.dispatcher.dispatch(connect_command("acct-1")).await.unwrap();
        assert!(matches!(
            response,
            CommandResponse::Connected { handle } if handle.account_id == "acct-1"
        ));

        let response = h.dispatcher.dispatch(Command::AccountsStatus).await.unwrap();
        match response {
            CommandResponse::AccountsStatus { accounts } => {
                assert_eq!(accounts.len(), 1);
                assert_eq!(accounts[0].status, SessionStatus::Connected);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn bulk_buy_normalizes_per_account_outcomes() {
        let h = harness();
        for id in ["acct-1", "acct-2"] {
            h.broker.account(id).set_last_price("NQ", 15_000.0);
            h.dispatcher.dispatch(connect_command(id)).await.unwrap();
        }
        h.broker.account("acct-2").set_fail_orders(true);

        let response = h
            .dispatcher
            .dispatch(Command::BuyAll {
                symbol: "NQ".to_string(),
                quantity: 1,
                order_type: OrderType::Market,
            })
            .await
            .unwrap();

        match response {
            CommandResponse::OrderOutcomes { mut outcomes } => {
                outcomes.sort_by(|a, b| a.account_id.cmp(&b.account_id));
                assert_eq!(outcomes.len(), 2);
                assert!(outcomes[0].success);
                assert!(!outcomes[1].success);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn change_quantity_routes_and_reports() {
        let h = harness();
        h.dispatcher.dispatch(connect_command("acct-1")).await.unwrap();
        h.broker.account("acct-1").set_working_quantity(9);

        let response = h
            .dispatcher
            .dispatch(Command::ChangeQuantity {
                account_id: "acct-1".to_string(),
                delta: 5,
            })
            .await
            .unwrap();

        match response {
            CommandResponse::QuantityChanged { change, .. } => {
                assert_eq!(change.old_quantity, 9);
                assert_eq!(change.new_quantity, 10);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn risk_commands_route_to_the_engine() {
        let h = harness();

        let response = h
            .dispatcher
            .dispatch(Command::UpdateRiskSettings(RiskSettingsPatch {
                general: Some(fleet_risk::GeneralSettings {
                    max_daily_loss: 750.0,
                    ..fleet_risk::GeneralSettings::default()
                }),
                ..RiskSettingsPatch::default()
            }))
            .await
            .unwrap();
        match response {
            CommandResponse::RiskSettingsUpdated { settings } => {
                assert_eq!(settings.general.max_daily_loss, 750.0);
            }
            other => panic!("unexpected response {other:?}"),
        }

        h.dispatcher.dispatch(Command::StartMonitoring).await.unwrap();
        let response = h.dispatcher.dispatch(Command::RiskStatistics).await.unwrap();
        match response {
            CommandResponse::RiskStatistics { statistics } => assert!(statistics.monitoring),
            other => panic!("unexpected response {other:?}"),
        }
        h.dispatcher.dispatch(Command::StopMonitoring).await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_a_typed_error() {
        let h = harness();
        h.broker.account("acct-1").set_fail_auth(true);
        let err = h
            .dispatcher
            .dispatch(connect_command("acct-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn close_all_after_positions_reports_success() {
        let h = harness();
        h.broker.account("acct-1").set_positions(vec![Position {
            symbol: "NQ".to_string(),
            quantity: 1.0,
            avg_price: 15_000.0,
            unrealized_pnl: 0.0,
        }]);
        h.dispatcher.dispatch(connect_command("acct-1")).await.unwrap();

        let response = h.dispatcher.dispatch(Command::CloseAll).await.unwrap();
        match response {
            CommandResponse::CloseOutcomes { outcomes } => {
                assert_eq!(outcomes.len(), 1);
                assert!(outcomes[0].success);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert!(h.broker.account("acct-1").positions().is_empty());
    }

    #[test]
    fn commands_deserialize_from_wire_json() {
        let command: Command = serde_json::from_str(
            r#"{"command":"buy-all","symbol":"NQ","quantity":2,"order_type":"Market"}"#,
        )
        .unwrap();
        assert!(matches!(
            command,
            Command::BuyAll { symbol, quantity: 2, order_type: OrderType::Market } if symbol == "NQ"
        ));

        let command: Command =
            serde_json::from_str(r#"{"command":"close-all"}"#).unwrap();
        assert!(matches!(command, Command::CloseAll));
    }
}
