//! In-memory simulated venue.
//!
//! `SimBroker` stands in for the real browser-automation connector in tests
//! and the CLI demo. Each account gets a mutable venue state (equity, PnL,
//! positions, working orders, last prices) plus failure-injection switches
//! for the error paths the session manager and risk engine must survive.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use fleet_core::{OrderSide, Position};

use crate::channel::{
    AccountState, AuthOutcome, AuthStateBlob, BrokerChannel, BrokerConnector, Credentials,
    OrderRef,
};
use crate::BrokerError;

/// Kind of a simulated order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimOrderKind {
    /// Immediately filled market order
    Market,

    /// Working stop order
    Stop { price: f64, trailing: Option<f64> },

    /// Working limit order
    Limit { price: f64 },
}

/// One order recorded by the simulated venue.
#[derive(Debug, Clone, PartialEq)]
pub struct SimOrder {
    /// Venue reference
    pub reference: OrderRef,

    /// Contract symbol
    pub symbol: String,

    /// Contracts
    pub quantity: u32,

    /// Order side
    pub side: OrderSide,

    /// Order kind and working price
    pub kind: SimOrderKind,

    /// OCO group, when linked
    pub oco_group: Option<u32>,
}

#[derive(Debug)]
struct SimAccountState {
    account_name: String,
    equity: f64,
    pnl: f64,
    positions: Vec<Position>,
    working_quantity: u32,
    last_prices: HashMap<String, f64>,
    orders: Vec<SimOrder>,
    next_oco_group: u32,
    channel_open: bool,
    fail_open: bool,
    fail_auth: bool,
    fail_orders: bool,
    fail_reads: bool,
    channel_gone: bool,
}

impl SimAccountState {
    fn new(account_id: &str) -> Self {
        Self {
            account_name: format!("SIM-{account_id}"),
            equity: 50_000.0,
            pnl: 0.0,
            positions: Vec::new(),
            working_quantity: 1,
            last_prices: HashMap::new(),
            orders: Vec::new(),
            next_oco_group: 1,
            channel_open: true,
            fail_open: false,
            fail_auth: false,
            fail_orders: false,
            fail_reads: false,
            channel_gone: false,
        }
    }
}

/// Handle to one simulated account's venue state.
#[derive(Clone)]
pub struct SimAccount {
    inner: Arc<Mutex<SimAccountState>>,
}

impl SimAccount {
    fn new(account_id: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimAccountState::new(account_id))),
        }
    }

    /// Set the account-level state the next poll will read.
    pub fn set_account(&self, account_name: &str, equity: f64, pnl: f64) {
        let mut state = self.inner.lock();
        state.account_name = account_name.to_string();
        state.equity = equity;
        state.pnl = pnl;
    }

    /// Replace the open-position list.
    pub fn set_positions(&self, positions: Vec<Position>) {
        self.inner.lock().positions = positions;
    }

    /// Current open positions.
    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().positions.clone()
    }

    /// Set the last traded price for a symbol.
    pub fn set_last_price(&self, symbol: &str, price: f64) {
        self.inner.lock().last_prices.insert(symbol.to_string(), price);
    }

    /// Set the working order quantity shown in the entry panel.
    pub fn set_working_quantity(&self, quantity: u32) {
        self.inner.lock().working_quantity = quantity;
    }

    /// Everything the venue has recorded, market fills included.
    pub fn orders(&self) -> Vec<SimOrder> {
        self.inner.lock().orders.clone()
    }

    /// Drop all recorded orders.
    pub fn clear_orders(&self) {
        self.inner.lock().orders.clear();
    }

    /// Make `open_channel` fail for this account.
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.lock().fail_open = fail;
    }

    /// Make the authentication sequence fail.
    pub fn set_fail_auth(&self, fail: bool) {
        self.inner.lock().fail_auth = fail;
    }

    /// Make order placement fail transiently.
    pub fn set_fail_orders(&self, fail: bool) {
        self.inner.lock().fail_orders = fail;
    }

    /// Make state reads fail transiently.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Simulate the underlying session dying; every subsequent call reports
    /// the channel as gone.
    pub fn drop_channel(&self) {
        self.inner.lock().channel_gone = true;
    }
}

/// Simulated broker: a [`BrokerConnector`] over in-memory accounts.
#[derive(Default)]
pub struct SimBroker {
    accounts: Mutex<HashMap<String, SimAccount>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to an account's venue state, created on first use.
    pub fn account(&self, account_id: &str) -> SimAccount {
        self.accounts
            .lock()
            .entry(account_id.to_string())
            .or_insert_with(|| SimAccount::new(account_id))
            .clone()
    }
}

#[async_trait]
impl BrokerConnector for SimBroker {
    async fn open_channel(
        &self,
        account_id: &str,
        prior_auth: Option<&AuthStateBlob>,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let account = self.account(account_id);
        if account.inner.lock().fail_open {
            return Err(BrokerError::Other("failed to launch automation channel".into()));
        }
        // A fresh channel for an account whose old one died starts clean.
        {
            let mut state = account.inner.lock();
            state.channel_open = true;
            state.channel_gone = false;
        }
        let restored_auth = prior_auth
            .and_then(|blob| blob.0.get("authenticated"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Arc::new(SimChannel {
            account_id: account_id.to_string(),
            account,
            restored_auth,
        }))
    }
}

struct SimChannel {
    account_id: String,
    account: SimAccount,
    restored_auth: bool,
}

impl SimChannel {
    fn check_alive(state: &SimAccountState) -> Result<(), BrokerError> {
        if state.channel_gone || !state.channel_open {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for SimChannel {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthOutcome, BrokerError> {
        let state = self.account.inner.lock();
        Self::check_alive(&state)?;
        if state.fail_auth {
            return Err(BrokerError::AuthenticationFailed(format!(
                "login rejected for {}",
                credentials.username
            )));
        }
        if self.restored_auth {
            Ok(AuthOutcome::AlreadyAuthenticated)
        } else {
            Ok(AuthOutcome::NewlyAuthenticated)
        }
    }

    async fn read_account_state(&self) -> Result<AccountState, BrokerError> {
        let state = self.account.inner.lock();
        Self::check_alive(&state)?;
        if state.fail_reads {
            return Err(BrokerError::ElementNotFound("account panel".into()));
        }
        Ok(AccountState {
            account_name: state.account_name.clone(),
            equity: state.equity,
            pnl: state.pnl,
        })
    }

    async fn read_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let state = self.account.inner.lock();
        Self::check_alive(&state)?;
        if state.fail_reads {
            return Err(BrokerError::ElementNotFound("position rows".into()));
        }
        Ok(state.positions.clone())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: OrderSide,
    ) -> Result<OrderRef, BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        if state.fail_orders {
            return Err(BrokerError::ElementNotFound("order ticket".into()));
        }

        let reference = OrderRef(Uuid::new_v4().to_string());
        state.orders.push(SimOrder {
            reference: reference.clone(),
            symbol: symbol.to_string(),
            quantity,
            side,
            kind: SimOrderKind::Market,
            oco_group: None,
        });

        // Market orders fill instantly at the last price.
        let fill_price = state.last_prices.get(symbol).copied().unwrap_or(0.0);
        let signed = match side {
            OrderSide::Buy => quantity as f64,
            OrderSide::Sell => -(quantity as f64),
        };
        if let Some(position) = state.positions.iter_mut().find(|p| p.symbol == symbol) {
            position.quantity += signed;
        } else {
            state.positions.push(Position {
                symbol: symbol.to_string(),
                quantity: signed,
                avg_price: fill_price,
                unrealized_pnl: 0.0,
            });
        }
        state.positions.retain(|p| p.quantity != 0.0);

        Ok(reference)
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        quantity: u32,
        price: f64,
        side: OrderSide,
        trailing: Option<f64>,
    ) -> Result<OrderRef, BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        if state.fail_orders {
            return Err(BrokerError::ElementNotFound("stop order form".into()));
        }
        let reference = OrderRef(Uuid::new_v4().to_string());
        state.orders.push(SimOrder {
            reference: reference.clone(),
            symbol: symbol.to_string(),
            quantity,
            side,
            kind: SimOrderKind::Stop { price, trailing },
            oco_group: None,
        });
        Ok(reference)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        quantity: u32,
        price: f64,
        side: OrderSide,
    ) -> Result<OrderRef, BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        if state.fail_orders {
            return Err(BrokerError::ElementNotFound("limit order form".into()));
        }
        let reference = OrderRef(Uuid::new_v4().to_string());
        state.orders.push(SimOrder {
            reference: reference.clone(),
            symbol: symbol.to_string(),
            quantity,
            side,
            kind: SimOrderKind::Limit { price },
            oco_group: None,
        });
        Ok(reference)
    }

    async fn link_as_oco(&self, orders: &[OrderRef]) -> Result<(), BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        let group = state.next_oco_group;
        state.next_oco_group += 1;
        let mut linked = 0;
        for order in state.orders.iter_mut() {
            if orders.contains(&order.reference) {
                order.oco_group = Some(group);
                linked += 1;
            }
        }
        if linked == 0 {
            return Err(BrokerError::ElementNotFound("orders to link".into()));
        }
        Ok(())
    }

    async fn modify_order_price(
        &self,
        order: &OrderRef,
        new_price: f64,
    ) -> Result<(), BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        let found = state.orders.iter_mut().find(|o| &o.reference == order);
        match found {
            Some(sim_order) => match &mut sim_order.kind {
                SimOrderKind::Stop { price, .. } | SimOrderKind::Limit { price } => {
                    *price = new_price;
                    Ok(())
                }
                SimOrderKind::Market => {
                    Err(BrokerError::Other("market order has no working price".into()))
                }
            },
            None => Err(BrokerError::ElementNotFound(format!("order {order}"))),
        }
    }

    async fn read_last_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let state = self.account.inner.lock();
        Self::check_alive(&state)?;
        state
            .last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::ElementNotFound(format!("price ticker for {symbol}")))
    }

    async fn close_all_positions(&self) -> Result<(), BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        state.positions.clear();
        state.orders.retain(|o| o.kind == SimOrderKind::Market);
        state.pnl = 0.0;
        Ok(())
    }

    async fn working_quantity(&self) -> Result<u32, BrokerError> {
        let state = self.account.inner.lock();
        Self::check_alive(&state)?;
        Ok(state.working_quantity)
    }

    async fn set_working_quantity(&self, quantity: u32) -> Result<(), BrokerError> {
        let mut state = self.account.inner.lock();
        Self::check_alive(&state)?;
        state.working_quantity = quantity;
        Ok(())
    }

    async fn export_auth_state(&self) -> Result<AuthStateBlob, BrokerError> {
        let state = self.account.inner.lock();
        Self::check_alive(&state)?;
        Ok(AuthStateBlob(serde_json::json!({
            "authenticated": true,
            "account_id": self.account_id,
        })))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.account.inner.lock().channel_open = false;
        Ok(())
    }
}
