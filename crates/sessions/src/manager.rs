use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_broker::{
    with_timeout, AuthOutcome, AuthStateStore, BrokerChannel, BrokerConnector, BrokerError,
    Credentials, OrderRef,
};
use fleet_core::{
    AccountId, AccountOutcome, AccountSnapshot, AccountStatusRecord, CloseAllReceipt, FleetConfig,
    OrderReceipt, OrderSide, OrderType, QuantityChange, SessionStatus,
};

use crate::{SessionError, SessionHandle};

/// Working-quantity bounds enforced by `change_quantity`.
const WORKING_QUANTITY_MIN: u32 = 1;
const WORKING_QUANTITY_MAX: u32 = 10;

/// One live account session, owned by the [`SessionManager`].
struct Session {
    account_id: AccountId,
    username: String,
    channel: Arc<dyn BrokerChannel>,
    status: RwLock<SessionStatus>,
    snapshot: RwLock<AccountSnapshot>,
    cancel: CancellationToken,
}

impl Session {
    fn is_connected(&self) -> bool {
        *self.status.read() == SessionStatus::Connected
    }
}

/// Owns the set of active account sessions.
///
/// Each connected account gets its own poll loop that refreshes the session
/// snapshot; bulk trading commands fan out over connected sessions
/// concurrently with per-account failure isolation. The risk engine reads
/// snapshots and issues orders exclusively through this type.
pub struct SessionManager {
    config: FleetConfig,
    connector: Arc<dyn BrokerConnector>,
    auth_store: AuthStateStore,
    sessions: Arc<DashMap<AccountId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: FleetConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let auth_store = AuthStateStore::new(config.auth_state_dir.clone());
        Self {
            config,
            connector,
            auth_store,
            sessions: Arc::new(DashMap::new()),
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.broker_call_timeout_ms)
    }

    /// Connect an account: acquire a channel, authenticate (reusing persisted
    /// auth state when the venue still honors it), register the session and
    /// start its poll loop.
    ///
    /// On any failure the partially created channel is released and nothing
    /// stays registered.
    pub async fn connect(
        &self,
        account_id: &str,
        credentials: Credentials,
    ) -> Result<SessionHandle, SessionError> {
        if self.sessions.contains_key(account_id) {
            return Err(SessionError::AlreadyConnected(account_id.to_string()));
        }
        if self.sessions.len() >= self.config.max_accounts {
            return Err(SessionError::AccountLimitReached(self.config.max_accounts));
        }

        info!(account_id, username = %credentials.username, "connecting account");

        let prior_auth = match self.auth_store.load(account_id).await {
            Ok(blob) => blob,
            Err(err) => {
                warn!(account_id, %err, "failed to load persisted auth state");
                None
            }
        };

        let channel = match self
            .connector
            .open_channel(account_id, prior_auth.as_ref())
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                return Err(SessionError::ConnectFailed {
                    account_id: account_id.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        let session = Arc::new(Session {
            account_id: account_id.to_string(),
            username: credentials.username.clone(),
            channel,
            status: RwLock::new(SessionStatus::Connecting),
            snapshot: RwLock::new(AccountSnapshot::empty()),
            cancel: CancellationToken::new(),
        });
        self.sessions
            .insert(account_id.to_string(), session.clone());

        *session.status.write() = SessionStatus::Authenticating;
        let login_timeout = Duration::from_millis(self.config.login_timeout_ms);
        let auth = with_timeout(
            login_timeout,
            "authenticate",
            session.channel.authenticate(&credentials),
        )
        .await;

        match auth {
            Ok(AuthOutcome::AlreadyAuthenticated) => {
                debug!(account_id, "already authenticated from persisted session state");
            }
            Ok(AuthOutcome::NewlyAuthenticated) => {
                // Persisting the fresh auth state is best-effort; a failure
                // costs a full login on the next connect, nothing more.
                match session.channel.export_auth_state().await {
                    Ok(blob) => {
                        if let Err(err) = self.auth_store.save(account_id, &blob).await {
                            warn!(account_id, %err, "failed to persist auth state");
                        }
                    }
                    Err(err) => warn!(account_id, %err, "failed to export auth state"),
                }
            }
            Err(err) => {
                *session.status.write() = SessionStatus::Error;
                self.sessions.remove(account_id);
                if let Err(close_err) = session.channel.close().await {
                    debug!(account_id, %close_err, "channel teardown after failed connect");
                }
                return Err(SessionError::ConnectFailed {
                    account_id: account_id.to_string(),
                    reason: err.to_string(),
                });
            }
        }

        *session.status.write() = SessionStatus::Connected;
        self.spawn_poll_loop(session);
        info!(account_id, "account connected");

        Ok(SessionHandle {
            account_id: account_id.to_string(),
        })
    }

    /// Spawn the per-session poll loop. Ticks are strictly sequential for one
    /// account; the first tick fires immediately so a fresh session gets a
    /// snapshot right away.
    fn spawn_poll_loop(&self, session: Arc<Session>) {
        let sessions = Arc::clone(&self.sessions);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let call_timeout = self.call_timeout();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => {
                        debug!(account_id = %session.account_id, "poll loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match Self::poll_once(&session, call_timeout).await {
                            Ok(()) => {}
                            Err(err) if err.is_channel_gone() => {
                                warn!(
                                    account_id = %session.account_id,
                                    "automation channel gone, deregistering session"
                                );
                                session.cancel.cancel();
                                *session.status.write() = SessionStatus::Closed;
                                sessions.remove(&session.account_id);
                                break;
                            }
                            Err(err) => {
                                warn!(
                                    account_id = %session.account_id,
                                    %err,
                                    "poll tick failed, keeping previous snapshot"
                                );
                            }
                        }
                    }
                }
            }
        });
    }

    /// One poll tick: read account state and positions, then replace the
    /// snapshot in a single write.
    async fn poll_once(session: &Session, call_timeout: Duration) -> Result<(), BrokerError> {
        let state = with_timeout(
            call_timeout,
            "read_account_state",
            session.channel.read_account_state(),
        )
        .await?;
        let positions = with_timeout(
            call_timeout,
            "read_positions",
            session.channel.read_positions(),
        )
        .await?;

        let snapshot = AccountSnapshot {
            account_name: state.account_name,
            equity: state.equity,
            unrealized_pnl: state.pnl,
            balance: state.equity,
            positions,
            last_update: Utc::now(),
        };
        *session.snapshot.write() = snapshot;
        Ok(())
    }

    /// Disconnect an account: cancel its poll loop, close the channel, remove
    /// it from the active set. Calling this for an unknown or already-closed
    /// account is a no-op.
    pub async fn disconnect(&self, account_id: &str) {
        if let Some((_, session)) = self.sessions.remove(account_id) {
            session.cancel.cancel();
            *session.status.write() = SessionStatus::Closed;
            if let Err(err) = session.channel.close().await {
                debug!(account_id, %err, "channel was already closed");
            }
            info!(account_id, "account disconnected");
        }
    }

    /// Disconnect every session. Idempotent.
    pub async fn shutdown(&self) {
        info!("shutting down session manager");
        let account_ids: Vec<AccountId> =
            self.sessions.iter().map(|e| e.key().clone()).collect();
        for account_id in account_ids {
            self.disconnect(&account_id).await;
        }
        info!("session manager shut down");
    }

    /// Market-buy on every connected account.
    pub async fn bulk_buy(
        &self,
        symbol: &str,
        quantity: u32,
        order_type: OrderType,
    ) -> Vec<AccountOutcome<OrderReceipt>> {
        info!(symbol, quantity, ?order_type, "bulk buy");
        self.entry_order_fan_out(symbol, quantity, order_type, OrderSide::Buy)
            .await
    }

    /// Market-sell on every connected account.
    pub async fn bulk_sell(
        &self,
        symbol: &str,
        quantity: u32,
        order_type: OrderType,
    ) -> Vec<AccountOutcome<OrderReceipt>> {
        info!(symbol, quantity, ?order_type, "bulk sell");
        self.entry_order_fan_out(symbol, quantity, order_type, OrderSide::Sell)
            .await
    }

    async fn entry_order_fan_out(
        &self,
        symbol: &str,
        quantity: u32,
        order_type: OrderType,
        side: OrderSide,
    ) -> Vec<AccountOutcome<OrderReceipt>> {
        if order_type != OrderType::Market {
            warn!(?order_type, "entry panel only supports market orders, placing market");
        }
        let symbol = symbol.to_string();
        self.fan_out("place_market_order", move |channel| {
            let symbol = symbol.clone();
            async move {
                channel.place_market_order(&symbol, quantity, side).await?;
                Ok(OrderReceipt {
                    symbol,
                    quantity,
                    side,
                    placed_at: Utc::now(),
                })
            }
        })
        .await
    }

    /// Flatten every position on every connected account.
    pub async fn close_all(&self) -> Vec<AccountOutcome<CloseAllReceipt>> {
        info!("close all positions across connected accounts");
        self.fan_out("close_all_positions", move |channel| async move {
            channel.close_all_positions().await?;
            Ok(CloseAllReceipt {
                closed_at: Utc::now(),
            })
        })
        .await
    }

    /// Run one operation against every connected session concurrently,
    /// collecting one outcome per account. A failing or slow account never
    /// affects the others.
    async fn fan_out<T, F, Fut>(&self, operation: &'static str, op: F) -> Vec<AccountOutcome<T>>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let call_timeout = self.call_timeout();
        let connected: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.value().clone())
            .collect();

        let mut in_flight = FuturesUnordered::new();
        for session in connected {
            let fut = with_timeout(call_timeout, operation, op(session.channel.clone()));
            in_flight.push(async move {
                match fut.await {
                    Ok(result) => AccountOutcome::ok(
                        session.account_id.clone(),
                        session.username.clone(),
                        result,
                    ),
                    Err(err) => AccountOutcome::failed(
                        session.account_id.clone(),
                        session.username.clone(),
                        err.to_string(),
                    ),
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Adjust the working order quantity by `delta`, clamped to `[1, 10]`.
    pub async fn change_quantity(
        &self,
        account_id: &str,
        delta: i32,
    ) -> Result<QuantityChange, SessionError> {
        let session = self.connected_session(account_id)?;
        let call_timeout = self.call_timeout();

        let current = with_timeout(
            call_timeout,
            "working_quantity",
            session.channel.working_quantity(),
        )
        .await?;
        let target = (i64::from(current) + i64::from(delta))
            .clamp(i64::from(WORKING_QUANTITY_MIN), i64::from(WORKING_QUANTITY_MAX))
            as u32;
        with_timeout(
            call_timeout,
            "set_working_quantity",
            session.channel.set_working_quantity(target),
        )
        .await?;

        info!(account_id, old = current, new = target, "working quantity changed");
        Ok(QuantityChange {
            old_quantity: current,
            new_quantity: target,
        })
    }

    /// Current status of every registered account. Pure in-memory read.
    pub fn status_snapshot_all(&self) -> Vec<AccountStatusRecord> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let snapshot = session.snapshot.read().clone();
                AccountStatusRecord {
                    account_id: session.account_id.clone(),
                    username: session.username.clone(),
                    account_name: if snapshot.account_name.is_empty() {
                        session.username.clone()
                    } else {
                        snapshot.account_name.clone()
                    },
                    status: *session.status.read(),
                    balance: snapshot.balance,
                    equity: snapshot.equity,
                    pnl: snapshot.unrealized_pnl,
                    positions: snapshot.positions,
                    last_update: snapshot.last_update,
                }
            })
            .collect()
    }

    /// Latest snapshots of all connected accounts, for the risk engine.
    pub fn connected_snapshots(&self) -> Vec<(AccountId, AccountSnapshot)> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| {
                let session = entry.value();
                (session.account_id.clone(), session.snapshot.read().clone())
            })
            .collect()
    }

    /// Place a protective stop order on one account.
    pub async fn place_stop_order(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: u32,
        price: f64,
        side: OrderSide,
        trailing: Option<f64>,
    ) -> Result<OrderRef, SessionError> {
        let session = self.connected_session(account_id)?;
        let order = with_timeout(
            self.call_timeout(),
            "place_stop_order",
            session
                .channel
                .place_stop_order(symbol, quantity, price, side, trailing),
        )
        .await?;
        Ok(order)
    }

    /// Place a protective limit (target) order on one account.
    pub async fn place_limit_order(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: u32,
        price: f64,
        side: OrderSide,
    ) -> Result<OrderRef, SessionError> {
        let session = self.connected_session(account_id)?;
        let order = with_timeout(
            self.call_timeout(),
            "place_limit_order",
            session
                .channel
                .place_limit_order(symbol, quantity, price, side),
        )
        .await?;
        Ok(order)
    }

    /// Move a working order to a new price on one account.
    pub async fn modify_order_price(
        &self,
        account_id: &str,
        order: &OrderRef,
        new_price: f64,
    ) -> Result<(), SessionError> {
        let session = self.connected_session(account_id)?;
        with_timeout(
            self.call_timeout(),
            "modify_order_price",
            session.channel.modify_order_price(order, new_price),
        )
        .await?;
        Ok(())
    }

    /// Link working orders one-cancels-other on one account.
    pub async fn link_as_oco(
        &self,
        account_id: &str,
        orders: &[OrderRef],
    ) -> Result<(), SessionError> {
        let session = self.connected_session(account_id)?;
        with_timeout(
            self.call_timeout(),
            "link_as_oco",
            session.channel.link_as_oco(orders),
        )
        .await?;
        Ok(())
    }

    /// Last traded price for a symbol on one account's feed.
    pub async fn last_price(&self, account_id: &str, symbol: &str) -> Result<f64, SessionError> {
        let session = self.connected_session(account_id)?;
        let price = with_timeout(
            self.call_timeout(),
            "read_last_price",
            session.channel.read_last_price(symbol),
        )
        .await?;
        Ok(price)
    }

    fn connected_session(&self, account_id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .get(account_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotConnected(account_id.to_string()))?;
        if !session.is_connected() {
            return Err(SessionError::NotConnected(account_id.to_string()));
        }
        Ok(session)
    }
}
