use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_broker::OrderRef;
use fleet_core::{
    AccountId, AccountSnapshot, EventBus, FleetConfig, FleetEvent, OrderSide, Position,
};
use fleet_sessions::SessionManager;

use crate::pricing::protective_prices;
use crate::settings::{RiskSettings, RiskSettingsPatch};

type TrackKey = (AccountId, String);

/// Bookkeeping for the protective orders attached to one open position.
///
/// Exists iff the position appeared in some past snapshot and has not since
/// disappeared from that account's position list.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    /// Entry price the protective prices were derived from
    pub entry_price: f64,

    /// Current stop price
    pub stop_price: f64,

    /// Target price
    pub take_profit_price: f64,

    /// Whether a stop order is working
    pub stop_loss_set: bool,

    /// Whether at least one target order is working
    pub take_profit_set: bool,

    /// Whether the stop was promoted to break-even; one-shot
    pub break_even_moved: bool,

    /// Last stop price set by the trailing ratchet
    pub last_trailing_stop: Option<f64>,

    stop_ref: Option<OrderRef>,
    take_profit_ref: Option<OrderRef>,
}

/// Counters returned by [`RiskEngine::get_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskStatistics {
    /// Positions currently tracked
    pub tracked_orders: usize,

    /// Tracked positions with a working stop
    pub stop_loss_set: usize,

    /// Tracked positions with a working target
    pub take_profit_set: usize,

    /// Tracked positions promoted to break-even
    pub break_even_moved: usize,

    /// Whether the reconciliation loop is running
    pub monitoring: bool,
}

/// Automatic protective-order engine.
///
/// Consumes snapshots from the [`SessionManager`]; attaches stop/target
/// orders to every untracked open position, promotes stops to break-even,
/// ratchets trailing stops, and flattens everything when aggregate daily PnL
/// crosses the configured bounds. All trading goes back through the session
/// manager; the tracked-order map is owned exclusively by this engine and
/// only ever mutated from its own reconciliation tick.
pub struct RiskEngine {
    sessions: Arc<SessionManager>,
    settings: RwLock<RiskSettings>,
    tracked: Mutex<HashMap<TrackKey, TrackedOrder>>,
    monitoring: RwLock<bool>,
    monitor_cancel: Mutex<Option<CancellationToken>>,
    tick_in_flight: AtomicBool,
    loss_breach_active: AtomicBool,
    profit_breach_active: AtomicBool,
    check_interval: Duration,
    events: EventBus,
}

impl RiskEngine {
    pub fn new(config: &FleetConfig, sessions: Arc<SessionManager>, events: EventBus) -> Self {
        Self {
            sessions,
            settings: RwLock::new(RiskSettings::default()),
            tracked: Mutex::new(HashMap::new()),
            monitoring: RwLock::new(false),
            monitor_cancel: Mutex::new(None),
            tick_in_flight: AtomicBool::new(false),
            loss_breach_active: AtomicBool::new(false),
            profit_breach_active: AtomicBool::new(false),
            check_interval: Duration::from_millis(config.risk_check_interval_ms),
            events,
        }
    }

    /// The bus this engine publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current settings.
    pub fn settings(&self) -> RiskSettings {
        self.settings.read().clone()
    }

    /// Merge a patch into the current settings; provided sections replace the
    /// current ones. Takes effect on the next reconciliation tick.
    pub fn update_settings(&self, patch: RiskSettingsPatch) {
        {
            let mut settings = self.settings.write();
            settings.apply(patch);

            if settings.take_profit.partial {
                let allocated: f64 = settings.take_profit.levels.iter().map(|l| l.percent).sum();
                if (allocated - 100.0).abs() > f64::EPSILON {
                    warn!(
                        allocated_percent = allocated,
                        "partial take-profit levels do not allocate exactly 100% of quantity"
                    );
                }
            }
        }
        info!("risk settings updated");
        self.events.publish(FleetEvent::SettingsUpdated);
    }

    /// Start the fixed-interval reconciliation loop. Starting an active loop
    /// is a no-op with a warning.
    pub fn start_monitoring(self: Arc<Self>) {
        {
            let mut monitoring = self.monitoring.write();
            if *monitoring {
                warn!("risk monitoring already active");
                return;
            }
            *monitoring = true;
        }

        let cancel = CancellationToken::new();
        *self.monitor_cancel.lock() = Some(cancel.clone());

        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("risk monitoring loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        engine.reconcile().await;
                    }
                }
            }
        });

        info!("risk monitoring started");
        self.events.publish(FleetEvent::MonitoringStarted);
    }

    /// Stop the reconciliation loop. The timer is cancelled before this
    /// returns, so no new tick can start afterwards. Stopping an inactive
    /// loop is a no-op with a warning.
    pub fn stop_monitoring(&self) {
        {
            let mut monitoring = self.monitoring.write();
            if !*monitoring {
                warn!("risk monitoring not active");
                return;
            }
            *monitoring = false;
        }
        if let Some(cancel) = self.monitor_cancel.lock().take() {
            cancel.cancel();
        }
        info!("risk monitoring stopped");
        self.events.publish(FleetEvent::MonitoringStopped);
    }

    /// One reconciliation tick. Skips instead of overlapping when a prior
    /// tick is still running.
    pub async fn reconcile(&self) {
        if self.tick_in_flight.swap(true, Ordering::SeqCst) {
            warn!("reconciliation tick still in flight, skipping");
            return;
        }
        self.reconcile_inner().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
    }

    async fn reconcile_inner(&self) {
        let snapshots = self.sessions.connected_snapshots();

        for (account_id, snapshot) in &snapshots {
            if snapshot.positions.is_empty() {
                continue;
            }
            for position in &snapshot.positions {
                let key = (account_id.clone(), position.symbol.clone());
                let existing = self.tracked.lock().get(&key).cloned();
                match existing {
                    None => self.track_new_position(account_id, position).await,
                    Some(entry) => self.manage_tracked(account_id, position, entry).await,
                }
            }
        }

        self.cleanup_closed_positions(&snapshots);
        self.check_daily_limits(&snapshots).await;
    }

    /// Attach protective orders to a position seen for the first time and
    /// begin tracking it.
    async fn track_new_position(&self, account_id: &AccountId, position: &Position) {
        let settings = self.settings();
        let entry_price = position.avg_price;
        let is_long = position.is_long();
        let quantity = position.quantity.abs().round() as u32;
        if quantity == 0 {
            return;
        }

        let prices = protective_prices(entry_price, is_long, &settings, &position.symbol);
        let close_side = if is_long {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };

        let mut entry = TrackedOrder {
            entry_price,
            stop_price: prices.stop_price,
            take_profit_price: prices.take_profit_price,
            stop_loss_set: false,
            take_profit_set: false,
            break_even_moved: false,
            last_trailing_stop: None,
            stop_ref: None,
            take_profit_ref: None,
        };

        if settings.stop_loss.enabled {
            let trailing = settings
                .stop_loss
                .trailing
                .then_some(settings.stop_loss.trailing_distance);
            match self
                .sessions
                .place_stop_order(
                    account_id,
                    &position.symbol,
                    quantity,
                    prices.stop_price,
                    close_side,
                    trailing,
                )
                .await
            {
                Ok(order) => {
                    entry.stop_loss_set = true;
                    entry.stop_ref = Some(order);
                }
                Err(err) => {
                    error!(%account_id, symbol = %position.symbol, %err, "failed to place stop loss");
                }
            }
        }

        if settings.take_profit.enabled {
            if settings.take_profit.partial && !settings.take_profit.levels.is_empty() {
                for level in &settings.take_profit.levels {
                    let level_quantity = (f64::from(quantity) * level.percent / 100.0).floor() as u32;
                    if level_quantity == 0 {
                        continue;
                    }
                    let price = if is_long {
                        entry_price + level.points
                    } else {
                        entry_price - level.points
                    };
                    match self
                        .sessions
                        .place_limit_order(
                            account_id,
                            &position.symbol,
                            level_quantity,
                            price,
                            close_side,
                        )
                        .await
                    {
                        Ok(order) => {
                            entry.take_profit_set = true;
                            entry.take_profit_ref = Some(order);
                        }
                        Err(err) => {
                            error!(
                                %account_id,
                                symbol = %position.symbol,
                                level_price = price,
                                %err,
                                "failed to place partial take profit"
                            );
                        }
                    }
                }
            } else {
                match self
                    .sessions
                    .place_limit_order(
                        account_id,
                        &position.symbol,
                        quantity,
                        prices.take_profit_price,
                        close_side,
                    )
                    .await
                {
                    Ok(order) => {
                        entry.take_profit_set = true;
                        entry.take_profit_ref = Some(order);
                    }
                    Err(err) => {
                        error!(%account_id, symbol = %position.symbol, %err, "failed to place take profit");
                    }
                }
            }
        }

        if settings.general.use_oco {
            if let (Some(stop), Some(target)) =
                (entry.stop_ref.clone(), entry.take_profit_ref.clone())
            {
                if let Err(err) = self.sessions.link_as_oco(account_id, &[stop, target]).await {
                    error!(%account_id, symbol = %position.symbol, %err, "failed to link OCO orders");
                }
            }
        }

        if entry.stop_loss_set || entry.take_profit_set {
            info!(
                %account_id,
                symbol = %position.symbol,
                stop = prices.stop_price,
                target = prices.take_profit_price,
                "protective orders attached"
            );
            self.events.publish(FleetEvent::SlTpAdded {
                symbol: position.symbol.clone(),
                stop_price: prices.stop_price,
                take_profit_price: prices.take_profit_price,
            });
        }

        self.tracked
            .lock()
            .insert((account_id.clone(), position.symbol.clone()), entry);
    }

    /// Break-even promotion, then trailing-stop update, for an already
    /// tracked position.
    async fn manage_tracked(
        &self,
        account_id: &AccountId,
        position: &Position,
        mut entry: TrackedOrder,
    ) {
        let settings = self.settings();

        if settings.general.break_even_after_points > 0.0 && !entry.break_even_moved {
            let resolved = settings.resolve_symbol(&position.symbol);
            let abs_quantity = position.quantity.abs();
            if abs_quantity > 0.0 {
                let points_profit = position.unrealized_pnl / (abs_quantity * resolved.tick_value);
                if points_profit >= settings.general.break_even_after_points {
                    let new_stop = if position.is_long() {
                        entry.entry_price + 1.0
                    } else {
                        entry.entry_price - 1.0
                    };
                    if let Some(stop_ref) = entry.stop_ref.clone() {
                        if let Err(err) = self
                            .sessions
                            .modify_order_price(account_id, &stop_ref, new_stop)
                            .await
                        {
                            error!(%account_id, symbol = %position.symbol, %err, "failed to move stop to break-even");
                        }
                    }
                    entry.break_even_moved = true;
                    entry.stop_price = new_stop;
                    info!(
                        %account_id,
                        symbol = %position.symbol,
                        new_stop_price = new_stop,
                        "stop moved to break-even"
                    );
                    self.events.publish(FleetEvent::BreakevenMoved {
                        symbol: position.symbol.clone(),
                        new_stop_price: new_stop,
                    });
                }
            }
        }

        // The ratchet stands down once break-even has taken over.
        if settings.stop_loss.trailing && !entry.break_even_moved {
            match self.sessions.last_price(account_id, &position.symbol).await {
                Ok(last_price) => {
                    let distance = settings.stop_loss.trailing_distance;
                    let candidate = if position.is_long() {
                        last_price - distance
                    } else {
                        last_price + distance
                    };
                    let improves = match entry.last_trailing_stop {
                        Some(current) => {
                            if position.is_long() {
                                candidate > current
                            } else {
                                candidate < current
                            }
                        }
                        None => true,
                    };
                    if improves {
                        if let Some(stop_ref) = entry.stop_ref.clone() {
                            if let Err(err) = self
                                .sessions
                                .modify_order_price(account_id, &stop_ref, candidate)
                                .await
                            {
                                error!(%account_id, symbol = %position.symbol, %err, "failed to trail stop");
                            }
                        }
                        entry.last_trailing_stop = Some(candidate);
                        entry.stop_price = candidate;
                        debug!(
                            %account_id,
                            symbol = %position.symbol,
                            stop = candidate,
                            "trailing stop ratcheted"
                        );
                    }
                }
                Err(err) => {
                    debug!(%account_id, symbol = %position.symbol, %err, "last price unavailable, trailing skipped");
                }
            }
        }

        self.tracked
            .lock()
            .insert((account_id.clone(), position.symbol.clone()), entry);
    }

    /// Drop tracked entries whose position no longer appears in its account's
    /// latest position list. An account with no connected session keeps no
    /// entries.
    fn cleanup_closed_positions(&self, snapshots: &[(AccountId, AccountSnapshot)]) {
        let live: HashMap<&str, HashSet<&str>> = snapshots
            .iter()
            .map(|(account_id, snapshot)| {
                (
                    account_id.as_str(),
                    snapshot
                        .positions
                        .iter()
                        .map(|p| p.symbol.as_str())
                        .collect(),
                )
            })
            .collect();

        self.tracked.lock().retain(|(account_id, symbol), _| {
            let keep = live
                .get(account_id.as_str())
                .is_some_and(|symbols| symbols.contains(symbol.as_str()));
            if !keep {
                info!(%account_id, %symbol, "position closed, dropping tracked order");
            }
            keep
        });
    }

    /// Aggregate daily-limit check. A breach issues a close-all on every tick
    /// it persists, but the outward event fires once per breach episode.
    async fn check_daily_limits(&self, snapshots: &[(AccountId, AccountSnapshot)]) {
        let (max_daily_loss, max_daily_profit) = {
            let settings = self.settings.read();
            (
                settings.general.max_daily_loss,
                settings.general.max_daily_profit,
            )
        };

        let total_daily_pnl: f64 = snapshots
            .iter()
            .flat_map(|(_, snapshot)| &snapshot.positions)
            .map(|p| p.unrealized_pnl)
            .sum();

        if max_daily_loss > 0.0 && total_daily_pnl <= -max_daily_loss {
            warn!(
                total_daily_pnl,
                limit = max_daily_loss,
                "max daily loss reached, closing all positions"
            );
            self.close_all_logged().await;
            if !self.loss_breach_active.swap(true, Ordering::SeqCst) {
                self.events.publish(FleetEvent::MaxDailyLossReached {
                    amount: total_daily_pnl,
                });
            }
        } else {
            self.loss_breach_active.store(false, Ordering::SeqCst);
        }

        if max_daily_profit > 0.0 && total_daily_pnl >= max_daily_profit {
            info!(
                total_daily_pnl,
                limit = max_daily_profit,
                "max daily profit reached, closing all positions"
            );
            self.close_all_logged().await;
            if !self.profit_breach_active.swap(true, Ordering::SeqCst) {
                self.events.publish(FleetEvent::MaxDailyProfitReached {
                    amount: total_daily_pnl,
                });
            }
        } else {
            self.profit_breach_active.store(false, Ordering::SeqCst);
        }
    }

    async fn close_all_logged(&self) {
        let outcomes = self.sessions.close_all().await;
        for outcome in outcomes.iter().filter(|o| !o.success) {
            error!(
                account_id = %outcome.account_id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "close-all failed for account"
            );
        }
    }

    /// Counters over the tracked-order map. Pure read.
    pub fn get_statistics(&self) -> RiskStatistics {
        let tracked = self.tracked.lock();
        RiskStatistics {
            tracked_orders: tracked.len(),
            stop_loss_set: tracked.values().filter(|t| t.stop_loss_set).count(),
            take_profit_set: tracked.values().filter(|t| t.take_profit_set).count(),
            break_even_moved: tracked.values().filter(|t| t.break_even_moved).count(),
            monitoring: *self.monitoring.read(),
        }
    }

    /// Stop monitoring, clear all tracked orders and restore default
    /// settings.
    pub fn reset(&self) {
        if *self.monitoring.read() {
            self.stop_monitoring();
        }
        self.tracked.lock().clear();
        *self.settings.write() = RiskSettings::default();
        self.loss_breach_active.store(false, Ordering::SeqCst);
        self.profit_breach_active.store(false, Ordering::SeqCst);
        info!("risk engine reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::broadcast;

    use fleet_broker::sim::{SimAccount, SimBroker, SimOrderKind};
    use fleet_broker::Credentials;
    use crate::settings::{GeneralSettings, StopLossSettings, TakeProfitSettings};

    struct Harness {
        engine: Arc<RiskEngine>,
        sessions: Arc<SessionManager>,
        broker: Arc<SimBroker>,
        _auth_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let auth_dir = tempfile::tempdir().unwrap();
        let config = FleetConfig {
            poll_interval_ms: 10,
            risk_check_interval_ms: 20,
            broker_call_timeout_ms: 500,
            login_timeout_ms: 500,
            auth_state_dir: auth_dir.path().to_path_buf(),
            ..FleetConfig::default()
        };
        let broker = Arc::new(SimBroker::new());
        let sessions = Arc::new(SessionManager::new(config.clone(), broker.clone()));
        let engine = Arc::new(RiskEngine::new(&config, sessions.clone(), EventBus::default()));
        Harness {
            engine,
            sessions,
            broker,
            _auth_dir: auth_dir,
        }
    }

    async fn connect(h: &Harness, account_id: &str) {
        h.sessions
            .connect(
                account_id,
                Credentials {
                    username: account_id.to_string(),
                    password: "secret".to_string(),
                },
            )
            .await
            .unwrap();
    }

    fn position(symbol: &str, quantity: f64, avg_price: f64, pnl: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity,
            avg_price,
            unrealized_pnl: pnl,
        }
    }

    /// Let the session poll loops pick up venue-side changes.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<FleetEvent>) -> Vec<FleetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn working_stop_price(account: &SimAccount) -> f64 {
        account
            .orders()
            .iter()
            .find_map(|o| match o.kind {
                SimOrderKind::Stop { price, .. } => Some(price),
                _ => None,
            })
            .expect("no working stop order")
    }

    #[tokio::test]
    async fn attaches_stop_and_target_to_a_new_long_position() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 2.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;

        let mut rx = h.engine.events().subscribe();
        h.engine.reconcile().await;

        let orders = account.orders();
        let stop = orders
            .iter()
            .find(|o| matches!(o.kind, SimOrderKind::Stop { .. }))
            .unwrap();
        assert_eq!(stop.quantity, 2);
        assert_eq!(stop.side, OrderSide::Sell);
        match stop.kind {
            SimOrderKind::Stop { price, trailing } => {
                assert_eq!(price, 14_960.0);
                assert_eq!(trailing, None);
            }
            _ => unreachable!(),
        }

        let target = orders
            .iter()
            .find(|o| matches!(o.kind, SimOrderKind::Limit { .. }))
            .unwrap();
        assert_eq!(target.side, OrderSide::Sell);
        match target.kind {
            SimOrderKind::Limit { price } => assert_eq!(price, 15_080.0),
            _ => unreachable!(),
        }

        // Default settings link the two one-cancels-other.
        assert_eq!(stop.oco_group, target.oco_group);
        assert!(stop.oco_group.is_some());

        let stats = h.engine.get_statistics();
        assert_eq!(stats.tracked_orders, 1);
        assert_eq!(stats.stop_loss_set, 1);
        assert_eq!(stats.take_profit_set, 1);

        let events = drain(&mut rx);
        assert!(events.contains(&FleetEvent::SlTpAdded {
            symbol: "NQ".to_string(),
            stop_price: 14_960.0,
            take_profit_price: 15_080.0,
        }));

        // A second tick must not re-place protective orders.
        let placed = account.orders().len();
        h.engine.reconcile().await;
        assert_eq!(account.orders().len(), placed);
    }

    #[tokio::test]
    async fn short_position_gets_mirrored_protective_sides() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", -2.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;

        h.engine.reconcile().await;

        let orders = account.orders();
        let stop = orders
            .iter()
            .find(|o| matches!(o.kind, SimOrderKind::Stop { .. }))
            .unwrap();
        assert_eq!(stop.side, OrderSide::Buy);
        match stop.kind {
            SimOrderKind::Stop { price, .. } => assert_eq!(price, 15_040.0),
            _ => unreachable!(),
        }
        let target = orders
            .iter()
            .find(|o| matches!(o.kind, SimOrderKind::Limit { .. }))
            .unwrap();
        assert_eq!(target.side, OrderSide::Buy);
        match target.kind {
            SimOrderKind::Limit { price } => assert_eq!(price, 14_920.0),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn break_even_promotion_is_one_shot() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 2.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;
        h.engine.reconcile().await;

        // 120 PnL over 2 contracts at tick value 5 = 12 points, past the
        // default threshold of 10.
        account.set_positions(vec![position("NQ", 2.0, 15_000.0, 120.0)]);
        settle().await;
        let mut rx = h.engine.events().subscribe();
        h.engine.reconcile().await;

        assert_eq!(working_stop_price(&account), 15_001.0);
        assert_eq!(h.engine.get_statistics().break_even_moved, 1);
        let events = drain(&mut rx);
        assert!(events.contains(&FleetEvent::BreakevenMoved {
            symbol: "NQ".to_string(),
            new_stop_price: 15_001.0,
        }));

        // Price retraces below the threshold; the promotion must not
        // re-evaluate or move the stop again.
        account.set_positions(vec![position("NQ", 2.0, 15_000.0, 10.0)]);
        settle().await;
        h.engine.reconcile().await;

        assert_eq!(working_stop_price(&account), 15_001.0);
        assert_eq!(h.engine.get_statistics().break_even_moved, 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn trailing_stop_never_loosens_for_a_long() {
        let h = harness();
        h.engine.update_settings(RiskSettingsPatch {
            stop_loss: Some(StopLossSettings {
                trailing: true,
                ..StopLossSettings::default()
            }),
            general: Some(GeneralSettings {
                break_even_after_points: 0.0,
                ..GeneralSettings::default()
            }),
            ..RiskSettingsPatch::default()
        });

        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("CL", 1.0, 15_000.0, 0.0)]);
        account.set_last_price("CL", 15_000.0);
        connect(&h, "acct-1").await;
        settle().await;

        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 14_990.0);

        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 14_995.0);

        account.set_last_price("CL", 15_010.0);
        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 15_005.0);

        // Price dips; the candidate is lower, so the stop must stand.
        account.set_last_price("CL", 15_002.0);
        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 15_005.0);

        account.set_last_price("CL", 15_020.0);
        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 15_015.0);
    }

    #[tokio::test]
    async fn trailing_stop_never_loosens_for_a_short() {
        let h = harness();
        h.engine.update_settings(RiskSettingsPatch {
            stop_loss: Some(StopLossSettings {
                trailing: true,
                ..StopLossSettings::default()
            }),
            general: Some(GeneralSettings {
                break_even_after_points: 0.0,
                ..GeneralSettings::default()
            }),
            ..RiskSettingsPatch::default()
        });

        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("CL", -1.0, 15_000.0, 0.0)]);
        account.set_last_price("CL", 15_000.0);
        connect(&h, "acct-1").await;
        settle().await;

        h.engine.reconcile().await;
        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 15_005.0);

        account.set_last_price("CL", 14_990.0);
        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 14_995.0);

        account.set_last_price("CL", 14_998.0);
        h.engine.reconcile().await;
        assert_eq!(working_stop_price(&account), 14_995.0);
    }

    #[tokio::test]
    async fn closed_position_is_dropped_from_tracking() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 1.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;
        h.engine.reconcile().await;
        assert_eq!(h.engine.get_statistics().tracked_orders, 1);

        account.set_positions(vec![]);
        settle().await;
        h.engine.reconcile().await;
        assert_eq!(h.engine.get_statistics().tracked_orders, 0);
    }

    #[tokio::test]
    async fn disconnected_account_drops_its_tracked_orders() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 1.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;
        h.engine.reconcile().await;
        assert_eq!(h.engine.get_statistics().tracked_orders, 1);

        h.sessions.disconnect("acct-1").await;
        h.engine.reconcile().await;
        assert_eq!(h.engine.get_statistics().tracked_orders, 0);
    }

    #[tokio::test]
    async fn daily_loss_breach_closes_all_and_fires_once_per_episode() {
        let h = harness();
        for id in ["acct-1", "acct-2"] {
            h.broker
                .account(id)
                .set_positions(vec![position("NQ", 1.0, 15_000.0, -300.0)]);
            connect(&h, id).await;
        }
        settle().await;

        let mut rx = h.engine.events().subscribe();
        h.engine.reconcile().await;

        assert!(h.broker.account("acct-1").positions().is_empty());
        assert!(h.broker.account("acct-2").positions().is_empty());
        let events = drain(&mut rx);
        let breaches: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, FleetEvent::MaxDailyLossReached { .. }))
            .collect();
        assert_eq!(breaches.len(), 1);
        assert_eq!(
            breaches[0],
            &FleetEvent::MaxDailyLossReached { amount: -600.0 }
        );

        // The venue lags and still shows a losing position: close-all runs
        // again but the episode event must not repeat.
        h.broker
            .account("acct-1")
            .set_positions(vec![position("NQ", 1.0, 15_000.0, -600.0)]);
        settle().await;
        h.engine.reconcile().await;
        assert!(h.broker.account("acct-1").positions().is_empty());
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FleetEvent::MaxDailyLossReached { .. })));

        // Flat again: the episode ends.
        settle().await;
        h.engine.reconcile().await;

        // A fresh breach is a new episode and fires again.
        h.broker
            .account("acct-1")
            .set_positions(vec![position("NQ", 1.0, 15_000.0, -600.0)]);
        settle().await;
        h.engine.reconcile().await;
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FleetEvent::MaxDailyLossReached { .. })));
    }

    #[tokio::test]
    async fn daily_profit_breach_closes_all() {
        let h = harness();
        h.broker
            .account("acct-1")
            .set_positions(vec![position("NQ", 1.0, 15_000.0, 1_500.0)]);
        connect(&h, "acct-1").await;
        settle().await;

        let mut rx = h.engine.events().subscribe();
        h.engine.reconcile().await;

        assert!(h.broker.account("acct-1").positions().is_empty());
        assert!(drain(&mut rx)
            .contains(&FleetEvent::MaxDailyProfitReached { amount: 1_500.0 }));
    }

    #[tokio::test]
    async fn pnl_between_the_bounds_triggers_nothing() {
        let h = harness();
        h.broker
            .account("acct-1")
            .set_positions(vec![position("NQ", 1.0, 15_000.0, -100.0)]);
        connect(&h, "acct-1").await;
        settle().await;

        let mut rx = h.engine.events().subscribe();
        h.engine.reconcile().await;

        assert_eq!(h.broker.account("acct-1").positions().len(), 1);
        assert!(!drain(&mut rx).iter().any(|e| matches!(
            e,
            FleetEvent::MaxDailyLossReached { .. } | FleetEvent::MaxDailyProfitReached { .. }
        )));
    }

    #[tokio::test]
    async fn partial_take_profit_splits_quantity_across_levels() {
        let h = harness();
        h.engine.update_settings(RiskSettingsPatch {
            stop_loss: Some(StopLossSettings {
                enabled: false,
                ..StopLossSettings::default()
            }),
            take_profit: Some(TakeProfitSettings {
                partial: true,
                ..TakeProfitSettings::default()
            }),
            ..RiskSettingsPatch::default()
        });

        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 10.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;
        h.engine.reconcile().await;

        let mut targets: Vec<(f64, u32)> = account
            .orders()
            .iter()
            .filter_map(|o| match o.kind {
                SimOrderKind::Limit { price } => Some((price, o.quantity)),
                _ => None,
            })
            .collect();
        targets.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        // floor(10 * 33%) = 3, floor(10 * 33%) = 3, floor(10 * 34%) = 3.
        assert_eq!(
            targets,
            vec![(15_010.0, 3), (15_020.0, 3), (15_030.0, 3)]
        );
    }

    #[tokio::test]
    async fn placement_failure_is_tracked_without_flags_or_event() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 1.0, 15_000.0, 0.0)]);
        account.set_fail_orders(true);
        connect(&h, "acct-1").await;
        settle().await;

        let mut rx = h.engine.events().subscribe();
        h.engine.reconcile().await;

        let stats = h.engine.get_statistics();
        assert_eq!(stats.tracked_orders, 1);
        assert_eq!(stats.stop_loss_set, 0);
        assert_eq!(stats.take_profit_set, 0);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FleetEvent::SlTpAdded { .. })));
    }

    #[tokio::test]
    async fn monitoring_loop_is_idempotent_and_reconciles() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 1.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;

        let mut rx = h.engine.events().subscribe();
        h.engine.clone().start_monitoring();
        h.engine.clone().start_monitoring();
        settle().await;

        assert!(h.engine.get_statistics().monitoring);
        assert_eq!(h.engine.get_statistics().tracked_orders, 1);

        h.engine.stop_monitoring();
        h.engine.stop_monitoring();
        assert!(!h.engine.get_statistics().monitoring);

        let events = drain(&mut rx);
        let started = events
            .iter()
            .filter(|e| matches!(e, FleetEvent::MonitoringStarted))
            .count();
        let stopped = events
            .iter()
            .filter(|e| matches!(e, FleetEvent::MonitoringStopped))
            .count();
        assert_eq!(started, 1);
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn reset_clears_tracking_and_restores_defaults() {
        let h = harness();
        let account = h.broker.account("acct-1");
        account.set_positions(vec![position("NQ", 1.0, 15_000.0, 0.0)]);
        connect(&h, "acct-1").await;
        settle().await;
        h.engine.reconcile().await;

        h.engine.update_settings(RiskSettingsPatch {
            general: Some(GeneralSettings {
                max_daily_loss: 750.0,
                ..GeneralSettings::default()
            }),
            ..RiskSettingsPatch::default()
        });
        h.engine.clone().start_monitoring();

        h.engine.reset();

        let stats = h.engine.get_statistics();
        assert_eq!(stats.tracked_orders, 0);
        assert!(!stats.monitoring);
        assert_eq!(h.engine.settings(), RiskSettings::default());
    }
}
