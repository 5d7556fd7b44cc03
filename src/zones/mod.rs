//! Price zones: fixed-width tick buckets aggregating aggressive and passive
//! volume history.
//!
//! The store owns the zone map exclusively; detectors only ever see value
//! snapshots. Zones inactive past the retention window become eligible for
//! eviction, and total retained zones are bounded by `max_zone_history`.

use crate::config::PreprocessorConfig;
use crate::numerics::{calculate_zone, safe_add};
use crate::rolling::RollingWindow;
use crate::types::{Side, Trade};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One trade as remembered by a zone's bounded ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneTradeRecord {
    pub price_ticks: i64,
    pub qty_units: i64,
    pub timestamp_ms: i64,
    pub side: Side,
}

/// Aggregated orderflow state for one zone bucket.
#[derive(Debug, Clone)]
pub struct Zone {
    pub zone_id: i64,
    /// Lower edge of the bucket in ticks.
    pub price_level_ticks: i64,
    pub aggressive_buy_units: i64,
    pub aggressive_sell_units: i64,
    pub passive_bid_units: i64,
    pub passive_ask_units: i64,
    pub trade_count: u64,
    pub first_seen_ms: i64,
    pub last_update_ms: i64,
    recent_trades: RollingWindow<ZoneTradeRecord>,
}

impl Zone {
    fn new(zone_id: i64, zone_ticks: i64, max_trades: usize, now_ms: i64) -> Self {
        Self {
            zone_id,
            price_level_ticks: zone_id * zone_ticks,
            aggressive_buy_units: 0,
            aggressive_sell_units: 0,
            passive_bid_units: 0,
            passive_ask_units: 0,
            trade_count: 0,
            first_seen_ms: now_ms,
            last_update_ms: now_ms,
            recent_trades: RollingWindow::new(max_trades),
        }
    }

    pub fn aggressive_total_units(&self) -> i64 {
        safe_add(self.aggressive_buy_units, self.aggressive_sell_units)
    }

    pub fn recent_trades(&self) -> impl Iterator<Item = &ZoneTradeRecord> {
        self.recent_trades.iter()
    }

    /// Value snapshot handed to detectors; never aliases store state.
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: self.zone_id,
            price_level_ticks: self.price_level_ticks,
            aggressive_buy_units: self.aggressive_buy_units,
            aggressive_sell_units: self.aggressive_sell_units,
            passive_bid_units: self.passive_bid_units,
            passive_ask_units: self.passive_ask_units,
            trade_count: self.trade_count,
            first_seen_ms: self.first_seen_ms,
            last_update_ms: self.last_update_ms,
            recent_trades: self.recent_trades.iter().copied().collect(),
        }
    }
}

/// Value copy of a zone at a point in time, carried on enriched trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub zone_id: i64,
    pub price_level_ticks: i64,
    pub aggressive_buy_units: i64,
    pub aggressive_sell_units: i64,
    pub passive_bid_units: i64,
    pub passive_ask_units: i64,
    pub trade_count: u64,
    pub first_seen_ms: i64,
    pub last_update_ms: i64,
    pub recent_trades: Vec<ZoneTradeRecord>,
}

impl ZoneSnapshot {
    pub fn aggressive_total_units(&self) -> i64 {
        safe_add(self.aggressive_buy_units, self.aggressive_sell_units)
    }

    pub fn aggressive_units(&self, side: Side) -> i64 {
        match side {
            Side::Buy => self.aggressive_buy_units,
            Side::Sell => self.aggressive_sell_units,
        }
    }

    /// Passive units on the book side a taker of `side` consumes:
    /// buys lift asks, sells hit bids.
    pub fn passive_consumed_units(&self, aggressor: Side) -> i64 {
        match aggressor {
            Side::Buy => self.passive_ask_units,
            Side::Sell => self.passive_bid_units,
        }
    }
}

/// Zones whose bucket price lies within `distance_ticks` of `price_ticks`.
/// Used by the detectors' confluence logic.
pub fn find_zones_near_price(
    snapshots: &[ZoneSnapshot],
    price_ticks: i64,
    distance_ticks: i64,
) -> Vec<&ZoneSnapshot> {
    snapshots
        .iter()
        .filter(|z| (z.price_level_ticks - price_ticks).abs() <= distance_ticks)
        .collect()
}

/// Per-symbol map from zone id to aggregates. Owned exclusively by the
/// market-data worker.
pub struct ZoneStore {
    zone_ticks: i64,
    retention_ms: i64,
    max_zone_history: usize,
    max_trades_per_zone: usize,
    zones: HashMap<i64, Zone>,
    evicted_total: u64,
}

impl ZoneStore {
    pub fn new(cfg: &PreprocessorConfig) -> Self {
        Self {
            zone_ticks: cfg.zone_ticks,
            retention_ms: cfg.zone_retention_ms,
            max_zone_history: cfg.max_zone_history,
            max_trades_per_zone: cfg.max_trades_per_zone,
            zones: HashMap::new(),
            evicted_total: 0,
        }
    }

    pub fn zone_ticks(&self) -> i64 {
        self.zone_ticks
    }

    pub fn zone_id_for(&self, price_ticks: i64) -> i64 {
        calculate_zone(price_ticks, self.zone_ticks)
    }

    /// Aggregate one trade into its zone, returning the zone id.
    ///
    /// Callers attach zone snapshots only after this returns, so every
    /// enriched trade sees its own contribution.
    pub fn apply_trade(&mut self, trade: &Trade) -> i64 {
        let zone_id = self.zone_id_for(trade.price_ticks);
        let zone_ticks = self.zone_ticks;
        let max_trades = self.max_trades_per_zone;
        let zone = self
            .zones
            .entry(zone_id)
            .or_insert_with(|| Zone::new(zone_id, zone_ticks, max_trades, trade.timestamp_ms));

        let side = trade.aggressor();
        match side {
            Side::Buy => {
                zone.aggressive_buy_units = safe_add(zone.aggressive_buy_units, trade.qty_units)
            }
            Side::Sell => {
                zone.aggressive_sell_units = safe_add(zone.aggressive_sell_units, trade.qty_units)
            }
        }
        zone.trade_count += 1;
        zone.last_update_ms = trade.timestamp_ms;
        zone.recent_trades.push(ZoneTradeRecord {
            price_ticks: trade.price_ticks,
            qty_units: trade.qty_units,
            timestamp_ms: trade.timestamp_ms,
            side,
        });

        self.maybe_evict(trade.timestamp_ms);
        zone_id
    }

    /// Write the book's current passive band sums into a zone so depletion
    /// analysis sees passive history alongside the aggressive aggregates.
    pub fn refresh_passive(&mut self, zone_id: i64, bid_units: i64, ask_units: i64, now_ms: i64) {
        if let Some(zone) = self.zones.get_mut(&zone_id) {
            zone.passive_bid_units = bid_units;
            zone.passive_ask_units = ask_units;
            zone.last_update_ms = now_ms;
        }
    }

    pub fn zone(&self, zone_id: i64) -> Option<&Zone> {
        self.zones.get(&zone_id)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    fn is_active(&self, zone: &Zone, now_ms: i64) -> bool {
        now_ms - zone.last_update_ms <= self.retention_ms
    }

    /// Snapshots of active zones whose bucket lies within `range_ticks` of
    /// the price, sorted by zone id for deterministic downstream iteration.
    pub fn active_zones_near(
        &self,
        price_ticks: i64,
        range_ticks: i64,
        now_ms: i64,
    ) -> Vec<ZoneSnapshot> {
        let mut snaps: Vec<ZoneSnapshot> = self
            .zones
            .values()
            .filter(|z| {
                self.is_active(z, now_ms)
                    && (z.price_level_ticks - price_ticks).abs() <= range_ticks
            })
            .map(Zone::snapshot)
            .collect();
        snaps.sort_by_key(|z| z.zone_id);
        snaps
    }

    /// Retention sweep: drop zones inactive beyond the window, then enforce
    /// the history cap evicting oldest-inactive first.
    fn maybe_evict(&mut self, now_ms: i64) {
        if self.zones.len() <= self.max_zone_history {
            return;
        }
        let retention = self.retention_ms;
        let before = self.zones.len();
        self.zones
            .retain(|_, z| now_ms - z.last_update_ms <= retention);

        if self.zones.len() > self.max_zone_history {
            let mut by_age: Vec<(i64, i64)> = self
                .zones
                .values()
                .map(|z| (z.last_update_ms, z.zone_id))
                .collect();
            by_age.sort_unstable();
            let excess = self.zones.len() - self.max_zone_history;
            for (_, id) in by_age.into_iter().take(excess) {
                self.zones.remove(&id);
            }
        }
        let evicted = before - self.zones.len();
        if evicted > 0 {
            self.evicted_total += evicted as u64;
            debug!(evicted, retained = self.zones.len(), "Evicted inactive zones");
        }
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PreprocessorConfig {
        PreprocessorConfig {
            zone_ticks: 10,
            max_zone_history: 4,
            max_trades_per_zone: 3,
            zone_retention_ms: 10_000,
            ..Default::default()
        }
    }

    fn trade(id: u64, price_ticks: i64, qty_units: i64, ts: i64, buyer_is_maker: bool) -> Trade {
        Trade {
            trade_id: id,
            price_ticks,
            qty_units,
            timestamp_ms: ts,
            buyer_is_maker,
        }
    }

    #[test]
    fn test_zone_id_bucketing() {
        let store = ZoneStore::new(&cfg());
        assert_eq!(store.zone_id_for(8905), 890);
        assert_eq!(store.zone_id_for(8900), 890);
        assert_eq!(store.zone_id_for(8910), 891);
    }

    /// Scenario: four buy trades at 89.05 with quantities 18, 16, 20, 15.
    /// Expected: the zone aggregates buy volume 69 and trade count 4
    /// (zone conservation).
    #[test]
    fn test_zone_conservation() {
        let mut store = ZoneStore::new(&cfg());
        let quantities = [18i64, 16, 20, 15];
        for (i, q) in quantities.iter().enumerate() {
            store.apply_trade(&trade(i as u64, 8905, *q, 1_000 * i as i64, false));
        }
        let zone = store.zone(890).unwrap();
        assert_eq!(zone.aggressive_buy_units, 69);
        assert_eq!(zone.aggressive_sell_units, 0);
        assert_eq!(zone.aggressive_total_units(), 69);
        assert_eq!(zone.trade_count, 4);
    }

    #[test]
    fn test_recent_trade_ring_is_bounded() {
        let mut store = ZoneStore::new(&cfg());
        for i in 0..5u64 {
            store.apply_trade(&trade(i, 8905, 10, i as i64, i % 2 == 0));
        }
        let zone = store.zone(890).unwrap();
        let recent: Vec<_> = zone.recent_trades().collect();
        assert_eq!(recent.len(), 3);
        // Oldest two evicted
        assert_eq!(recent[0].timestamp_ms, 2);
    }

    #[test]
    fn test_refresh_passive_updates_aggregates() {
        let mut store = ZoneStore::new(&cfg());
        store.apply_trade(&trade(1, 8905, 10, 0, false));
        store.refresh_passive(890, 400, 5_000, 100);
        let z = store.zone(890).unwrap();
        assert_eq!(z.passive_bid_units, 400);
        assert_eq!(z.passive_ask_units, 5_000);
        assert_eq!(z.last_update_ms, 100);
    }

    #[test]
    fn test_active_zones_near_sorted_and_filtered() {
        let mut store = ZoneStore::new(&cfg());
        store.apply_trade(&trade(1, 8905, 10, 0, false)); // zone 890
        store.apply_trade(&trade(2, 8925, 10, 0, false)); // zone 892
        store.apply_trade(&trade(3, 9500, 10, 0, false)); // zone 950, far away
        let snaps = store.active_zones_near(8905, 30, 100);
        let ids: Vec<i64> = snaps.iter().map(|z| z.zone_id).collect();
        assert_eq!(ids, vec![890, 892]);
    }

    #[test]
    fn test_inactive_zone_not_returned() {
        let mut store = ZoneStore::new(&cfg());
        store.apply_trade(&trade(1, 8905, 10, 0, false));
        assert_eq!(store.active_zones_near(8905, 30, 5_000).len(), 1);
        // Past retention (10s)
        assert!(store.active_zones_near(8905, 30, 20_001).is_empty());
    }

    /// Scenario: more distinct zones than max_zone_history, all recent.
    /// Expected: eviction keeps the cap, dropping oldest-updated first.
    #[test]
    fn test_eviction_bounded_by_history_cap() {
        let mut store = ZoneStore::new(&cfg());
        for i in 0..8i64 {
            // Each trade in its own zone, strictly increasing timestamps.
            store.apply_trade(&trade(i as u64, i * 10, 10, i, false));
        }
        assert!(store.len() <= 4 + 1);
        // The newest zones survive.
        assert!(store.zone(7).is_some());
        assert!(store.zone(0).is_none());
        assert!(store.evicted_total() > 0);
    }

    #[test]
    fn test_find_zones_near_price() {
        let mut store = ZoneStore::new(&cfg());
        store.apply_trade(&trade(1, 8905, 10, 0, false));
        store.apply_trade(&trade(2, 8955, 10, 0, false));
        let snaps = store.active_zones_near(8905, 100, 100);
        let near = find_zones_near_price(&snaps, 8905, 20);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].zone_id, 890);
    }

    #[test]
    fn test_snapshot_is_value_copy() {
        let mut store = ZoneStore::new(&cfg());
        store.apply_trade(&trade(1, 8905, 10, 0, false));
        let snap = store.zone(890).unwrap().snapshot();
        store.apply_trade(&trade(2, 8905, 25, 1, false));
        // The earlier snapshot is unaffected by later aggregation.
        assert_eq!(snap.aggressive_buy_units, 10);
        assert_eq!(store.zone(890).unwrap().aggressive_buy_units, 35);
    }

    #[test]
    fn test_passive_consumed_side_selection() {
        let snap = ZoneSnapshot {
            zone_id: 0,
            price_level_ticks: 0,
            aggressive_buy_units: 0,
            aggressive_sell_units: 0,
            passive_bid_units: 400,
            passive_ask_units: 5_000,
            trade_count: 0,
            first_seen_ms: 0,
            last_update_ms: 0,
            recent_trades: Vec::new(),
        };
        // Buys consume asks; sells consume bids. Never the sum.
        assert_eq!(snap.passive_consumed_units(Side::Buy), 5_000);
        assert_eq!(snap.passive_consumed_units(Side::Sell), 400);
    }
}
