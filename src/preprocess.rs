//! Trade preprocessor: normalizes raw aggregated trades, updates the zone
//! store, and emits enriched trades carrying book context and nearby zone
//! snapshots.
//!
//! Ordering contract: the trade's aggressive volume is aggregated into its
//! zone *before* the zone snapshot is attached, so every enriched trade sees
//! its own contribution. Violating this shows up as the first trade of a
//! burst reading stale aggregates.

use crate::book::OrderBookState;
use crate::config::PreprocessorConfig;
use crate::error::ParseError;
use crate::numerics::SymbolScale;
use crate::types::{AggTradeEvent, BookContext, EnrichedTrade, Trade};
use crate::zones::ZoneStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Drop counters; every rejected trade is counted, never silently swallowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessStats {
    pub trades_processed: u64,
    pub trades_dropped: u64,
    pub degraded_enrichments: u64,
    pub large_trades: u64,
}

pub struct TradePreprocessor {
    scale: SymbolScale,
    cfg: PreprocessorConfig,
    stats: PreprocessStats,
}

impl TradePreprocessor {
    pub fn new(scale: SymbolScale, cfg: PreprocessorConfig) -> Self {
        Self {
            scale,
            cfg,
            stats: PreprocessStats::default(),
        }
    }

    pub fn stats(&self) -> PreprocessStats {
        self.stats
    }

    /// Normalize a raw event. Malformed trades drop whole with a counter
    /// increment; nothing is partially applied.
    pub fn normalize(&mut self, ev: &AggTradeEvent) -> Result<Trade, ParseError> {
        let price_ticks = self.scale.parse_price(&ev.price).map_err(|e| {
            self.stats.trades_dropped += 1;
            warn!(trade_id = ev.agg_trade_id, error = %e, "Dropping malformed trade price");
            e
        })?;
        let qty_units = self.scale.parse_qty(&ev.quantity).map_err(|e| {
            self.stats.trades_dropped += 1;
            warn!(trade_id = ev.agg_trade_id, error = %e, "Dropping malformed trade quantity");
            e
        })?;
        Ok(Trade {
            trade_id: ev.agg_trade_id,
            price_ticks,
            qty_units,
            timestamp_ms: ev.trade_time,
            buyer_is_maker: ev.is_buyer_maker,
        })
    }

    /// Full preprocessing of one raw trade against the current book and
    /// zone state.
    pub fn process(
        &mut self,
        ev: &AggTradeEvent,
        book: &OrderBookState,
        zones: &mut ZoneStore,
    ) -> Result<EnrichedTrade, ParseError> {
        let trade = self.normalize(ev)?;

        // 1. Capture book context. A quarantined book degrades enrichment
        //    but the trade still flows.
        let book_ctx = self.capture_book_context(&trade, book);
        if !book_ctx.book_synced {
            self.stats.degraded_enrichments += 1;
        }

        // 2. Aggregate first: the trade lands in its zone before any
        //    snapshot is taken.
        let zone_id = zones.apply_trade(&trade);
        zones.refresh_passive(
            zone_id,
            book_ctx.zone_passive_bid_units,
            book_ctx.zone_passive_ask_units,
            trade.timestamp_ms,
        );

        // 3. Then read: snapshot active zones near the trade price.
        let zone_data = zones.active_zones_near(
            trade.price_ticks,
            self.cfg.zone_calculation_range_ticks,
            trade.timestamp_ms,
        );

        let is_large = trade.qty_units >= self.cfg.large_trade_units;
        if is_large {
            self.stats.large_trades += 1;
            debug!(
                trade_id = trade.trade_id,
                qty_units = trade.qty_units,
                "Large trade flagged"
            );
        }
        self.stats.trades_processed += 1;

        Ok(EnrichedTrade {
            trade,
            book: book_ctx,
            zone_id,
            is_large,
            zone_data,
        })
    }

    fn capture_book_context(&self, trade: &Trade, book: &OrderBookState) -> BookContext {
        if !book.is_synced() {
            return BookContext::default();
        }
        let (Some((best_bid, _)), Some((best_ask, _))) = (book.best_bid(), book.best_ask()) else {
            return BookContext::default();
        };
        let level = book.level(trade.price_ticks).unwrap_or_default();
        let (zone_bid, zone_ask) = book.sum_band(trade.price_ticks, self.cfg.band_ticks);
        BookContext {
            book_synced: true,
            best_bid_ticks: best_bid,
            best_ask_ticks: best_ask,
            spread_ticks: best_ask - best_bid,
            mid_ticks: (best_bid + best_ask) / 2,
            passive_bid_units: level.bid_units,
            passive_ask_units: level.ask_units,
            zone_passive_bid_units: zone_bid,
            zone_passive_ask_units: zone_ask,
        }
    }
}
