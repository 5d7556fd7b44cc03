//! End-to-end scenario tests driving the public engine API with synthetic
//! trade and depth streams.

use orderflow_engine::config::CvdMode;
use orderflow_engine::engine::{EngineEvent, MarketDataEngine};
use orderflow_engine::health::MarketHealth;
use orderflow_engine::signal::{SignalManager, SubmitOutcome};
use orderflow_engine::types::{
    AggTradeEvent, DepthUpdateEvent, SignalMetadata, SnapshotResponse, ThresholdRecord,
};
use orderflow_engine::{EngineConfig, Side, SignalCandidate, SignalKind, SymbolConfig};

fn agg_trade(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> AggTradeEvent {
    AggTradeEvent {
        event_type: "aggTrade".into(),
        event_time: ts,
        symbol: "BTCUSDT".into(),
        agg_trade_id: id,
        price: price.into(),
        quantity: qty.into(),
        first_trade_id: id,
        last_trade_id: id,
        trade_time: ts,
        is_buyer_maker: buyer_is_maker,
        is_best_match: true,
    }
}

fn depth_update(
    first: i64,
    last: i64,
    ts: i64,
    bids: &[(&str, &str)],
    asks: &[(&str, &str)],
) -> DepthUpdateEvent {
    DepthUpdateEvent {
        event_type: "depthUpdate".into(),
        event_time: ts,
        symbol: "BTCUSDT".into(),
        first_update_id: first,
        final_update_id: last,
        bids: bids
            .iter()
            .map(|(p, q)| [p.to_string(), q.to_string()])
            .collect(),
        asks: asks
            .iter()
            .map(|(p, q)| [p.to_string(), q.to_string()])
            .collect(),
    }
}

fn snapshot(id: i64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> SnapshotResponse {
    SnapshotResponse {
        last_update_id: id,
        bids: bids
            .iter()
            .map(|(p, q)| (p.to_string(), q.to_string()))
            .collect(),
        asks: asks
            .iter()
            .map(|(p, q)| (p.to_string(), q.to_string()))
            .collect(),
    }
}

fn candidates_of(events: &[EngineEvent], kind: SignalKind) -> Vec<SignalCandidate> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Candidate(c) if c.kind == kind => Some((**c).clone()),
            _ => None,
        })
        .collect()
}

/// Scenario 1: absorption at resistance. Base 89.00, tick 0.01, zone_ticks
/// 10; 5000 passive ask units at 89.05; four buys of 18, 16, 20, 15 one
/// second apart.
/// Expected: the enriched trade after the fourth shows zone aggregates
/// buy=69/count=4; exactly one absorption signal across the burst; a fifth
/// identical trade inside the cooldown adds nothing.
#[test]
fn scenario_absorption_at_resistance() {
    let mut cfg = EngineConfig::new(SymbolConfig::default());
    cfg.absorption.min_agg_volume_units = 50_00_000_000;
    cfg.absorption.final_confidence_required = 0.30;
    cfg.absorption.event_cooldown_ms = 30_000;
    cfg.indicators.enabled = false;
    let mut eng = MarketDataEngine::new(cfg);

    eng.on_snapshot(&snapshot(
        100,
        &[("89.00", "4.0")],
        &[("89.05", "5000.0"), ("89.06", "10.0")],
    ));

    let mut absorption = Vec::new();
    let mut last_enriched = None;
    for (i, qty) in ["18", "16", "20", "15"].iter().enumerate() {
        let ts = 1_000 * (i as i64 + 1);
        let events = eng.on_trade_event(&agg_trade(i as u64 + 1, "89.05", qty, ts, false));
        absorption.extend(candidates_of(&events, SignalKind::Absorption));
        if let EngineEvent::Enriched(enriched) = &events[0] {
            last_enriched = Some((**enriched).clone());
        }
    }

    let enriched = last_enriched.expect("enriched trades flowed");
    let own = enriched.own_zone().expect("own zone attached");
    assert_eq!(own.aggressive_buy_units, 69_00_000_000);
    assert_eq!(own.trade_count, 4);

    assert_eq!(absorption.len(), 1, "exactly one absorption signal");
    assert_eq!(absorption[0].side, Side::Sell);
    assert!((0.0..=1.0).contains(&absorption[0].confidence));
    assert!(absorption[0].thresholds.all_passed());

    // Fifth identical trade within the cooldown: no second signal.
    let events = eng.on_trade_event(&agg_trade(9, "89.05", "18", 5_000, false));
    assert!(candidates_of(&events, SignalKind::Absorption).is_empty());
}

/// Scenario 2: exhaustion on bid depletion. Passive bid 400 at 500.00 is
/// consumed by seven aggressive sells (50, 70, 80, 60, 55, 40, 15) with
/// depth diffs walking the bid down to 5.
/// Expected: one exhaustion signal with side=buy and depletion_ratio at or
/// above the threshold; a cooldown-window-immediate eighth trade adds none.
#[test]
fn scenario_exhaustion_on_bid_depletion() {
    let mut cfg = EngineConfig::new(SymbolConfig::default());
    cfg.exhaustion.min_agg_volume_units = 100_00_000_000;
    cfg.exhaustion.final_confidence_required = 0.70;
    cfg.confluence.min_zone_confluence_count = 1;
    cfg.indicators.enabled = false;
    let mut eng = MarketDataEngine::new(cfg);

    eng.on_snapshot(&snapshot(
        100,
        &[("500.00", "400.0"), ("499.99", "10.0")],
        &[("500.01", "300.0")],
    ));

    let quantities = ["50", "70", "80", "60", "55", "40", "15"];
    let bids_after = ["350.0", "280.0", "200.0", "140.0", "85.0", "45.0", "5.0"];
    let mut exhaustion = Vec::new();
    for (i, (qty, bid)) in quantities.iter().zip(bids_after).enumerate() {
        let ts = 1_000 * (i as i64 + 1);
        // The diff stream reflects the consumed bid before the next print.
        eng.on_depth_event(&depth_update(
            101 + i as i64,
            101 + i as i64,
            ts - 10,
            &[("500.00", bid)],
            &[],
        ));
        let events = eng.on_trade_event(&agg_trade(i as u64 + 1, "500.00", qty, ts, true));
        exhaustion.extend(candidates_of(&events, SignalKind::Exhaustion));
    }

    assert_eq!(exhaustion.len(), 1, "exactly one exhaustion signal");
    let sig = &exhaustion[0];
    assert_eq!(sig.side, Side::Buy);
    let SignalMetadata::Exhaustion { depletion_ratio, .. } = &sig.metadata else {
        panic!("wrong metadata variant");
    };
    assert!(*depletion_ratio >= 0.75);

    // Immediate follow-up inside the cooldown: nothing more.
    eng.on_depth_event(&depth_update(108, 108, 7_990, &[("500.00", "4.0")], &[]));
    let events = eng.on_trade_event(&agg_trade(8, "500.00", "1", 8_000, true));
    assert!(candidates_of(&events, SignalKind::Exhaustion).is_empty());
}

/// Scenario 3: accumulation promotion. Twenty trades over 12s at
/// 82.15/82.16, quantities ~52, buy-dominant, then a triggering buy.
/// Expected: one accumulation zone_created event and one zone signal with
/// total volume above 300.
#[test]
fn scenario_accumulation_promotion() {
    let mut cfg = EngineConfig::new(SymbolConfig::default());
    cfg.accumulation.min_duration_ms = 10_000;
    cfg.accumulation.min_zone_volume_units = 300_00_000_000;
    cfg.accumulation.min_trade_count = 10;
    cfg.accumulation.min_buy_ratio = 0.55;
    cfg.accumulation.final_confidence_required = 0.30;
    cfg.indicators.enabled = false;
    let mut eng = MarketDataEngine::new(cfg);

    eng.on_snapshot(&snapshot(
        100,
        &[("82.14", "200.0")],
        &[("82.17", "200.0")],
    ));

    let mut zone_created = Vec::new();
    let mut signals = Vec::new();
    for i in 0..20u64 {
        let price = if i % 2 == 0 { "82.15" } else { "82.16" };
        let is_sell = i % 4 == 3; // 15 buys, 5 sells
        let events = eng.on_trade_event(&agg_trade(i + 1, price, "52", i as i64 * 600, is_sell));
        signals.extend(candidates_of(&events, SignalKind::Accumulation));
        zone_created.extend(events.iter().filter_map(|e| match e {
            EngineEvent::Zone(z @ orderflow_engine::ZoneEvent::ZoneCreated { .. }) => {
                Some(z.clone())
            }
            _ => None,
        }));
    }
    let events = eng.on_trade_event(&agg_trade(99, "82.15", "52", 12_100, false));
    signals.extend(candidates_of(&events, SignalKind::Accumulation));
    zone_created.extend(events.iter().filter_map(|e| match e {
        EngineEvent::Zone(z @ orderflow_engine::ZoneEvent::ZoneCreated { .. }) => Some(z.clone()),
        _ => None,
    }));

    assert_eq!(zone_created.len(), 1, "one zone_created event");
    let orderflow_engine::ZoneEvent::ZoneCreated {
        kind, total_volume, ..
    } = &zone_created[0]
    else {
        panic!()
    };
    assert_eq!(*kind, SignalKind::Accumulation);
    assert!(*total_volume > 300.0);

    assert_eq!(signals.len(), 1, "one zone signal");
    assert_eq!(signals[0].side, Side::Buy);
    let SignalMetadata::Zone { total_volume, .. } = &signals[0].metadata else {
        panic!("wrong metadata variant");
    };
    assert!(*total_volume > 300.0);
}

fn cvd_tape(eng: &mut MarketDataEngine) -> Vec<SignalCandidate> {
    let mut signals = Vec::new();
    for i in 0..500i64 {
        let ts = i * 600; // 500 trades over 300 s
        let is_buy = i % 10 < 7; // sustained 70/30 buy dominance
        let ticks = 10_000 + i / 5;
        let price = format!("{}.{:02}", ticks / 100, ticks % 100);
        // Volume surges in the last 30 seconds.
        let qty = if ts >= 270_000 { "60" } else { "10" };
        let events = eng.on_trade_event(&agg_trade(i as u64 + 1, &price, qty, ts, !is_buy));
        signals.extend(candidates_of(&events, SignalKind::CvdConfirmation));
    }
    signals
}

/// Scenario 4: CVD momentum. 500 trades over 300s with 70/30 buy dominance
/// and an end-of-tape volume surge.
/// Expected: at least one CVD confirmation with side=buy and |z| >= min_z;
/// the identical tape under divergence-only mode stays silent.
#[test]
fn scenario_cvd_momentum_and_divergence_mode() {
    let mut cfg = EngineConfig::new(SymbolConfig::default());
    cfg.cvd.windows_sec = vec![60, 300];
    cfg.cvd.min_samples_for_stats = 20;
    cfg.cvd.min_z = 1.0;
    cfg.cvd.strong_correlation_threshold = 0.5;
    cfg.cvd.volume_surge_multiplier = 1.5;
    cfg.cvd.divergence_threshold = -0.2;
    cfg.cvd.final_confidence_required = 0.40;
    cfg.cvd.mode = CvdMode::Momentum;
    cfg.indicators.enabled = false;
    let mut momentum_cfg = cfg.clone();
    let mut eng = MarketDataEngine::new(momentum_cfg.clone());
    eng.on_snapshot(&snapshot(100, &[("99.99", "500.0")], &[("100.01", "500.0")]));
    let signals = cvd_tape(&mut eng);
    assert!(!signals.is_empty(), "momentum tape must confirm");
    for sig in &signals {
        assert_eq!(sig.side, Side::Buy);
        let SignalMetadata::Cvd { z_score, .. } = &sig.metadata else {
            panic!("wrong metadata variant");
        };
        assert!(z_score.abs() >= 1.0);
    }

    // Same tape, divergence-only: flow confirms price, so nothing fires.
    momentum_cfg.cvd.mode = CvdMode::Divergence;
    let mut eng = MarketDataEngine::new(momentum_cfg);
    eng.on_snapshot(&snapshot(100, &[("99.99", "500.0")], &[("100.01", "500.0")]));
    let signals = cvd_tape(&mut eng);
    assert!(signals.is_empty(), "divergence mode must stay silent");
}

/// Scenario 5: sequence gap recovery. Updates 1..=100 apply in order; an
/// update with U=150 opens a gap.
/// Expected: the book transitions to recovering and requests one snapshot;
/// buffered 101..149-range updates are discarded; after a snapshot at 200,
/// subsequent updates resume.
#[test]
fn scenario_sequence_gap_recovery() {
    let cfg = EngineConfig::new(SymbolConfig::default());
    let mut eng = MarketDataEngine::new(cfg);
    eng.on_snapshot(&snapshot(0, &[("89.00", "5.0")], &[("89.05", "5.0")]));

    for id in 1..=100i64 {
        let events = eng.on_depth_event(&depth_update(
            id,
            id,
            id * 10,
            &[("89.00", "5.0")],
            &[],
        ));
        assert!(events.is_empty(), "in-sequence updates need no recovery");
    }
    assert!(!eng.book_health().recovering);

    // Gap: U=150 with ids 101..149 missing.
    let events = eng.on_depth_event(&depth_update(150, 150, 1_500, &[("89.01", "1.0")], &[]));
    assert!(matches!(
        events.as_slice(),
        [EngineEvent::SnapshotRequest { .. }]
    ));
    assert!(eng.book_health().recovering);

    // Updates in the missing range buffer (and are discarded at recovery).
    let events = eng.on_depth_event(&depth_update(151, 160, 1_600, &[("89.02", "1.0")], &[]));
    assert!(events.is_empty(), "no duplicate snapshot request");

    // Snapshot at 200 restores sync; buffered updates behind it vanish.
    eng.on_snapshot(&snapshot(200, &[("89.00", "5.0")], &[("89.05", "5.0")]));
    assert!(!eng.book_health().recovering);

    // Subsequent in-sequence updates resume cleanly.
    let events = eng.on_depth_event(&depth_update(201, 201, 2_100, &[("89.01", "2.0")], &[]));
    assert!(events.is_empty());
    assert!(!eng.book_health().recovering);
}

/// Scenario 6: queue backpressure. 10k mixed-priority signals into
/// max_queue 5000 / backpressure 4000.
/// Expected: roughly the 5000 highest priorities dispatch, the rest count
/// as backpressure drops, and no bypass-priority signal is ever dropped.
#[test]
fn scenario_queue_backpressure() {
    let mut cfg = EngineConfig::new(SymbolConfig::default());
    cfg.signals.max_queue_size = 5_000;
    cfg.signals.backpressure_threshold = 4_000;
    cfg.signals.signal_throttle_ms = 0;
    cfg.signals.conflict.enabled = false;
    cfg.signals.signal_timeout_ms = i64::MAX;
    cfg.signals.high_priority_bypass_threshold = 0.83;
    cfg.signals.max_adaptive_batch_size = 512;
    let mut mgr = SignalManager::new(cfg.signals.clone());
    let health = MarketHealth::warming_up();

    let make = |seq: u64, kind: SignalKind, confidence: f64| SignalCandidate {
        id: SignalCandidate::deterministic_id("load", seq as i64, seq),
        kind,
        side: Side::Buy,
        price_ticks: 8_905,
        confidence,
        timestamp_ms: 0,
        detector_id: "load".into(),
        correlation_id: SignalCandidate::deterministic_id("load", 0, u64::MAX),
        thresholds: ThresholdRecord::default(),
        indicators: None,
        metadata: SignalMetadata::Cvd {
            window_sec: 60,
            delta: 0.0,
            z_score: 0.0,
            correlation: 0.0,
            volume_surge: 1.0,
            mode: "momentum".into(),
        },
    };

    let mut bypass_dispatched = 0u64;
    for i in 0..10_000u64 {
        if i % 1_000 == 999 {
            // A bypass-priority exhaustion signal mid-saturation. In the
            // balanced regime: 0.9 * 0.8 * 0.99 = 0.713 < threshold? No —
            // threshold 0.83 needs high-vol weighting.
            let mut hot = MarketHealth::warming_up();
            hot.volatility_ratio = 5.0;
            let out = mgr.submit(make(i, SignalKind::Exhaustion, 0.99), &hot, 0);
            assert!(
                matches!(out, SubmitOutcome::DispatchedImmediately(_)),
                "bypass signal must never be dropped: {out:?}"
            );
            bypass_dispatched += 1;
            continue;
        }
        let confidence = 0.60 + 0.40 * ((i * 7 % 100) as f64 / 100.0);
        let _ = mgr.submit(make(i, SignalKind::CvdConfirmation, confidence), &health, 0);
    }

    let mut dispatched = 0u64;
    let mut now = 1_000;
    loop {
        let batch = mgr.process_batch(now);
        if batch.is_empty() {
            break;
        }
        dispatched += batch.len() as u64;
        now += 100;
    }

    let stats = mgr.stats();
    assert_eq!(stats.received, 10_000);
    assert_eq!(stats.bypass_dispatched, bypass_dispatched);
    let queued_dispatched = dispatched;
    assert!(
        (4_000..=5_000).contains(&(queued_dispatched as usize)),
        "dispatched {queued_dispatched}"
    );
    assert_eq!(
        stats.confirmed + stats.dropped_backpressure,
        10_000,
        "every signal dispatched or counted as a drop"
    );
}

/// Determinism: replaying the same trade+depth stream produces byte-
/// identical candidate metadata and ids.
#[test]
fn property_replay_determinism() {
    let run = || {
        let mut cfg = EngineConfig::new(SymbolConfig::default());
        cfg.absorption.min_agg_volume_units = 50_00_000_000;
        cfg.absorption.final_confidence_required = 0.30;
        cfg.indicators.enabled = false;
        let mut eng = MarketDataEngine::new(cfg);
        eng.on_snapshot(&snapshot(
            100,
            &[("89.00", "4.0")],
            &[("89.05", "5000.0")],
        ));
        let mut out = Vec::new();
        for i in 0..50u64 {
            let qty = if i % 3 == 0 { "18" } else { "7" };
            let side = i % 5 == 0;
            let ts = 500 * i as i64;
            let events = eng.on_trade_event(&agg_trade(i + 1, "89.05", qty, ts, side));
            for e in events {
                if let EngineEvent::Candidate(c) = e {
                    out.push(serde_json::to_string(&*c).unwrap());
                }
            }
        }
        out
    };
    let first = run();
    let second = run();
    assert!(!first.is_empty(), "tape should produce at least one candidate");
    assert_eq!(first, second, "replay must be byte-identical");
}

/// Idempotence: applying the identical depth update twice leaves the book
/// exactly as after the first application.
#[test]
fn property_duplicate_depth_update_idempotent() {
    let cfg = EngineConfig::new(SymbolConfig::default());
    let mut eng = MarketDataEngine::new(cfg);
    eng.on_snapshot(&snapshot(100, &[("89.00", "5.0")], &[("89.05", "5.0")]));

    let update = depth_update(101, 102, 1_000, &[("89.01", "3.0")], &[("89.04", "2.0")]);
    eng.on_depth_event(&update);
    let health_after_first = eng.book_health();
    eng.on_depth_event(&update);
    let health_after_second = eng.book_health();
    assert_eq!(health_after_first.initialized, health_after_second.initialized);
    assert!(!health_after_second.recovering);

    // The enrichment view confirms identical book state.
    let e1 = eng.on_trade_event(&agg_trade(1, "89.01", "1", 2_000, false));
    let EngineEvent::Enriched(enriched) = &e1[0] else { panic!() };
    assert_eq!(enriched.book.best_bid_ticks, 8901);
    assert_eq!(enriched.book.passive_bid_units, 3_00_000_000);
}

/// Bounds: every emitted confidence lies in [0,1] and every CVD statistic
/// within its clamp, across a mixed stress tape.
#[test]
fn property_output_bounds() {
    let mut cfg = EngineConfig::new(SymbolConfig::default());
    cfg.absorption.final_confidence_required = 0.10;
    cfg.absorption.min_agg_volume_units = 10_00_000_000;
    cfg.cvd.min_samples_for_stats = 10;
    cfg.cvd.min_z = 0.5;
    cfg.cvd.strong_correlation_threshold = 0.2;
    cfg.cvd.volume_surge_multiplier = 1.1;
    cfg.cvd.final_confidence_required = 0.10;
    cfg.indicators.enabled = false;
    let mut eng = MarketDataEngine::new(cfg);
    eng.on_snapshot(&snapshot(
        100,
        &[("99.99", "800.0")],
        &[("100.01", "900.0")],
    ));

    let mut candidates = Vec::new();
    for i in 0..400i64 {
        let ticks = 10_000 + (i % 40) - 20;
        let price = format!("{}.{:02}", ticks / 100, ticks % 100);
        let qty = if i % 17 == 0 { "250" } else { "3" };
        let events = eng.on_trade_event(&agg_trade(
            i as u64 + 1,
            &price,
            qty,
            i * 250,
            i % 3 == 0,
        ));
        for e in events {
            if let EngineEvent::Candidate(c) = e {
                candidates.push(*c);
            }
        }
    }

    for c in &candidates {
        assert!((0.0..=1.0).contains(&c.confidence), "confidence bound: {c:?}");
        if let SignalMetadata::Cvd {
            z_score,
            correlation,
            ..
        } = &c.metadata
        {
            assert!(z_score.abs() <= 8.0);
            assert!(correlation.abs() <= 0.999);
        }
    }
}
