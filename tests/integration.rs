mod common;

use chrono::Duration;

use level_signal_trader::core::{classify, Invalidation};
use level_signal_trader::exchange::{ExchangePosition, OrderExchange};
use level_signal_trader::models::{DemoStatus, Direction, OrderSide, SignalStatus};
use level_signal_trader::trading::{JsonFileStore, Outcome, SignalStore};

use common::*;

#[tokio::test]
async fn scenario_1_long_just_under_level_keeps_waiting() {
    assert_eq!(classify(Direction::Long, 100.0, 99.95), Invalidation::Ok);

    let mut cfg = config();
    // tighter than the 0.05% gap, so the signal is valid but not yet in its entry zone
    cfg.entry_max_deviation_pct = 0.01;
    let rig = Rig::new(cfg);
    rig.exchange.set_price(PAIR, 99.95).await;
    let mut s = signal(1, Direction::Long, 100.0, 300);
    s.demo_status = Some(DemoStatus::WaitingForPrice);
    rig.add(s).await;

    let report = rig.watcher.sweep(&ctx()).await.unwrap();
    assert_eq!(report.waiting_checked, 1);
    let s = rig.reload(1).await;
    assert_eq!(s.demo_status, Some(DemoStatus::WaitingForPrice));
    assert!(s.order_id.is_none());
    assert_eq!(rig.exchange.place_calls().await, 0);
}

#[tokio::test]
async fn scenario_2_long_level_broken() {
    let rig = Rig::new(config());
    let s = rig.add(signal(2, Direction::Long, 100.0, 300)).await;
    let outcome = rig.engine.attempt(&s, 99.70, &ctx()).await.unwrap();
    assert_eq!(outcome, Outcome::Recorded(DemoStatus::LevelBroken));

    let events = rig.store.events(2).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "LEVEL_BROKEN");
}

#[tokio::test]
async fn scenario_3_short_deviation_is_final() {
    let rig = Rig::new(config());
    let s = rig.add(signal(3, Direction::Short, 100.0, 300)).await;
    let outcome = rig.engine.attempt(&s, 102.50, &ctx()).await.unwrap();
    assert_eq!(outcome, Outcome::Recorded(DemoStatus::PriceDeviationTooLarge));

    // price returns to the level: the signal stays finished
    let s = rig.reload(3).await;
    let again = rig.engine.attempt(&s, 100.0, &ctx()).await.unwrap();
    assert_eq!(
        again,
        Outcome::AlreadyProcessed {
            status: Some(DemoStatus::PriceDeviationTooLarge)
        }
    );
    assert_eq!(rig.exchange.place_calls().await, 0);
}

#[tokio::test]
async fn scenario_4_thirty_one_minutes_old() {
    let rig = Rig::new(config());
    let s = rig.add(signal(4, Direction::Long, 100.0, 31 * 60)).await;
    let outcome = rig.engine.attempt(&s, 100.0, &ctx()).await.unwrap();
    assert_eq!(outcome, Outcome::Recorded(DemoStatus::SignalTooOld));
    assert_eq!(rig.exchange.place_calls().await, 0);
}

#[tokio::test]
async fn scenario_5_placed_is_already_processed() {
    let rig = Rig::new(config());
    let mut s = signal(5, Direction::Long, 100.0, 300);
    s.demo_status = Some(DemoStatus::Placed);
    s.order_id = Some("ext-1".into());
    let s = rig.add(s).await;

    for _ in 0..3 {
        let outcome = rig.engine.attempt(&s, 100.0, &ctx()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::AlreadyProcessed {
                status: Some(DemoStatus::Placed)
            }
        );
    }
    assert_eq!(rig.exchange.place_calls().await, 0);
    assert_eq!(rig.reload(5).await.version, 0);
}

#[tokio::test]
async fn scenario_6_breakeven_fires_once() {
    let rig = Rig::new(config());
    rig.exchange
        .seed_position(ExchangePosition {
            pair: PAIR.into(),
            direction: Direction::Long,
            size: 0.5,
            entry_price: 100.0,
            take_profit: Some(101.5),
            stop_loss: Some(99.5),
        })
        .await;
    rig.exchange.set_price(PAIR, 100.5).await;

    let mut s = signal(6, Direction::Long, 100.0, 3 * 3600);
    s.demo_status = Some(DemoStatus::OpenPosition);
    s.order_id = Some("ext-6".into());
    s.entry_price = Some(100.0);
    s.tp_price = Some(101.5);
    s.sl_price = Some(99.5);
    s.filled_at = Some(now() - Duration::minutes(45));
    rig.add(s).await;

    let first = rig.watcher.sweep(&ctx()).await.unwrap();
    assert_eq!(first.breakeven_applied, 1);
    let s = rig.reload(6).await;
    assert_eq!(s.demo_status, Some(DemoStatus::SlToBreakeven));
    assert!((s.sl_price.unwrap() - 99.9).abs() < 1e-9);
    let orders = rig.exchange.order_count().await;

    let second = rig.watcher.sweep(&ctx_at(1)).await.unwrap();
    assert_eq!(second, Default::default());
    assert_eq!(rig.exchange.order_count().await, orders);
    assert_eq!(rig.reload(6).await.version, s.version);

    let pos = rig.exchange.get_position(PAIR).await.unwrap().unwrap();
    assert!((pos.stop_loss.unwrap() - 99.9).abs() < 1e-9);
}

#[tokio::test]
async fn broken_level_recovers_within_window_only() {
    let rig = Rig::new(config());
    rig.exchange.set_price(PAIR, 99.5).await;
    let s = rig.add(signal(7, Direction::Long, 100.0, 60)).await;
    rig.engine.attempt(&s, 99.5, &ctx()).await.unwrap();
    assert_eq!(rig.reload(7).await.demo_status, Some(DemoStatus::LevelBroken));

    // back above the level ten minutes later
    rig.exchange.set_price(PAIR, 100.3).await;
    let report = rig.watcher.sweep(&ctx_at(10)).await.unwrap();
    assert_eq!(report.level_recovered, 1);
    // recovered and retried in the same sweep; 0.3% is inside the entry corridor
    let s = rig.reload(7).await;
    assert!(matches!(
        s.demo_status,
        Some(DemoStatus::WaitingForPrice) | Some(DemoStatus::New)
    ));

    let mut late = signal(8, Direction::Long, 100.0, 60);
    late.demo_status = Some(DemoStatus::LevelBroken);
    rig.add(late).await;
    let report = rig.watcher.sweep(&ctx_at(45)).await.unwrap();
    assert_eq!(report.level_recovered, 0);
    assert_eq!(rig.reload(8).await.demo_status, Some(DemoStatus::LevelBroken));
}

#[tokio::test]
async fn waiting_signal_submits_when_price_arrives_then_fills() {
    let rig = Rig::new(config());
    rig.exchange.set_price(PAIR, 101.0).await;
    let s = rig.add(signal(9, Direction::Long, 100.0, 60)).await;

    let outcome = rig.engine.attempt(&s, 101.0, &ctx()).await.unwrap();
    assert_eq!(outcome, Outcome::Recorded(DemoStatus::WaitingForPrice));

    rig.exchange.set_price(PAIR, 100.2).await;
    let report = rig.watcher.sweep(&ctx_at(1)).await.unwrap();
    assert_eq!(report.waiting_submitted, 1);
    let s = rig.reload(9).await;
    assert_eq!(s.demo_status, Some(DemoStatus::New));
    let order_id = s.order_id.clone().unwrap();
    let resting = rig.exchange.open_entry_orders(PAIR, OrderSide::Buy).await.unwrap();
    assert_eq!(resting.len(), 1);
    assert_eq!(resting[0].order_id, order_id);
    assert_eq!(resting[0].client_order_id, "entry-9");

    rig.exchange.set_price(PAIR, 99.95).await;
    let report = rig.watcher.sweep(&ctx_at(2)).await.unwrap();
    assert_eq!(report.orders_filled, 1);
    let s = rig.reload(9).await;
    assert_eq!(s.demo_status, Some(DemoStatus::OpenPosition));

    let kinds: Vec<String> = rig
        .store
        .events(9)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec!["WAITING_FOR_PRICE", "ORDER_SUBMITTED", "POSITION_FILLED"]
    );
}

#[tokio::test]
async fn waiting_signals_are_invalidated_by_the_sweep() {
    let rig = Rig::new(config());
    rig.exchange.set_price(PAIR, 99.7).await;

    // 0.3% under a LONG level: broken
    let mut broken = signal(15, Direction::Long, 100.0, 300);
    broken.demo_status = Some(DemoStatus::WaitingForPrice);
    rig.add(broken).await;
    // 2.8% above a LONG level: too far
    let mut far = signal(16, Direction::Long, 97.0, 300);
    far.demo_status = Some(DemoStatus::WaitingForPrice);
    rig.add(far).await;

    let report = rig.watcher.sweep(&ctx()).await.unwrap();
    assert_eq!(report.waiting_checked, 2);
    assert_eq!(report.waiting_submitted, 0);
    assert_eq!(rig.reload(15).await.demo_status, Some(DemoStatus::LevelBroken));
    assert_eq!(
        rig.reload(16).await.demo_status,
        Some(DemoStatus::PriceDeviationTooLarge)
    );
    assert_eq!(rig.exchange.place_calls().await, 0);

    // price unchanged: the broken level does not recover, the final one is not revisited
    let report = rig.watcher.sweep(&ctx_at(1)).await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(rig.reload(15).await.demo_status, Some(DemoStatus::LevelBroken));
    assert_eq!(rig.store.events(16).await.unwrap().len(), 1);
}

#[tokio::test]
async fn waiting_signal_expires_at_the_cutoff() {
    let rig = Rig::new(config());
    rig.exchange.set_price(PAIR, 101.0).await;
    let s = rig.add(signal(10, Direction::Long, 100.0, 1700)).await;
    rig.engine.attempt(&s, 101.0, &ctx()).await.unwrap();

    // 1820s old at the next sweep: expired, even though the price is now in range
    rig.exchange.set_price(PAIR, 100.0).await;
    let report = rig.watcher.sweep(&ctx_at(2)).await.unwrap();
    assert_eq!(report.waiting_checked, 1);
    assert_eq!(report.waiting_expired, 1);
    assert_eq!(rig.reload(10).await.demo_status, Some(DemoStatus::SignalTooOld));
    assert_eq!(rig.exchange.place_calls().await, 0);

    // retryable, but too old for the pending bucket
    let report = rig.watcher.sweep(&ctx_at(3)).await.unwrap();
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn orphan_closed_signal_and_untouched_history() {
    let rig = Rig::new(config());
    let mut orphan = signal(11, Direction::Short, 100.0, 5 * 3600);
    orphan.demo_status = Some(DemoStatus::LiveDisabled);
    rig.add(orphan).await;
    rig.store
        .set_market_status(11, SignalStatus::Closed, Some(99.0), Some(now()))
        .await
        .unwrap();

    let mut traded = signal(12, Direction::Short, 100.0, 5 * 3600);
    traded.demo_status = Some(DemoStatus::OpenPosition);
    traded.order_id = Some("ext-12".into());
    traded.status = SignalStatus::TakeProfit;
    rig.add(traded).await;

    let report = rig.watcher.sweep(&ctx()).await.unwrap();
    assert_eq!(report.orphans_closed, 1);
    assert_eq!(
        rig.reload(11).await.demo_status,
        Some(DemoStatus::SignalClosedNoOrder)
    );
    assert_eq!(rig.reload(12).await.demo_status, Some(DemoStatus::OpenPosition));
}

#[tokio::test]
async fn live_switch_off_then_on() {
    let rig = Rig::new(config());
    rig.exchange.set_price(PAIR, 100.1).await;
    let s = rig.add(signal(13, Direction::Long, 100.0, 60)).await;

    let off = level_signal_trader::trading::TradingContext::new(now(), false);
    let outcome = rig.engine.attempt(&s, 100.1, &off).await.unwrap();
    assert_eq!(outcome, Outcome::Recorded(DemoStatus::LiveDisabled));

    // the sweep picks it up again once live trading is on
    let report = rig.watcher.sweep(&ctx_at(1)).await.unwrap();
    assert_eq!(report.pending_attempted, 1);
    assert_eq!(rig.reload(13).await.demo_status, Some(DemoStatus::New));
}

#[tokio::test]
async fn engine_state_survives_store_reopen() {
    let dir = std::env::temp_dir().join(format!("lst-integration-{}", std::process::id()));
    let path = dir.join("signals.json");
    let _ = std::fs::remove_dir_all(&dir);

    {
        let store = JsonFileStore::open(&path).unwrap();
        store.insert(signal(14, Direction::Long, 100.0, 60)).await.unwrap();
        store
            .compare_and_set(
                14,
                None,
                DemoStatus::LevelBroken,
                Default::default(),
                now(),
            )
            .await
            .unwrap();
    }

    let store = JsonFileStore::open(&path).unwrap();
    let s = store.get(14).await.unwrap().unwrap();
    assert_eq!(s.demo_status, Some(DemoStatus::LevelBroken));
    assert_eq!(s.version, 1);
    let _ = std::fs::remove_dir_all(&dir);
}
