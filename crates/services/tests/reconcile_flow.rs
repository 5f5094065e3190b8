use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};

use signal_ledger_core::config::ReconcileConfig;
use signal_ledger_domain::entities::{NewSignal, SignalRecord};
use signal_ledger_domain::enums::{Direction, ExitPattern, SignalKind, SignalStatus};
use signal_ledger_domain::traits::{MatchCommit, SignalRepository};
use signal_ledger_domain::value_objects::{HeaderStrategyExtractor, StrategyKeyExtractor};
use signal_ledger_infrastructure::InMemorySignalRepository;
use signal_ledger_services::reconcile::{
    BackfillDriver, BackfillOptions, BackfillSide, InboundAlert, IngestOutcome, IngestedSignal,
    MatchResult, RetryPolicy, SignalIngestService, SignalMatcher,
};

struct Harness {
    repo: Arc<InMemorySignalRepository>,
    matcher: Arc<SignalMatcher>,
    ingest: SignalIngestService,
    config: ReconcileConfig,
}

impl Harness {
    fn new() -> Self {
        let config = ReconcileConfig::default();
        let repo = Arc::new(InMemorySignalRepository::new());
        let matcher = Arc::new(
            SignalMatcher::new(repo.clone(), &config).with_retry(RetryPolicy::immediate(3)),
        );
        let ingest = SignalIngestService::new(matcher.clone(), &config);
        Self {
            repo,
            matcher,
            ingest,
            config,
        }
    }

    async fn ingest(&self, alert: InboundAlert) -> IngestedSignal {
        match self.ingest.ingest(alert).await.unwrap() {
            IngestOutcome::Recorded(signal) => *signal,
            IngestOutcome::Duplicate { key } => panic!("unexpected duplicate: {key}"),
        }
    }

    /// 直接写入账本，模拟历史数据（不经过分类）
    async fn append_raw(
        &self,
        raw: &str,
        kind: SignalKind,
        direction: Direction,
        price: Option<f64>,
        secs: i64,
    ) -> SignalRecord {
        self.repo
            .append_signal(NewSignal {
                strategy_key: HeaderStrategyExtractor.derive(raw, "BTCUSDT"),
                symbol: "BTCUSDT".to_string(),
                kind,
                declared_kind: kind,
                direction,
                entry_price: price,
                status: SignalStatus::Pending,
                raw_text: raw.to_string(),
                created_at: at(secs),
                parent_id: None,
            })
            .await
            .unwrap()
    }

    async fn get(&self, record: &SignalRecord) -> SignalRecord {
        self.repo.find_by_id(record.id).await.unwrap().unwrap()
    }

    fn backfill(&self, side: BackfillSide) -> BackfillOptions {
        BackfillOptions::from_config(&self.config, side)
    }

    fn driver(&self) -> BackfillDriver {
        BackfillDriver::new(self.matcher.clone())
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

fn alert(raw: &str, kind: SignalKind, secs: i64) -> InboundAlert {
    InboundAlert::new(raw, kind, at(secs)).symbol("BTCUSDT")
}

fn matched(result: &Option<MatchResult>) -> &signal_ledger_services::reconcile::MatchedTrade {
    match result {
        Some(MatchResult::Matched(trade)) => trade,
        other => panic!("expected a match, got {other:?}"),
    }
}

#[tokio::test]
async fn flat_position_event_closes_earlier_entry() {
    let h = Harness::new();
    let entry = h
        .ingest(
            alert(r#"AJAY{"action":"buy","price":100}"#, SignalKind::Entry, 0)
                .direction(Direction::Long)
                .price(100.0),
        )
        .await;
    assert_eq!(entry.record.kind, SignalKind::Entry);
    assert!(entry.match_result.is_none());

    let exit = h
        .ingest(alert(
            r#"AJAY{"marketPosition":"flat","prevMarketPosition":"long","price":105}"#,
            SignalKind::Entry,
            10,
        ))
        .await;

    assert_eq!(exit.classification.pattern, Some(ExitPattern::FlatPosition));
    assert_eq!(exit.classification.closing_direction, Some(Direction::Long));
    let trade = matched(&exit.match_result);
    assert_eq!(trade.entry_id, entry.record.id);
    assert_relative_eq!(trade.pnl.value(), 4.9);

    let closed = h.get(&entry.record).await;
    assert_eq!(closed.status, SignalStatus::Closed);
    assert_eq!(closed.exit_price, Some(105.0));
    assert_eq!(closed.closed_at, Some(at(10)));
    assert_relative_eq!(closed.profit_loss_percent.unwrap(), 4.9);
    assert!(!closed.needs_review);

    assert_eq!(exit.record.status, SignalStatus::Executed);
    assert_eq!(exit.record.kind, SignalKind::Exit);
    assert_eq!(exit.record.declared_kind, SignalKind::Entry);
}

#[tokio::test]
async fn exit_closes_oldest_open_entry_first() {
    let h = Harness::new();
    let mut entries = Vec::new();
    for (secs, price) in [(0, 100.0), (1, 101.0), (2, 102.0)] {
        let e = h
            .ingest(alert("AJAY{}", SignalKind::Entry, secs).direction(Direction::Long).price(price))
            .await;
        entries.push(e.record);
    }

    let exit = h
        .ingest(alert("AJAY{}", SignalKind::Exit, 10).direction(Direction::Long).price(110.0))
        .await;
    let trade = matched(&exit.match_result);
    assert_eq!(trade.entry_id, entries[0].id);
    assert_relative_eq!(trade.pnl.value(), 9.9);

    assert_eq!(h.get(&entries[0]).await.status, SignalStatus::Closed);
    assert!(h.get(&entries[1]).await.is_open());
    assert!(h.get(&entries[2]).await.is_open());
}

#[tokio::test]
async fn matching_is_scoped_by_strategy_symbol_and_direction() {
    let h = Harness::new();
    h.ingest(alert("7RSI{}", SignalKind::Entry, 0).direction(Direction::Long).price(100.0))
        .await;
    h.ingest(
        InboundAlert::new("AJAY{}", SignalKind::Entry, at(1))
            .symbol("ETHUSDT")
            .direction(Direction::Long)
            .price(100.0),
    )
    .await;
    h.ingest(alert("AJAY{}", SignalKind::Entry, 2).direction(Direction::Short).price(100.0))
        .await;

    let exit = h
        .ingest(alert("AJAY{}", SignalKind::Exit, 10).direction(Direction::Long).price(90.0))
        .await;
    assert_eq!(exit.match_result, Some(MatchResult::Orphan(ExitPattern::ExplicitExit)));
    assert!(exit.record.is_open());
}

#[tokio::test]
async fn entries_after_the_exit_are_never_matched() {
    let h = Harness::new();
    let exit = h
        .ingest(alert("AJAY{}", SignalKind::Exit, 0).direction(Direction::Long).price(110.0))
        .await;
    assert_eq!(exit.match_result, Some(MatchResult::Orphan(ExitPattern::ExplicitExit)));

    let later = h
        .ingest(alert("AJAY{}", SignalKind::Entry, 5).direction(Direction::Long).price(100.0))
        .await;

    let report = h.driver().run(&h.backfill(BackfillSide::UnconsumedExits)).await;
    assert_eq!(report.matched, 0);
    assert!(h.get(&later.record).await.is_open());
}

#[tokio::test]
async fn declared_exit_wins_over_flat_payload() {
    let h = Harness::new();
    let entry = h
        .ingest(alert("AJAY{}", SignalKind::Entry, 0).direction(Direction::Long).price(100.0))
        .await;

    let exit = h
        .ingest(
            alert(
                r#"AJAY{"marketPosition":"flat","prevMarketPosition":"short","price":110}"#,
                SignalKind::Exit,
                3,
            )
            .direction(Direction::Long),
        )
        .await;

    assert_eq!(exit.classification.pattern, Some(ExitPattern::ExplicitExit));
    assert_eq!(matched(&exit.match_result).entry_id, entry.record.id);
}

#[tokio::test]
async fn reversal_closes_old_side_and_opens_new_side() {
    let h = Harness::new();
    let long_entry = h
        .ingest(alert(r#"AJAY{"action":"buy"}"#, SignalKind::Entry, 0).price(100.0))
        .await;
    assert_eq!(long_entry.record.direction, Direction::Long);

    let flip = h
        .ingest(alert(
            r#"AJAY{"marketPosition":"short","prevMarketPosition":"long","price":110}"#,
            SignalKind::Entry,
            5,
        ))
        .await;
    assert_eq!(flip.classification.pattern, Some(ExitPattern::Reversal));
    assert_eq!(flip.record.kind, SignalKind::Exit);
    assert_eq!(flip.record.direction, Direction::Long);
    let trade = matched(&flip.match_result);
    assert_eq!(trade.entry_id, long_entry.record.id);
    assert_relative_eq!(trade.pnl.value(), 9.9);

    let companion = flip.companion.clone().expect("reversal should open the new side");
    assert_eq!(companion.kind, SignalKind::Entry);
    assert_eq!(companion.direction, Direction::Short);
    assert_eq!(companion.parent_id, Some(flip.record.id));
    assert_eq!(companion.entry_price, Some(110.0));
    assert!(companion.opens_position());

    let close_short = h
        .ingest(alert(
            r#"AJAY{"marketPosition":"flat","prevMarketPosition":"short","price":99}"#,
            SignalKind::Entry,
            20,
        ))
        .await;
    let trade = matched(&close_short.match_result);
    assert_eq!(trade.entry_id, companion.id);
    assert_eq!(trade.direction, Direction::Short);
    assert_relative_eq!(trade.pnl.value(), 9.9);
}

#[tokio::test]
async fn orphan_exit_is_matched_by_later_backfill() {
    let h = Harness::new();
    let exit = h
        .ingest(alert(r#"AJAY{"action":"close","prevMarketPosition":"long","price":110}"#, SignalKind::Entry, 10))
        .await;
    assert_eq!(exit.match_result, Some(MatchResult::Orphan(ExitPattern::CloseAction)));
    assert_eq!(exit.record.status, SignalStatus::Pending);

    // 开仓晚到，但时间戳更早
    let entry = h
        .append_raw(r#"AJAY{"action":"buy"}"#, SignalKind::Entry, Direction::Long, Some(100.0), 0)
        .await;

    let report = h.driver().run(&h.backfill(BackfillSide::UnconsumedExits)).await;
    assert_eq!(report.matched, 1);
    assert_eq!(report.patterns.close_action, 1);
    assert_eq!(report.profitable, 1);
    assert_relative_eq!(report.total_pnl, 9.9);

    assert_eq!(h.get(&exit.record).await.status, SignalStatus::Executed);
    assert_eq!(h.get(&entry).await.status, SignalStatus::Closed);
}

#[tokio::test]
async fn backfill_is_idempotent_and_dry_run_mutates_nothing() {
    let h = Harness::new();
    h.append_raw(r#"AJAY{"action":"buy"}"#, SignalKind::Entry, Direction::Long, Some(100.0), 0)
        .await;
    h.append_raw(r#"AJAY{"action":"sell"}"#, SignalKind::Entry, Direction::Short, Some(100.0), 1)
        .await;
    // 历史数据：平仓事件被存成了 ENTRY
    h.append_raw(
        r#"AJAY{"marketPosition":"flat","prevMarketPosition":"long","price":90}"#,
        SignalKind::Entry,
        Direction::Long,
        Some(90.0),
        5,
    )
    .await;
    h.append_raw(
        r#"AJAY{"marketPosition":"flat","prevMarketPosition":"short","price":95}"#,
        SignalKind::Entry,
        Direction::Long,
        Some(95.0),
        6,
    )
    .await;

    let before = h.repo.snapshot().await;
    let dry = h
        .driver()
        .run(&h.backfill(BackfillSide::OpenEntries).dry_run(true))
        .await;
    assert_eq!(dry.matched, 2);
    assert_eq!(dry.patterns.flat_position, 2);
    assert_eq!(dry.skipped, 2);
    assert_eq!(h.repo.snapshot().await, before);

    let live = h.driver().run(&h.backfill(BackfillSide::OpenEntries)).await;
    assert_eq!(live.matched, 2);
    assert_eq!(live.losing, 1);
    assert_eq!(live.profitable, 1);
    assert_relative_eq!(live.total_pnl, -10.1 + 4.9, epsilon = 1e-9);
    let after_first = h.repo.snapshot().await;

    for side in [BackfillSide::OpenEntries, BackfillSide::UnconsumedExits] {
        let again = h.driver().run(&h.backfill(side)).await;
        assert_eq!(again.matched, 0);
        assert_eq!(again.errors, 0);
    }
    assert_eq!(h.repo.snapshot().await, after_first);
}

#[tokio::test]
async fn lookahead_window_keeps_fifo_order() {
    let h = Harness::new();
    let first = h
        .append_raw("AJAY{}", SignalKind::Entry, Direction::Long, Some(100.0), 0)
        .await;
    let second = h
        .append_raw("AJAY{}", SignalKind::Entry, Direction::Long, Some(100.0), 1)
        .await;
    let exit = h
        .append_raw("AJAY{}", SignalKind::Exit, Direction::Long, Some(110.0), 2)
        .await;

    let mut options = h.backfill(BackfillSide::OpenEntries);
    options.lookahead = 1;
    let report = h.driver().run(&options).await;

    // 第一条开仓的窗口里只有第二条开仓；第二条开仓找到的平仓事件仍归最早的开仓
    assert_eq!(report.matched, 1);
    assert_eq!(report.orphaned, 2);
    assert_eq!(h.get(&first).await.status, SignalStatus::Closed);
    assert!(h.get(&second).await.is_open());
    assert_eq!(h.get(&exit).await.status, SignalStatus::Executed);
}

#[tokio::test]
async fn backfill_creates_missing_reversal_companions_once() {
    let h = Harness::new();
    h.append_raw(r#"AJAY{"action":"buy"}"#, SignalKind::Entry, Direction::Long, Some(100.0), 0)
        .await;
    let flip = h
        .append_raw(
            r#"AJAY{"marketPosition":"short","prevMarketPosition":"long","price":110}"#,
            SignalKind::Entry,
            Direction::Short,
            Some(110.0),
            5,
        )
        .await;
    h.append_raw(
        r#"AJAY{"marketPosition":"flat","prevMarketPosition":"short","price":99}"#,
        SignalKind::Entry,
        Direction::Short,
        Some(99.0),
        9,
    )
    .await;

    let dry = h
        .driver()
        .run(&h.backfill(BackfillSide::UnconsumedExits).dry_run(true))
        .await;
    assert_eq!(dry.companions_created, 0);
    assert_eq!(dry.matched, 1);

    let live = h.driver().run(&h.backfill(BackfillSide::UnconsumedExits)).await;
    assert_eq!(live.companions_created, 1);
    assert_eq!(live.matched, 2);
    assert_eq!(live.patterns.reversal, 1);
    assert_eq!(live.patterns.flat_position, 1);

    let companion = h.repo.find_companion_entry(flip.id).await.unwrap().unwrap();
    assert_eq!(companion.status, SignalStatus::Closed);
    assert_eq!(companion.direction, Direction::Short);

    let again = h.driver().run(&h.backfill(BackfillSide::UnconsumedExits)).await;
    assert_eq!(again.companions_created, 0);
    assert_eq!(again.matched, 0);
}

#[tokio::test]
async fn entries_backfill_settles_reversal_chain_in_one_run() {
    let h = Harness::new();
    let entry = h
        .append_raw(r#"AJAY{"action":"buy"}"#, SignalKind::Entry, Direction::Long, Some(100.0), 0)
        .await;
    let flip = h
        .append_raw(
            r#"AJAY{"marketPosition":"short","prevMarketPosition":"long","price":110}"#,
            SignalKind::Entry,
            Direction::Short,
            Some(110.0),
            5,
        )
        .await;
    let flat = h
        .append_raw(
            r#"AJAY{"marketPosition":"flat","prevMarketPosition":"short","price":99}"#,
            SignalKind::Entry,
            Direction::Short,
            Some(99.0),
            9,
        )
        .await;

    let first = h.driver().run(&h.backfill(BackfillSide::OpenEntries)).await;
    assert_eq!(first.companions_created, 1);
    assert_eq!(first.matched, 2);
    assert_eq!(first.patterns.reversal, 1);
    assert_eq!(first.patterns.flat_position, 1);
    assert_eq!(first.errors, 0);

    assert_eq!(h.get(&entry).await.status, SignalStatus::Closed);
    assert_eq!(h.get(&flip).await.status, SignalStatus::Executed);
    assert_eq!(h.get(&flat).await.status, SignalStatus::Executed);
    let companion = h.repo.find_companion_entry(flip.id).await.unwrap().unwrap();
    assert_eq!(companion.status, SignalStatus::Closed);
    assert_relative_eq!(companion.profit_loss_percent.unwrap(), 9.9, epsilon = 1e-9);

    let second = h.driver().run(&h.backfill(BackfillSide::OpenEntries)).await;
    assert_eq!(second.matched, 0);
    assert_eq!(second.companions_created, 0);
}

#[tokio::test]
async fn concurrent_matchers_close_an_entry_at_most_once() {
    let h = Harness::new();
    let entry = h
        .append_raw("AJAY{}", SignalKind::Entry, Direction::Long, Some(100.0), 0)
        .await;
    let exit_a = h
        .append_raw("AJAY{}", SignalKind::Exit, Direction::Long, Some(110.0), 5)
        .await;
    let exit_b = h
        .append_raw("AJAY{}", SignalKind::Exit, Direction::Long, Some(120.0), 6)
        .await;

    let mut handles = Vec::new();
    for exit in [exit_a.clone(), exit_b.clone(), exit_a.clone(), exit_b.clone()] {
        let matcher = h.matcher.clone();
        handles.push(tokio::spawn(async move { matcher.reconcile_exit(&exit).await }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            MatchResult::Matched(_) => wins += 1,
            MatchResult::Conflict(c) => {
                assert!(matches!(c, MatchCommit::EntryAlreadyClosed | MatchCommit::ExitAlreadyConsumed))
            }
            MatchResult::Orphan(_) | MatchResult::AlreadySettled => {}
            MatchResult::NotAnExit => panic!("explicit exit misclassified"),
        }
    }
    assert_eq!(wins, 1);

    let closed = h.get(&entry).await;
    assert_eq!(closed.status, SignalStatus::Closed);
    let consumed = [h.get(&exit_a).await, h.get(&exit_b).await]
        .iter()
        .filter(|r| r.status == SignalStatus::Executed)
        .count();
    assert_eq!(consumed, 1);
}

#[tokio::test]
async fn unpriced_match_is_flagged_for_review() {
    let h = Harness::new();
    let entry = h
        .ingest(alert("AJAY{}", SignalKind::Entry, 0).direction(Direction::Long))
        .await;
    assert_eq!(entry.record.entry_price, None);

    let exit = h
        .ingest(alert("AJAY{}", SignalKind::Exit, 4).direction(Direction::Long).price(105.0))
        .await;
    let trade = matched(&exit.match_result);
    assert!(trade.pnl.needs_review());

    let closed = h.get(&entry.record).await;
    assert_eq!(closed.profit_loss_percent, Some(0.0));
    assert!(closed.needs_review);

    let summary = h.repo.summarize_closed(None).await.unwrap();
    assert_eq!(summary.closed, 1);
    assert_eq!(summary.flagged, 1);
    assert_eq!(summary.wins + summary.losses, 0);
}

#[tokio::test]
async fn duplicate_alerts_inside_window_are_dropped() {
    let h = Harness::new();
    let first = alert("AJAY{}", SignalKind::Entry, 0).direction(Direction::Long).price(100.0);
    let mut repeat = first.clone();
    repeat.received_at = at(0) + Duration::milliseconds(4_000);
    let mut later = first.clone();
    later.received_at = at(0) + Duration::milliseconds(9_500);

    assert!(matches!(h.ingest.ingest(first).await.unwrap(), IngestOutcome::Recorded(_)));
    assert!(matches!(
        h.ingest.ingest(repeat).await.unwrap(),
        IngestOutcome::Duplicate { .. }
    ));
    assert!(matches!(h.ingest.ingest(later).await.unwrap(), IngestOutcome::Recorded(_)));
    assert_eq!(h.repo.len().await, 2);
}

#[tokio::test]
async fn explicit_strategy_matches_exactly() {
    let h = Harness::new();
    let trend = h
        .ingest(
            alert(r#"Trend v2{"strategy":"Trend"}"#, SignalKind::Entry, 0)
                .direction(Direction::Long)
                .price(100.0),
        )
        .await;
    assert!(trend.record.strategy_key.is_explicit());
    h.ingest(
        alert("TrendFollower{}", SignalKind::Entry, 1)
            .direction(Direction::Long)
            .price(100.0),
    )
    .await;

    let exit = h
        .ingest(
            alert("whatever{}", SignalKind::Exit, 5)
                .strategy("Trend")
                .direction(Direction::Long)
                .price(110.0),
        )
        .await;
    assert_eq!(matched(&exit.match_result).entry_id, trend.record.id);

    let summary = h.repo.summarize_closed(Some("Trend")).await.unwrap();
    assert_eq!(summary.closed, 1);
    assert_eq!(summary.wins, 1);
    assert_relative_eq!(summary.total_pnl, 9.9);
}

#[tokio::test]
async fn missing_symbol_is_rejected_without_writing() {
    let h = Harness::new();
    let result = h
        .ingest
        .ingest(InboundAlert::new("AJAY{}", SignalKind::Entry, at(0)))
        .await;
    assert!(result.is_err());
    assert!(h.repo.is_empty().await);

    let from_payload = h
        .ingest
        .ingest(InboundAlert::new(r#"AJAY{"ticker":"ETHUSDT"}"#, SignalKind::Entry, at(1)))
        .await
        .unwrap();
    match from_payload {
        IngestOutcome::Recorded(signal) => assert_eq!(signal.record.symbol, "ETHUSDT"),
        IngestOutcome::Duplicate { .. } => panic!("unexpected duplicate"),
    }
}
