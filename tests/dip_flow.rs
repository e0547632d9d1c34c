//! End-to-end flow: orderbook update -> detection -> dual-leg execution ->
//! durable position -> resolution, against a temp-file database.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use dipbot::book::{BookStore, OutcomeSide, PriceLevel};
use dipbot::catalog::MarketCatalog;
use dipbot::clock::Timeframe;
use dipbot::config::BotConfig;
use dipbot::detector::{Admission, DetectionResult, DipDetector};
use dipbot::executor::{OrderAck, OrderGateway, OrderRequest, TradeExecutor};
use dipbot::resolver::ResolutionTracker;
use dipbot::store::{PositionStatus, PositionStore};

/// Fills every order at the limit price, no slippage.
struct FillAtLimitGateway;

#[async_trait]
impl OrderGateway for FillAtLimitGateway {
    async fn submit(&self, req: OrderRequest) -> Result<OrderAck> {
        Ok(OrderAck {
            order_id: format!("fill:{}", req.token_id),
            transaction_hash: None,
            filled_size: req.size,
            avg_price: req.price - 0.02, // fills at the quoted ask, not the buffered limit
            latency_ms: 3,
        })
    }
}

fn lvl(price: f64, size: f64) -> PriceLevel {
    PriceLevel { price, size }
}

#[tokio::test]
async fn dip_flows_from_detection_to_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("dipbot.db");
    let db_path = db_path.to_str().unwrap();

    let mut config = BotConfig::default();
    config.timeframe = Timeframe::H1;
    config.threshold = 0.97;
    config.db_path = db_path.to_string();

    let store = PositionStore::open(db_path).unwrap();
    let admission = Arc::new(Admission::new(config.max_open_positions));
    let mut detector = DipDetector::new(&config, admission.clone());

    // A dipped book: 0.48 + 0.47 = 0.95 < 0.97.
    let books = BookStore::new();
    let window = "bitcoin-up-or-down-july-15-2pm-et";
    books
        .apply_snapshot("BTC", 0, window, OutcomeSide::Up, vec![], vec![lvl(0.48, 500.0)])
        .unwrap();
    let book = books
        .apply_snapshot(
            "BTC",
            0,
            window,
            OutcomeSide::Down,
            vec![],
            vec![lvl(0.47, 500.0)],
        )
        .unwrap();

    // Detection admits.
    let opportunity = match detector.detect(&book) {
        DetectionResult::Trade(opp) => *opp,
        other => panic!("expected admission, got {other:?}"),
    };
    assert!(admission.admit(&opportunity.window_label, &opportunity.symbol));

    // Execution fills both legs and persists the open position.
    let executor = TradeExecutor::new(
        Arc::new(FillAtLimitGateway),
        None,
        store.clone(),
        admission.clone(),
        config.timeframe,
        config.max_total_cost,
    );
    let result = executor
        .execute(
            &opportunity,
            opportunity.shares,
            opportunity.shares,
            "up-token",
            "down-token",
        )
        .await;
    assert!(result.success, "execution failed: {:?}", result.error);
    let position = result.position.unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert!((position.size_up - opportunity.shares).abs() < 1e-9);
    assert!((position.total_cost - 0.95 * opportunity.shares).abs() < 1e-6);
    assert_eq!(admission.pending_count(), 0);

    let open = store.open_positions().await.unwrap();
    assert_eq!(open.len(), 1);

    // Resolution (paper): the old window has long ended relative to a far
    // future "now", so the pass settles it.
    let catalog = MarketCatalog::new(
        reqwest::Client::new(),
        "https://gamma-api.polymarket.com",
        config.timeframe,
    );
    let tracker = ResolutionTracker::new(catalog, store.clone(), config.timeframe, true);
    let now_far_future = position.opened_at_ms / 1000 + 2 * 3600;
    let settled = tracker.resolve_pending(now_far_future).await.unwrap();
    assert_eq!(settled, 1);

    let resolved = store.by_id(&position.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, PositionStatus::Resolved);
    // Riskless pair: payout is the matched share count regardless of side.
    let payout = resolved.payout.unwrap();
    assert!((payout - opportunity.shares).abs() < 1e-9);
    // 1h market: no fees; realised profit equals payout minus cost.
    let profit = resolved.actual_profit.unwrap();
    assert!((profit - (payout - resolved.total_cost)).abs() < 1e-9);
    assert!(profit > 0.0);

    // A second pass is a no-op (single-fire settlement).
    assert_eq!(tracker.resolve_pending(now_far_future).await.unwrap(), 0);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.wins, 1);
    assert!((stats.net_profit - profit).abs() < 1e-9);
}
