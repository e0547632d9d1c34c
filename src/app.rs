//! Application wiring.
//!
//! Owns the shared state and supervises the logical tasks: ingest (with
//! inline detection), rotation, pre-signing, resolution, and the event
//! writer. Shutdown is cooperative: schedulers stop, the feed closes,
//! in-flight executions finish, the store is flushed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::book::{BookStore, PairBook};
use crate::catalog::{CatalogState, MarketCatalog};
use crate::config::BotConfig;
use crate::detector::{Admission, DetectionResult, DipDetector, DipEvent, DipOpportunity};
use crate::executor::{
    ClobCredentials, ClobGateway, OrderGateway, PaperGateway, TradeExecutor,
};
use crate::presign::{HotMarket, PreSigner};
use crate::resolver::ResolutionTracker;
use crate::store::{OrderbookSnapshotRecord, PositionStore};
use crate::stream::{CatalogHandle, MarketFeed, RotationTask, SyntheticFeed};

/// Pre-sign refresh cadence.
const PRESIGN_TICK: Duration = Duration::from_millis(500);
/// "Hot" margin above the admission threshold.
const HOT_MARGIN: f64 = 0.05;

pub struct App {
    config: BotConfig,
}

struct IngestCtx {
    catalog: CatalogHandle,
    executor: Arc<TradeExecutor>,
    store: PositionStore,
    admission: Arc<Admission>,
    executions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl App {
    pub fn new(config: BotConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        info!(
            timeframe = config.timeframe.as_str(),
            assets = ?config.assets.iter().map(|a| a.symbol()).collect::<Vec<_>>(),
            threshold = config.threshold,
            paper = config.paper_mode,
            "starting dipbot core"
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("dipbot/0.1")
            .build()
            .context("build HTTP client")?;

        let store = PositionStore::open(&config.db_path).context("open position store")?;
        let books = Arc::new(BookStore::new());
        let catalog: CatalogHandle = Arc::new(ArcSwap::from_pointee(CatalogState::default()));
        let admission = Arc::new(Admission::new(config.max_open_positions));

        // Gateway: paper simulator or the live CLOB with its signer half.
        let (gateway, signer): (Arc<dyn OrderGateway>, Option<Arc<ClobGateway>>) =
            if config.paper_mode {
                let paper: Arc<dyn OrderGateway> = Arc::new(PaperGateway::default());
                (paper, None)
            } else {
                let creds = ClobCredentials::from_env().ok_or_else(|| {
                    anyhow!("live mode requires POLYMARKET_CLOB_API_KEY/SECRET/PASSPHRASE")
                })?;
                let clob = Arc::new(ClobGateway::new(http.clone(), creds, &config.clob_base_url));
                let gateway: Arc<dyn OrderGateway> = clob.clone();
                (gateway, Some(clob))
            };
        let presigner = signer.as_ref().map(|_| Arc::new(PreSigner::new()));

        let executor = Arc::new(TradeExecutor::new(
            gateway,
            presigner.clone(),
            store.clone(),
            admission.clone(),
            config.timeframe,
            config.max_total_cost,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (resubscribe_tx, resubscribe_rx) = mpsc::channel(4);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<DipEvent>();

        // Event writer: dip lifecycle events into the durable log.
        let events_store = store.clone();
        let events_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let ts_ms = match &event {
                    DipEvent::Started { ts_ms, .. } | DipEvent::Ended { ts_ms, .. } => *ts_ms,
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if let Err(e) = events_store.insert_event(event.kind(), ts_ms, &json).await
                        {
                            warn!(error = %e, "failed to persist dip event");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode dip event"),
                }
            }
        });

        // Rotation: sole writer of the catalog snapshot.
        let rotation = RotationTask::new(
            MarketCatalog::new(http.clone(), &config.gamma_base_url, config.timeframe),
            config.assets.clone(),
            config.timeframe,
            config.max_window_offset,
            catalog.clone(),
            books.clone(),
            presigner.clone(),
            resubscribe_tx,
        );
        let rotation_task = tokio::spawn(rotation.run(shutdown_rx.clone()));

        // Resolution: wakes after each window close.
        let resolver = ResolutionTracker::new(
            MarketCatalog::new(http.clone(), &config.gamma_base_url, config.timeframe),
            store.clone(),
            config.timeframe,
            config.paper_mode,
        );
        let resolution_task = tokio::spawn(resolver.run(shutdown_rx.clone()));

        // Pre-sign: live mode only, every 500ms over the hot set.
        let presign_task = match (presigner.clone(), signer.clone()) {
            (Some(presigner), Some(signer)) => {
                let catalog = catalog.clone();
                let books = books.clone();
                let threshold = config.threshold;
                let mut shutdown = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    let mut tick = interval(PRESIGN_TICK);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = tick.tick() => {
                                let hot = hot_markets(&catalog, &books, threshold);
                                presigner.tick(signer.as_ref(), &hot).await;
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }))
            }
            _ => None,
        };

        // Ingest + inline detection.
        let detector = DipDetector::new(&config, admission.clone()).with_events(events_tx);
        let ctx = IngestCtx {
            catalog: catalog.clone(),
            executor,
            store: store.clone(),
            admission,
            executions: Arc::new(Mutex::new(Vec::new())),
        };
        let executions = ctx.executions.clone();
        let ingest_task = tokio::spawn(run_ingest(
            config.clone(),
            catalog,
            books.clone(),
            detector,
            ctx,
            resubscribe_rx,
            shutdown_rx,
        ));

        info!(
            mode = if config.paper_mode { "paper" } else { "live" },
            "🚀 dipbot running"
        );

        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        // Schedulers stop, then in-flight executions complete.
        let _ = ingest_task.await;
        let _ = rotation_task.await;
        let _ = resolution_task.await;
        if let Some(task) = presign_task {
            let _ = task.await;
        }
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *executions.lock());
        for handle in pending {
            let _ = handle.await;
        }
        let _ = events_task.await;

        info!(books = %books.metrics().summary(), "ingest counters");
        store.flush().await?;
        info!("dipbot stopped");
        Ok(())
    }
}

/// Markets trading close enough to the threshold to keep signed orders warm.
fn hot_markets(catalog: &CatalogHandle, books: &BookStore, threshold: f64) -> Vec<HotMarket> {
    let state = catalog.load();
    state
        .markets
        .values()
        .filter_map(|tokens| {
            let book = books.get(&tokens.window_label)?;
            let cost = book.best_case_cost()?;
            if cost < threshold + HOT_MARGIN {
                Some(HotMarket {
                    window_label: tokens.window_label.clone(),
                    token_id_up: tokens.token_id_up.clone(),
                    token_id_down: tokens.token_id_down.clone(),
                })
            } else {
                None
            }
        })
        .collect()
}

async fn run_ingest(
    config: BotConfig,
    catalog: CatalogHandle,
    books: Arc<BookStore>,
    mut detector: DipDetector,
    ctx: IngestCtx,
    resubscribe_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
) {
    if config.simulate_feed {
        let feed = SyntheticFeed::new(catalog, books, rand::random());
        feed.run(|book| handle_book(&mut detector, &ctx, book), shutdown_rx)
            .await;
    } else {
        let feed = MarketFeed::new(&config.ws_url, catalog, books);
        feed.run(
            |book| handle_book(&mut detector, &ctx, book),
            resubscribe_rx,
            shutdown_rx,
        )
        .await;
    }
    // Pair every DIP_STARTED with an END before the event channel closes.
    detector.close_all_dips(Utc::now().timestamp_millis());
    info!(detector = %detector.metrics().summary(), "detection counters");
}

/// Inline per-update handler: detect, admit, hand off to an execution task.
fn handle_book(detector: &mut DipDetector, ctx: &IngestCtx, book: PairBook) {
    let opportunity = match detector.detect(&book) {
        DetectionResult::Skip(_) => return,
        DetectionResult::Trade(opp) => opp,
    };

    // Reserve the admission before any order leaves the process.
    if !ctx
        .admission
        .admit(&opportunity.window_label, &opportunity.symbol)
    {
        return;
    }

    let state = ctx.catalog.load();
    let Some(tokens) = state.by_window(&opportunity.window_label).cloned() else {
        // Rotated away between detection and handoff.
        ctx.admission
            .complete(&opportunity.window_label, &opportunity.symbol, false);
        return;
    };

    let executor = ctx.executor.clone();
    let store = ctx.store.clone();
    let opportunity = *opportunity;
    let handle = tokio::spawn(async move {
        if let Err(e) = store.orderbook_snapshot(snapshot_record(&book, &opportunity)).await {
            warn!(error = %e, "failed to persist admission snapshot");
        }

        let result = executor
            .execute(
                &opportunity,
                opportunity.shares,
                opportunity.shares,
                &tokens.token_id_up,
                &tokens.token_id_down,
            )
            .await;

        match (&result.success, &result.position, &result.error) {
            (true, Some(position), _) => info!(
                id = position.id.as_str(),
                window = opportunity.window_label.as_str(),
                cost = position.total_cost,
                expected_profit = position.expected_profit,
                "position opened"
            ),
            (_, _, Some(error)) => warn!(
                window = opportunity.window_label.as_str(),
                error = error.as_str(),
                "execution failed"
            ),
            _ => {}
        }
    });

    let mut executions = ctx.executions.lock();
    executions.retain(|h| !h.is_finished());
    executions.push(handle);
}

fn snapshot_record(book: &PairBook, opportunity: &DipOpportunity) -> OrderbookSnapshotRecord {
    OrderbookSnapshotRecord {
        ts_ms: opportunity.timestamp_ms,
        market: opportunity.window_label.clone(),
        position_id: None,
        best_ask_up: opportunity.ask_up,
        best_ask_down: opportunity.ask_down,
        total_cost: opportunity.best_case_cost,
        liquidity_up_5pct: book.up.ask_liquidity_within(0.05),
        liquidity_down_5pct: book.down.ask_liquidity_within(0.05),
        depth_up: book.up.asks.clone(),
        depth_down: book.down.asks.clone(),
    }
}
