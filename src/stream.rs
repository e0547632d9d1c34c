//! Streaming client & window rotation.
//!
//! One long-lived push connection to the exchange market channel feeds the
//! orderbook store; detection runs inline on every applied update via the
//! `on_book` callback. The rotation task is the single writer of the
//! catalog snapshot: it pre-fetches the next window's tokens two minutes
//! before the boundary, swaps the token index atomically at the boundary,
//! and cycles the connection so the subscription matches the new universe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::book::{BookStore, LadderSide, PairBook, PriceChange, PriceLevel};
use crate::catalog::{Asset, CatalogState, MarketCatalog, MarketNotFound, MarketTokens};
use crate::clock::{self, Timeframe};
use crate::presign::PreSigner;

/// Shared, atomically swapped catalog snapshot.
pub type CatalogHandle = Arc<ArcSwap<CatalogState>>;

/// Reconnect base delay after a feed drop.
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Pre-fetch lead before the window boundary.
const PREFETCH_LEAD: Duration = Duration::from_secs(120);

// ============================================================================
// Message demux
// ============================================================================

#[derive(Debug, Clone)]
pub enum FeedUpdate {
    Snapshot {
        asset_id: String,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
    PriceChange {
        asset_id: String,
        change: PriceChange,
    },
    Subscribed,
    FeedError(String),
}

fn value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_levels(v: Option<&Value>) -> Vec<PriceLevel> {
    let Some(Value::Array(items)) = v else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let price = value_f64(item.get("price")?)?;
            let size = value_f64(item.get("size")?)?;
            Some(PriceLevel { price, size })
        })
        .collect()
}

fn parse_price_change_item(item: &Value) -> Option<FeedUpdate> {
    let asset_id = item.get("asset_id")?.as_str()?.to_string();
    let side = item.get("side").and_then(|s| s.as_str()).unwrap_or("SELL");
    let ladder = if side.eq_ignore_ascii_case("BUY") {
        LadderSide::Bid
    } else {
        LadderSide::Ask
    };

    let price = item.get("price").and_then(value_f64);
    let size = item.get("size").and_then(value_f64);
    let best = match ladder {
        LadderSide::Ask => item.get("best_ask").and_then(value_f64),
        LadderSide::Bid => item.get("best_bid").and_then(value_f64),
    };

    let change = match (price, size) {
        (Some(p), Some(s)) => PriceChange {
            ladder,
            price: p,
            size: Some(s),
        },
        // Best-price-only form: size is opaque.
        _ => PriceChange {
            ladder,
            price: best.or(price)?,
            size: None,
        },
    };
    Some(FeedUpdate::PriceChange { asset_id, change })
}

fn parse_object(obj: &Value) -> Vec<FeedUpdate> {
    let event_type = obj
        .get("event_type")
        .or_else(|| obj.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    // Batched price changes carry their own asset ids.
    if let Some(Value::Array(changes)) = obj.get("price_changes") {
        return changes.iter().filter_map(parse_price_change_item).collect();
    }

    match event_type {
        "book" | "book_snapshot" => {
            let Some(asset_id) = obj.get("asset_id").and_then(|v| v.as_str()) else {
                return Vec::new();
            };
            vec![FeedUpdate::Snapshot {
                asset_id: asset_id.to_string(),
                bids: parse_levels(obj.get("bids")),
                asks: parse_levels(obj.get("asks")),
            }]
        }
        "price_change" => parse_price_change_item(obj).into_iter().collect(),
        "subscribed" => vec![FeedUpdate::Subscribed],
        "error" => vec![FeedUpdate::FeedError(
            obj.get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown feed error")
                .to_string(),
        )],
        _ => Vec::new(),
    }
}

/// Demultiplex one raw feed message into updates. Arrays are iterated,
/// `price_changes` batches are flattened, book events become snapshots.
pub fn parse_feed_message(text: &str) -> Vec<FeedUpdate> {
    if text.eq_ignore_ascii_case("PONG") {
        return Vec::new();
    }
    let json: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    match &json {
        Value::Array(items) => items.iter().flat_map(parse_object).collect(),
        Value::Object(_) => parse_object(&json),
        _ => Vec::new(),
    }
}

// ============================================================================
// Market feed
// ============================================================================

pub struct MarketFeed {
    ws_url: String,
    catalog: CatalogHandle,
    books: Arc<BookStore>,
}

impl MarketFeed {
    pub fn new(ws_url: &str, catalog: CatalogHandle, books: Arc<BookStore>) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            catalog,
            books,
        }
    }

    /// Route one update through the token index into the book store.
    /// Returns the updated book for inline detection; a miss means the
    /// token is not ours (e.g. an in-flight message from before rotation).
    pub fn apply_update(&self, update: &FeedUpdate) -> Option<PairBook> {
        match update {
            FeedUpdate::Snapshot {
                asset_id,
                bids,
                asks,
            } => {
                let catalog = self.catalog.load();
                let Some(route) = catalog.route(asset_id) else {
                    trace!(asset_id = asset_id.as_str(), "dropping update for unknown token");
                    self.books.dropped();
                    return None;
                };
                self.books.apply_snapshot(
                    &route.symbol,
                    route.window_offset,
                    &route.window_label,
                    route.side,
                    bids.clone(),
                    asks.clone(),
                )
            }
            FeedUpdate::PriceChange { asset_id, change } => {
                let catalog = self.catalog.load();
                let Some(route) = catalog.route(asset_id) else {
                    self.books.dropped();
                    return None;
                };
                self.books.apply_price_change(
                    &route.symbol,
                    route.window_offset,
                    &route.window_label,
                    route.side,
                    *change,
                )
            }
            FeedUpdate::Subscribed => {
                debug!("feed subscription confirmed");
                None
            }
            FeedUpdate::FeedError(msg) => {
                warn!(message = msg.as_str(), "feed error message");
                None
            }
        }
    }

    /// Connection supervisor: reconnects with bounded exponential backoff,
    /// re-subscribing to the full current token set each time. A rotation
    /// signal forces an immediate clean reconnect.
    pub async fn run<F>(
        &self,
        mut on_book: F,
        mut resubscribe: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut(PairBook),
    {
        let mut reconnect_delay = RECONNECT_BASE;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let tokens = self.catalog.load().all_token_ids();
            if tokens.is_empty() {
                // Rotation has not filled the catalog yet.
                tokio::select! {
                    _ = sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.changed() => return,
                }
            }

            match self
                .connect_and_stream(&tokens, &mut on_book, &mut resubscribe, &mut shutdown)
                .await
            {
                Ok(StreamExit::Rotation) => {
                    reconnect_delay = RECONNECT_BASE;
                    info!("rotating feed connection to the new token universe");
                }
                Ok(StreamExit::Shutdown) => return,
                Err(e) => {
                    warn!(error = %e, delay_secs = reconnect_delay.as_secs(), "feed disconnected; reconnecting");
                    tokio::select! {
                        _ = sleep(reconnect_delay) => {}
                        _ = shutdown.changed() => return,
                    }
                    reconnect_delay = (reconnect_delay * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    async fn connect_and_stream<F>(
        &self,
        tokens: &[String],
        on_book: &mut F,
        resubscribe: &mut mpsc::Receiver<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamExit>
    where
        F: FnMut(PairBook),
    {
        info!(tokens = tokens.len(), "🔌 connecting to market feed");
        let (ws_stream, resp) = connect_async(&self.ws_url)
            .await
            .context("connect market feed")?;
        info!(status = %resp.status(), "✅ market feed connected");

        let (mut write, mut read) = ws_stream.split();

        let sub_msg = serde_json::json!({
            "auth": null,
            "type": "MARKET",
            "assets_ids": tokens,
        });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .context("send market subscription")?;

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                _ = resubscribe.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamExit::Rotation);
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamExit::Shutdown);
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("feed stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            for update in parse_feed_message(&text) {
                                if let Some(book) = self.apply_update(&update) {
                                    on_book(book);
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "feed close frame");
                            return Err(anyhow!("feed closed by server"));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("feed error: {e}")),
                    }
                }
            }
        }
    }
}

enum StreamExit {
    Rotation,
    Shutdown,
}

// ============================================================================
// Rotation task
// ============================================================================

pub struct RotationTask {
    catalog_api: MarketCatalog,
    assets: Vec<Asset>,
    timeframe: Timeframe,
    max_offset: u8,
    catalog: CatalogHandle,
    books: Arc<BookStore>,
    presigner: Option<Arc<PreSigner>>,
    resubscribe_tx: mpsc::Sender<()>,
}

impl RotationTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog_api: MarketCatalog,
        assets: Vec<Asset>,
        timeframe: Timeframe,
        max_offset: u8,
        catalog: CatalogHandle,
        books: Arc<BookStore>,
        presigner: Option<Arc<PreSigner>>,
        resubscribe_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            catalog_api,
            assets,
            timeframe,
            max_offset,
            catalog,
            books,
            presigner,
            resubscribe_tx,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Initial fill before the first boundary.
        let mut staged: HashMap<(String, u8), MarketTokens> = HashMap::new();
        self.rotate(&mut staged).await;

        loop {
            // An empty catalog (lookup outage at boot) retries well before
            // the next boundary.
            if self.catalog.load().markets.is_empty() {
                tokio::select! {
                    _ = sleep(Duration::from_secs(30)) => {
                        self.rotate(&mut staged).await;
                        continue;
                    }
                    _ = shutdown.changed() => return,
                }
            }

            let now_ms = Utc::now().timestamp_millis();
            let to_boundary =
                Duration::from_millis(clock::ms_until_next_boundary(now_ms, self.timeframe));

            // Pre-fetch two minutes out so the boundary swap is instant.
            if to_boundary > PREFETCH_LEAD {
                tokio::select! {
                    _ = sleep(to_boundary - PREFETCH_LEAD) => {}
                    _ = shutdown.changed() => return,
                }
                self.prefetch(&mut staged).await;
            }

            // Re-anchor to the wall clock; the prefetch consumed real time.
            let now_ms = Utc::now().timestamp_millis();
            let to_boundary =
                Duration::from_millis(clock::ms_until_next_boundary(now_ms, self.timeframe));
            tokio::select! {
                _ = sleep(to_boundary) => {}
                _ = shutdown.changed() => return,
            }

            self.rotate(&mut staged).await;
        }
    }

    /// Stage tokens for the post-boundary window universe.
    async fn prefetch(&self, staged: &mut HashMap<(String, u8), MarketTokens>) {
        let boundary_unix = {
            let now = Utc::now().timestamp();
            clock::current_period_start(now, self.timeframe) + self.timeframe.period_secs()
        };

        staged.clear();
        for &asset in &self.assets {
            for offset in 0..=self.max_offset {
                match self.catalog_api.lookup(asset, offset, boundary_unix).await {
                    Ok(tokens) => {
                        staged.insert((asset.symbol().to_string(), offset), tokens);
                    }
                    Err(e) if e.downcast_ref::<MarketNotFound>().is_some() => {
                        debug!(
                            asset = asset.symbol(),
                            offset, "next window not listed yet (prefetch)"
                        );
                    }
                    Err(e) => {
                        warn!(asset = asset.symbol(), offset, error = %e, "prefetch lookup failed");
                    }
                }
            }
        }
        info!(staged = staged.len(), "pre-fetched next window tokens");
    }

    /// Install the new universe: swap markets + token index atomically,
    /// evict rotated-out books and pre-signed slices, cycle the feed.
    async fn rotate(&self, staged: &mut HashMap<(String, u8), MarketTokens>) {
        let now_unix = Utc::now().timestamp();
        let mut markets: HashMap<(String, u8), MarketTokens> = HashMap::new();

        for &asset in &self.assets {
            for offset in 0..=self.max_offset {
                let key = (asset.symbol().to_string(), offset);
                let period_ts = clock::period_start_at_offset(now_unix, self.timeframe, offset);

                // Staged entry wins when it matches the expected period.
                if let Some(tokens) = staged.remove(&key) {
                    if tokens.period_ts_unix == period_ts {
                        markets.insert(key, tokens);
                        continue;
                    }
                }

                match self.catalog_api.lookup(asset, offset, now_unix).await {
                    Ok(tokens) => {
                        markets.insert(key, tokens);
                    }
                    Err(e) if e.downcast_ref::<MarketNotFound>().is_some() => {
                        // Future window not listed yet: record absence,
                        // retry next cycle.
                        debug!(asset = asset.symbol(), offset, "window not listed yet");
                    }
                    Err(e) => {
                        warn!(asset = asset.symbol(), offset, error = %e, "catalog lookup failed");
                    }
                }
            }
        }
        staged.clear();

        let state = CatalogState::from_markets(markets);
        let labels = state.window_labels();
        info!(
            markets = state.markets.len(),
            tokens = state.index.len(),
            "token universe rotated"
        );

        self.catalog.store(Arc::new(state));
        self.books.retain_windows(&labels);
        if let Some(presigner) = &self.presigner {
            presigner.retain_windows(&labels);
        }
        // Cycle the connection so the subscription matches the new set.
        let _ = self.resubscribe_tx.try_send(());
    }
}

// ============================================================================
// Synthetic feed (offline runs)
// ============================================================================

/// Replaces the network task when `simulate_feed` is on: random-walk books
/// for every catalog market, pushed through the same apply path.
pub struct SyntheticFeed {
    catalog: CatalogHandle,
    books: Arc<BookStore>,
    rng: ChaCha8Rng,
    tick: Duration,
}

impl SyntheticFeed {
    pub fn new(catalog: CatalogHandle, books: Arc<BookStore>, seed: u64) -> Self {
        Self {
            catalog,
            books,
            rng: ChaCha8Rng::seed_from_u64(seed),
            tick: Duration::from_millis(250),
        }
    }

    pub async fn run<F>(mut self, mut on_book: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(PairBook),
    {
        info!("synthetic feed running (simulate_feed)");
        loop {
            tokio::select! {
                _ = sleep(self.tick) => {}
                _ = shutdown.changed() => return,
            }

            let catalog = self.catalog.load();
            for tokens in catalog.markets.values() {
                // Mid wanders around 0.50; the pair cost occasionally dips
                // below one.
                let mid: f64 = self.rng.gen_range(0.42..0.58);
                let discount: f64 = self.rng.gen_range(0.0..0.08);
                let ask_up = (mid + 0.01 - discount / 2.0).clamp(0.05, 0.95);
                let ask_down = (1.0 - mid + 0.01 - discount / 2.0).clamp(0.05, 0.95);
                let size_up: f64 = self.rng.gen_range(50.0..800.0);
                let size_down: f64 = self.rng.gen_range(50.0..800.0);

                for (side, ask, size) in [
                    (crate::book::OutcomeSide::Up, ask_up, size_up),
                    (crate::book::OutcomeSide::Down, ask_down, size_down),
                ] {
                    let bids = vec![PriceLevel {
                        price: (ask - 0.02).max(0.01),
                        size: size * 0.8,
                    }];
                    let asks = vec![
                        PriceLevel { price: ask, size },
                        PriceLevel {
                            price: ask + 0.02,
                            size: size * 2.0,
                        },
                    ];
                    if let Some(book) = self.books.apply_snapshot(
                        &tokens.symbol,
                        tokens.window_offset,
                        &tokens.window_label,
                        side,
                        bids,
                        asks,
                    ) {
                        on_book(book);
                    }
                }
            }
        }
    }
}
