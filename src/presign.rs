//! Order pre-signer.
//!
//! Signing an order costs 200-400ms on the wire. For markets trading near
//! the admission threshold we keep a cache of already-signed orders over a
//! grid of common price/size points so the executor can post immediately.
//! Strictly best-effort: every failure here is swallowed and the executor
//! falls back to live signing.

use std::collections::HashMap;
#[cfg(test)]
use std::time::Instant;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::executor::{BuySell, OrderSigner, SignedOrder};

/// Price points signed ahead of need.
pub const PRICE_GRID: [f64; 9] = [0.30, 0.35, 0.40, 0.45, 0.50, 0.55, 0.60, 0.65, 0.70];
/// Share sizes signed ahead of need.
pub const SIZE_GRID: [f64; 2] = [50.0, 100.0];

/// Entries older than this are re-signed on the next tick.
const REFRESH_AGE: Duration = Duration::from_secs(25);
/// Entries older than this are never served.
const EVICT_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PreSignKey {
    window_label: String,
    token_id: String,
    buy_sell: BuySell,
    price_cents: u32,
    size: u32,
}

impl PreSignKey {
    fn new(window: &str, token_id: &str, buy_sell: BuySell, price: f64, size: f64) -> Self {
        Self {
            window_label: window.to_string(),
            token_id: token_id.to_string(),
            buy_sell,
            price_cents: (price * 100.0).round() as u32,
            size: size.round() as u32,
        }
    }
}

/// A market hot enough to keep signed orders warm for.
#[derive(Debug, Clone)]
pub struct HotMarket {
    pub window_label: String,
    pub token_id_up: String,
    pub token_id_down: String,
}

pub struct PreSigner {
    cache: RwLock<HashMap<PreSignKey, SignedOrder>>,
}

impl Default for PreSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl PreSigner {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::with_capacity(128)),
        }
    }

    /// Cache hit for (market, token, buy/sell, price to the tick, rounded
    /// size). Expired entries are dropped, never served.
    pub fn lookup(
        &self,
        window: &str,
        token_id: &str,
        buy_sell: BuySell,
        price: f64,
        size: f64,
    ) -> Option<SignedOrder> {
        let key = PreSignKey::new(window, token_id, buy_sell, price, size);
        let hit = self.cache.read().get(&key).cloned();
        match hit {
            Some(signed) if signed.created_at.elapsed() < EVICT_AGE => Some(signed),
            Some(_) => {
                self.cache.write().remove(&key);
                None
            }
            None => None,
        }
    }

    /// One pre-sign pass: evict stale entries, then (re-)sign the grid for
    /// every hot market. Sign failures are silently ignored.
    pub async fn tick(&self, signer: &dyn OrderSigner, hot: &[HotMarket]) {
        self.evict_stale();
        self.retain_windows(&hot.iter().map(|h| h.window_label.clone()).collect::<Vec<_>>());

        for market in hot {
            for token_id in [&market.token_id_up, &market.token_id_down] {
                for price in PRICE_GRID {
                    for size in SIZE_GRID {
                        let key = PreSignKey::new(
                            &market.window_label,
                            token_id,
                            BuySell::Buy,
                            price,
                            size,
                        );
                        let fresh_enough = self
                            .cache
                            .read()
                            .get(&key)
                            .map(|s| s.created_at.elapsed() < REFRESH_AGE)
                            .unwrap_or(false);
                        if fresh_enough {
                            continue;
                        }
                        match signer.sign(token_id, BuySell::Buy, price, size).await {
                            Ok(signed) => {
                                self.cache.write().insert(key, signed);
                            }
                            Err(e) => {
                                // Best-effort only.
                                debug!(token_id = token_id.as_str(), price, error = %e, "pre-sign failed");
                            }
                        }
                    }
                }
            }
        }
        trace!(entries = self.cache.read().len(), "pre-sign tick complete");
    }

    fn evict_stale(&self) {
        self.cache
            .write()
            .retain(|_, signed| signed.created_at.elapsed() < EVICT_AGE);
    }

    /// Rotation eviction: drop every entry outside the kept window slice.
    pub fn retain_windows(&self, keep: &[String]) {
        self.cache
            .write()
            .retain(|key, _| keep.iter().any(|w| *w == key.window_label));
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubSigner {
        signs: AtomicU64,
        fail: bool,
    }

    impl StubSigner {
        fn new() -> Self {
            Self {
                signs: AtomicU64::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl OrderSigner for StubSigner {
        async fn sign(
            &self,
            token_id: &str,
            side: BuySell,
            price: f64,
            size: f64,
        ) -> Result<SignedOrder> {
            self.signs.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("signer down");
            }
            Ok(SignedOrder {
                body: format!("{token_id}:{}:{price}:{size}", side.as_str()),
                headers: vec![],
                created_at: Instant::now(),
            })
        }
    }

    fn hot() -> Vec<HotMarket> {
        vec![HotMarket {
            window_label: "btc-updown-15m-1700000000".to_string(),
            token_id_up: "up-token".to_string(),
            token_id_down: "down-token".to_string(),
        }]
    }

    #[tokio::test]
    async fn tick_populates_full_grid_for_hot_market() {
        let presigner = PreSigner::new();
        let signer = StubSigner::new();
        presigner.tick(&signer, &hot()).await;

        // 2 tokens x 9 prices x 2 sizes.
        assert_eq!(presigner.len(), 36);
        assert_eq!(signer.signs.load(Ordering::Relaxed), 36);

        // A second tick re-signs nothing while entries are fresh.
        presigner.tick(&signer, &hot()).await;
        assert_eq!(signer.signs.load(Ordering::Relaxed), 36);
    }

    #[tokio::test]
    async fn lookup_hits_on_rounded_price_and_size() {
        let presigner = PreSigner::new();
        let signer = StubSigner::new();
        presigner.tick(&signer, &hot()).await;

        let window = "btc-updown-15m-1700000000";
        assert!(presigner
            .lookup(window, "up-token", BuySell::Buy, 0.50, 100.0)
            .is_some());
        // 0.501 rounds to the same cent.
        assert!(presigner
            .lookup(window, "up-token", BuySell::Buy, 0.501, 100.0)
            .is_some());
        // Off-grid price misses.
        assert!(presigner
            .lookup(window, "up-token", BuySell::Buy, 0.52, 100.0)
            .is_none());
        // Sells are not pre-signed.
        assert!(presigner
            .lookup(window, "up-token", BuySell::Sell, 0.50, 100.0)
            .is_none());
    }

    #[tokio::test]
    async fn aged_entries_are_refreshed_and_expired_entries_never_served() {
        let presigner = PreSigner::new();
        let signer = StubSigner::new();
        presigner.tick(&signer, &hot()).await;

        let window = "btc-updown-15m-1700000000";
        let key = PreSignKey::new(window, "up-token", BuySell::Buy, 0.50, 100.0);

        // Backdate one entry past the refresh age.
        {
            let mut cache = presigner.cache.write();
            let entry = cache.get_mut(&key).unwrap();
            entry.created_at = Instant::now() - Duration::from_secs(26);
        }
        presigner.tick(&signer, &hot()).await;
        assert_eq!(signer.signs.load(Ordering::Relaxed), 37);

        // Backdate past the eviction age: lookup refuses to serve it.
        {
            let mut cache = presigner.cache.write();
            let entry = cache.get_mut(&key).unwrap();
            entry.created_at = Instant::now() - Duration::from_secs(31);
        }
        assert!(presigner
            .lookup(window, "up-token", BuySell::Buy, 0.50, 100.0)
            .is_none());
    }

    #[tokio::test]
    async fn rotation_evicts_whole_window_slice() {
        let presigner = PreSigner::new();
        let signer = StubSigner::new();
        presigner.tick(&signer, &hot()).await;
        assert_eq!(presigner.len(), 36);

        presigner.retain_windows(&["some-other-window".to_string()]);
        assert!(presigner.is_empty());
    }

    #[tokio::test]
    async fn cooled_markets_are_dropped_on_tick() {
        let presigner = PreSigner::new();
        let signer = StubSigner::new();
        presigner.tick(&signer, &hot()).await;
        // Market no longer hot: next tick clears its slice.
        presigner.tick(&signer, &[]).await;
        assert!(presigner.is_empty());
    }

    #[tokio::test]
    async fn sign_failures_are_swallowed() {
        let presigner = PreSigner::new();
        let mut signer = StubSigner::new();
        signer.fail = true;
        presigner.tick(&signer, &hot()).await;
        assert!(presigner.is_empty());
    }
}
