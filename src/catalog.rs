//! Market catalog.
//!
//! Resolves (asset, window offset) to the UP/DOWN token pair of the matching
//! exchange market. Slug shapes:
//! - 15m:   `{asset}-updown-15m-{unix_seconds}`
//! - 1h/4h: `{full_name}-up-or-down-{month}-{day}-{hour12}{am|pm}-et`
//! - daily: `{full_name}-up-or-down-{month}-{day}-et`
//!
//! The markets endpoint delivers `clobTokenIds` and `outcomes` either as
//! JSON arrays or as JSON-encoded strings; both shapes are tolerated.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::book::OutcomeSide;
use crate::clock::{self, SlugFragments, Timeframe};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Underlying assets with listed up/down markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "btc",
            Asset::Eth => "eth",
            Asset::Sol => "sol",
            Asset::Xrp => "xrp",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
            Asset::Xrp => "XRP",
        }
    }

    /// Long-form name used in hourly and daily slugs.
    pub fn full_name(&self) -> &'static str {
        match self {
            Asset::Btc => "bitcoin",
            Asset::Eth => "ethereum",
            Asset::Sol => "solana",
            Asset::Xrp => "xrp",
        }
    }
}

impl FromStr for Asset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Asset::Btc),
            "eth" | "ethereum" => Ok(Asset::Eth),
            "sol" | "solana" => Ok(Asset::Sol),
            "xrp" => Ok(Asset::Xrp),
            other => bail!("unknown asset: {other}"),
        }
    }
}

/// Resolved token pair for one (asset, window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTokens {
    pub symbol: String,
    pub window_offset: u8,
    /// Market slug; doubles as the window key.
    pub window_label: String,
    pub period_ts_unix: i64,
    pub token_id_up: String,
    pub token_id_down: String,
    pub condition_id: String,
    pub question: Option<String>,
}

/// Routing entry for one token id.
#[derive(Debug, Clone)]
pub struct TokenRoute {
    pub symbol: String,
    pub side: OutcomeSide,
    pub window_label: String,
    pub window_offset: u8,
}

/// Immutable catalog snapshot: swapped wholesale on rotation so readers
/// never observe a half-updated index.
#[derive(Debug, Default)]
pub struct CatalogState {
    /// (asset symbol, offset) -> tokens. None-valued offsets are simply
    /// absent (not yet listed on the exchange).
    pub markets: HashMap<(String, u8), MarketTokens>,
    pub index: HashMap<String, TokenRoute>,
}

impl CatalogState {
    pub fn from_markets(markets: HashMap<(String, u8), MarketTokens>) -> Self {
        let mut index = HashMap::with_capacity(markets.len() * 2);
        for tokens in markets.values() {
            index.insert(
                tokens.token_id_up.clone(),
                TokenRoute {
                    symbol: tokens.symbol.clone(),
                    side: OutcomeSide::Up,
                    window_label: tokens.window_label.clone(),
                    window_offset: tokens.window_offset,
                },
            );
            index.insert(
                tokens.token_id_down.clone(),
                TokenRoute {
                    symbol: tokens.symbol.clone(),
                    side: OutcomeSide::Down,
                    window_label: tokens.window_label.clone(),
                    window_offset: tokens.window_offset,
                },
            );
        }
        Self { markets, index }
    }

    pub fn route(&self, token_id: &str) -> Option<&TokenRoute> {
        self.index.get(token_id)
    }

    pub fn by_window(&self, window_label: &str) -> Option<&MarketTokens> {
        self.markets
            .values()
            .find(|m| m.window_label == window_label)
    }

    pub fn all_token_ids(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn window_labels(&self) -> Vec<String> {
        self.markets
            .values()
            .map(|m| m.window_label.clone())
            .collect()
    }
}

/// Market object as served by the markets endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GammaMarket {
    pub slug: String,
    #[serde(rename = "conditionId", alias = "condition_id", default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default, deserialize_with = "de_string_vec")]
    pub outcomes: Vec<String>,
    #[serde(
        rename = "clobTokenIds",
        alias = "clob_token_ids",
        default,
        deserialize_with = "de_string_vec"
    )]
    pub clob_token_ids: Vec<String>,
    #[serde(
        rename = "outcomePrices",
        alias = "outcome_prices",
        default,
        deserialize_with = "de_string_vec"
    )]
    pub outcome_prices: Vec<String>,
}

impl GammaMarket {
    pub fn parsed_outcome_prices(&self) -> Vec<f64> {
        self.outcome_prices
            .iter()
            .filter_map(|s| s.parse::<f64>().ok())
            .collect()
    }
}

/// Some responses return JSON arrays as a string (e.g. "[\"Up\",\"Down\"]").
fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

/// Lookup failure after all fallbacks; callers downcast to distinguish a
/// not-yet-listed window from a transport error.
#[derive(Debug)]
pub struct MarketNotFound {
    pub slug: String,
}

impl std::fmt::Display for MarketNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no active market for slug {}", self.slug)
    }
}

impl std::error::Error for MarketNotFound {}

pub fn slug_for(asset: Asset, timeframe: Timeframe, period_ts: i64) -> String {
    match timeframe {
        Timeframe::M15 => format!("{}-updown-15m-{}", asset.as_str(), period_ts),
        Timeframe::H1 | Timeframe::H4 => {
            let SlugFragments {
                month_name,
                day,
                hour12,
                am_pm,
            } = clock::slug_fragments(period_ts);
            format!(
                "{}-up-or-down-{}-{}-{}{}-et",
                asset.full_name(),
                month_name,
                day,
                hour12,
                am_pm
            )
        }
        Timeframe::D1 => {
            let SlugFragments {
                month_name, day, ..
            } = clock::slug_fragments(period_ts);
            format!("{}-up-or-down-{}-{}-et", asset.full_name(), month_name, day)
        }
    }
}

/// Prefix used for the fallback search when an exact slug misses.
pub fn slug_search_prefix(asset: Asset, timeframe: Timeframe) -> String {
    match timeframe {
        Timeframe::M15 => format!("{}-updown-15m-", asset.as_str()),
        _ => format!("{}-up-or-down-", asset.full_name()),
    }
}

/// Among fallback candidates, take the lexicographically greatest slug
/// matching the prefix.
pub fn pick_fallback(candidates: Vec<GammaMarket>, prefix: &str) -> Option<GammaMarket> {
    candidates
        .into_iter()
        .filter(|m| m.slug.starts_with(prefix))
        .filter(|m| m.active.unwrap_or(true) && !m.closed.unwrap_or(false))
        .max_by(|a, b| a.slug.cmp(&b.slug))
}

/// Identify the UP and DOWN token ids by case-insensitive outcome match.
pub fn split_outcome_tokens(market: &GammaMarket) -> Result<(String, String)> {
    let pos = |names: &[&str]| -> Option<usize> {
        market.outcomes.iter().position(|o| {
            names
                .iter()
                .any(|n| o.eq_ignore_ascii_case(n))
        })
    };

    let up_idx = pos(&["up", "yes"])
        .ok_or_else(|| anyhow!("no UP outcome in {:?}", market.outcomes))?;
    let down_idx = pos(&["down", "no"])
        .ok_or_else(|| anyhow!("no DOWN outcome in {:?}", market.outcomes))?;

    let up = market
        .clob_token_ids
        .get(up_idx)
        .ok_or_else(|| anyhow!("missing UP token id for {}", market.slug))?;
    let down = market
        .clob_token_ids
        .get(down_idx)
        .ok_or_else(|| anyhow!("missing DOWN token id for {}", market.slug))?;
    Ok((up.clone(), down.clone()))
}

pub struct MarketCatalog {
    http: Client,
    base_url: String,
    timeframe: Timeframe,
}

impl MarketCatalog {
    pub fn new(http: Client, base_url: &str, timeframe: Timeframe) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeframe,
        }
    }

    /// Resolve the token pair for `asset` at `offset` windows ahead.
    pub async fn lookup(&self, asset: Asset, offset: u8, now_unix: i64) -> Result<MarketTokens> {
        let period_ts = clock::period_start_at_offset(now_unix, self.timeframe, offset);
        let slug = slug_for(asset, self.timeframe, period_ts);

        let mut market = self
            .fetch_markets(&[("slug", slug.as_str()), ("active", "true")])
            .await?
            .into_iter()
            .next();

        if market.is_none() {
            let prefix = slug_search_prefix(asset, self.timeframe);
            debug!(slug = %slug, prefix = %prefix, "exact slug miss, falling back to prefix search");
            let candidates = self
                .fetch_markets(&[("slug_contains", prefix.as_str()), ("active", "true")])
                .await
                .unwrap_or_default();
            market = pick_fallback(candidates, &prefix);
        }

        let market = market.ok_or(MarketNotFound { slug: slug.clone() })?;
        let (token_id_up, token_id_down) = split_outcome_tokens(&market)?;

        Ok(MarketTokens {
            symbol: asset.symbol().to_string(),
            window_offset: offset,
            window_label: market.slug.clone(),
            period_ts_unix: period_ts,
            token_id_up,
            token_id_down,
            condition_id: market.condition_id.clone(),
            question: market.question.clone(),
        })
    }

    /// Fetch a resolved/closed market by its exact slug (resolution path;
    /// no `active` filter).
    pub async fn lookup_by_slug(&self, slug: &str) -> Result<Option<GammaMarket>> {
        Ok(self
            .fetch_markets(&[("slug", slug)])
            .await?
            .into_iter()
            .next())
    }

    async fn fetch_markets(&self, query: &[(&str, &str)]) -> Result<Vec<GammaMarket>> {
        let url = format!("{}/markets", self.base_url);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let result = self
                .http
                .get(&url)
                .timeout(HTTP_TIMEOUT)
                .query(query)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let body = response.text().await.context("markets response body")?;
                    return serde_json::from_str::<Vec<GammaMarket>>(&body).map_err(|e| {
                        warn!(
                            error = %e,
                            body_preview = %body.chars().take(300).collect::<String>(),
                            "markets JSON parse failed"
                        );
                        anyhow!("markets json parse: {e}")
                    });
                }
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Ok(Vec::new());
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!(attempt = attempt + 1, "markets endpoint rate limited");
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    bail!("markets endpoint error {status}: {text}");
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "markets request failed");
                }
            }

            if attempt < MAX_RETRIES - 1 {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        bail!("markets endpoint: max retries exceeded for {url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn slug_shapes() {
        assert_eq!(
            slug_for(Asset::Btc, Timeframe::M15, 1_700_000_000),
            "btc-updown-15m-1700000000"
        );

        // 18:00 UTC on 2024-07-15 = 2pm ET.
        let ts = Utc
            .with_ymd_and_hms(2024, 7, 15, 18, 0, 0)
            .unwrap()
            .timestamp();
        assert_eq!(
            slug_for(Asset::Eth, Timeframe::H1, ts),
            "ethereum-up-or-down-july-15-2pm-et"
        );
        assert_eq!(
            slug_for(Asset::Eth, Timeframe::D1, ts),
            "ethereum-up-or-down-july-15-et"
        );
    }

    #[test]
    fn tolerant_decode_array_and_string_shapes() {
        // Arrays.
        let m: GammaMarket = serde_json::from_str(
            r#"{
                "slug": "btc-updown-15m-1700000000",
                "conditionId": "0xabc",
                "outcomes": ["Up", "Down"],
                "clobTokenIds": ["111", "222"]
            }"#,
        )
        .unwrap();
        assert_eq!(m.outcomes, vec!["Up", "Down"]);
        assert_eq!(m.clob_token_ids, vec!["111", "222"]);

        // JSON-encoded strings.
        let m: GammaMarket = serde_json::from_str(
            r#"{
                "slug": "btc-updown-15m-1700000000",
                "conditionId": "0xabc",
                "outcomes": "[\"Down\", \"Up\"]",
                "clobTokenIds": "[\"222\", \"111\"]",
                "outcomePrices": "[\"0.97\", \"0.03\"]"
            }"#,
        )
        .unwrap();
        assert_eq!(m.outcomes, vec!["Down", "Up"]);
        assert_eq!(m.parsed_outcome_prices(), vec![0.97, 0.03]);
    }

    #[test]
    fn outcome_token_split_is_case_insensitive_and_order_free() {
        let m: GammaMarket = serde_json::from_str(
            r#"{
                "slug": "s",
                "conditionId": "c",
                "outcomes": ["DOWN", "uP"],
                "clobTokenIds": ["dtoken", "utoken"]
            }"#,
        )
        .unwrap();
        let (up, down) = split_outcome_tokens(&m).unwrap();
        assert_eq!(up, "utoken");
        assert_eq!(down, "dtoken");

        let m: GammaMarket = serde_json::from_str(
            r#"{
                "slug": "s",
                "conditionId": "c",
                "outcomes": ["Yes", "No"],
                "clobTokenIds": ["y", "n"]
            }"#,
        )
        .unwrap();
        let (up, down) = split_outcome_tokens(&m).unwrap();
        assert_eq!(up, "y");
        assert_eq!(down, "n");
    }

    #[test]
    fn fallback_picks_greatest_matching_slug() {
        let mk = |slug: &str| GammaMarket {
            slug: slug.to_string(),
            condition_id: String::new(),
            question: None,
            active: Some(true),
            closed: Some(false),
            resolved: None,
            outcomes: vec![],
            clob_token_ids: vec![],
            outcome_prices: vec![],
        };
        let picked = pick_fallback(
            vec![
                mk("btc-updown-15m-1700000000"),
                mk("btc-updown-15m-1700000900"),
                mk("eth-updown-15m-1700009999"),
            ],
            "btc-updown-15m-",
        )
        .unwrap();
        assert_eq!(picked.slug, "btc-updown-15m-1700000900");

        assert!(pick_fallback(vec![mk("eth-updown-15m-1")], "btc-updown-15m-").is_none());
    }

    #[test]
    fn catalog_state_indexes_both_tokens() {
        let mut markets = HashMap::new();
        markets.insert(
            ("BTC".to_string(), 0u8),
            MarketTokens {
                symbol: "BTC".to_string(),
                window_offset: 0,
                window_label: "btc-updown-15m-1700000000".to_string(),
                period_ts_unix: 1_700_000_000,
                token_id_up: "111".to_string(),
                token_id_down: "222".to_string(),
                condition_id: "0xabc".to_string(),
                question: None,
            },
        );
        let state = CatalogState::from_markets(markets);

        let up = state.route("111").unwrap();
        assert_eq!(up.side, OutcomeSide::Up);
        assert_eq!(up.window_label, "btc-updown-15m-1700000000");
        let down = state.route("222").unwrap();
        assert_eq!(down.side, OutcomeSide::Down);
        assert!(state.route("333").is_none());
        assert_eq!(state.all_token_ids().len(), 2);
    }

    #[test]
    fn market_not_found_is_downcastable() {
        let err: anyhow::Error = MarketNotFound {
            slug: "btc-updown-15m-1".to_string(),
        }
        .into();
        assert!(err.downcast_ref::<MarketNotFound>().is_some());
    }
}
