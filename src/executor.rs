//! Dual-leg trade executor.
//!
//! Submits the UP and DOWN buys in parallel as fill-and-kill orders, records
//! the position on success, and issues a compensating SELL when exactly one
//! leg fills. A failed rollback is the one case that leaves inventory on the
//! book: the position is persisted as Failed so an operator can reconcile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Timeframe;
use crate::detector::{Admission, DipOpportunity};
use crate::presign::PreSigner;
use crate::store::{Position, PositionStatus, PositionStore};

/// Price-protection buffer added to each leg's limit.
const PRICE_BUFFER: f64 = 0.02;
/// Bounded order-submission timeout; a timeout counts as leg failure.
const ORDER_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuySell {
    Buy,
    Sell,
}

impl BuySell {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuySell::Buy => "BUY",
            BuySell::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Fok,
    Fak,
    Gtc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Fok => "FOK",
            OrderType::Fak => "FAK",
            OrderType::Gtc => "GTC",
        }
    }
}

/// A signed order blob: body plus auth headers, cached by the pre-signer so
/// submission can skip the signing step.
#[derive(Debug, Clone)]
pub struct SignedOrder {
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: BuySell,
    /// Limit price per share.
    pub price: f64,
    /// Shares.
    pub size: f64,
    pub order_type: OrderType,
    pub presigned: Option<SignedOrder>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub transaction_hash: Option<String>,
    pub filled_size: f64,
    pub avg_price: f64,
    pub latency_ms: u64,
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit(&self, req: OrderRequest) -> Result<OrderAck>;
}

/// Signing half of the live gateway, used by the pre-signer.
#[async_trait]
pub trait OrderSigner: Send + Sync {
    async fn sign(
        &self,
        token_id: &str,
        side: BuySell,
        price: f64,
        size: f64,
    ) -> Result<SignedOrder>;
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub position: Option<Position>,
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
}

// ============================================================================
// Live CLOB gateway
// ============================================================================

#[derive(Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
    pub wallet_address: String,
}

impl ClobCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("POLYMARKET_CLOB_API_KEY").ok()?;
        let secret = std::env::var("POLYMARKET_CLOB_SECRET").ok()?;
        let passphrase = std::env::var("POLYMARKET_CLOB_PASSPHRASE").ok()?;
        let wallet_address = std::env::var("POLYMARKET_WALLET_ADDRESS").unwrap_or_default();
        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            secret,
            passphrase,
            wallet_address,
        })
    }
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("wallet_address", &self.wallet_address)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize)]
struct ClobOrderPayload {
    #[serde(rename = "tokenID")]
    token_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
    #[serde(rename = "feeRateBps")]
    fee_rate_bps: u32,
}

#[derive(Debug, Deserialize)]
struct ClobOrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id", default)]
    order_id: Option<String>,
    #[serde(rename = "transactionHash", alias = "transaction_hash", default)]
    transaction_hash: Option<String>,
    #[serde(
        rename = "filledAmount",
        alias = "filled_amount",
        alias = "filledSize",
        default,
        deserialize_with = "de_f64_opt"
    )]
    filled_amount: Option<f64>,
    #[serde(
        rename = "avgPrice",
        alias = "avg_price",
        default,
        deserialize_with = "de_f64_opt"
    )]
    avg_price: Option<f64>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
}

/// Numbers arrive both as JSON numbers and as strings.
fn de_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    })
}

pub struct ClobGateway {
    client: Client,
    creds: ClobCredentials,
    host: String,
}

impl ClobGateway {
    pub fn new(client: Client, creds: ClobCredentials, host: &str) -> Self {
        Self {
            client,
            creds,
            host: host.trim_end_matches('/').to_string(),
        }
    }

    fn sign_message(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let secret_bytes = URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.creds.secret))
            .or_else(|_| BASE64.decode(&self.creds.secret))
            .context("decode CLOB secret")?;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_message(method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_ADDRESS".to_string(), self.creds.wallet_address.clone()),
            ("POLY_API_KEY".to_string(), self.creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), self.creds.passphrase.clone()),
        ])
    }

    fn build_signed(&self, req: &OrderRequest) -> Result<SignedOrder> {
        let payload = ClobOrderPayload {
            token_id: req.token_id.clone(),
            price: format!("{:.2}", req.price),
            size: format!("{:.2}", req.size),
            side: req.side.as_str().to_string(),
            order_type: req.order_type.as_str().to_string(),
            fee_rate_bps: 0,
        };
        let body = serde_json::to_string(&payload).context("serialize order")?;
        let headers = self.auth_headers("POST", "/order", &body)?;
        Ok(SignedOrder {
            body,
            headers,
            created_at: Instant::now(),
        })
    }

    async fn post_order(&self, signed: &SignedOrder, req: &OrderRequest) -> Result<OrderAck> {
        let start = Instant::now();
        let url = format!("{}/order", self.host);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (key, value) in &signed.headers {
            request = request.header(key, value);
        }

        let response = request
            .body(signed.body.clone())
            .send()
            .await
            .context("order request failed")?;
        let status = response.status();
        let latency_ms = start.elapsed().as_millis() as u64;

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %text, latency_ms, "order rejected");
            return Err(anyhow!("order rejected ({status}): {text}"));
        }

        let text = response.text().await.context("order response body")?;
        let resp: ClobOrderResponse =
            serde_json::from_str(&text).context("parse order response")?;
        if let Some(err) = resp.error_msg.as_deref() {
            if !err.is_empty() {
                return Err(anyhow!("order error: {err}"));
            }
        }

        // Any 2xx is a success; the fill may be smaller than requested.
        let filled_size = resp.filled_amount.unwrap_or(req.size);
        let avg_price = resp.avg_price.unwrap_or(req.price);
        Ok(OrderAck {
            order_id: resp
                .order_id
                .unwrap_or_else(|| format!("clob:{}", Uuid::new_v4())),
            transaction_hash: resp.transaction_hash,
            filled_size,
            avg_price,
            latency_ms,
        })
    }
}

#[async_trait]
impl OrderGateway for ClobGateway {
    async fn submit(&self, req: OrderRequest) -> Result<OrderAck> {
        // Pre-signed blob skips the 200-400ms signing step.
        let signed = match &req.presigned {
            Some(s) => s.clone(),
            None => self.build_signed(&req)?,
        };
        self.post_order(&signed, &req).await
    }
}

#[async_trait]
impl OrderSigner for ClobGateway {
    async fn sign(
        &self,
        token_id: &str,
        side: BuySell,
        price: f64,
        size: f64,
    ) -> Result<SignedOrder> {
        self.build_signed(&OrderRequest {
            token_id: token_id.to_string(),
            side,
            price,
            size,
            order_type: OrderType::Fak,
            presigned: None,
        })
    }
}

// ============================================================================
// Paper gateway
// ============================================================================

/// Simulated fills: 0-1% upward slippage, 50-150ms latency, 5% rejects.
pub struct PaperGateway {
    rng: Mutex<ChaCha8Rng>,
    reject_prob: f64,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
            reject_prob: 0.05,
        }
    }
}

impl PaperGateway {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            reject_prob: 0.05,
        }
    }

    #[cfg(test)]
    fn with_reject_prob(seed: u64, reject_prob: f64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            reject_prob,
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit(&self, req: OrderRequest) -> Result<OrderAck> {
        let (delay_ms, reject, slip) = {
            let mut rng = self.rng.lock();
            (
                rng.gen_range(50..=150u64),
                rng.gen::<f64>() < self.reject_prob,
                rng.gen_range(0.0..0.01),
            )
        };
        sleep(Duration::from_millis(delay_ms)).await;

        if reject {
            return Err(anyhow!("order rejected (simulated)"));
        }

        let avg_price = match req.side {
            BuySell::Buy => (req.price * (1.0 + slip)).min(0.99),
            BuySell::Sell => (req.price * (1.0 - slip)).max(0.01),
        };
        Ok(OrderAck {
            order_id: format!("paper:{}", Uuid::new_v4()),
            transaction_hash: None,
            filled_size: req.size,
            avg_price,
            latency_ms: delay_ms,
        })
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct TradeExecutor {
    gateway: Arc<dyn OrderGateway>,
    presigner: Option<Arc<PreSigner>>,
    store: PositionStore,
    admission: Arc<Admission>,
    timeframe: Timeframe,
    max_total_cost: f64,
}

impl TradeExecutor {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        presigner: Option<Arc<PreSigner>>,
        store: PositionStore,
        admission: Arc<Admission>,
        timeframe: Timeframe,
        max_total_cost: f64,
    ) -> Self {
        Self {
            gateway,
            presigner,
            store,
            admission,
            timeframe,
            max_total_cost,
        }
    }

    /// Execute an admitted opportunity. The caller has already inserted the
    /// admission; this method releases it on every path.
    pub async fn execute(
        &self,
        opportunity: &DipOpportunity,
        size_up: f64,
        size_down: f64,
        token_up: &str,
        token_down: &str,
    ) -> ExecutionResult {
        let execution_start = Instant::now();
        let window = &opportunity.window_label;
        let symbol = &opportunity.symbol;

        if opportunity.total_cost > self.max_total_cost {
            self.admission.complete(window, symbol, false);
            return ExecutionResult {
                success: false,
                position: None,
                error: Some(format!(
                    "total cost {:.4} above executor cutoff {:.4}",
                    opportunity.total_cost, self.max_total_cost
                )),
                latency_ms: None,
            };
        }

        let limit_up = (opportunity.ask_up + PRICE_BUFFER).min(0.99);
        let limit_down = (opportunity.ask_down + PRICE_BUFFER).min(0.99);

        let (up_result, down_result) = tokio::join!(
            self.submit_leg(token_up, window, BuySell::Buy, limit_up, size_up),
            self.submit_leg(token_down, window, BuySell::Buy, limit_down, size_down),
        );
        let order_ms = execution_start.elapsed().as_millis() as u64;

        match (up_result, down_result) {
            (Ok(up_ack), Ok(down_ack)) => {
                let position = self
                    .record_open_position(opportunity, &up_ack, &down_ack, execution_start, order_ms)
                    .await;
                self.admission.complete(window, symbol, true);
                info!(
                    window = window.as_str(),
                    cost = opportunity.total_cost,
                    order_ms,
                    "✅ both legs filled"
                );
                ExecutionResult {
                    success: true,
                    position,
                    error: None,
                    latency_ms: Some(order_ms),
                }
            }
            (Ok(up_ack), Err(down_err)) => {
                let result = self
                    .unwind_single_leg(
                        opportunity,
                        token_up,
                        &up_ack,
                        crate::book::OutcomeSide::Up,
                        &down_err.to_string(),
                        order_ms,
                    )
                    .await;
                self.admission.complete(window, symbol, false);
                result
            }
            (Err(up_err), Ok(down_ack)) => {
                let result = self
                    .unwind_single_leg(
                        opportunity,
                        token_down,
                        &down_ack,
                        crate::book::OutcomeSide::Down,
                        &up_err.to_string(),
                        order_ms,
                    )
                    .await;
                self.admission.complete(window, symbol, false);
                result
            }
            (Err(up_err), Err(down_err)) => {
                self.admission.complete(window, symbol, false);
                warn!(
                    window = window.as_str(),
                    up_error = %up_err,
                    down_error = %down_err,
                    "both legs failed"
                );
                ExecutionResult {
                    success: false,
                    position: None,
                    error: Some(format!("both legs failed: up={up_err}; down={down_err}")),
                    latency_ms: Some(order_ms),
                }
            }
        }
    }

    async fn submit_leg(
        &self,
        token_id: &str,
        window: &str,
        side: BuySell,
        price: f64,
        size: f64,
    ) -> Result<OrderAck> {
        let presigned = self
            .presigner
            .as_ref()
            .and_then(|p| p.lookup(window, token_id, side, price, size));
        if presigned.is_some() {
            debug!(token_id, price, size, "pre-signed order cache hit");
        }

        let req = OrderRequest {
            token_id: token_id.to_string(),
            side,
            price,
            size,
            order_type: OrderType::Fak,
            presigned,
        };
        match timeout(ORDER_TIMEOUT, self.gateway.submit(req)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("order submission timed out")),
        }
    }

    /// One leg filled, the other failed: issue a best-effort compensating
    /// SELL. A rollback failure leaves the position on the book as Failed.
    async fn unwind_single_leg(
        &self,
        opportunity: &DipOpportunity,
        filled_token: &str,
        filled_ack: &OrderAck,
        filled_side: crate::book::OutcomeSide,
        other_error: &str,
        order_ms: u64,
    ) -> ExecutionResult {
        warn!(
            window = opportunity.window_label.as_str(),
            side = filled_side.as_str(),
            filled = filled_ack.filled_size,
            error = other_error,
            "single leg filled, rolling back"
        );

        let sell_price = (filled_ack.avg_price - PRICE_BUFFER).max(0.01);
        let rollback = self
            .submit_leg(
                filled_token,
                &opportunity.window_label,
                BuySell::Sell,
                sell_price,
                filled_ack.filled_size,
            )
            .await;

        match rollback {
            Ok(sell_ack) => {
                info!(
                    window = opportunity.window_label.as_str(),
                    sold = sell_ack.filled_size,
                    avg = sell_ack.avg_price,
                    "rollback sell filled"
                );
                ExecutionResult {
                    success: false,
                    position: None,
                    error: Some(format!("one leg failed, rolled back: {other_error}")),
                    latency_ms: Some(order_ms),
                }
            }
            Err(rollback_err) => {
                error!(
                    window = opportunity.window_label.as_str(),
                    error = %rollback_err,
                    "rollback failed - manual intervention required"
                );
                // Residual one-sided inventory: persist as Failed for the
                // operator. Rollback never re-enters admission.
                let (cost_up, cost_down, size_up, size_down) = match filled_side {
                    crate::book::OutcomeSide::Up => (
                        filled_ack.filled_size * filled_ack.avg_price,
                        0.0,
                        filled_ack.filled_size,
                        0.0,
                    ),
                    crate::book::OutcomeSide::Down => (
                        0.0,
                        filled_ack.filled_size * filled_ack.avg_price,
                        0.0,
                        filled_ack.filled_size,
                    ),
                };
                let position = Position {
                    id: Uuid::new_v4().to_string(),
                    market: opportunity.symbol.clone(),
                    window_key: opportunity.window_label.clone(),
                    opened_at_ms: Utc::now().timestamp_millis(),
                    resolved_at_ms: None,
                    status: PositionStatus::Failed,
                    cost_up,
                    cost_down,
                    size_up,
                    size_down,
                    total_cost: cost_up + cost_down,
                    expected_profit: 0.0,
                    ask_up: Some(opportunity.ask_up),
                    ask_down: Some(opportunity.ask_down),
                    liquidity_up: Some(opportunity.liquidity_up),
                    liquidity_down: Some(opportunity.liquidity_down),
                    est_slippage: None,
                    latency_detect_ms: None,
                    latency_exec_ms: Some(order_ms as i64),
                    latency_total_ms: None,
                    outcome: None,
                    payout: None,
                    fees: None,
                    actual_profit: None,
                };
                if let Err(e) = self.store.save(&position).await {
                    error!(error = %e, "failed to persist rollback-failed position");
                }
                ExecutionResult {
                    success: false,
                    position: Some(position),
                    error: Some(format!(
                        "rollback failed ({rollback_err}); original: {other_error}"
                    )),
                    latency_ms: Some(order_ms),
                }
            }
        }
    }

    async fn record_open_position(
        &self,
        opportunity: &DipOpportunity,
        up_ack: &OrderAck,
        down_ack: &OrderAck,
        execution_start: Instant,
        order_ms: u64,
    ) -> Option<Position> {
        let cost_up = up_ack.filled_size * up_ack.avg_price;
        let cost_down = down_ack.filled_size * down_ack.avg_price;
        let fees = crate::fees::entry_fees(
            self.timeframe,
            cost_up,
            up_ack.avg_price,
            cost_down,
            down_ack.avg_price,
        );

        let detect_ms = opportunity
            .detected_at
            .map(|d| execution_start.duration_since(d).as_millis() as i64);
        let total_ms = detect_ms.map(|d| d + order_ms as i64);

        let position = Position {
            id: Uuid::new_v4().to_string(),
            market: opportunity.symbol.clone(),
            window_key: opportunity.window_label.clone(),
            opened_at_ms: Utc::now().timestamp_millis(),
            resolved_at_ms: None,
            status: PositionStatus::Open,
            cost_up,
            cost_down,
            size_up: up_ack.filled_size,
            size_down: down_ack.filled_size,
            total_cost: cost_up + cost_down,
            expected_profit: opportunity.expected_profit,
            ask_up: Some(opportunity.ask_up),
            ask_down: Some(opportunity.ask_down),
            liquidity_up: Some(opportunity.liquidity_up),
            liquidity_down: Some(opportunity.liquidity_down),
            est_slippage: Some((opportunity.slippage_up + opportunity.slippage_down) / 2.0),
            latency_detect_ms: detect_ms,
            latency_exec_ms: Some(order_ms as i64),
            latency_total_ms: total_ms,
            outcome: None,
            payout: None,
            fees: Some(fees),
            actual_profit: None,
        };

        match self.store.save(&position).await {
            Ok(()) => Some(position),
            Err(e) => {
                error!(error = %e, "failed to persist open position");
                Some(position)
            }
        }
    }
}
