//! Durable position store.
//!
//! SQLite-backed log of positions, dip events, and orderbook audit
//! snapshots. Schema evolution is additive only: analytical columns are
//! added as nullable so existing rows never need rewriting.

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::book::PriceLevel;

/// Levels retained per side in an orderbook audit snapshot.
const SNAPSHOT_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Resolved,
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Resolved => "resolved",
            PositionStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "resolved" => PositionStatus::Resolved,
            "failed" => PositionStatus::Failed,
            _ => PositionStatus::Open,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    /// Underlying symbol, e.g. "BTC".
    pub market: String,
    /// Market slug of the window the position was opened in.
    pub window_key: String,
    pub opened_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
    pub status: PositionStatus,
    pub cost_up: f64,
    pub cost_down: f64,
    pub size_up: f64,
    pub size_down: f64,
    pub total_cost: f64,
    pub expected_profit: f64,
    pub ask_up: Option<f64>,
    pub ask_down: Option<f64>,
    pub liquidity_up: Option<f64>,
    pub liquidity_down: Option<f64>,
    pub est_slippage: Option<f64>,
    pub latency_detect_ms: Option<i64>,
    pub latency_exec_ms: Option<i64>,
    pub latency_total_ms: Option<i64>,
    pub outcome: Option<String>,
    pub payout: Option<f64>,
    pub fees: Option<f64>,
    pub actual_profit: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionStats {
    pub total: u64,
    pub open: u64,
    pub resolved: u64,
    pub failed: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub net_profit: f64,
    pub total_invested: f64,
}

#[derive(Debug, Clone)]
pub struct OrderbookSnapshotRecord {
    pub ts_ms: i64,
    pub market: String,
    pub position_id: Option<String>,
    pub best_ask_up: f64,
    pub best_ask_down: f64,
    pub total_cost: f64,
    pub liquidity_up_5pct: Option<f64>,
    pub liquidity_down_5pct: Option<f64>,
    pub depth_up: Vec<PriceLevel>,
    pub depth_down: Vec<PriceLevel>,
}

#[derive(Clone)]
pub struct PositionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PositionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open position db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                market TEXT NOT NULL,
                window_key TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                resolved_at INTEGER,
                status TEXT NOT NULL,
                cost_up REAL NOT NULL,
                cost_down REAL NOT NULL,
                size_up REAL NOT NULL,
                size_down REAL NOT NULL,
                total_cost REAL NOT NULL,
                expected_profit REAL NOT NULL,
                ask_up REAL,
                ask_down REAL,
                outcome TEXT,
                payout REAL,
                fees REAL,
                actual_profit REAL
            )",
            [],
        )?;

        // Analytical columns arrived after the first deployments; added as
        // nullable so old rows stay untouched.
        for col in [
            "liquidity_up REAL",
            "liquidity_down REAL",
            "est_slippage REAL",
            "latency_detect_ms INTEGER",
            "latency_exec_ms INTEGER",
            "latency_total_ms INTEGER",
        ] {
            let sql = format!("ALTER TABLE positions ADD COLUMN {col}");
            if let Err(e) = conn.execute(&sql, []) {
                let msg = e.to_string();
                if !msg.contains("duplicate column name") {
                    return Err(e).context("positions migration");
                }
            }
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                ts INTEGER NOT NULL,
                data_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orderbook_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                market TEXT NOT NULL,
                position_id TEXT,
                best_ask_up REAL NOT NULL,
                best_ask_down REAL NOT NULL,
                total_cost REAL NOT NULL,
                liquidity_up_5pct REAL,
                liquidity_down_5pct REAL,
                depth_up_json TEXT NOT NULL,
                depth_down_json TEXT NOT NULL
            )",
            [],
        )?;

        for sql in [
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
            "CREATE INDEX IF NOT EXISTS idx_positions_market ON positions(market)",
            "CREATE INDEX IF NOT EXISTS idx_positions_opened_at ON positions(opened_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_events_type ON events(type)",
            "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts DESC)",
            "CREATE INDEX IF NOT EXISTS idx_ob_snapshots_ts ON orderbook_snapshots(ts DESC)",
            "CREATE INDEX IF NOT EXISTS idx_ob_snapshots_market ON orderbook_snapshots(market)",
        ] {
            conn.execute(sql, [])?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert by id.
    pub async fn save(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO positions \
             (id, market, window_key, opened_at, resolved_at, status, cost_up, cost_down, \
              size_up, size_down, total_cost, expected_profit, ask_up, ask_down, outcome, \
              payout, fees, actual_profit, liquidity_up, liquidity_down, est_slippage, \
              latency_detect_ms, latency_exec_ms, latency_total_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                &position.id,
                &position.market,
                &position.window_key,
                position.opened_at_ms,
                position.resolved_at_ms,
                position.status.as_str(),
                position.cost_up,
                position.cost_down,
                position.size_up,
                position.size_down,
                position.total_cost,
                position.expected_profit,
                position.ask_up,
                position.ask_down,
                position.outcome.as_deref(),
                position.payout,
                position.fees,
                position.actual_profit,
                position.liquidity_up,
                position.liquidity_down,
                position.est_slippage,
                position.latency_detect_ms,
                position.latency_exec_ms,
                position.latency_total_ms,
            ],
        )
        .context("save position")?;
        Ok(())
    }

    pub async fn by_id(&self, id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{SELECT_POSITION} WHERE id = ?1 LIMIT 1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_position(row)?)),
            None => Ok(None),
        }
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        Self::query_positions_sync(
            &conn,
            &format!("{SELECT_POSITION} WHERE status = 'open' ORDER BY opened_at ASC"),
            params![],
        )
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        Self::query_positions_sync(
            &conn,
            &format!("{SELECT_POSITION} ORDER BY opened_at DESC LIMIT ?1"),
            params![limit.clamp(1, 1000) as i64],
        )
    }

    pub async fn by_date_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        Self::query_positions_sync(
            &conn,
            &format!(
                "{SELECT_POSITION} WHERE opened_at >= ?1 AND opened_at <= ?2 \
                 ORDER BY opened_at ASC"
            ),
            params![start_ms, end_ms],
        )
    }

    pub async fn by_market(&self, market: &str, limit: usize) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        Self::query_positions_sync(
            &conn,
            &format!("{SELECT_POSITION} WHERE market = ?1 ORDER BY opened_at DESC LIMIT ?2"),
            params![market, limit.clamp(1, 1000) as i64],
        )
    }

    fn query_positions_sync(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Position>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(args, row_to_position)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn stats(&self) -> Result<PositionStats> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*), COALESCE(SUM(actual_profit), 0.0), \
                    COALESCE(SUM(total_cost), 0.0), \
                    COALESCE(SUM(CASE WHEN actual_profit > 0 THEN 1 ELSE 0 END), 0) \
             FROM positions GROUP BY status",
        )?;
        let mut stats = PositionStats::default();
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: u64 = row.get(1)?;
            let profit: f64 = row.get(2)?;
            let invested: f64 = row.get(3)?;
            let wins: u64 = row.get(4)?;
            Ok((status, count, profit, invested, wins))
        })?;
        for r in rows {
            let (status, count, profit, invested, wins) = r?;
            stats.total += count;
            stats.total_invested += invested;
            match PositionStatus::parse(&status) {
                PositionStatus::Open => stats.open += count,
                PositionStatus::Resolved => {
                    stats.resolved += count;
                    stats.wins += wins;
                    stats.net_profit += profit;
                }
                PositionStatus::Failed => {
                    stats.failed += count;
                    stats.net_profit += profit;
                }
            }
        }
        if stats.resolved > 0 {
            stats.win_rate = stats.wins as f64 / stats.resolved as f64;
        }
        Ok(stats)
    }

    pub async fn insert_event(&self, kind: &str, ts_ms: i64, data_json: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (type, ts, data_json) VALUES (?1, ?2, ?3)",
            params![kind, ts_ms, data_json],
        )
        .context("insert event")?;
        Ok(())
    }

    pub async fn events_by_type(&self, kind: &str, limit: usize) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, data_json FROM events WHERE type = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind, limit.clamp(1, 10_000) as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Append-only audit of the book at an admitted opportunity. Depth is
    /// capped at 10 levels per side.
    pub async fn orderbook_snapshot(&self, mut record: OrderbookSnapshotRecord) -> Result<()> {
        record.depth_up.truncate(SNAPSHOT_DEPTH);
        record.depth_down.truncate(SNAPSHOT_DEPTH);
        let depth_up_json = serde_json::to_string(&record.depth_up)?;
        let depth_down_json = serde_json::to_string(&record.depth_down)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orderbook_snapshots \
             (ts, market, position_id, best_ask_up, best_ask_down, total_cost, \
              liquidity_up_5pct, liquidity_down_5pct, depth_up_json, depth_down_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.ts_ms,
                &record.market,
                record.position_id.as_deref(),
                record.best_ask_up,
                record.best_ask_down,
                record.total_cost,
                record.liquidity_up_5pct,
                record.liquidity_down_5pct,
                depth_up_json,
                depth_down_json,
            ],
        )
        .context("insert orderbook snapshot")?;
        Ok(())
    }

    pub async fn snapshot_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: u64 =
            conn.query_row("SELECT COUNT(*) FROM orderbook_snapshots", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Flush WAL to the main db file (shutdown path).
    pub async fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
        debug!("position store flushed");
        Ok(())
    }
}

const SELECT_POSITION: &str = "SELECT id, market, window_key, opened_at, resolved_at, status, \
    cost_up, cost_down, size_up, size_down, total_cost, expected_profit, ask_up, ask_down, \
    outcome, payout, fees, actual_profit, liquidity_up, liquidity_down, est_slippage, \
    latency_detect_ms, latency_exec_ms, latency_total_ms FROM positions";

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        market: row.get(1)?,
        window_key: row.get(2)?,
        opened_at_ms: row.get(3)?,
        resolved_at_ms: row.get(4)?,
        status: PositionStatus::parse(&row.get::<_, String>(5)?),
        cost_up: row.get(6)?,
        cost_down: row.get(7)?,
        size_up: row.get(8)?,
        size_down: row.get(9)?,
        total_cost: row.get(10)?,
        expected_profit: row.get(11)?,
        ask_up: row.get(12)?,
        ask_down: row.get(13)?,
        outcome: row.get(14)?,
        payout: row.get(15)?,
        fees: row.get(16)?,
        actual_profit: row.get(17)?,
        liquidity_up: row.get(18)?,
        liquidity_down: row.get(19)?,
        est_slippage: row.get(20)?,
        latency_detect_ms: row.get(21)?,
        latency_exec_ms: row.get(22)?,
        latency_total_ms: row.get(23)?,
    })
}
