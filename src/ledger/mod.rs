//! Transactional store of order intents, requests, cancels and fills
//! (§4.2). Every mutation to an `OrderIntent` goes through here so the
//! Order Router never holds state the ledger doesn't also know about.

pub mod outbox;

use crate::domain::errors::{LedgerError, OrderStateTransitionError};
use crate::domain::intent::{
    CancelIntent, CancelState, Fill, IntentState, OrderIntent, OrderScope, OrderSide, OrderType,
    RequestState, TimeInForce,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)
                        .await
                        .context("failed to create ledger database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to connect to ledger database")?;

        info!(db_url, "ledger connected");

        let ledger = Self { pool };
        ledger.init().await?;
        Ok(ledger)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_intents (
                intent_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                account TEXT NOT NULL,
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                tif TEXT NOT NULL,
                strategy TEXT,
                qty TEXT NOT NULL,
                price TEXT,
                filled_qty TEXT NOT NULL,
                remaining_qty TEXT NOT NULL,
                avg_fill_price TEXT,
                state TEXT NOT NULL,
                broker_order_id TEXT,
                replaced_by TEXT,
                created_ts TEXT NOT NULL,
                updated_ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create order_intents table")?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_order_intents_request_id ON order_intents (request_id);")
            .execute(&mut *conn)
            .await
            .context("failed to create request_id index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_order_intents_broker_id ON order_intents (broker_order_id);")
            .execute(&mut *conn)
            .await
            .context("failed to create broker_order_id index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_order_intents_venue_symbol ON order_intents (venue, symbol);")
            .execute(&mut *conn)
            .await
            .context("failed to create venue/symbol index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_request_ledger (
                request_id TEXT PRIMARY KEY,
                intent_id TEXT NOT NULL,
                state TEXT NOT NULL,
                superseded_by TEXT,
                created_ts TEXT NOT NULL,
                updated_ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create order_request_ledger table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cancel_intents (
                intent_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                broker_order_id TEXT,
                account TEXT NOT NULL,
                venue TEXT NOT NULL,
                reason TEXT NOT NULL,
                state TEXT NOT NULL,
                created_ts TEXT NOT NULL,
                updated_ts TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create cancel_intents table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                qty TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                realised_pnl TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create fills table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fills_order_id ON fills (order_id);")
            .execute(&mut *conn)
            .await
            .context("failed to create fills index")?;

        info!("ledger schema initialized");
        Ok(())
    }

    /// Inserts a brand new intent, or returns the existing row untouched
    /// when `request_id` has already been seen (exact-once submit).
    pub async fn upsert_intent(&self, intent: &OrderIntent) -> Result<OrderIntent, LedgerError> {
        if let Some(existing) = self.find_by_request_id(&intent.request_id).await? {
            return Ok(existing);
        }

        sqlx::query(
            r#"
            INSERT INTO order_intents (
                intent_id, request_id, account, venue, symbol, side, order_type, tif, strategy,
                qty, price, filled_qty, remaining_qty, avg_fill_price, state,
                broker_order_id, replaced_by, created_ts, updated_ts
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(&intent.intent_id)
        .bind(&intent.request_id)
        .bind(&intent.scope.account)
        .bind(&intent.scope.venue)
        .bind(&intent.scope.symbol)
        .bind(side_str(intent.scope.side))
        .bind(order_type_str(intent.scope.order_type))
        .bind(tif_str(intent.scope.tif))
        .bind(&intent.scope.strategy)
        .bind(intent.qty.to_string())
        .bind(intent.price.map(|p| p.to_string()))
        .bind(intent.filled_qty.to_string())
        .bind(intent.remaining_qty.to_string())
        .bind(intent.avg_fill_price.map(|p| p.to_string()))
        .bind(state_str(intent.state))
        .bind(&intent.broker_order_id)
        .bind(&intent.replaced_by)
        .bind(intent.created_ts.to_rfc3339())
        .bind(intent.updated_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO order_request_ledger (request_id, intent_id, state, superseded_by, created_ts, updated_ts)
            VALUES (?,?,?,?,?,?)
            "#,
        )
        .bind(&intent.request_id)
        .bind(&intent.intent_id)
        .bind(request_state_str(RequestState::Active))
        .bind(None::<String>)
        .bind(intent.created_ts.to_rfc3339())
        .bind(intent.updated_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(intent.clone())
    }

    /// Moves an intent to `target`, validating the transition table and
    /// persisting fill/broker-id updates atomically. Terminal, already
    /// broker-acknowledged intents short-circuit without error (replay safe).
    pub async fn transition(
        &self,
        intent_id: &str,
        target: IntentState,
        broker_order_id: Option<String>,
        filled_qty: Option<Decimal>,
        avg_fill_price: Option<Decimal>,
    ) -> Result<OrderIntent, LedgerError> {
        let current = self
            .find_by_intent_id(intent_id)
            .await?
            .ok_or_else(|| LedgerError::Journal(format!("unknown intent {intent_id}")))?;

        if current.state == target && current.state.is_terminal() {
            return Ok(current);
        }

        if !current.state.can_transition_to(target) {
            return Err(OrderStateTransitionError {
                intent_id: intent_id.to_string(),
                from: format!("{:?}", current.state),
                to: format!("{target:?}"),
            }
            .into());
        }

        let new_filled = filled_qty.unwrap_or(current.filled_qty);
        let new_remaining = (current.qty - new_filled).max(Decimal::ZERO);
        let new_avg = avg_fill_price.or(current.avg_fill_price);
        let new_broker_id = broker_order_id.or(current.broker_order_id.clone());
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE order_intents SET
                state = ?, broker_order_id = ?, filled_qty = ?, remaining_qty = ?,
                avg_fill_price = ?, updated_ts = ?
            WHERE intent_id = ?
            "#,
        )
        .bind(state_str(target))
        .bind(&new_broker_id)
        .bind(new_filled.to_string())
        .bind(new_remaining.to_string())
        .bind(new_avg.map(|p| p.to_string()))
        .bind(now.to_rfc3339())
        .bind(intent_id)
        .execute(&self.pool)
        .await?;

        self.find_by_intent_id(intent_id)
            .await?
            .ok_or_else(|| LedgerError::Journal(format!("intent {intent_id} vanished after update")))
    }

    /// Drives `intent_id` to `Replaced` through the normal transition
    /// table, then records the forward pointer to its replacement.
    pub async fn mark_replaced(&self, intent_id: &str, replaced_by: &str) -> Result<OrderIntent, LedgerError> {
        self.transition(intent_id, IntentState::Replaced, None, None, None).await?;

        sqlx::query("UPDATE order_intents SET replaced_by = ?, updated_ts = ? WHERE intent_id = ?")
            .bind(replaced_by)
            .bind(Utc::now().to_rfc3339())
            .bind(intent_id)
            .execute(&self.pool)
            .await?;

        self.find_by_intent_id(intent_id)
            .await?
            .ok_or_else(|| LedgerError::Journal(format!("intent {intent_id} vanished after mark_replaced")))
    }

    pub async fn record_fill(&self, fill: &Fill) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO fills (order_id, ts, qty, price, fee, realised_pnl) VALUES (?,?,?,?,?,?)",
        )
        .bind(&fill.order_id)
        .bind(fill.ts.to_rfc3339())
        .bind(fill.qty.to_string())
        .bind(fill.price.to_string())
        .bind(fill.fee.to_string())
        .bind(fill.realised_pnl.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_cancel_intent(&self, cancel: &CancelIntent) -> Result<CancelIntent, LedgerError> {
        if let Some(existing) = self.find_cancel_by_request_id(&cancel.request_id).await? {
            return Ok(existing);
        }
        sqlx::query(
            r#"
            INSERT INTO cancel_intents (intent_id, request_id, broker_order_id, account, venue, reason, state, created_ts, updated_ts)
            VALUES (?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(&cancel.intent_id)
        .bind(&cancel.request_id)
        .bind(&cancel.broker_order_id)
        .bind(&cancel.account)
        .bind(&cancel.venue)
        .bind(&cancel.reason)
        .bind(cancel_state_str(cancel.state))
        .bind(cancel.created_ts.to_rfc3339())
        .bind(cancel.updated_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(cancel.clone())
    }

    pub async fn update_cancel_state(&self, intent_id: &str, state: CancelState) -> Result<(), LedgerError> {
        sqlx::query("UPDATE cancel_intents SET state = ?, updated_ts = ? WHERE intent_id = ?")
            .bind(cancel_state_str(state))
            .bind(Utc::now().to_rfc3339())
            .bind(intent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_intent_id(&self, intent_id: &str) -> Result<Option<OrderIntent>, LedgerError> {
        let row = sqlx::query("SELECT * FROM order_intents WHERE intent_id = ?")
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_intent))
    }

    pub async fn find_by_request_id(&self, request_id: &str) -> Result<Option<OrderIntent>, LedgerError> {
        let row = sqlx::query("SELECT * FROM order_intents WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_intent))
    }

    pub async fn find_cancel_by_request_id(&self, request_id: &str) -> Result<Option<CancelIntent>, LedgerError> {
        let row = sqlx::query("SELECT * FROM cancel_intents WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_cancel))
    }

    pub async fn list_inflight(&self, venue: Option<&str>) -> Result<Vec<OrderIntent>, LedgerError> {
        let rows = match venue {
            Some(v) => {
                sqlx::query("SELECT * FROM order_intents WHERE venue = ? AND state NOT IN ('Filled','Canceled','Rejected','Expired','Replaced')")
                    .bind(v)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM order_intents WHERE state NOT IN ('Filled','Canceled','Rejected','Expired','Replaced')")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(row_to_intent).collect())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "Market",
        OrderType::Limit => "Limit",
    }
}

fn tif_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "Gtc",
        TimeInForce::Ioc => "Ioc",
        TimeInForce::Fok => "Fok",
    }
}

fn state_str(state: IntentState) -> &'static str {
    match state {
        IntentState::New => "New",
        IntentState::Pending => "Pending",
        IntentState::Sent => "Sent",
        IntentState::Acked => "Acked",
        IntentState::Partial => "Partial",
        IntentState::Filled => "Filled",
        IntentState::Canceled => "Canceled",
        IntentState::Rejected => "Rejected",
        IntentState::Expired => "Expired",
        IntentState::Replaced => "Replaced",
    }
}

fn request_state_str(state: RequestState) -> &'static str {
    match state {
        RequestState::Active => "Active",
        RequestState::Superseded => "Superseded",
        RequestState::Completed => "Completed",
    }
}

fn cancel_state_str(state: CancelState) -> &'static str {
    match state {
        CancelState::Pending => "Pending",
        CancelState::Sent => "Sent",
        CancelState::Acked => "Acked",
        CancelState::Rejected => "Rejected",
    }
}

fn parse_state(s: &str) -> IntentState {
    match s {
        "Pending" => IntentState::Pending,
        "Sent" => IntentState::Sent,
        "Acked" => IntentState::Acked,
        "Partial" => IntentState::Partial,
        "Filled" => IntentState::Filled,
        "Canceled" => IntentState::Canceled,
        "Rejected" => IntentState::Rejected,
        "Expired" => IntentState::Expired,
        "Replaced" => IntentState::Replaced,
        _ => IntentState::New,
    }
}

fn parse_cancel_state(s: &str) -> CancelState {
    match s {
        "Sent" => CancelState::Sent,
        "Acked" => CancelState::Acked,
        "Rejected" => CancelState::Rejected,
        _ => CancelState::Pending,
    }
}

fn row_to_intent(row: sqlx::sqlite::SqliteRow) -> OrderIntent {
    let side = match row.get::<String, _>("side").as_str() {
        "Sell" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    let order_type = match row.get::<String, _>("order_type").as_str() {
        "Limit" => OrderType::Limit,
        _ => OrderType::Market,
    };
    let tif = match row.get::<String, _>("tif").as_str() {
        "Ioc" => TimeInForce::Ioc,
        "Fok" => TimeInForce::Fok,
        _ => TimeInForce::Gtc,
    };
    let scope = OrderScope {
        account: row.get("account"),
        venue: row.get("venue"),
        symbol: row.get("symbol"),
        side,
        order_type,
        tif,
        strategy: row.get("strategy"),
    };
    OrderIntent {
        intent_id: row.get("intent_id"),
        request_id: row.get("request_id"),
        scope,
        qty: Decimal::from_str(&row.get::<String, _>("qty")).unwrap_or_default(),
        price: row
            .get::<Option<String>, _>("price")
            .and_then(|p| Decimal::from_str(&p).ok()),
        filled_qty: Decimal::from_str(&row.get::<String, _>("filled_qty")).unwrap_or_default(),
        remaining_qty: Decimal::from_str(&row.get::<String, _>("remaining_qty")).unwrap_or_default(),
        avg_fill_price: row
            .get::<Option<String>, _>("avg_fill_price")
            .and_then(|p| Decimal::from_str(&p).ok()),
        state: parse_state(&row.get::<String, _>("state")),
        broker_order_id: row.get("broker_order_id"),
        replaced_by: row.get("replaced_by"),
        created_ts: parse_ts(&row.get::<String, _>("created_ts")),
        updated_ts: parse_ts(&row.get::<String, _>("updated_ts")),
    }
}

fn row_to_cancel(row: sqlx::sqlite::SqliteRow) -> CancelIntent {
    CancelIntent {
        intent_id: row.get("intent_id"),
        request_id: row.get("request_id"),
        broker_order_id: row.get("broker_order_id"),
        account: row.get("account"),
        venue: row.get("venue"),
        reason: row.get("reason"),
        state: parse_cancel_state(&row.get::<String, _>("state")),
        created_ts: parse_ts(&row.get::<String, _>("created_ts")),
        updated_ts: parse_ts(&row.get::<String, _>("updated_ts")),
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scope() -> OrderScope {
        OrderScope {
            account: "acct-1".into(),
            venue: "binance".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            tif: TimeInForce::Gtc,
            strategy: Some("mm-1".into()),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_request_id() {
        let ledger = Ledger::new("sqlite::memory:").await.unwrap();
        let intent = OrderIntent::new(
            "intent-1".into(),
            "req-1".into(),
            sample_scope(),
            Decimal::new(1, 0),
            Some(Decimal::new(100, 0)),
        );
        let first = ledger.upsert_intent(&intent).await.unwrap();
        let mut duplicate = intent.clone();
        duplicate.intent_id = "intent-2-should-be-ignored".into();
        let second = ledger.upsert_intent(&duplicate).await.unwrap();
        assert_eq!(first.intent_id, second.intent_id);
        assert_eq!(second.intent_id, "intent-1");
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_jump() {
        let ledger = Ledger::new("sqlite::memory:").await.unwrap();
        let intent = OrderIntent::new(
            "intent-3".into(),
            "req-3".into(),
            sample_scope(),
            Decimal::new(1, 0),
            Some(Decimal::new(100, 0)),
        );
        ledger.upsert_intent(&intent).await.unwrap();
        ledger
            .transition(&intent.intent_id, IntentState::Filled, None, Some(Decimal::new(1, 0)), None)
            .await
            .unwrap();
        let err = ledger
            .transition(&intent.intent_id, IntentState::Sent, None, None, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_terminal_replay_is_noop() {
        let ledger = Ledger::new("sqlite::memory:").await.unwrap();
        let intent = OrderIntent::new(
            "intent-4".into(),
            "req-4".into(),
            sample_scope(),
            Decimal::new(1, 0),
            Some(Decimal::new(100, 0)),
        );
        ledger.upsert_intent(&intent).await.unwrap();
        ledger
            .transition(&intent.intent_id, IntentState::Canceled, None, None, None)
            .await
            .unwrap();
        let replay = ledger
            .transition(&intent.intent_id, IntentState::Canceled, None, None, None)
            .await
            .unwrap();
        assert_eq!(replay.state, IntentState::Canceled);
    }
}
