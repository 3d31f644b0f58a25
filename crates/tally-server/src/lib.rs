use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tally_config::Config;
use tally_contracts::{
    BalanceSnapshot, CreditOutcome, CreditRequest, DebitOutcome, DebitRequest, ReconcileReport,
    TransactionKind, TransactionPage, TransactionRecord, API_VERSION,
};
use tally_kernel::{covers, reconcile, INITIAL_GRANT_DESCRIPTION};
use tokio::sync::Mutex;
use uuid::Uuid;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(addr = %addr, api_version = API_VERSION, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/owners/{owner_id}/balance", get(balance))
        .route("/v1/owners/{owner_id}/debit", post(debit))
        .route("/v1/owners/{owner_id}/credit", post(credit))
        .route("/v1/owners/{owner_id}/transactions", get(transactions))
        .route("/v1/owners/{owner_id}/reconcile", get(reconcile_owner))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    initial_grant: u64,
    store: Arc<Mutex<StoreBackend>>,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            initial_grant: cfg.grant.initial_tokens,
            store: Arc::new(Mutex::new(store)),
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn balance(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<BalanceSnapshot>, (StatusCode, Json<Value>)> {
    let mut store = state.store.lock().await;
    let (balance, created) = store
        .get_or_create(&owner_id, state.initial_grant)
        .map_err(store_error)?;
    if created {
        tracing::info!(owner = %owner_id, balance, "provisioned account");
    }
    Ok(Json(BalanceSnapshot { owner_id, balance }))
}

async fn debit(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Json(req): Json<DebitRequest>,
) -> Result<Json<DebitOutcome>, (StatusCode, Json<Value>)> {
    if req.amount == 0 {
        return Err(validation_error("amount must be > 0"));
    }
    if req.feature.trim().is_empty() {
        return Err(validation_error("feature is required"));
    }
    let description = req
        .description
        .clone()
        .unwrap_or_else(|| format!("Debited {} tokens for {}", req.amount, req.feature));

    let mut store = state.store.lock().await;
    store
        .get_or_create(&owner_id, state.initial_grant)
        .map_err(store_error)?;
    let applied = store
        .debit(&owner_id, req.amount, &req.feature, &description)
        .map_err(store_error)?;

    let outcome = if applied.applied {
        tracing::debug!(owner = %owner_id, amount = req.amount, feature = %req.feature, balance = applied.balance, "debit applied");
        DebitOutcome {
            applied: true,
            balance: applied.balance,
            reason_code: "debit_applied".to_string(),
        }
    } else {
        tracing::warn!(owner = %owner_id, amount = req.amount, balance = applied.balance, "debit refused");
        DebitOutcome {
            applied: false,
            balance: applied.balance,
            reason_code: "insufficient_balance".to_string(),
        }
    };
    Ok(Json(outcome))
}

async fn credit(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Json(req): Json<CreditRequest>,
) -> Result<Json<CreditOutcome>, (StatusCode, Json<Value>)> {
    if req.amount == 0 {
        return Err(validation_error("amount must be > 0"));
    }
    if req.description.trim().is_empty() {
        return Err(validation_error("description is required"));
    }

    let mut store = state.store.lock().await;
    store
        .get_or_create(&owner_id, state.initial_grant)
        .map_err(store_error)?;
    let balance = store
        .credit(&owner_id, req.amount, &req.description)
        .map_err(store_error)?;
    tracing::debug!(owner = %owner_id, amount = req.amount, balance, "credit applied");
    Ok(Json(CreditOutcome { balance }))
}

async fn transactions(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<TransactionPage>, (StatusCode, Json<Value>)> {
    let mut store = state.store.lock().await;
    store
        .get_or_create(&owner_id, state.initial_grant)
        .map_err(store_error)?;
    let transactions = store.transactions(&owner_id).map_err(store_error)?;
    Ok(Json(TransactionPage {
        owner_id,
        transactions,
    }))
}

async fn reconcile_owner(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<ReconcileReport>, (StatusCode, Json<Value>)> {
    let mut store = state.store.lock().await;
    let (balance, _) = store
        .get_or_create(&owner_id, state.initial_grant)
        .map_err(store_error)?;
    let history = store.transactions(&owner_id).map_err(store_error)?;
    let report = reconcile(balance, &history);
    if !report.consistent {
        tracing::warn!(owner = %owner_id, drift = report.drift, "ledger drift detected");
    }
    Ok(Json(ReconcileReport {
        owner_id,
        consistent: report.consistent,
        recorded_balance: report.recorded_balance,
        transaction_sum: report.transaction_sum,
        drift: report.drift,
    }))
}

fn validation_error(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": "validation_error", "message": message}})),
    )
}

fn store_error(message: String) -> (StatusCode, Json<Value>) {
    tracing::error!(error = %message, "store operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"code": "store_error", "message": message}})),
    )
}

/// Result of a conditional debit at the store. The check and the decrement
/// happen under the same store-level guard, so a refused debit writes nothing.
#[derive(Debug, Clone, Copy)]
struct AppliedDebit {
    applied: bool,
    balance: u64,
}

#[derive(Default)]
struct MemoryStore {
    accounts: HashMap<String, u64>,
    transactions: Vec<TransactionRecord>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    fn get_or_create(&mut self, owner_id: &str, grant: u64) -> Result<(u64, bool), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(balance) = store.accounts.get(owner_id) {
                    return Ok((*balance, false));
                }
                store.accounts.insert(owner_id.to_string(), grant);
                store.transactions.push(new_record(
                    owner_id,
                    TransactionKind::Credit,
                    grant,
                    INITIAL_GRANT_DESCRIPTION,
                    None,
                ));
                Ok((grant, true))
            }
            StoreBackend::Sqlite(store) => store.get_or_create(owner_id, grant),
        }
    }

    fn debit(
        &mut self,
        owner_id: &str,
        amount: u64,
        feature: &str,
        description: &str,
    ) -> Result<AppliedDebit, String> {
        match self {
            StoreBackend::Memory(store) => {
                let balance = store
                    .accounts
                    .get_mut(owner_id)
                    .ok_or_else(|| format!("account {owner_id} not provisioned"))?;
                if !covers(*balance, amount) {
                    return Ok(AppliedDebit {
                        applied: false,
                        balance: *balance,
                    });
                }
                *balance -= amount;
                let balance = *balance;
                store.transactions.push(new_record(
                    owner_id,
                    TransactionKind::Debit,
                    amount,
                    description,
                    Some(feature),
                ));
                Ok(AppliedDebit {
                    applied: true,
                    balance,
                })
            }
            StoreBackend::Sqlite(store) => store.debit(owner_id, amount, feature, description),
        }
    }

    fn credit(&mut self, owner_id: &str, amount: u64, description: &str) -> Result<u64, String> {
        match self {
            StoreBackend::Memory(store) => {
                let balance = store
                    .accounts
                    .get_mut(owner_id)
                    .ok_or_else(|| format!("account {owner_id} not provisioned"))?;
                *balance += amount;
                let balance = *balance;
                store.transactions.push(new_record(
                    owner_id,
                    TransactionKind::Credit,
                    amount,
                    description,
                    None,
                ));
                Ok(balance)
            }
            StoreBackend::Sqlite(store) => store.credit(owner_id, amount, description),
        }
    }

    /// Newest first.
    fn transactions(&self, owner_id: &str) -> Result<Vec<TransactionRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .transactions
                .iter()
                .filter(|t| t.owner_id == owner_id)
                .rev()
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.transactions(owner_id),
        }
    }
}

fn new_record(
    owner_id: &str,
    kind: TransactionKind,
    amount: u64,
    description: &str,
    feature: Option<&str>,
) -> TransactionRecord {
    TransactionRecord {
        id: Uuid::new_v4(),
        owner_id: owner_id.to_string(),
        kind,
        amount,
        description: description.to_string(),
        feature: feature.map(|v| v.to_string()),
        created_at: Utc::now(),
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                owner_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL CHECK (balance >= 0),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount INTEGER NOT NULL,
                description TEXT NOT NULL,
                feature TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_owner
                ON transactions(owner_id);
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn get_or_create(&mut self, owner_id: &str, grant: u64) -> Result<(u64, bool), String> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT balance FROM accounts WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        if let Some(balance) = existing {
            return Ok((balance as u64, false));
        }

        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        tx.execute(
            "INSERT INTO accounts(owner_id, balance, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![owner_id, grant as i64, now],
        )
        .map_err(|e| e.to_string())?;
        insert_transaction(
            &tx,
            &new_record(
                owner_id,
                TransactionKind::Credit,
                grant,
                INITIAL_GRANT_DESCRIPTION,
                None,
            ),
        )?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok((grant, true))
    }

    fn debit(
        &mut self,
        owner_id: &str,
        amount: u64,
        feature: &str,
        description: &str,
    ) -> Result<AppliedDebit, String> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        // Check and decrement in one statement; a stale client-side read
        // cannot drive the balance negative.
        let changed = tx
            .execute(
                "UPDATE accounts SET balance = balance - ?2, updated_at = ?3
                 WHERE owner_id = ?1 AND balance >= ?2",
                params![owner_id, amount as i64, now],
            )
            .map_err(|e| e.to_string())?;

        if changed == 0 {
            let balance = account_balance(&tx, owner_id)?;
            // Nothing was written; drop the transaction.
            return Ok(AppliedDebit {
                applied: false,
                balance,
            });
        }

        insert_transaction(
            &tx,
            &new_record(
                owner_id,
                TransactionKind::Debit,
                amount,
                description,
                Some(feature),
            ),
        )?;
        let balance = account_balance(&tx, owner_id)?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(AppliedDebit {
            applied: true,
            balance,
        })
    }

    fn credit(&mut self, owner_id: &str, amount: u64, description: &str) -> Result<u64, String> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let changed = tx
            .execute(
                "UPDATE accounts SET balance = balance + ?2, updated_at = ?3 WHERE owner_id = ?1",
                params![owner_id, amount as i64, now],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return Err(format!("account {owner_id} not provisioned"));
        }
        insert_transaction(
            &tx,
            &new_record(owner_id, TransactionKind::Credit, amount, description, None),
        )?;
        let balance = account_balance(&tx, owner_id)?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(balance)
    }

    fn transactions(&self, owner_id: &str) -> Result<Vec<TransactionRecord>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, kind, amount, description, feature, created_at
                 FROM transactions WHERE owner_id = ?1 ORDER BY rowid DESC",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![owner_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(|e| e.to_string())?;

        let mut out = Vec::new();
        for row in rows {
            let (id, owner_id, kind, amount, description, feature, created_at) =
                row.map_err(|e| e.to_string())?;
            out.push(TransactionRecord {
                id: Uuid::parse_str(&id).map_err(|e| e.to_string())?,
                owner_id,
                kind: parse_kind(&kind)?,
                amount: amount as u64,
                description,
                feature,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(out)
    }
}

fn account_balance(conn: &Connection, owner_id: &str) -> Result<u64, String> {
    let balance: i64 = conn
        .query_row(
            "SELECT balance FROM accounts WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )
        .map_err(|e| e.to_string())?;
    Ok(balance as u64)
}

fn insert_transaction(conn: &Connection, rec: &TransactionRecord) -> Result<(), String> {
    conn.execute(
        "INSERT INTO transactions(id, owner_id, kind, amount, description, feature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rec.id.to_string(),
            rec.owner_id,
            kind_name(rec.kind),
            rec.amount as i64,
            rec.description,
            rec.feature,
            rec.created_at.to_rfc3339()
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn kind_name(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Credit => "credit",
        TransactionKind::Debit => "debit",
    }
}

fn parse_kind(name: &str) -> Result<TransactionKind, String> {
    match name {
        "credit" => Ok(TransactionKind::Credit),
        "debit" => Ok(TransactionKind::Debit),
        other => Err(format!("unknown transaction kind: {other}")),
    }
}

fn parse_rfc3339(ts: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(ts)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_debit_refusal_writes_nothing() {
        let mut store = StoreBackend::Memory(MemoryStore::default());
        store.get_or_create("owner-a", 50).unwrap();
        let refused = store.debit("owner-a", 75, "addon_purchase", "too big").unwrap();
        assert!(!refused.applied);
        assert_eq!(refused.balance, 50);
        assert_eq!(store.transactions("owner-a").unwrap().len(), 1);
    }

    #[test]
    fn memory_history_is_newest_first() {
        let mut store = StoreBackend::Memory(MemoryStore::default());
        store.get_or_create("owner-a", 60).unwrap();
        store.debit("owner-a", 10, "voice_support", "first debit").unwrap();
        store.credit("owner-a", 5, "manual top-up").unwrap();
        let history = store.transactions("owner-a").unwrap();
        assert_eq!(history[0].description, "manual top-up");
        assert_eq!(history[2].description, INITIAL_GRANT_DESCRIPTION);
    }
}
