use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::bridge::{
    normalize_hash, BridgeAssetType, BridgeTxn, BridgeTxnType, OutgoingMessageState, RedeemState,
    StoreEvent, TransactionStore,
};
use crate::core::errors::BridgeError;

type Result<T> = std::result::Result<T, BridgeError>;

/// Local durable copy of the transaction set, one row per `(chain_id, tx_hash)`.
#[derive(Debug, Clone)]
pub struct BridgeStorage {
    pool: SqlitePool,
    is_memory: bool,
}

/// Accepts `sqlite:` or `sqlite://` and creates the parent directory of file databases.
fn normalize_sqlite_url(database_url: &str) -> String {
    let mut db_url = database_url.trim().to_string();
    if db_url.starts_with("sqlite:") && !db_url.starts_with("sqlite://") {
        db_url = db_url.replacen("sqlite:", "sqlite://", 1);
    }

    if let Some(path) = db_url.strip_prefix("sqlite://") {
        let path_only = path.split_once('?').map(|(p, _)| p).unwrap_or(path);
        if path_only != ":memory:" && !path_only.is_empty() {
            if let Some(parent) = std::path::Path::new(path_only).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        warn!("Failed to create database dir {:?}: {}", parent, e);
                    }
                }
            }
        }
    }
    db_url
}

impl BridgeStorage {
    pub async fn new_with_url(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
        use std::time::Duration;

        let db_url = normalize_sqlite_url(database_url);
        // Never log the full URL.
        let safe_db_url_info = match db_url.split_once("://") {
            Some((scheme, rest)) => format!("{}://(redacted, len={})", scheme, rest.len()),
            None => "(invalid db_url format)".to_string(),
        };
        info!(db = %safe_db_url_info, "[storage] connecting to database");
        let is_memory = db_url.contains(":memory:");

        let mut connect_options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| BridgeError::Config(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);
        if !is_memory {
            connect_options = connect_options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Each in-memory connection is its own database, so keep exactly one alive.
        let pool_options = if is_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(600))
        };
        let pool = pool_options.connect_with(connect_options).await?;

        let storage = Self { pool, is_memory };
        storage.initialize_schema().await?;
        info!("Bridge storage initialized");
        Ok(storage)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new_with_url("sqlite::memory:").await
    }

    pub fn is_in_memory(&self) -> bool {
        self.is_memory
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing bridge_transactions schema");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transactions (
                chain_id INTEGER NOT NULL,
                tx_hash TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                sender TEXT NOT NULL,
                asset_name TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                value TEXT NOT NULL,
                block_number INTEGER,
                timestamp_resolved INTEGER,
                timestamp_created INTEGER NOT NULL,
                receipt TEXT,
                seq_num INTEGER,
                batch_number TEXT,
                batch_index TEXT,
                partner_tx_hash TEXT,
                outgoing_message_state TEXT,
                redeem_state TEXT,
                dropped INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chain_id, tx_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bridge_transactions_sender ON bridge_transactions (sender)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts the row for `tx` or merges into it with the same rules as the
    /// in-memory store: write-once columns keep their first value and message /
    /// redeem state only move forward, so a late write of an older snapshot
    /// cannot regress the row.
    pub async fn save(&self, tx: &BridgeTxn) -> Result<()> {
        Self::save_with(&self.pool, tx).await
    }

    async fn save_with<'e, E>(executor: E, tx: &BridgeTxn) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let receipt = tx.receipt.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO bridge_transactions (
                chain_id, tx_hash, tx_type, sender, asset_name, asset_type, value,
                block_number, timestamp_resolved, timestamp_created, receipt,
                seq_num, batch_number, batch_index, partner_tx_hash,
                outgoing_message_state, redeem_state, dropped
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(chain_id, tx_hash) DO UPDATE SET
                block_number = COALESCE(bridge_transactions.block_number, excluded.block_number),
                timestamp_resolved = COALESCE(bridge_transactions.timestamp_resolved, excluded.timestamp_resolved),
                receipt = COALESCE(bridge_transactions.receipt, excluded.receipt),
                seq_num = COALESCE(bridge_transactions.seq_num, excluded.seq_num),
                batch_number = COALESCE(bridge_transactions.batch_number, excluded.batch_number),
                batch_index = COALESCE(bridge_transactions.batch_index, excluded.batch_index),
                partner_tx_hash = COALESCE(bridge_transactions.partner_tx_hash, excluded.partner_tx_hash),
                outgoing_message_state = CASE
                    WHEN (CASE excluded.outgoing_message_state
                            WHEN 'unconfirmed' THEN 1 WHEN 'confirmed' THEN 2 WHEN 'executed' THEN 3 ELSE 0 END)
                       > (CASE bridge_transactions.outgoing_message_state
                            WHEN 'unconfirmed' THEN 1 WHEN 'confirmed' THEN 2 WHEN 'executed' THEN 3 ELSE 0 END)
                    THEN excluded.outgoing_message_state
                    ELSE bridge_transactions.outgoing_message_state
                END,
                redeem_state = CASE
                    WHEN (CASE excluded.redeem_state
                            WHEN 'pending' THEN 1 WHEN 'required' THEN 2 WHEN 'redeemed' THEN 3 WHEN 'expired' THEN 3 ELSE 0 END)
                       > (CASE bridge_transactions.redeem_state
                            WHEN 'pending' THEN 1 WHEN 'required' THEN 2 WHEN 'redeemed' THEN 3 WHEN 'expired' THEN 3 ELSE 0 END)
                    THEN excluded.redeem_state
                    ELSE bridge_transactions.redeem_state
                END,
                dropped = CASE
                    WHEN COALESCE(bridge_transactions.receipt, excluded.receipt) IS NOT NULL THEN 0
                    ELSE MAX(bridge_transactions.dropped, excluded.dropped)
                END
            "#,
        )
        .bind(tx.chain_id as i64)
        .bind(&tx.tx_hash)
        .bind(tx.tx_type.as_str())
        .bind(&tx.sender)
        .bind(&tx.asset_name)
        .bind(tx.asset_type.as_str())
        .bind(&tx.value)
        .bind(tx.block_number.map(|n| n as i64))
        .bind(tx.timestamp_resolved)
        .bind(tx.timestamp_created)
        .bind(receipt)
        .bind(tx.seq_num.map(|n| n as i64))
        .bind(&tx.batch_number)
        .bind(&tx.batch_index)
        .bind(&tx.partner_tx_hash)
        .bind(tx.outgoing_message_state.map(|s| s.as_str()))
        .bind(tx.redeem_state.map(|s| s.as_str()))
        .bind(tx.dropped)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Makes the table equal to `records`, in one transaction.
    pub async fn replace_all(&self, records: &[BridgeTxn]) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM bridge_transactions").execute(&mut *db_tx).await?;
        for tx in records {
            Self::save_with(&mut *db_tx, tx).await?;
        }
        db_tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, chain_id: u64, tx_hash: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bridge_transactions WHERE chain_id = ?1 AND tx_hash = ?2")
            .bind(chain_id as i64)
            .bind(normalize_hash(tx_hash))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_account(&self, sender: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM bridge_transactions WHERE sender = ?1")
            .bind(sender.to_ascii_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bridge_transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn load_all(&self) -> Result<Vec<BridgeTxn>> {
        let rows = sqlx::query("SELECT * FROM bridge_transactions ORDER BY timestamp_created")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_txn).collect()
    }
}

fn parse_column<T: FromStr<Err = String>>(value: Option<String>) -> Result<Option<T>> {
    value.map(|s| T::from_str(&s).map_err(BridgeError::Storage)).transpose()
}

fn row_to_txn(row: &SqliteRow) -> Result<BridgeTxn> {
    let tx_type: String = row.try_get("tx_type")?;
    let asset_type: String = row.try_get("asset_type")?;
    let receipt: Option<String> = row.try_get("receipt")?;
    let chain_id: i64 = row.try_get("chain_id")?;

    Ok(BridgeTxn {
        tx_type: BridgeTxnType::from(tx_type),
        chain_id: chain_id as u64,
        sender: row.try_get("sender")?,
        asset_name: row.try_get("asset_name")?,
        asset_type: BridgeAssetType::from_str(&asset_type).map_err(BridgeError::Storage)?,
        value: row.try_get("value")?,
        tx_hash: row.try_get("tx_hash")?,
        block_number: row.try_get::<Option<i64>, _>("block_number")?.map(|n| n as u64),
        timestamp_resolved: row.try_get("timestamp_resolved")?,
        timestamp_created: row.try_get("timestamp_created")?,
        receipt: receipt.map(|r| serde_json::from_str(&r)).transpose()?,
        seq_num: row.try_get::<Option<i64>, _>("seq_num")?.map(|n| n as u64),
        batch_number: row.try_get("batch_number")?,
        batch_index: row.try_get("batch_index")?,
        partner_tx_hash: row.try_get("partner_tx_hash")?,
        outgoing_message_state: parse_column::<OutgoingMessageState>(row.try_get("outgoing_message_state")?)?,
        redeem_state: parse_column::<RedeemState>(row.try_get("redeem_state")?)?,
        dropped: row.try_get("dropped")?,
    })
}

/// Writes every store change through to `storage` until `cancel` fires. Events
/// still queued at shutdown are flushed; a lagged receiver rewrites the snapshot.
pub fn spawn_persistence(
    storage: Arc<BridgeStorage>,
    store: Arc<TransactionStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = store.events();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => persist(&storage, &event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Persistence fell behind; rewriting snapshot");
                    if let Err(e) = storage.replace_all(&store.snapshot()).await {
                        warn!("Snapshot rewrite failed: {}", e);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            persist(&storage, &event).await;
        }
        debug!("Persistence task stopped");
    })
}

async fn persist(storage: &BridgeStorage, event: &StoreEvent) {
    match event {
        StoreEvent::Upserted(records) => {
            for tx in records {
                if let Err(e) = storage.save(tx).await {
                    warn!(key = %tx.key(), "Failed to persist bridge transaction: {}", e);
                }
            }
        }
        StoreEvent::Removed(records) => {
            for tx in records {
                if let Err(e) = storage.delete(tx.chain_id, &tx.tx_hash).await {
                    warn!(key = %tx.key(), "Failed to delete bridge transaction: {}", e);
                }
            }
        }
    }
}
