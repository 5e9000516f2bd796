use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use time::{Date, OffsetDateTime};

use super::store::{
    AdjustmentOutcome, AdjustmentRequest, ChargeOutcome, ChargePlan, ChargeRequest, Entity,
    KeyInsertOutcome, KeyLimits, LedgerStore, PendingDepositRequest, SettleOutcome, Settlement,
    StoreError, settle_pending,
};
use super::store_types::{
    Account, ApiKeyRecord, PaymentEventRecord, PermissionScope, PricingSettings, Role,
    Transaction, TransactionStatus, UsageRecord,
};

const DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]");

const TRANSACTION_COLUMNS: &str = "id, account_id, amount_micros, balance_after_micros, status, \
     payment_ref, description, created_at_ms";

const API_KEY_COLUMNS: &str = "id, account_id, name, key, permissions_json, expires_at_ms, \
     last_used_at_ms, created_at_ms";

/// SQLite-backed ledger. Each call opens its own connection on a blocking
/// thread; mutations take the database write lock up front with
/// `BEGIN IMMEDIATE` and additionally guard account rows by `version`.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Unavailable {
                    message: err.to_string(),
                };
            }
        }
        StoreError::Sqlite(err)
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.blocking(|conn| init_schema(conn)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn create_account(
        &self,
        account: Account,
        opening: Option<Transaction>,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM accounts WHERE id=?1",
                    rusqlite::params![account.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(StoreError::Duplicate {
                    entity: Entity::Account,
                    id: account.id,
                });
            }
            tx.execute(
                "INSERT INTO accounts
                 (id, balance_micros, free_ops_used, free_ops_reset_at_ms, role, version, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    account.id,
                    account.balance,
                    i64::from(account.free_operations_used),
                    to_millis(account.free_operations_reset_at),
                    account.role.as_str(),
                    u64_to_i64(account.version),
                    to_millis(account.created_at),
                ],
            )?;
            if let Some(opening) = opening {
                insert_transaction(&tx, &opening)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| read_account(conn, &account_id)).await
    }

    async fn set_role(&self, account_id: &str, role: Role) -> Result<Account, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_account(&tx, &account_id)?
                .ok_or_else(|| StoreError::account_not_found(&account_id))?;
            let mut updated = current.clone();
            updated.role = role;
            updated.version = current.version.wrapping_add(1);
            write_account(&tx, &updated, current.version)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_account(&tx, &request.account_id)?
                .ok_or_else(|| StoreError::account_not_found(&request.account_id))?;
            let outcome = match request.plan(&current)? {
                ChargePlan::Free { updated } => {
                    write_account(&tx, &updated, current.version)?;
                    ChargeOutcome::Free { account: updated }
                }
                ChargePlan::Paid {
                    updated,
                    transaction,
                } => {
                    write_account(&tx, &updated, current.version)?;
                    insert_transaction(&tx, &transaction)?;
                    ChargeOutcome::Paid {
                        account: updated,
                        transaction,
                    }
                }
                ChargePlan::Insufficient { balance } => {
                    return Ok(ChargeOutcome::Insufficient { balance });
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn apply_adjustment(
        &self,
        request: AdjustmentRequest,
    ) -> Result<AdjustmentOutcome, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_account(&tx, &request.account_id)?
                .ok_or_else(|| StoreError::account_not_found(&request.account_id))?;
            let Some((updated, transaction)) = request.apply(&current)? else {
                return Ok(AdjustmentOutcome::Refused {
                    balance: current.balance,
                });
            };
            write_account(&tx, &updated, current.version)?;
            insert_transaction(&tx, &transaction)?;
            tx.commit()?;
            Ok(AdjustmentOutcome::Applied {
                account: updated,
                transaction,
            })
        })
        .await
    }

    async fn create_pending_deposit(
        &self,
        request: PendingDepositRequest,
    ) -> Result<Transaction, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if read_deposit(&tx, &request.reference)?.is_some() {
                return Err(StoreError::Duplicate {
                    entity: Entity::Deposit,
                    id: request.reference,
                });
            }
            let account = read_account(&tx, &request.account_id)?
                .ok_or_else(|| StoreError::account_not_found(&request.account_id))?;
            let transaction = request.transaction(account.balance);
            insert_transaction(&tx, &transaction)?;
            tx.commit()?;
            Ok(transaction)
        })
        .await
    }

    async fn settle_deposit(
        &self,
        reference: &str,
        settlement: Settlement,
        now: OffsetDateTime,
    ) -> Result<SettleOutcome, StoreError> {
        let reference = reference.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pending = read_deposit(&tx, &reference)?.ok_or_else(|| StoreError::NotFound {
                entity: Entity::Deposit,
                id: reference.clone(),
            })?;
            if pending.status.is_terminal() {
                return Ok(SettleOutcome::AlreadySettled(pending));
            }

            let current = read_account(&tx, &pending.account_id)?
                .ok_or_else(|| StoreError::account_not_found(&pending.account_id))?;
            let (settled, new_balance) = settle_pending(&pending, &current, &settlement)?;
            if new_balance != current.balance {
                let mut updated = current.clone();
                updated.balance = new_balance;
                updated.version = current.version.wrapping_add(1);
                write_account(&tx, &updated, current.version)?;
            }

            let changed = tx.execute(
                "UPDATE transactions
                 SET amount_micros=?2, balance_after_micros=?3, status=?4, updated_at_ms=?5
                 WHERE id=?1 AND status='pending'",
                rusqlite::params![
                    settled.id,
                    settled.amount,
                    settled.balance_after,
                    settled.status.as_str(),
                    to_millis(now),
                ],
            )?;
            if changed != 1 {
                return Err(StoreError::Conflict {
                    entity: Entity::Deposit,
                    id: reference,
                });
            }
            tx.commit()?;
            Ok(SettleOutcome::Applied(settled))
        })
        .await
    }

    async fn find_deposit(&self, reference: &str) -> Result<Option<Transaction>, StoreError> {
        let reference = reference.to_string();
        self.blocking(move |conn| read_deposit(conn, &reference)).await
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE account_id=?1
                 ORDER BY created_at_ms DESC, rowid DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], TransactionRow::read)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_transaction()?);
            }
            Ok(out)
        })
        .await
    }

    async fn insert_api_key(
        &self,
        record: ApiKeyRecord,
        limits: KeyLimits,
    ) -> Result<KeyInsertOutcome, StoreError> {
        let permissions_json = serde_json::to_string(&record.permissions)?;
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let account = read_account(&tx, &record.account_id)?
                .ok_or_else(|| StoreError::account_not_found(&record.account_id))?;
            let limit = limits.for_balance(account.balance);
            let existing: i64 = tx.query_row(
                "SELECT COUNT(*) FROM api_keys WHERE account_id=?1",
                rusqlite::params![record.account_id],
                |row| row.get(0),
            )?;
            if existing >= i64::from(limit) {
                return Ok(KeyInsertOutcome::LimitReached { limit });
            }
            let taken = tx
                .query_row(
                    "SELECT 1 FROM api_keys WHERE key=?1 OR id=?2",
                    rusqlite::params![record.key, record.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if taken {
                return Err(StoreError::Duplicate {
                    entity: Entity::ApiKey,
                    id: record.id,
                });
            }
            tx.execute(
                &format!("INSERT INTO api_keys ({API_KEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                rusqlite::params![
                    record.id,
                    record.account_id,
                    record.name,
                    record.key,
                    permissions_json,
                    record.expires_at.map(to_millis),
                    record.last_used_at.map(to_millis),
                    to_millis(record.created_at),
                ],
            )?;
            tx.commit()?;
            Ok(KeyInsertOutcome::Created)
        })
        .await
    }

    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key=?1"),
                    rusqlite::params![key],
                    ApiKeyRow::read,
                )
                .optional()?;
            row.map(ApiKeyRow::into_record).transpose()
        })
        .await
    }

    async fn touch_api_key(&self, key_id: &str, now: OffsetDateTime) -> Result<(), StoreError> {
        let key_id = key_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE api_keys SET last_used_at_ms=?2 WHERE id=?1",
                rusqlite::params![key_id, to_millis(now)],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: Entity::ApiKey,
                    id: key_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn list_api_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys
                 WHERE account_id=?1
                 ORDER BY created_at_ms DESC, id"
            ))?;
            let rows = stmt.query_map(rusqlite::params![account_id], ApiKeyRow::read)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_record()?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete_api_key(&self, account_id: &str, key_id: &str) -> Result<bool, StoreError> {
        let account_id = account_id.to_string();
        let key_id = key_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "DELETE FROM api_keys WHERE id=?1 AND account_id=?2",
                rusqlite::params![key_id, account_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn increment_usage(
        &self,
        account_id: &str,
        operation: &str,
        date: Date,
    ) -> Result<u64, StoreError> {
        let account_id = account_id.to_string();
        let operation = operation.to_string();
        let date = format_date(date)?;
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "INSERT INTO usage_records (account_id, operation, date, count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(account_id, operation, date) DO UPDATE SET count = count + 1
                 RETURNING count",
                rusqlite::params![account_id, operation, date],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(count))
        })
        .await
    }

    async fn usage_between(
        &self,
        account_id: &str,
        from: Date,
        to: Date,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let account_id = account_id.to_string();
        let from = format_date(from)?;
        let to = format_date(to)?;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, operation, date, count FROM usage_records
                 WHERE account_id=?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date, operation",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, from, to], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (account_id, operation, date, count) = row?;
                out.push(UsageRecord {
                    account_id,
                    operation,
                    date: parse_date(&date)?,
                    count: i64_to_u64(count),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn payment_event_seen(&self, event_id: &str) -> Result<bool, StoreError> {
        let event_id = event_id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM payment_events WHERE event_id=?1",
                    rusqlite::params![event_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .await
    }

    async fn record_payment_event(&self, event: PaymentEventRecord) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO payment_events
                 (event_id, event_type, resource_id, resource_status, received_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    event.event_id,
                    event.event_type,
                    event.resource_id,
                    event.resource_status,
                    to_millis(event.received_at),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn load_pricing_settings(&self) -> Result<Option<PricingSettings>, StoreError> {
        self.blocking(|conn| {
            let row = conn
                .query_row(
                    "SELECT operation_cost_micros, free_operations, custom_prices_json, updated_at_ms
                     FROM pricing_settings WHERE id=1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((operation_cost, free_operations, custom_prices_json, updated_at_ms)) = row
            else {
                return Ok(None);
            };
            let monthly_free_operations = u32::try_from(free_operations).map_err(|_| {
                StoreError::inconsistent(format!("stored free allotment {free_operations} out of range"))
            })?;
            Ok(Some(PricingSettings {
                operation_cost,
                monthly_free_operations,
                custom_prices: serde_json::from_str(&custom_prices_json)?,
                updated_at: updated_at_ms.map(from_millis).transpose()?,
            }))
        })
        .await
    }

    async fn save_pricing_settings(&self, settings: PricingSettings) -> Result<(), StoreError> {
        let custom_prices_json = serde_json::to_string(&settings.custom_prices)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO pricing_settings
                 (id, operation_cost_micros, free_operations, custom_prices_json, updated_at_ms)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    operation_cost_micros=excluded.operation_cost_micros,
                    free_operations=excluded.free_operations,
                    custom_prices_json=excluded.custom_prices_json,
                    updated_at_ms=excluded.updated_at_ms",
                rusqlite::params![
                    settings.operation_cost,
                    i64::from(settings.monthly_free_operations),
                    custom_prices_json,
                    settings.updated_at.map(to_millis),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn read_account(conn: &rusqlite::Connection, account_id: &str) -> Result<Option<Account>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, balance_micros, free_ops_used, free_ops_reset_at_ms, role, version, created_at_ms
             FROM accounts WHERE id=?1",
            rusqlite::params![account_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, balance, used, reset_at_ms, role, version, created_at_ms)) = row else {
        return Ok(None);
    };
    let role = Role::parse(&role)
        .ok_or_else(|| StoreError::inconsistent(format!("account {id} has unknown role {role:?}")))?;
    Ok(Some(Account {
        balance,
        free_operations_used: u32::try_from(used).map_err(|_| {
            StoreError::inconsistent(format!("account {id} has invalid free counter {used}"))
        })?,
        free_operations_reset_at: from_millis(reset_at_ms)?,
        role,
        version: i64_to_u64(version),
        created_at: from_millis(created_at_ms)?,
        id,
    }))
}

/// Writes `updated` only if the row still carries `expected_version`.
fn write_account(
    conn: &rusqlite::Connection,
    updated: &Account,
    expected_version: u64,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE accounts
         SET balance_micros=?2, free_ops_used=?3, free_ops_reset_at_ms=?4, role=?5, version=?6
         WHERE id=?1 AND version=?7",
        rusqlite::params![
            updated.id,
            updated.balance,
            i64::from(updated.free_operations_used),
            to_millis(updated.free_operations_reset_at),
            updated.role.as_str(),
            u64_to_i64(updated.version),
            u64_to_i64(expected_version),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::Conflict {
            entity: Entity::Account,
            id: updated.id.clone(),
        });
    }
    Ok(())
}

fn insert_transaction(conn: &rusqlite::Connection, transaction: &Transaction) -> Result<(), StoreError> {
    let created_at_ms = to_millis(transaction.created_at);
    conn.execute(
        "INSERT INTO transactions
         (id, account_id, amount_micros, balance_after_micros, status, payment_ref, description,
          created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        rusqlite::params![
            transaction.id,
            transaction.account_id,
            transaction.amount,
            transaction.balance_after,
            transaction.status.as_str(),
            transaction.external_payment_ref,
            transaction.description,
            created_at_ms,
        ],
    )?;
    Ok(())
}

fn read_deposit(conn: &rusqlite::Connection, reference: &str) -> Result<Option<Transaction>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE payment_ref=?1"),
            rusqlite::params![reference],
            TransactionRow::read,
        )
        .optional()?;
    row.map(TransactionRow::into_transaction).transpose()
}

struct TransactionRow {
    id: String,
    account_id: String,
    amount: i64,
    balance_after: i64,
    status: String,
    payment_ref: Option<String>,
    description: String,
    created_at_ms: i64,
}

impl TransactionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            amount: row.get(2)?,
            balance_after: row.get(3)?,
            status: row.get(4)?,
            payment_ref: row.get(5)?,
            description: row.get(6)?,
            created_at_ms: row.get(7)?,
        })
    }

    fn into_transaction(self) -> Result<Transaction, StoreError> {
        let status = TransactionStatus::parse(&self.status).ok_or_else(|| {
            StoreError::inconsistent(format!(
                "transaction {} has unknown status {:?}",
                self.id, self.status
            ))
        })?;
        Ok(Transaction {
            created_at: from_millis(self.created_at_ms)?,
            id: self.id,
            account_id: self.account_id,
            amount: self.amount,
            balance_after: self.balance_after,
            status,
            external_payment_ref: self.payment_ref,
            description: self.description,
        })
    }
}

struct ApiKeyRow {
    id: String,
    account_id: String,
    name: String,
    key: String,
    permissions_json: String,
    expires_at_ms: Option<i64>,
    last_used_at_ms: Option<i64>,
    created_at_ms: i64,
}

impl ApiKeyRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            name: row.get(2)?,
            key: row.get(3)?,
            permissions_json: row.get(4)?,
            expires_at_ms: row.get(5)?,
            last_used_at_ms: row.get(6)?,
            created_at_ms: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<ApiKeyRecord, StoreError> {
        let permissions: PermissionScope = serde_json::from_str(&self.permissions_json)?;
        Ok(ApiKeyRecord {
            id: self.id,
            account_id: self.account_id,
            name: self.name,
            key: self.key,
            permissions,
            expires_at: self.expires_at_ms.map(from_millis).transpose()?,
            last_used_at: self.last_used_at_ms.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at_ms)?,
        })
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            balance_micros INTEGER NOT NULL DEFAULT 0,
            free_ops_used INTEGER NOT NULL DEFAULT 0,
            free_ops_reset_at_ms INTEGER NOT NULL,
            role TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            key TEXT NOT NULL UNIQUE,
            permissions_json TEXT NOT NULL,
            expires_at_ms INTEGER,
            last_used_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_account_id
            ON api_keys(account_id);

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            balance_after_micros INTEGER NOT NULL,
            status TEXT NOT NULL,
            payment_ref TEXT UNIQUE,
            description TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_account_created
            ON transactions(account_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS usage_records (
            account_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            date TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, operation, date)
        );

        CREATE TABLE IF NOT EXISTS payment_events (
            event_id TEXT PRIMARY KEY NOT NULL,
            event_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            resource_status TEXT NOT NULL,
            received_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pricing_settings (
            id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
            operation_cost_micros INTEGER NOT NULL,
            free_operations INTEGER NOT NULL,
            custom_prices_json TEXT NOT NULL,
            updated_at_ms INTEGER
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn to_millis(at: OffsetDateTime) -> i64 {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

fn from_millis(millis: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| StoreError::inconsistent(format!("stored timestamp {millis} out of range: {err}")))
}

fn format_date(date: Date) -> Result<String, StoreError> {
    date.format(DATE_FORMAT)
        .map_err(|err| StoreError::inconsistent(format!("format usage date {date}: {err}")))
}

fn parse_date(raw: &str) -> Result<Date, StoreError> {
    Date::parse(raw, DATE_FORMAT)
        .map_err(|err| StoreError::inconsistent(format!("stored usage date {raw:?}: {err}")))
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
