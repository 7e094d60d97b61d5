//! SQLite-backed gateway store.
//!
//! Provides storage for:
//! - API keys (SHA-256 digests) and caller plans
//! - Internal and external model catalogs
//! - Billing ledgers
//! - Usage records

use super::{
    CallerDirectory, LedgerSnapshot, LedgerStore, ModelCatalog, ModelUsage, Plan, StoreError,
    SubscriptionStatus, UsageStore, UsageSummary,
};
use crate::catalog::{Capability, ExternalModel, InternalModel};
use crate::usage::{ModelRef, Outcome, UsageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SHA-256 hex digest of an API key, the only form persisted.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Gateway database operations.
///
/// The async seam implementations run each statement on tokio's blocking pool.
pub struct GatewayDb {
    conn: Arc<Mutex<Connection>>,
}

const INTERNAL_COLUMNS: &str = "id, slug, upstream_model, prompt_price_per_1k, completion_price_per_1k, \
     markup_percent, capabilities, context_window, active";

const EXTERNAL_COLUMNS: &str = "id, owner_id, model_name, endpoint_url, credential, prompt_price_per_1k, \
     completion_price_per_1k, request_template, response_mapping, custom_headers, capabilities, active";

impl GatewayDb {
    /// Open or create a gateway database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `op` against the connection on the blocking pool.
    async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&conn)
        })
        .await?
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS api_keys (
                key_hash TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS plans (
                caller_id TEXT PRIMARY KEY,
                requests_per_minute INTEGER,
                requests_per_day INTEGER,
                token_allowance INTEGER,
                pay_as_you_go INTEGER NOT NULL DEFAULT 0,
                byom_enabled INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS internal_models (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                upstream_model TEXT NOT NULL,
                prompt_price_per_1k REAL NOT NULL,
                completion_price_per_1k REAL NOT NULL,
                markup_percent REAL NOT NULL DEFAULT 0,
                capabilities TEXT NOT NULL,
                context_window INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS external_models (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                model_name TEXT NOT NULL,
                endpoint_url TEXT NOT NULL,
                credential TEXT NOT NULL,
                prompt_price_per_1k REAL NOT NULL,
                completion_price_per_1k REAL NOT NULL,
                request_template TEXT,
                response_mapping TEXT,
                custom_headers TEXT NOT NULL DEFAULT '{}',
                capabilities TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS ledgers (
                caller_id TEXT PRIMARY KEY,
                monthly_tokens INTEGER NOT NULL DEFAULT 0,
                credit_balance INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                internal_model_id TEXT,
                external_model_id TEXT,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                prompt_cost REAL NOT NULL,
                completion_cost REAL NOT NULL,
                total_cost REAL NOT NULL,
                latency_ms INTEGER NOT NULL,
                succeeded INTEGER NOT NULL,
                error_message TEXT,
                client_ip TEXT,
                user_agent TEXT,
                created_at_ms INTEGER NOT NULL,
                CHECK ((internal_model_id IS NULL) <> (external_model_id IS NULL)),
                CHECK (total_tokens = prompt_tokens + completion_tokens),
                CHECK (prompt_cost >= 0 AND completion_cost >= 0 AND total_cost >= 0)
            );

            CREATE INDEX IF NOT EXISTS idx_external_owner ON external_models(owner_id);
            CREATE INDEX IF NOT EXISTS idx_usage_caller_time ON usage_records(caller_id, created_at_ms);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administrative writes (the CRUD layer lives elsewhere; these seed it)
    // ------------------------------------------------------------------

    /// Register an API key for a caller. Only the digest is stored.
    pub fn insert_api_key(&self, api_key: &str, caller_id: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO api_keys (key_hash, caller_id, revoked) VALUES (?1, ?2, 0)",
            params![hash_api_key(api_key), caller_id],
        )?;
        Ok(())
    }

    pub fn revoke_api_key(&self, api_key: &str) -> Result<bool, StoreError> {
        let changed = self.lock()?.execute(
            "UPDATE api_keys SET revoked = 1 WHERE key_hash = ?1",
            params![hash_api_key(api_key)],
        )?;
        Ok(changed > 0)
    }

    pub fn upsert_plan(&self, caller_id: &str, plan: &Plan) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO plans (caller_id, requests_per_minute, requests_per_day, token_allowance, pay_as_you_go, byom_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(caller_id) DO UPDATE SET
                requests_per_minute = excluded.requests_per_minute,
                requests_per_day = excluded.requests_per_day,
                token_allowance = excluded.token_allowance,
                pay_as_you_go = excluded.pay_as_you_go,
                byom_enabled = excluded.byom_enabled",
            params![
                caller_id,
                plan.requests_per_minute,
                plan.requests_per_day,
                plan.token_allowance.map(|v| to_sql_int(v, "token allowance")).transpose()?,
                plan.pay_as_you_go,
                plan.byom_enabled,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_internal_model(&self, model: &InternalModel) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO internal_models (id, slug, upstream_model, prompt_price_per_1k,
                completion_price_per_1k, markup_percent, capabilities, context_window, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                model.id,
                model.slug,
                model.upstream_model,
                model.prompt_price_per_1k,
                model.completion_price_per_1k,
                model.markup_percent,
                serde_json::to_string(&model.capabilities)?,
                model.context_window,
                model.active,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_external_model(&self, model: &ExternalModel) -> Result<(), StoreError> {
        let template = model.request_template.as_ref().map(serde_json::to_string).transpose()?;
        let mapping = model.response_mapping.as_ref().map(serde_json::to_string).transpose()?;
        self.lock()?.execute(
            "INSERT OR REPLACE INTO external_models (id, owner_id, model_name, endpoint_url, credential,
                prompt_price_per_1k, completion_price_per_1k, request_template, response_mapping,
                custom_headers, capabilities, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                model.id,
                model.owner_id,
                model.model_name,
                model.endpoint_url,
                model.credential,
                model.prompt_price_per_1k,
                model.completion_price_per_1k,
                template,
                mapping,
                serde_json::to_string(&model.custom_headers)?,
                serde_json::to_string(&model.capabilities)?,
                model.active,
            ],
        )?;
        Ok(())
    }

    /// Set the credit balance, creating the ledger row if needed.
    pub fn set_credit_balance(&self, caller_id: &str, balance: i64) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO ledgers (caller_id, credit_balance) VALUES (?1, ?2)
             ON CONFLICT(caller_id) DO UPDATE SET credit_balance = excluded.credit_balance",
            params![caller_id, balance],
        )?;
        Ok(())
    }

    pub fn set_subscription_status(
        &self,
        caller_id: &str,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO ledgers (caller_id, status) VALUES (?1, ?2)
             ON CONFLICT(caller_id) DO UPDATE SET status = excluded.status",
            params![caller_id, status.as_str()],
        )?;
        Ok(())
    }

    /// Usage records for a caller, oldest first.
    pub fn usage_records(&self, caller_id: &str) -> Result<Vec<StoredUsage>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, endpoint, internal_model_id, external_model_id, prompt_tokens,
                    completion_tokens, total_tokens, total_cost, succeeded, error_message
             FROM usage_records WHERE caller_id = ?1 ORDER BY created_at_ms ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![caller_id], |row| {
            let internal: Option<String> = row.get(2)?;
            let external: Option<String> = row.get(3)?;
            Ok(StoredUsage {
                request_id: row.get(0)?,
                endpoint: row.get(1)?,
                model: match (internal, external) {
                    (Some(id), None) => Some(ModelRef::Internal(id)),
                    (None, Some(id)) => Some(ModelRef::External(id)),
                    _ => None,
                },
                prompt_tokens: row.get::<_, i64>(4)? as u64,
                completion_tokens: row.get::<_, i64>(5)? as u64,
                total_tokens: row.get::<_, i64>(6)? as u64,
                total_cost: row.get(7)?,
                succeeded: row.get(8)?,
                error_message: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Flattened usage row, used by reporting and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredUsage {
    pub request_id: String,
    pub endpoint: String,
    pub model: Option<ModelRef>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

fn to_sql_int(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} {} out of range", what, value)))
}

fn parse_capabilities(raw: &str) -> Result<Vec<Capability>, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: Option<String>,
) -> Result<Option<T>, rusqlite::Error> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn internal_from_row(row: &Row<'_>) -> Result<InternalModel, rusqlite::Error> {
    let capabilities: String = row.get(6)?;
    Ok(InternalModel {
        id: row.get(0)?,
        slug: row.get(1)?,
        upstream_model: row.get(2)?,
        prompt_price_per_1k: row.get(3)?,
        completion_price_per_1k: row.get(4)?,
        markup_percent: row.get(5)?,
        capabilities: parse_capabilities(&capabilities)?,
        context_window: row.get(7)?,
        active: row.get(8)?,
    })
}

fn external_from_row(row: &Row<'_>) -> Result<ExternalModel, rusqlite::Error> {
    let capabilities: String = row.get(10)?;
    let headers: Option<BTreeMap<String, String>> = parse_json_column(9, row.get(9)?)?;
    Ok(ExternalModel {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        model_name: row.get(2)?,
        endpoint_url: row.get(3)?,
        credential: row.get(4)?,
        prompt_price_per_1k: row.get(5)?,
        completion_price_per_1k: row.get(6)?,
        request_template: parse_json_column(7, row.get(7)?)?,
        response_mapping: parse_json_column(8, row.get(8)?)?,
        custom_headers: headers.unwrap_or_default(),
        capabilities: parse_capabilities(&capabilities)?,
        active: row.get(11)?,
    })
}

#[async_trait]
impl CallerDirectory for GatewayDb {
    async fn authenticate(&self, api_key: &str) -> Result<Option<String>, StoreError> {
        let key_hash = hash_api_key(api_key);
        self.call(move |conn| {
            let caller = conn
                .query_row(
                    "SELECT caller_id FROM api_keys WHERE key_hash = ?1 AND revoked = 0",
                    params![key_hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(caller)
        })
        .await
    }

    async fn get_plan(&self, caller_id: &str) -> Result<Plan, StoreError> {
        let caller_id = caller_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT requests_per_minute, requests_per_day, token_allowance, pay_as_you_go, byom_enabled
                 FROM plans WHERE caller_id = ?1",
                params![caller_id],
                |row| {
                    Ok(Plan {
                        requests_per_minute: row.get(0)?,
                        requests_per_day: row.get(1)?,
                        token_allowance: row.get::<_, Option<i64>>(2)?.map(|v| v.max(0) as u64),
                        pay_as_you_go: row.get(3)?,
                        byom_enabled: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("plan for {}", caller_id)))
        })
        .await
    }
}

#[async_trait]
impl ModelCatalog for GatewayDb {
    async fn find_internal_model(&self, key: &str) -> Result<Option<InternalModel>, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            // An exact id match wins over a slug match.
            let sql = format!(
                "SELECT {} FROM internal_models WHERE active = 1 AND (id = ?1 OR slug = ?1)
                 ORDER BY CASE WHEN id = ?1 THEN 0 ELSE 1 END LIMIT 1",
                INTERNAL_COLUMNS
            );
            Ok(conn.query_row(&sql, params![key], internal_from_row).optional()?)
        })
        .await
    }

    async fn find_external_model(
        &self,
        key: &str,
        owner_id: &str,
    ) -> Result<Option<ExternalModel>, StoreError> {
        let (key, owner_id) = (key.to_string(), owner_id.to_string());
        self.call(move |conn| {
            let sql = format!(
                "SELECT {} FROM external_models
                 WHERE owner_id = ?2 AND active = 1 AND (id = ?1 OR model_name = ?1)
                 ORDER BY CASE WHEN id = ?1 THEN 0 ELSE 1 END, rowid ASC LIMIT 1",
                EXTERNAL_COLUMNS
            );
            Ok(conn.query_row(&sql, params![key, owner_id], external_from_row).optional()?)
        })
        .await
    }

    async fn list_internal_models(&self) -> Result<Vec<InternalModel>, StoreError> {
        self.call(|conn| {
            let sql = format!(
                "SELECT {} FROM internal_models WHERE active = 1 ORDER BY slug",
                INTERNAL_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], internal_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_external_models(&self, owner_id: &str) -> Result<Vec<ExternalModel>, StoreError> {
        let owner_id = owner_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {} FROM external_models WHERE owner_id = ?1 AND active = 1 ORDER BY model_name",
                EXTERNAL_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![owner_id], external_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[async_trait]
impl LedgerStore for GatewayDb {
    async fn get_monthly_usage(&self, caller_id: &str) -> Result<LedgerSnapshot, StoreError> {
        let caller_id = caller_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT monthly_tokens, credit_balance, status FROM ledgers WHERE caller_id = ?1",
                    params![caller_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                None => Ok(LedgerSnapshot::default()),
                Some((tokens, credit_balance, status)) => Ok(LedgerSnapshot {
                    monthly_tokens: tokens.max(0) as u64,
                    credit_balance,
                    status: status.parse().map_err(StoreError::Corrupt)?,
                }),
            }
        })
        .await
    }

    async fn increment_monthly_usage(&self, caller_id: &str, delta_tokens: u64) -> Result<(), StoreError> {
        let delta = to_sql_int(delta_tokens, "token delta")?;
        let caller_id = caller_id.to_string();
        self.call(move |conn| {
            // Single statement: no read-modify-write window between concurrent requests.
            conn.execute(
                "INSERT INTO ledgers (caller_id, monthly_tokens) VALUES (?1, ?2)
                 ON CONFLICT(caller_id) DO UPDATE SET monthly_tokens = monthly_tokens + excluded.monthly_tokens",
                params![caller_id, delta],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UsageStore for GatewayDb {
    async fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let prompt_tokens = to_sql_int(record.tokens.prompt(), "prompt_tokens")?;
        let completion_tokens = to_sql_int(record.tokens.completion(), "completion_tokens")?;
        let total_tokens = to_sql_int(record.tokens.total(), "total_tokens")?;
        let latency_ms = to_sql_int(record.latency_ms, "latency_ms")?;
        let record = record.clone();

        self.call(move |conn| {
            let (internal_id, external_id) = match &record.model {
                ModelRef::Internal(id) => (Some(id.as_str()), None),
                ModelRef::External(id) => (None, Some(id.as_str())),
            };
            let (succeeded, error_message) = match &record.outcome {
                Outcome::Succeeded => (true, None),
                Outcome::Failed { error } => (false, Some(error.as_str())),
            };

            conn.execute(
                "INSERT INTO usage_records (id, caller_id, request_id, endpoint, internal_model_id,
                    external_model_id, prompt_tokens, completion_tokens, total_tokens, prompt_cost,
                    completion_cost, total_cost, latency_ms, succeeded, error_message, client_ip,
                    user_agent, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    record.id,
                    record.caller_id,
                    record.request_id,
                    record.endpoint.as_str(),
                    internal_id,
                    external_id,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    record.cost.prompt,
                    record.cost.completion,
                    record.cost.total,
                    latency_ms,
                    succeeded,
                    error_message,
                    record.client.ip,
                    record.client.user_agent,
                    record.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_since(&self, caller_id: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let caller_id = caller_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM usage_records WHERE caller_id = ?1 AND created_at_ms >= ?2",
                params![caller_id, since.timestamp_millis()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn summarize(
        &self,
        caller_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, StoreError> {
        let caller_id = caller_id.to_string();
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let until_ms = until.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);

        self.call(move |conn| {
            let mut summary = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(succeeded), 0),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(total_cost), 0.0)
                 FROM usage_records
                 WHERE caller_id = ?1 AND created_at_ms >= ?2 AND created_at_ms < ?3",
                params![caller_id, since_ms, until_ms],
                |row| {
                    let total: i64 = row.get(0)?;
                    let succeeded: i64 = row.get(1)?;
                    Ok(UsageSummary {
                        total_requests: total as u64,
                        succeeded: succeeded as u64,
                        failed: (total - succeeded).max(0) as u64,
                        prompt_tokens: row.get::<_, i64>(2)? as u64,
                        completion_tokens: row.get::<_, i64>(3)? as u64,
                        total_tokens: row.get::<_, i64>(4)? as u64,
                        total_cost: crate::metering::round_cost(row.get(5)?),
                        by_model: Vec::new(),
                    })
                },
            )?;

            let mut stmt = conn.prepare(
                "SELECT CASE WHEN internal_model_id IS NOT NULL THEN 'internal' ELSE 'external' END,
                        COALESCE(internal_model_id, external_model_id),
                        COUNT(*),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(total_cost), 0.0)
                 FROM usage_records
                 WHERE caller_id = ?1 AND created_at_ms >= ?2 AND created_at_ms < ?3
                 GROUP BY 1, 2
                 ORDER BY 2",
            )?;
            let rows = stmt.query_map(params![caller_id, since_ms, until_ms], |row| {
                Ok(ModelUsage {
                    kind: row.get(0)?,
                    model_id: row.get(1)?,
                    requests: row.get::<_, i64>(2)? as u64,
                    total_tokens: row.get::<_, i64>(3)? as u64,
                    total_cost: crate::metering::round_cost(row.get(4)?),
                })
            })?;
            summary.by_model = rows.collect::<Result<Vec<_>, _>>()?;

            Ok(summary)
        })
        .await
    }
}
