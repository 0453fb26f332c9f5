//! Retrying HTTP fetch and target-store transports for IBS.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ibs_core::{CanonicalRow, ColumnKind, COLUMNS, KEY_COLUMNS};
use reqwest::StatusCode;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ibs-storage";

/// Transient relation the SQL transport stages each chunk in.
pub const STAGE_TABLE: &str = "ibs_stage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Postgres SQLSTATE codes worth another attempt: connection loss, lock and
/// serialization contention, cancelled statements, resource exhaustion.
pub fn classify_sqlstate(code: &str) -> RetryDisposition {
    let retryable = code.starts_with("08")
        || code.starts_with("53")
        || matches!(code, "40001" | "40P01" | "55P03" | "57014" | "57P01");
    if retryable {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            RetryDisposition::Retryable
        }
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(RetryDisposition::NonRetryable),
        _ => RetryDisposition::NonRetryable,
    }
}

/// Bounded exponential retry: `max_attempts` tries in total, sleeping
/// `base_delay * multiplier^n` (capped at `max_delay`) after failed try `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(attempt_index)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a failure on zero-based `attempt_index` earns another try.
    pub fn should_retry(&self, disposition: RetryDisposition, attempt_index: u32) -> bool {
        disposition == RetryDisposition::Retryable && attempt_index + 1 < self.max_attempts.max(1)
    }
}

/// Waits between retry attempts; swapped for a recording fake in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("ibs-loader/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// HTTP client used by row sources, retrying transient failures.
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.send_with_retry(|| self.client.get(url))
            .instrument(span)
            .await
    }

    pub async fn post_json(
        &self,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", source_id, url);
        self.send_with_retry(|| {
            let request = self.client.post(url).json(body);
            match bearer {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if self.backoff.should_retry(classify_status(status), attempt) {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt = attempt + 1, ?delay, "retrying http request");
                        self.sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: truncate_chars(&body, 500),
                    });
                }
                Err(err) => {
                    if self.backoff.should_retry(classify_reqwest_error(&err), attempt) {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt = attempt + 1, ?delay, "retrying http request");
                        self.sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Request(err) => classify_reqwest_error(err),
            Self::Database(err) => classify_sqlx_error(err),
            Self::Timeout(_) => RetryDisposition::Retryable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

/// A target store that merges a chunk of rows atomically on
/// `(tradedatehour, ticker)`, replacing every non-key column on conflict.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Short label for logs and the run summary, e.g. `rest:intradaybullishstocks`.
    fn target(&self) -> String;

    async fn write_chunk(&self, rows: &[CanonicalRow]) -> Result<(), StoreError>;
}

/// Validates a (optionally schema-qualified) lower-case SQL identifier.
pub fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
                && part.len() <= 63
        })
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub project_url: String,
    pub service_key: String,
    pub table: String,
    pub timeout: Duration,
}

/// PostgREST-style upsert endpoint (`POST /rest/v1/<table>`).
#[derive(Debug, Clone)]
pub struct RestUpsertStore {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
    table: String,
}

impl RestUpsertStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building store http client")?;
        let endpoint = format!(
            "{}/rest/v1/{}?on_conflict={}",
            config.project_url.trim_end_matches('/'),
            config.table,
            KEY_COLUMNS.join(",")
        );
        Ok(Self {
            client,
            endpoint,
            service_key: config.service_key,
            table: config.table,
        })
    }
}

#[async_trait]
impl ChunkSink for RestUpsertStore {
    fn target(&self) -> String {
        format!("rest:{}", self.table)
    }

    async fn write_chunk(&self, rows: &[CanonicalRow]) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Prefer", "resolution=merge-duplicates")
            .json(rows)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!(status = status.as_u16(), rows = rows.len(), "rest upsert accepted");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            body: truncate_chars(&body, 500),
        })
    }
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::HourBucket | ColumnKind::Timestamp => "timestamptz",
        ColumnKind::Text => "text",
        ColumnKind::Decimal => "double precision",
        ColumnKind::Integer => "bigint",
    }
}

fn column_list() -> String {
    COLUMNS
        .iter()
        .map(|c| c.store_name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table_sql(table: &str) -> String {
    let columns = COLUMNS
        .iter()
        .map(|c| {
            let null = if c.is_essential() { " NOT NULL" } else { "" };
            format!("    {} {}{}", c.store_name, sql_type(c.kind), null)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n{columns},\n    PRIMARY KEY ({})\n)",
        KEY_COLUMNS.join(", ")
    )
}

pub fn create_stage_sql(table: &str) -> String {
    format!("CREATE TEMP TABLE {STAGE_TABLE} (LIKE {table} INCLUDING DEFAULTS) ON COMMIT DROP")
}

pub fn stage_insert_prefix() -> String {
    format!("INSERT INTO {STAGE_TABLE} ({}) ", column_list())
}

pub fn merge_sql(table: &str) -> String {
    let updates = COLUMNS
        .iter()
        .filter(|c| !c.is_key())
        .map(|c| format!("{0} = EXCLUDED.{0}", c.store_name))
        .collect::<Vec<_>>()
        .join(", ");
    let columns = column_list();
    format!(
        "INSERT INTO {table} AS t ({columns}) SELECT {columns} FROM {STAGE_TABLE} \
         ON CONFLICT ({}) DO UPDATE SET {updates}",
        KEY_COLUMNS.join(", ")
    )
}

/// Direct Postgres transport: stage the chunk in a transaction-scoped temp
/// table, then merge into the target with `INSERT ... ON CONFLICT DO UPDATE`.
#[derive(Debug, Clone)]
pub struct PgUpsertStore {
    pool: PgPool,
    table: String,
    timeout: Duration,
}

impl PgUpsertStore {
    pub async fn connect(database_url: &str, table: &str, timeout: Duration) -> Result<Self, StoreError> {
        let options: PgConnectOptions = database_url.parse()?;
        Self::connect_with(options, table, timeout).await
    }

    pub async fn connect_with(
        options: PgConnectOptions,
        table: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool, table, timeout))
    }

    pub fn from_pool(pool: PgPool, table: &str, timeout: Duration) -> Self {
        Self {
            pool,
            table: table.to_string(),
            timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_chunk(&self, rows: &[CanonicalRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&create_stage_sql(&self.table))
            .execute(&mut *tx)
            .await?;

        let mut stage: QueryBuilder<Postgres> = QueryBuilder::new(stage_insert_prefix());
        stage.push_values(rows, |mut b, row| {
            b.push_bind(row.trade_bucket)
                .push_bind(&row.ticker)
                .push_bind(row.exchange.as_deref())
                .push_bind(&row.name)
                .push_bind(row.sector.as_deref())
                .push_bind(row.last_price_gbp)
                .push_bind(row.gap_pct)
                .push_bind(row.rel_volume)
                .push_bind(row.avg_volume_30d)
                .push_bind(row.range_52w_pos)
                .push_bind(row.atr_pct)
                .push_bind(row.float_shares)
                .push_bind(row.free_float_pct)
                .push_bind(row.short_interest_pct)
                .push_bind(row.market_cap_gbp)
                .push_bind(row.conviction.as_deref())
                .push_bind(row.catalyst.as_deref())
                .push_bind(&row.source_url)
                .push_bind(row.news_timestamp);
        });
        stage.build().execute(&mut *tx).await?;

        let merged = sqlx::query(&merge_sql(&self.table))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(rows = merged.rows_affected(), "sql merge committed");
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for PgUpsertStore {
    fn target(&self) -> String {
        format!("postgres:{}", self.table)
    }

    async fn write_chunk(&self, rows: &[CanonicalRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        // A timed-out merge drops its transaction, which rolls the chunk back.
        tokio::time::timeout(self.timeout, self.merge_chunk(rows))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}
