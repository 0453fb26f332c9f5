//! Normalize-and-upsert pipeline: configuration, schema normalizer, chunked
//! upsert executor and the run driver.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use ibs_adapters::{
    FeedSource, FileSource, ModelSource, ModelSourceConfig, RowSource, SourceError,
};
use ibs_core::{column, CanonicalRow, Column, RowKey, DEFAULT_TABLE};
use ibs_storage::{
    is_valid_table_name, BackoffPolicy, ChunkSink, HttpClientConfig, HttpFetcher, PgUpsertStore,
    RestStoreConfig, RestUpsertStore, RetryDisposition, Sleeper, StoreError, TokioSleeper,
};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ibs-sync";

/// Upper bound keeping one staged chunk under Postgres' bind-parameter limit.
pub const MAX_BATCH_SIZE: usize = 3000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("no target store configured; set IBS_STORE with SUPABASE_* or DATABASE_URL / PG_* settings")]
    NoStore,
}

#[derive(Clone, PartialEq, Eq)]
pub enum PgTarget {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

impl PgTarget {
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        match self {
            Self::Url(url) => url.parse(),
            Self::Parts {
                host,
                port,
                database,
                user,
                password,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(user)
                .password(password)),
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for PgTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(_) => f.write_str("PgTarget::Url(..)"),
            Self::Parts { host, port, database, .. } => f
                .debug_struct("PgTarget::Parts")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Rest { project_url: String, service_key: String },
    Postgres(PgTarget),
}

impl fmt::Debug for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest { project_url, .. } => f
                .debug_struct("StoreTarget::Rest")
                .field("project_url", project_url)
                .finish_non_exhaustive(),
            Self::Postgres(pg) => f.debug_tuple("StoreTarget::Postgres").field(pg).finish(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Every recognized option, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub store: Option<StoreTarget>,
    pub table: String,
    pub batch_size: usize,
    pub request_timeout: Duration,
    pub max_rows: usize,
    pub backoff: BackoffPolicy,
    pub model: ModelSettings,
    pub feed_url: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            store: None,
            table: DEFAULT_TABLE.to_string(),
            batch_size: 200,
            request_timeout: Duration::from_secs(60),
            max_rows: 100,
            backoff: BackoffPolicy::default(),
            model: ModelSettings {
                api_key: None,
                model: ModelSourceConfig::DEFAULT_MODEL.to_string(),
                base_url: ModelSourceConfig::DEFAULT_BASE_URL.to_string(),
            },
            feed_url: None,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}

fn require(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<String, ConfigError> {
    lookup(var).ok_or(ConfigError::Missing(var))
}

impl LoaderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            store: Self::resolve_store(&lookup)?,
            table: lookup("IBS_TABLE").unwrap_or(defaults.table),
            batch_size: parse_var(&lookup, "BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            request_timeout: parse_var(&lookup, "TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_rows: parse_var(&lookup, "MAX_ROWS")?.unwrap_or(defaults.max_rows),
            backoff: BackoffPolicy {
                max_attempts: parse_var(&lookup, "IBS_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.backoff.max_attempts),
                base_delay: parse_var(&lookup, "IBS_BACKOFF_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.base_delay),
                multiplier: parse_var(&lookup, "IBS_BACKOFF_MULTIPLIER")?
                    .unwrap_or(defaults.backoff.multiplier),
                max_delay: defaults.backoff.max_delay,
            },
            model: ModelSettings {
                api_key: lookup("OPENAI_API_KEY"),
                model: lookup("OPENAI_MODEL").unwrap_or(defaults.model.model),
                base_url: lookup("OPENAI_BASE_URL").unwrap_or(defaults.model.base_url),
            },
            feed_url: lookup("DATA_API"),
        };
        config.validate()?;
        Ok(config)
    }

    fn resolve_store(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<StoreTarget>, ConfigError> {
        let kind = match lookup("IBS_STORE") {
            Some(kind) => kind.trim().to_ascii_lowercase(),
            None if lookup("SUPABASE_PROJECT_URL").is_some() => "rest".to_string(),
            None if lookup("DATABASE_URL").is_some() || lookup("PG_HOST").is_some() => {
                "postgres".to_string()
            }
            None => return Ok(None),
        };

        match kind.as_str() {
            "rest" | "supabase" => Ok(Some(StoreTarget::Rest {
                project_url: require(lookup, "SUPABASE_PROJECT_URL")?,
                service_key: require(lookup, "SUPABASE_SERVICE_ROLE")?,
            })),
            "postgres" | "sql" => {
                let target = match lookup("DATABASE_URL") {
                    Some(url) => PgTarget::Url(url),
                    None => PgTarget::Parts {
                        host: require(lookup, "PG_HOST")?,
                        port: parse_var(lookup, "PG_PORT")?.unwrap_or(5432),
                        database: require(lookup, "PG_DATABASE")?,
                        user: require(lookup, "PG_USER")?,
                        password: require(lookup, "PG_PASSWORD")?,
                    },
                };
                Ok(Some(StoreTarget::Postgres(target)))
            }
            other => Err(ConfigError::Invalid {
                var: "IBS_STORE",
                reason: format!("unknown store kind {other:?} (expected rest or postgres)"),
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::Invalid {
                var: "BATCH_SIZE",
                reason: format!("{} is outside 1..={MAX_BATCH_SIZE}", self.batch_size),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "TIMEOUT_SECS",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_rows == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_ROWS",
                reason: "must be positive".to_string(),
            });
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "IBS_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff.multiplier == 0 {
            return Err(ConfigError::Invalid {
                var: "IBS_BACKOFF_MULTIPLIER",
                reason: "must be at least 1".to_string(),
            });
        }
        if !is_valid_table_name(&self.table) {
            return Err(ConfigError::Invalid {
                var: "IBS_TABLE",
                reason: format!("{:?} is not a lower-case SQL identifier", self.table),
            });
        }
        if let Some(StoreTarget::Rest { project_url, .. }) = &self.store {
            if !(project_url.starts_with("http://") || project_url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    var: "SUPABASE_PROJECT_URL",
                    reason: "must be an http(s) URL".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn require_store(&self) -> Result<&StoreTarget, ConfigError> {
        self.store.as_ref().ok_or(ConfigError::NoStore)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.request_timeout,
            backoff: self.backoff,
            ..Default::default()
        }
    }
}

/// Which row source a run reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    Model,
    Feed { url: Option<String> },
    File(PathBuf),
}

pub fn build_source(selection: &SourceSelection, config: &LoaderConfig) -> anyhow::Result<Box<dyn RowSource>> {
    let source: Box<dyn RowSource> = match selection {
        SourceSelection::File(path) => Box::new(FileSource::new(path.clone())),
        SourceSelection::Feed { url } => {
            let url = url
                .clone()
                .or_else(|| config.feed_url.clone())
                .ok_or(ConfigError::Missing("DATA_API"))?;
            let http = HttpFetcher::new(config.http_client_config())?;
            Box::new(FeedSource::new(url, Arc::new(http)))
        }
        SourceSelection::Model => {
            let api_key = config
                .model
                .api_key
                .clone()
                .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
            let http = HttpFetcher::new(config.http_client_config())?;
            Box::new(ModelSource::new(
                ModelSourceConfig {
                    api_key,
                    model: config.model.model.clone(),
                    base_url: config.model.base_url.clone(),
                    max_rows: config.max_rows,
                    temperature: 0.2,
                },
                Arc::new(http),
            ))
        }
    };
    Ok(source)
}

pub async fn build_sink(config: &LoaderConfig) -> anyhow::Result<Arc<dyn ChunkSink>> {
    let sink: Arc<dyn ChunkSink> = match config.require_store()? {
        StoreTarget::Rest {
            project_url,
            service_key,
        } => Arc::new(RestUpsertStore::new(RestStoreConfig {
            project_url: project_url.clone(),
            service_key: service_key.clone(),
            table: config.table.clone(),
            timeout: config.request_timeout,
        })?),
        StoreTarget::Postgres(target) => Arc::new(connect_postgres(target, config).await?),
    };
    Ok(sink)
}

async fn connect_postgres(target: &PgTarget, config: &LoaderConfig) -> anyhow::Result<PgUpsertStore> {
    let options = target
        .connect_options()
        .context("parsing postgres connection settings")?;
    PgUpsertStore::connect_with(options, &config.table, config.request_timeout)
        .await
        .context("connecting to postgres")
}

/// Create the target table when it does not exist yet (postgres targets only).
pub async fn ensure_table(config: &LoaderConfig) -> anyhow::Result<String> {
    match config.require_store()? {
        StoreTarget::Postgres(target) => {
            let store = connect_postgres(target, config).await?;
            store
                .ensure_table()
                .await
                .with_context(|| format!("creating table {}", config.table))?;
            Ok(store.target())
        }
        StoreTarget::Rest { .. } => anyhow::bail!(
            "the REST endpoint cannot run DDL; apply `ibs migrate --print` output in the database instead"
        ),
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed input: expected a JSON array of records, got {found}")]
pub struct MalformedInput {
    pub found: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    NotAnObject,
    MissingTicker,
    MissingName,
    MissingSourceUrl,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeOutcome {
    /// Canonical rows, unique on `(trade_bucket, ticker)`.
    pub rows: Vec<CanonicalRow>,
    pub discarded: usize,
    /// Rows folded into an earlier row with the same key.
    pub duplicates: usize,
    pub discard_reasons: HashMap<DiscardReason, usize>,
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Maps loosely-typed records onto [`CanonicalRow`]s.
///
/// A record whose `tradedatehour` is absent or unparseable is bucketed into
/// the current UTC hour at normalization time; callers relying on historical
/// buckets must supply them explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    fixed_now: Option<DateTime<Utc>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizer whose fallback bucket is derived from `now` instead of the clock.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            fixed_now: Some(now),
        }
    }

    pub fn normalize(&self, input: &JsonValue) -> Result<NormalizeOutcome, MalformedInput> {
        let records = input.as_array().ok_or(MalformedInput {
            found: json_kind(input),
        })?;
        let fallback_bucket = floor_to_hour(self.fixed_now.unwrap_or_else(Utc::now));

        let mut outcome = NormalizeOutcome::default();
        let mut positions: HashMap<RowKey, usize> = HashMap::new();

        for (index, record) in records.iter().enumerate() {
            let row = match record.as_object() {
                Some(map) => normalize_record(map, fallback_bucket),
                None => Err(DiscardReason::NotAnObject),
            };
            match row {
                Ok(row) => {
                    let key = row.key();
                    match positions.get(&key).copied() {
                        Some(at) => {
                            outcome.rows[at] = row;
                            outcome.duplicates += 1;
                        }
                        None => {
                            positions.insert(key, outcome.rows.len());
                            outcome.rows.push(row);
                        }
                    }
                }
                Err(reason) => {
                    debug!(index, ?reason, "discarding record");
                    outcome.discarded += 1;
                    *outcome.discard_reasons.entry(reason).or_default() += 1;
                }
            }
        }

        if outcome.discarded > 0 {
            warn!(
                discarded = outcome.discarded,
                reasons = ?outcome.discard_reasons,
                "records dropped during normalization"
            );
        }
        if outcome.duplicates > 0 {
            info!(duplicates = outcome.duplicates, "collapsed records sharing a key");
        }
        Ok(outcome)
    }
}

/// Lower-cases keys; on a case-insensitive collision the first non-null value wins.
fn lowercase_keys(record: &Map<String, JsonValue>) -> HashMap<String, &JsonValue> {
    let mut fields: HashMap<String, &JsonValue> = HashMap::with_capacity(record.len());
    for (key, value) in record {
        let slot = fields.entry(key.to_lowercase()).or_insert(value);
        if slot.is_null() {
            *slot = value;
        }
    }
    fields
}

fn first_present<'a>(fields: &HashMap<String, &'a JsonValue>, column: &Column) -> Option<&'a JsonValue> {
    column
        .accepted_keys()
        .filter_map(|key| fields.get(key).copied())
        .find(|value| !value.is_null())
}

struct Fields<'a> {
    raw: HashMap<String, &'a JsonValue>,
}

impl<'a> Fields<'a> {
    fn get(&self, store_name: &str) -> Option<&'a JsonValue> {
        column(store_name).and_then(|c| first_present(&self.raw, c))
    }

    fn text(&self, store_name: &str) -> Option<String> {
        self.get(store_name).and_then(coerce_text)
    }

    fn decimal(&self, store_name: &str) -> Option<f64> {
        self.get(store_name).and_then(coerce_decimal)
    }

    fn integer(&self, store_name: &str) -> Option<i64> {
        self.get(store_name).and_then(coerce_integer)
    }

    fn timestamp(&self, store_name: &str) -> Option<DateTime<Utc>> {
        self.get(store_name).and_then(parse_timestamp)
    }
}

/// Coerce one record; `Err` names the first missing essential field.
pub fn normalize_record(
    record: &Map<String, JsonValue>,
    fallback_bucket: DateTime<Utc>,
) -> Result<CanonicalRow, DiscardReason> {
    let fields = Fields {
        raw: lowercase_keys(record),
    };

    let trade_bucket = fields
        .timestamp("tradedatehour")
        .map(floor_to_hour)
        .unwrap_or(fallback_bucket);
    let ticker = fields.text("ticker").ok_or(DiscardReason::MissingTicker)?;
    let name = fields.text("stockname").ok_or(DiscardReason::MissingName)?;
    let source_url = fields
        .text("sourceurl")
        .ok_or(DiscardReason::MissingSourceUrl)?;

    Ok(CanonicalRow {
        trade_bucket,
        ticker,
        exchange: fields.text("exchange"),
        name,
        sector: fields.text("sector"),
        last_price_gbp: fields.decimal("lastgbp"),
        gap_pct: fields.decimal("gappct"),
        rel_volume: fields.decimal("relvol"),
        avg_volume_30d: fields.integer("avgvol30d"),
        range_52w_pos: fields.decimal("range52wpos"),
        atr_pct: fields.decimal("atrpct"),
        float_shares: fields.integer("floatshares"),
        free_float_pct: fields.decimal("freefloatpct"),
        short_interest_pct: fields.decimal("shortinterestpct"),
        market_cap_gbp: fields.integer("marketcapgbp"),
        conviction: fields.text("conviction"),
        catalyst: fields.text("catalyst"),
        source_url,
        news_timestamp: fields.timestamp("newstimestamp"),
    })
}

pub fn coerce_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

pub fn coerce_decimal(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Integer-valued columns keep the integer part of the parsed number.
pub fn coerce_integer(value: &JsonValue) -> Option<i64> {
    if let JsonValue::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    let truncated = coerce_decimal(value)?.trunc();
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    (truncated >= i64::MIN as f64 && truncated < i64::MAX as f64).then_some(truncated as i64)
}

pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floored = ts.timestamp().div_euclid(3600) * 3600;
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

const OFFSET_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

const NAIVE_FORMATS: [&str; 8] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%Y%m%d"];

const COMPACT_FORMATS: [&str; 3] = ["%Y%m%dT%H%M%S", "%Y%m%dT%H%M", "%Y%m%d%H%M%S"];

/// Digit strings up to this length are compact calendar stamps, never epochs.
const MAX_COMPACT_DIGITS: usize = 10;

/// Permissive timestamp parsing; naive values are taken as UTC. JSON numbers
/// are Unix seconds (milliseconds above 10^11), digit strings only when
/// longer than ten digits.
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => from_epoch(n.as_f64()?),
        JsonValue::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() >= 1e11 { raw } else { raw * 1000.0 };
    if millis.abs() > 8.64e15 {
        return None;
    }
    DateTime::from_timestamp_millis(millis.trunc() as i64)
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        if s.len() > MAX_COMPACT_DIGITS {
            return from_epoch(s.parse::<f64>().ok()?);
        }
        return parse_compact_digits(s);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive = strip_utc_marker(s);
    for fmt in NAIVE_FORMATS.iter().chain(&COMPACT_FORMATS) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(naive, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
        }
    }
    None
}

fn strip_utc_marker(s: &str) -> &str {
    let upper = s.to_ascii_uppercase();
    for marker in [" UTC", " GMT", "UTC", "GMT", "Z"] {
        if upper.ends_with(marker) {
            return s[..s.len() - marker.len()].trim_end();
        }
    }
    s
}

/// `YYYYMMDD` or `YYYYMMDDHH`.
fn parse_compact_digits(s: &str) -> Option<DateTime<Utc>> {
    let (date, hour) = match s.len() {
        8 => (s, 0),
        10 => (&s[..8], s[8..].parse::<u32>().ok()?),
        _ => return None,
    };
    let dt = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?.and_hms_opt(hour, 0, 0)?;
    Some(Utc.from_utc_datetime(&dt))
}

/// Position of one chunk within a run's batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkRef {
    pub index: usize,
    pub count: usize,
    pub offset: usize,
    pub size: usize,
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {}/{} (rows {}..{}, {} rows)",
            self.index + 1,
            self.count,
            self.offset,
            self.offset + self.size,
            self.size
        )
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("{chunk} failed permanently after {attempts} attempt(s); {written} row(s) committed before it: {source}")]
    Permanent {
        chunk: ChunkRef,
        attempts: u32,
        written: usize,
        #[source]
        source: StoreError,
    },
    #[error("{chunk} still failing after {attempts} attempt(s); {written} row(s) committed before it: {source}")]
    RetriesExhausted {
        chunk: ChunkRef,
        attempts: u32,
        written: usize,
        #[source]
        source: StoreError,
    },
}

impl UpsertError {
    pub fn chunk(&self) -> &ChunkRef {
        match self {
            Self::Permanent { chunk, .. } | Self::RetriesExhausted { chunk, .. } => chunk,
        }
    }

    /// Rows in chunks fully committed before the failing one.
    pub fn written(&self) -> usize {
        match self {
            Self::Permanent { written, .. } | Self::RetriesExhausted { written, .. } => *written,
        }
    }
}

/// Writes rows chunk by chunk, each chunk retried as a unit.
pub struct UpsertExecutor {
    sink: Arc<dyn ChunkSink>,
    batch_size: usize,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl UpsertExecutor {
    pub fn new(sink: Arc<dyn ChunkSink>, batch_size: usize, backoff: BackoffPolicy) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            backoff,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn target(&self) -> String {
        self.sink.target()
    }

    /// Returns the number of rows written; chunks run strictly in order.
    pub async fn upsert(&self, rows: &[CanonicalRow]) -> Result<usize, UpsertError> {
        let count = rows.len().div_ceil(self.batch_size);
        let mut written = 0usize;

        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let chunk_ref = ChunkRef {
                index,
                count,
                offset: index * self.batch_size,
                size: chunk.len(),
            };
            let span = info_span!("upsert_chunk", chunk = index + 1, of = count, size = chunk.len());
            let attempts = self
                .write_chunk(chunk, chunk_ref, written)
                .instrument(span)
                .await?;
            written += chunk.len();
            info!(%chunk_ref, attempts, written, "chunk committed");
        }
        Ok(written)
    }

    async fn write_chunk(
        &self,
        rows: &[CanonicalRow],
        chunk: ChunkRef,
        written: usize,
    ) -> Result<u32, UpsertError> {
        let mut attempt = 0u32;
        loop {
            let err = match self.sink.write_chunk(rows).await {
                Ok(()) => return Ok(attempt + 1),
                Err(err) => err,
            };
            let disposition = err.disposition();
            if self.backoff.should_retry(disposition, attempt) {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(%chunk, attempt = attempt + 1, ?delay, error = %err, "transient store failure; retrying");
                self.sleeper.sleep(delay).await;
                attempt += 1;
                continue;
            }

            let attempts = attempt + 1;
            return Err(match disposition {
                RetryDisposition::Retryable => UpsertError::RetriesExhausted {
                    chunk,
                    attempts,
                    written,
                    source: err,
                },
                RetryDisposition::NonRetryable => UpsertError::Permanent {
                    chunk,
                    attempts,
                    written,
                    source: err,
                },
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Normalize,
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source stage failed: {0}")]
    Source(#[source] SourceError),
    #[error("normalize stage failed: {0}")]
    Malformed(#[source] MalformedInput),
    #[error("upsert stage failed: {0}")]
    Upsert(#[source] UpsertError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Source(SourceError::Malformed(_)) | Self::Malformed(_) => Stage::Normalize,
            Self::Source(_) => Stage::Source,
            Self::Upsert(_) => Stage::Upsert,
        }
    }
}

/// One structured record per invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub timestamp_utc: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub target: String,
    pub received_count: usize,
    pub normalized_count: usize,
    pub discarded_count: usize,
    pub duplicate_count: usize,
    pub written_count: usize,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn started(source: &dyn RowSource, target: String) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            timestamp_utc: now,
            finished_at: now,
            source: source.source_id().to_string(),
            model: source.model().map(str::to_string),
            target,
            received_count: 0,
            normalized_count: 0,
            discarded_count: 0,
            duplicate_count: 0,
            written_count: 0,
            status: RunStatus::Completed,
            failed_stage: None,
            error: None,
        }
    }

    fn record_ingest(&mut self, ingest: &IngestOutcome) {
        self.received_count = ingest.received;
        self.normalized_count = ingest.normalized.rows.len();
        self.discarded_count = ingest.normalized.discarded;
        self.duplicate_count = ingest.normalized.duplicates;
    }

    fn fail(mut self, error: PipelineError) -> RunFailure {
        self.finished_at = Utc::now();
        self.status = RunStatus::Failed;
        self.failed_stage = Some(error.stage());
        self.error = Some(error.to_string());
        RunFailure {
            summary: Box::new(self),
            error,
        }
    }
}

/// A failed run, with the counts reached before failing.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub summary: Box<RunSummary>,
    #[source]
    pub error: PipelineError,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub source: String,
    pub received: usize,
    pub normalized: NormalizeOutcome,
}

/// Source and normalize stages, shared by real and dry runs.
#[derive(Debug, Clone)]
pub struct Ingest {
    normalizer: Normalizer,
    max_rows: usize,
}

impl Ingest {
    pub fn new(normalizer: Normalizer, max_rows: usize) -> Self {
        Self {
            normalizer,
            max_rows: max_rows.max(1),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(Normalizer::new(), config.max_rows)
    }

    pub async fn collect(&self, source: &dyn RowSource) -> Result<IngestOutcome, PipelineError> {
        let batch = source.fetch().await.map_err(PipelineError::Source)?;

        debug!(format = ?batch.format, bytes = batch.byte_size, "source payload decoded");

        let mut records = batch.records;
        if let JsonValue::Array(rows) = &mut records {
            if rows.len() > self.max_rows {
                warn!(
                    cap = self.max_rows,
                    dropped = rows.len() - self.max_rows,
                    "source returned more rows than the cap"
                );
                rows.truncate(self.max_rows);
            }
        }
        let received = records.as_array().map(Vec::len).unwrap_or(0);

        let normalized = self
            .normalizer
            .normalize(&records)
            .map_err(PipelineError::Malformed)?;
        Ok(IngestOutcome {
            source: source.source_id().to_string(),
            received,
            normalized,
        })
    }
}

/// Source -> Normalizer -> Executor, strictly sequential.
pub struct Pipeline {
    ingest: Ingest,
    executor: UpsertExecutor,
}

impl Pipeline {
    pub fn new(ingest: Ingest, executor: UpsertExecutor) -> Self {
        Self { ingest, executor }
    }

    pub fn from_config(config: &LoaderConfig, sink: Arc<dyn ChunkSink>) -> Self {
        Self::new(
            Ingest::from_config(config),
            UpsertExecutor::new(sink, config.batch_size, config.backoff),
        )
    }

    pub async fn run(&self, source: &dyn RowSource) -> Result<RunSummary, RunFailure> {
        let mut summary = RunSummary::started(source, self.executor.target());
        let span = info_span!("pipeline_run", run_id = %summary.run_id, source = source.source_id());

        async move {
            let ingest = match self.ingest.collect(source).await {
                Ok(ingest) => ingest,
                Err(err) => return Err(summary.fail(err)),
            };
            summary.record_ingest(&ingest);
            info!(
                received = summary.received_count,
                normalized = summary.normalized_count,
                discarded = summary.discarded_count,
                "records normalized"
            );

            match self.executor.upsert(&ingest.normalized.rows).await {
                Ok(written) => summary.written_count = written,
                Err(err) => {
                    summary.written_count = err.written();
                    return Err(summary.fail(PipelineError::Upsert(err)));
                }
            }

            summary.finished_at = Utc::now();
            info!(written = summary.written_count, "run completed");
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Timelike;
    use ibs_adapters::{PayloadFormat, SourceBatch};
    use serde_json::json;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::at(utc(2024, 3, 1, 14, 42, 17))
    }

    fn record(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().unwrap().clone()
    }

    fn pick(ticker: &str, price: f64) -> JsonValue {
        json!({
            "tradedatehour": "2024-03-01T09:00:00Z",
            "ticker": ticker,
            "stockname": format!("{ticker} plc"),
            "sourceurl": "https://example.com/rns",
            "lastgbp": price,
        })
    }

    #[test]
    fn mixed_case_scenario_normalizes_with_null_optionals() {
        let input = json!([{
            "TradeDateHour": "2024-03-01T09:00:00Z",
            "Ticker": "ABC.L",
            "StockName": "ABC",
            "SourceURL": "http://x"
        }]);
        let outcome = normalizer().normalize(&input).unwrap();
        assert_eq!(outcome.discarded, 0);
        assert_eq!(outcome.rows.len(), 1);

        let row = &outcome.rows[0];
        assert_eq!(row.trade_bucket, utc(2024, 3, 1, 9, 0, 0));
        assert_eq!(row.ticker, "ABC.L");
        assert_eq!(row.name, "ABC");
        assert_eq!(row.source_url, "http://x");
        assert_eq!(
            row,
            &CanonicalRow::essential(utc(2024, 3, 1, 9, 0, 0), "ABC.L", "ABC", "http://x")
        );
    }

    #[test]
    fn mixed_case_keys_match_lower_case_keys() {
        let mixed = record(json!({
            "TradeDateHour": "2024-03-01 09:15", "TICKER": "XYZ.L", "StockName": "XYZ",
            "SourceUrl": "https://x", "LastGBP": "2.5", "AvgVol30D": 1200.9,
            "NewsTimestamp": "2024-03-01T07:00:00+01:00", "Conviction": "High"
        }));
        let lower: Map<String, JsonValue> = mixed
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        let bucket = utc(2024, 3, 1, 14, 0, 0);
        assert_eq!(normalize_record(&mixed, bucket), normalize_record(&lower, bucket));
    }

    #[test]
    fn missing_name_and_source_discard_the_record() {
        let outcome = normalizer().normalize(&json!([{"ticker": "ABC.L"}])).unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.discard_reasons.get(&DiscardReason::MissingName), Some(&1));
    }

    #[test]
    fn blank_essentials_are_treated_as_missing() {
        let rec = record(json!({"ticker": "  ", "stockname": "A", "sourceurl": "u"}));
        assert_eq!(
            normalize_record(&rec, utc(2024, 1, 1, 0, 0, 0)),
            Err(DiscardReason::MissingTicker)
        );
        let rec = record(json!({"ticker": "A.L", "stockname": "A", "sourceurl": ""}));
        assert_eq!(
            normalize_record(&rec, utc(2024, 1, 1, 0, 0, 0)),
            Err(DiscardReason::MissingSourceUrl)
        );
    }

    #[test]
    fn descriptive_aliases_are_accepted() {
        let rec = record(json!({
            "Trade_Bucket": "2024-03-01T09:59:59.999Z", "ticker": "A.L", "Name": "A plc",
            "source_url": "u", "last_price_gbp": 1.5, "market_cap_gbp": "12345678"
        }));
        let row = normalize_record(&rec, utc(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(row.trade_bucket, utc(2024, 3, 1, 9, 0, 0));
        assert_eq!(row.name, "A plc");
        assert_eq!(row.last_price_gbp, Some(1.5));
        assert_eq!(row.market_cap_gbp, Some(12_345_678));
    }

    #[test]
    fn trade_bucket_is_floored_and_converted_to_utc() {
        let cases = [
            ("2024-03-01T09:37:12Z", utc(2024, 3, 1, 9, 0, 0)),
            ("2024-03-01T10:05:00+01:00", utc(2024, 3, 1, 9, 0, 0)),
            ("2024-03-01 09:59:59.123456", utc(2024, 3, 1, 9, 0, 0)),
            ("Fri, 01 Mar 2024 09:30:00 GMT", utc(2024, 3, 1, 9, 0, 0)),
            ("01/03/2024 23:10", utc(2024, 3, 1, 23, 0, 0)),
            ("2024-03-01", utc(2024, 3, 1, 0, 0, 0)),
            ("20240301", utc(2024, 3, 1, 0, 0, 0)),
            ("2024030109", utc(2024, 3, 1, 9, 0, 0)),
            ("20240301T090000Z", utc(2024, 3, 1, 9, 0, 0)),
            ("20240301T0915", utc(2024, 3, 1, 9, 0, 0)),
            ("2024-03-01 09:00:00 UTC", utc(2024, 3, 1, 9, 0, 0)),
            ("2024-03-01 09:45 gmt", utc(2024, 3, 1, 9, 0, 0)),
        ];
        for (raw, expected) in cases {
            let rec = record(json!({"tradedatehour": raw, "ticker": "A", "stockname": "A", "sourceurl": "u"}));
            let row = normalize_record(&rec, utc(2000, 1, 1, 0, 0, 0)).unwrap();
            assert_eq!(row.trade_bucket, expected, "parsing {raw}");
            assert_eq!(row.trade_bucket.minute(), 0);
            assert_eq!(row.trade_bucket.second(), 0);
            assert_eq!(row.trade_bucket.nanosecond(), 0);
        }
    }

    #[test]
    fn unparseable_or_missing_bucket_falls_back_to_current_hour() {
        let input = json!([
            {"tradedatehour": "next tuesday", "ticker": "A", "stockname": "A", "sourceurl": "u"},
            {"ticker": "B", "stockname": "B", "sourceurl": "u"},
        ]);
        let outcome = normalizer().normalize(&input).unwrap();
        assert_eq!(outcome.rows.len(), 2);
        for row in &outcome.rows {
            assert_eq!(row.trade_bucket, utc(2024, 3, 1, 14, 0, 0));
        }
    }

    #[test]
    fn news_timestamp_keeps_minutes_and_nulls_garbage() {
        let rec = record(json!({
            "ticker": "A", "stockname": "A", "sourceurl": "u",
            "newstimestamp": "2024-03-01T07:42:00+02:00"
        }));
        let row = normalize_record(&rec, utc(2024, 3, 1, 9, 0, 0)).unwrap();
        assert_eq!(row.news_timestamp, Some(utc(2024, 3, 1, 5, 42, 0)));

        let rec = record(json!({"ticker": "A", "stockname": "A", "sourceurl": "u", "newstimestamp": "soon"}));
        assert_eq!(normalize_record(&rec, utc(2024, 3, 1, 9, 0, 0)).unwrap().news_timestamp, None);
    }

    #[test]
    fn epoch_timestamps_are_seconds_or_millis() {
        assert_eq!(parse_timestamp(&json!(1709283600)), Some(utc(2024, 3, 1, 9, 0, 0)));
        assert_eq!(parse_timestamp(&json!("1709283600000")), Some(utc(2024, 3, 1, 9, 0, 0)));
        assert_eq!(parse_timestamp(&json!(true)), None);
        assert_eq!(parse_timestamp(&json!("")), None);
        // short digit strings are calendar stamps or nothing
        assert_eq!(parse_timestamp(&json!("1709283600")), None);
        assert_eq!(parse_timestamp(&json!("12345")), None);
        assert_eq!(parse_timestamp(&json!("20241301")), None);
    }

    #[test]
    fn failed_numeric_coercion_is_null_not_zero() {
        for raw in [json!(""), json!("  "), json!("n/a"), json!("NaN"), json!("inf"), json!(true), json!([1]), json!({})] {
            assert_eq!(coerce_decimal(&raw), None, "decimal from {raw}");
            assert_eq!(coerce_integer(&raw), None, "integer from {raw}");
        }
        assert_eq!(coerce_decimal(&json!(" 9.5 ")), Some(9.5));
        assert_eq!(coerce_decimal(&json!("1e3")), Some(1000.0));
        assert_eq!(coerce_decimal(&json!(-2)), Some(-2.0));
    }

    #[test]
    fn integer_columns_truncate_toward_zero() {
        assert_eq!(coerce_integer(&json!(250000)), Some(250_000));
        assert_eq!(coerce_integer(&json!(250000.0)), Some(250_000));
        assert_eq!(coerce_integer(&json!(320000000.75)), Some(320_000_000));
        assert_eq!(coerce_integer(&json!("99.99")), Some(99));
        assert_eq!(coerce_integer(&json!(-1.9)), Some(-1));
        assert_eq!(coerce_integer(&json!(1e30)), None);
        assert_eq!(coerce_integer(&json!(i64::MAX)), Some(i64::MAX));
    }

    #[test]
    fn text_coercion_trims_and_renders_scalars() {
        assert_eq!(coerce_text(&json!("  AIM ")), Some("AIM".to_string()));
        assert_eq!(coerce_text(&json!(123)), Some("123".to_string()));
        assert_eq!(coerce_text(&json!(["a"])), None);
        assert_eq!(coerce_text(&json!(null)), None);
    }

    #[test]
    fn records_without_optionals_are_kept_with_nulls() {
        let rec = record(json!({"ticker": "A.L", "stockname": "A", "sourceurl": "u", "unrelated": 5}));
        let row = normalize_record(&rec, utc(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(row, CanonicalRow::essential(utc(2024, 1, 1, 0, 0, 0), "A.L", "A", "u"));
    }

    #[test]
    fn non_array_input_is_malformed() {
        let err = normalizer().normalize(&json!({"ticker": "A"})).unwrap_err();
        assert_eq!(err.found, "an object");
        assert!(normalizer().normalize(&json!("[]")).is_err());
        assert!(normalizer().normalize(&json!([])).unwrap().rows.is_empty());
    }

    #[test]
    fn non_object_elements_are_discarded_not_fatal() {
        let input = json!([1, "x", null, pick("A.L", 1.0)]);
        let outcome = normalizer().normalize(&input).unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.discarded, 3);
        assert_eq!(outcome.discard_reasons.get(&DiscardReason::NotAnObject), Some(&3));
    }

    #[test]
    fn duplicate_keys_collapse_to_last_values_at_first_position() {
        let input = json!([pick("A.L", 1.0), pick("B.L", 2.0), pick("A.L", 3.0)]);
        let outcome = normalizer().normalize(&input).unwrap();
        assert_eq!(outcome.duplicates, 1);
        let tickers: Vec<_> = outcome.rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A.L", "B.L"]);
        assert_eq!(outcome.rows[0].last_price_gbp, Some(3.0));
    }

    #[test]
    fn case_collision_prefers_non_null_value() {
        let rec = record(json!({"Ticker": null, "ticker": "A.L", "stockname": "A", "sourceurl": "u"}));
        assert_eq!(normalize_record(&rec, utc(2024, 1, 1, 0, 0, 0)).unwrap().ticker, "A.L");
    }

    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<BTreeMap<RowKey, CanonicalRow>>,
        calls: Mutex<Vec<usize>>,
        script: Mutex<VecDeque<Option<u16>>>,
    }

    impl MemorySink {
        /// Queue per-call outcomes: `None` succeeds, `Some(status)` fails with that HTTP status.
        fn scripted(outcomes: impl IntoIterator<Item = Option<u16>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into_iter().collect()),
                ..Default::default()
            }
        }

        fn stored(&self) -> BTreeMap<RowKey, CanonicalRow> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChunkSink for MemorySink {
        fn target(&self) -> String {
            "memory:test".to_string()
        }

        async fn write_chunk(&self, rows: &[CanonicalRow]) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(rows.len());
            if let Some(Some(status)) = self.script.lock().unwrap().pop_front() {
                return Err(StoreError::HttpStatus {
                    status,
                    body: "scripted failure".to_string(),
                });
            }
            let mut stored = self.rows.lock().unwrap();
            for row in rows {
                stored.insert(row.key(), row.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    fn rows(n: usize) -> Vec<CanonicalRow> {
        (0..n)
            .map(|i| CanonicalRow::essential(utc(2024, 3, 1, 9, 0, 0), format!("T{i:03}.L"), "Co", "u"))
            .collect()
    }

    fn executor(sink: Arc<MemorySink>, batch: usize, sleeper: Arc<RecordingSleeper>) -> UpsertExecutor {
        UpsertExecutor::new(sink, batch, BackoffPolicy::default()).with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn rows_are_written_in_fixed_size_chunks() {
        let sink = Arc::new(MemorySink::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let written = executor(sink.clone(), 200, sleeper).upsert(&rows(450)).await.unwrap();
        assert_eq!(written, 450);
        assert_eq!(*sink.calls.lock().unwrap(), vec![200, 200, 50]);
        assert_eq!(sink.stored().len(), 450);
    }

    #[tokio::test]
    async fn permanent_failure_on_second_chunk_stops_the_run() {
        let sink = Arc::new(MemorySink::scripted([None, Some(400)]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = executor(sink.clone(), 200, sleeper.clone())
            .upsert(&rows(450))
            .await
            .unwrap_err();

        assert!(matches!(err, UpsertError::Permanent { attempts: 1, .. }));
        assert_eq!(err.written(), 200);
        assert_eq!(
            *err.chunk(),
            ChunkRef {
                index: 1,
                count: 3,
                offset: 200,
                size: 200
            }
        );
        assert!(err.to_string().starts_with("chunk 2/3 (rows 200..400, 200 rows)"));
        assert_eq!(*sink.calls.lock().unwrap(), vec![200, 200]);
        assert!(sleeper.delays.lock().unwrap().is_empty());
        assert_eq!(sink.stored().len(), 200);
    }

    #[tokio::test]
    async fn transient_failures_back_off_exponentially_then_succeed() {
        let sink = Arc::new(MemorySink::scripted([Some(503), Some(429), None]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let written = executor(sink.clone(), 10, sleeper.clone()).upsert(&rows(5)).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(*sink.calls.lock().unwrap(), vec![5, 5, 5]);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_name_the_chunk() {
        let sink = Arc::new(MemorySink::scripted([None, Some(502), Some(502), Some(502)]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = executor(sink.clone(), 3, sleeper.clone()).upsert(&rows(5)).await.unwrap_err();
        assert!(matches!(err, UpsertError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.written(), 3);
        assert_eq!(err.chunk().offset, 3);
        assert_eq!(err.chunk().size, 2);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let sink = Arc::new(MemorySink::default());
        let written = executor(sink.clone(), 200, Arc::default()).upsert(&[]).await.unwrap();
        assert_eq!(written, 0);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    struct StaticSource(JsonValue);

    #[async_trait]
    impl RowSource for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn fetch(&self) -> Result<SourceBatch, SourceError> {
            Ok(batch_of(&self.0))
        }
    }

    struct CannedModel(JsonValue);

    #[async_trait]
    impl RowSource for CannedModel {
        fn source_id(&self) -> &str {
            "model"
        }

        fn model(&self) -> Option<&str> {
            Some("gpt-4o-mini")
        }

        async fn fetch(&self) -> Result<SourceBatch, SourceError> {
            Ok(batch_of(&self.0))
        }
    }

    fn batch_of(records: &JsonValue) -> SourceBatch {
        SourceBatch {
            format: PayloadFormat::Json,
            byte_size: records.to_string().len(),
            records: records.clone(),
        }
    }

    fn pipeline(sink: Arc<MemorySink>, batch: usize, max_rows: usize) -> Pipeline {
        Pipeline::new(
            Ingest::new(normalizer(), max_rows),
            UpsertExecutor::new(sink, batch, BackoffPolicy::default()).with_sleeper(Arc::new(RecordingSleeper::default())),
        )
    }

    #[tokio::test]
    async fn scenario_row_is_written_once() {
        let sink = Arc::new(MemorySink::default());
        let source = StaticSource(json!([{
            "TradeDateHour": "2024-03-01T09:00:00Z",
            "Ticker": "ABC.L",
            "StockName": "ABC",
            "SourceURL": "http://x"
        }]));
        let summary = pipeline(sink.clone(), 200, 100).run(&source).await.unwrap();
        assert_eq!(summary.received_count, 1);
        assert_eq!(summary.normalized_count, 1);
        assert_eq!(summary.written_count, 1);
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.target, "memory:test");

        let value = serde_json::to_value(&summary).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["status"], "completed");
    }

    #[tokio::test]
    async fn missing_essentials_scenario_writes_nothing() {
        let sink = Arc::new(MemorySink::default());
        let summary = pipeline(sink.clone(), 200, 100)
            .run(&StaticSource(json!([{"ticker": "ABC.L"}])))
            .await
            .unwrap();
        assert_eq!(summary.received_count, 1);
        assert_eq!(summary.normalized_count, 0);
        assert_eq!(summary.discarded_count, 1);
        assert_eq!(summary.written_count, 0);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerunning_identical_batch_is_idempotent() {
        let sink = Arc::new(MemorySink::default());
        let source = StaticSource(json!([pick("A.L", 1.0), pick("B.L", 2.0)]));
        let pipeline = pipeline(sink.clone(), 200, 100);

        pipeline.run(&source).await.unwrap();
        let once = sink.stored();
        pipeline.run(&source).await.unwrap();
        assert_eq!(sink.stored(), once);
        assert_eq!(once.len(), 2);
    }

    #[tokio::test]
    async fn later_run_overwrites_same_key() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(sink.clone(), 200, 100);
        pipeline.run(&StaticSource(json!([pick("A.L", 1.0)]))).await.unwrap();
        pipeline.run(&StaticSource(json!([pick("A.L", 1.7)]))).await.unwrap();

        let stored = sink.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.values().next().unwrap().last_price_gbp, Some(1.7));
    }

    #[tokio::test]
    async fn failed_run_reports_committed_rows_and_stage() {
        let sink = Arc::new(MemorySink::scripted([None, Some(422)]));
        let records: Vec<JsonValue> = (0..450).map(|i| pick(&format!("T{i:03}.L"), 1.0)).collect();
        let failure = pipeline(sink.clone(), 200, 1000)
            .run(&StaticSource(JsonValue::Array(records)))
            .await
            .unwrap_err();

        assert_eq!(failure.summary.written_count, 200);
        assert_eq!(failure.summary.normalized_count, 450);
        assert_eq!(failure.summary.status, RunStatus::Failed);
        assert_eq!(failure.summary.failed_stage, Some(Stage::Upsert));
        assert!(failure.summary.error.as_deref().unwrap().contains("chunk 2/3"));
        assert!(matches!(failure.error, PipelineError::Upsert(_)));
    }

    #[tokio::test]
    async fn malformed_source_output_aborts_before_writing() {
        let sink = Arc::new(MemorySink::default());
        let failure = pipeline(sink.clone(), 200, 100)
            .run(&StaticSource(json!({"rows": []})))
            .await
            .unwrap_err();
        assert_eq!(failure.error.stage(), Stage::Normalize);
        assert!(matches!(failure.error, PipelineError::Malformed(_)));
        assert_eq!(failure.summary.written_count, 0);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn row_cap_truncates_source_output() {
        let sink = Arc::new(MemorySink::default());
        let records: Vec<JsonValue> = (0..5).map(|i| pick(&format!("T{i}.L"), 1.0)).collect();
        let summary = pipeline(sink.clone(), 200, 3)
            .run(&StaticSource(JsonValue::Array(records)))
            .await
            .unwrap();
        assert_eq!(summary.received_count, 3);
        assert_eq!(summary.written_count, 3);
    }

    #[tokio::test]
    async fn summary_names_the_model_behind_model_sourced_rows() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(sink.clone(), 200, 100);

        let summary = pipeline.run(&CannedModel(json!([pick("A.L", 1.0)]))).await.unwrap();
        assert_eq!(summary.source, "model");
        assert_eq!(summary.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(serde_json::to_value(&summary).unwrap()["model"], "gpt-4o-mini");

        let summary = pipeline.run(&StaticSource(json!([]))).await.unwrap();
        assert_eq!(summary.model, None);
        assert!(serde_json::to_value(&summary).unwrap().get("model").is_none());
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_and_rest_inference() {
        let config = LoaderConfig::from_lookup(lookup_from(&[
            ("SUPABASE_PROJECT_URL", "https://proj.supabase.co/"),
            ("SUPABASE_SERVICE_ROLE", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_rows, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.table, "intradaybullishstocks");
        assert!(matches!(config.store, Some(StoreTarget::Rest { .. })));
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn config_builds_postgres_target_from_parts() {
        let config = LoaderConfig::from_lookup(lookup_from(&[
            ("PG_HOST", "db.internal"),
            ("PG_DATABASE", "markets"),
            ("PG_USER", "loader"),
            ("PG_PASSWORD", "p@ss/word"),
            ("BATCH_SIZE", "500"),
            ("IBS_TABLE", "bullishstocks"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 500);
        match config.store {
            Some(StoreTarget::Postgres(PgTarget::Parts { port, ref password, .. })) => {
                assert_eq!(port, 5432);
                assert_eq!(password, "p@ss/word");
            }
            other => panic!("unexpected store {other:?}"),
        }
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = LoaderConfig::from_lookup(lookup_from(&[("BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BATCH_SIZE", .. }));

        let err = LoaderConfig::from_lookup(lookup_from(&[("BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BATCH_SIZE", .. }));

        let err = LoaderConfig::from_lookup(lookup_from(&[("IBS_STORE", "rest")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SUPABASE_PROJECT_URL"));

        let err = LoaderConfig::from_lookup(lookup_from(&[("IBS_STORE", "mongo")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "IBS_STORE", .. }));

        let err = LoaderConfig::from_lookup(lookup_from(&[("IBS_TABLE", "Bullish;Stocks")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "IBS_TABLE", .. }));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = LoaderConfig::from_lookup(lookup_from(&[("MAX_ROWS", " "), ("DATABASE_URL", "")])).unwrap();
        assert_eq!(config.max_rows, 100);
        assert_eq!(config.store, None);
        assert_eq!(config.require_store().unwrap_err(), ConfigError::NoStore);
    }

    #[test]
    fn model_source_requires_api_key() {
        let config = LoaderConfig::default();
        let err = build_source(&SourceSelection::Model, &config).err().unwrap();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
        assert!(build_source(&SourceSelection::File("picks.json".into()), &config).is_ok());
    }
}
