//! Row sources: local files, HTTP feeds and generative-model completions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use ibs_storage::{truncate_chars, FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ibs-adapters";

/// Longest completion excerpt carried in a malformed-response error.
const COMPLETION_EXCERPT_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Csv,
}

impl PayloadFormat {
    fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let lower = lower.split(['?', '#']).next().unwrap_or_default();
        if lower.ends_with(".csv") {
            Self::Csv
        } else {
            Self::Json
        }
    }
}

/// Decoded but not yet validated source output.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub format: PayloadFormat,
    pub byte_size: usize,
    pub records: JsonValue,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait RowSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Generative model behind the rows, when there is one.
    fn model(&self) -> Option<&str> {
        None
    }

    async fn fetch(&self) -> Result<SourceBatch, SourceError>;
}

/// Decode a JSON or CSV payload into a JSON value.
///
/// JSON objects wrapping their rows in a `data` member are unwrapped; whether
/// the result is a sequence of records is left to the normalizer.
pub fn decode_payload(format: PayloadFormat, bytes: &[u8]) -> Result<JsonValue, SourceError> {
    match format {
        PayloadFormat::Json => {
            let value: JsonValue = serde_json::from_slice(bytes)
                .map_err(|e| SourceError::Malformed(format!("invalid JSON payload: {e}")))?;
            Ok(unwrap_data_member(value))
        }
        PayloadFormat::Csv => decode_csv(bytes),
    }
}

fn unwrap_data_member(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut map) if map.get("data").is_some_and(JsonValue::is_array) => {
            map.remove("data").unwrap_or(JsonValue::Null)
        }
        other => other,
    }
}

/// Every cell becomes a JSON string keyed by its header; short rows simply
/// lack the trailing keys.
fn decode_csv(bytes: &[u8]) -> Result<JsonValue, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| SourceError::Malformed(format!("invalid CSV header: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| SourceError::Malformed(format!("invalid CSV record {}: {e}", line + 1)))?;
        let row: Map<String, JsonValue> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| (h.to_string(), JsonValue::String(cell.to_string())))
            .collect();
        rows.push(JsonValue::Object(row));
    }
    Ok(JsonValue::Array(rows))
}

/// Extract the row array from a chat completion.
pub fn parse_model_completion(content: &str) -> Result<JsonValue, SourceError> {
    let body = strip_code_fence(content.trim());
    let malformed = |reason: String| {
        SourceError::Malformed(format!(
            "model did not return a JSON array ({reason}); returned: {}",
            truncate_chars(content, COMPLETION_EXCERPT_CHARS)
        ))
    };
    let value: JsonValue = serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;
    match unwrap_data_member(value) {
        rows @ JsonValue::Array(_) => Ok(rows),
        _ => Err(malformed("non-list JSON structure".to_string())),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or_default();
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RowSource for FileSource {
    fn source_id(&self) -> &str {
        "file"
    }

    async fn fetch(&self) -> Result<SourceBatch, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let format = PayloadFormat::from_path(&self.path.to_string_lossy());
        Ok(SourceBatch {
            format,
            byte_size: bytes.len(),
            records: decode_payload(format, &bytes)?,
        })
    }
}

/// JSON or CSV rows served over HTTP.
pub struct FeedSource {
    url: String,
    http: Arc<HttpFetcher>,
}

impl FeedSource {
    pub fn new(url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl RowSource for FeedSource {
    fn source_id(&self) -> &str {
        "feed"
    }

    async fn fetch(&self) -> Result<SourceBatch, SourceError> {
        let resp = self.http.fetch_bytes(self.source_id(), &self.url).await?;
        let format = match resp.content_type.as_deref() {
            Some(ct) if ct.contains("csv") => PayloadFormat::Csv,
            Some(ct) if ct.contains("json") => PayloadFormat::Json,
            _ => PayloadFormat::from_path(&resp.final_url),
        };
        debug!(?format, bytes = resp.body.len(), "feed payload received");
        Ok(SourceBatch {
            format,
            byte_size: resp.body.len(),
            records: decode_payload(format, &resp.body)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ModelSourceConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_rows: usize,
    pub temperature: f64,
}

impl ModelSourceConfig {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a precise data extractor. Always output valid JSON.";

/// Extraction prompt asking for at most `max_rows` picks in the store's key layout.
pub fn build_prompt(max_rows: usize) -> String {
    format!(
        r#"Return up to {max_rows} UK- and Europe-listed stocks trading under £5 per share (converted to GBP)
with a fresh, positive catalyst in the past 24-48 hours that makes an intraday move likely.

Hard filters: last price < £5 in GBP; 30-day average volume >= 100,000 shares; no clearly
negative same-day news. Catalysts: earnings beats or raised guidance, regulatory approvals,
major contracts or partnerships, M&A, analyst upgrades, unusual volume on positive news.

Each element must be an object with exactly these lower-case keys:
  "tradedatehour"    UTC hour snapshot, "YYYY-MM-DDTHH:00:00Z"
  "ticker"           e.g. "ABC.L"
  "exchange"         e.g. "LSE", "AIM", "XETRA", "EPA"
  "stockname"        full company name
  "sector"           short industry label
  "lastgbp"          last price in GBP
  "gappct"           open gap in percent
  "relvol"           today's volume / 30-day average
  "avgvol30d"        integer shares
  "range52wpos"      0 = 52-week low, 1 = 52-week high
  "atrpct"           14-day ATR as percent of price
  "floatshares"      integer, or null if unknown
  "freefloatpct"     percent, or null if unknown
  "shortinterestpct" percent, or null if unknown
  "marketcapgbp"     integer GBP
  "conviction"       "High", "Medium" or "Watchlist"
  "catalyst"         one or two sentences with specifics
  "sourceurl"        primary source (RNS, regulator or company release)
  "newstimestamp"    UTC time of the news item, "YYYY-MM-DDTHH:MM:00Z"

Order by conviction (High first), then gappct desc, relvol desc, newstimestamp desc.
Output ONLY a JSON array, no prose or markdown. If nothing qualifies, output []."#
    )
}

/// Rows produced by an OpenAI-compatible chat completion.
pub struct ModelSource {
    config: ModelSourceConfig,
    http: Arc<HttpFetcher>,
}

impl ModelSource {
    pub fn new(config: ModelSourceConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn request_body(&self) -> JsonValue {
        json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(self.config.max_rows)},
            ],
        })
    }
}

#[async_trait]
impl RowSource for ModelSource {
    fn source_id(&self) -> &str {
        "model"
    }

    fn model(&self) -> Option<&str> {
        Some(&self.config.model)
    }

    async fn fetch(&self) -> Result<SourceBatch, SourceError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post_json(
                self.source_id(),
                &url,
                Some(&self.config.api_key),
                &self.request_body(),
            )
            .await?;
        let completion: ChatCompletion = serde_json::from_slice(&resp.body)
            .map_err(|e| SourceError::Malformed(format!("unexpected chat completion shape: {e}")))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| SourceError::Malformed("chat completion has no content".to_string()))?;

        Ok(SourceBatch {
            format: PayloadFormat::Json,
            byte_size: content.len(),
            records: parse_model_completion(&content)?,
        })
    }
}
