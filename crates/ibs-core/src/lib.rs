//! Canonical stock-pick row model and column catalogue for IBS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ibs-core";

/// Table written to when no override is configured.
pub const DEFAULT_TABLE: &str = "intradaybullishstocks";

/// How a raw value is coerced into a canonical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Timestamp floored to the start of its UTC hour.
    HourBucket,
    Timestamp,
    Text,
    Decimal,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Lower-case column name in the target relation.
    pub store_name: &'static str,
    /// Additional lower-case raw keys accepted for this column.
    pub aliases: &'static [&'static str],
    pub kind: ColumnKind,
}

impl Column {
    const fn new(store_name: &'static str, aliases: &'static [&'static str], kind: ColumnKind) -> Self {
        Self {
            store_name,
            aliases,
            kind,
        }
    }

    /// Store name first, then aliases.
    pub fn accepted_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.store_name).chain(self.aliases.iter().copied())
    }

    pub fn is_key(&self) -> bool {
        KEY_COLUMNS.contains(&self.store_name)
    }

    pub fn is_essential(&self) -> bool {
        ESSENTIAL_COLUMNS.contains(&self.store_name)
    }
}

/// Canonical column set, in canonical order.
pub const COLUMNS: [Column; 19] = [
    Column::new("tradedatehour", &["trade_bucket"], ColumnKind::HourBucket),
    Column::new("ticker", &[], ColumnKind::Text),
    Column::new("exchange", &[], ColumnKind::Text),
    Column::new("stockname", &["name", "company", "company_name"], ColumnKind::Text),
    Column::new("sector", &[], ColumnKind::Text),
    Column::new("lastgbp", &["last_price_gbp"], ColumnKind::Decimal),
    Column::new("gappct", &["gap_pct"], ColumnKind::Decimal),
    Column::new("relvol", &["rel_volume"], ColumnKind::Decimal),
    Column::new("avgvol30d", &["avg_volume_30d"], ColumnKind::Integer),
    Column::new("range52wpos", &["range_52w_pos"], ColumnKind::Decimal),
    Column::new("atrpct", &["atr_pct"], ColumnKind::Decimal),
    Column::new("floatshares", &["float_shares"], ColumnKind::Integer),
    Column::new("freefloatpct", &["free_float_pct"], ColumnKind::Decimal),
    Column::new("shortinterestpct", &["short_interest_pct"], ColumnKind::Decimal),
    Column::new("marketcapgbp", &["market_cap_gbp"], ColumnKind::Integer),
    Column::new("conviction", &[], ColumnKind::Text),
    Column::new("catalyst", &[], ColumnKind::Text),
    Column::new("sourceurl", &["source_url"], ColumnKind::Text),
    Column::new("newstimestamp", &["news_timestamp"], ColumnKind::Timestamp),
];

/// Identity key of the target relation.
pub const KEY_COLUMNS: [&str; 2] = ["tradedatehour", "ticker"];

/// Columns that must be non-null for a row to be stored at all.
pub const ESSENTIAL_COLUMNS: [&str; 4] = ["tradedatehour", "ticker", "stockname", "sourceurl"];

pub fn column(store_name: &str) -> Option<&'static Column> {
    COLUMNS.iter().find(|c| c.store_name == store_name)
}

pub fn store_column_names() -> impl Iterator<Item = &'static str> {
    COLUMNS.iter().map(|c| c.store_name)
}

/// `(trade_bucket, ticker)` identity of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub trade_bucket: DateTime<Utc>,
    pub ticker: String,
}

/// Fully-typed, schema-complete stock pick ready for storage.
///
/// Serializes with the store column names, nulls included, so a serialized
/// row always replaces every non-key column on merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    #[serde(rename = "tradedatehour")]
    pub trade_bucket: DateTime<Utc>,
    pub ticker: String,
    pub exchange: Option<String>,
    #[serde(rename = "stockname")]
    pub name: String,
    pub sector: Option<String>,
    #[serde(rename = "lastgbp")]
    pub last_price_gbp: Option<f64>,
    #[serde(rename = "gappct")]
    pub gap_pct: Option<f64>,
    #[serde(rename = "relvol")]
    pub rel_volume: Option<f64>,
    #[serde(rename = "avgvol30d")]
    pub avg_volume_30d: Option<i64>,
    #[serde(rename = "range52wpos")]
    pub range_52w_pos: Option<f64>,
    #[serde(rename = "atrpct")]
    pub atr_pct: Option<f64>,
    #[serde(rename = "floatshares")]
    pub float_shares: Option<i64>,
    #[serde(rename = "freefloatpct")]
    pub free_float_pct: Option<f64>,
    #[serde(rename = "shortinterestpct")]
    pub short_interest_pct: Option<f64>,
    #[serde(rename = "marketcapgbp")]
    pub market_cap_gbp: Option<i64>,
    pub conviction: Option<String>,
    pub catalyst: Option<String>,
    #[serde(rename = "sourceurl")]
    pub source_url: String,
    #[serde(rename = "newstimestamp")]
    pub news_timestamp: Option<DateTime<Utc>>,
}

impl CanonicalRow {
    /// Row with only the essential fields set.
    pub fn essential(
        trade_bucket: DateTime<Utc>,
        ticker: impl Into<String>,
        name: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            trade_bucket,
            ticker: ticker.into(),
            exchange: None,
            name: name.into(),
            sector: None,
            last_price_gbp: None,
            gap_pct: None,
            rel_volume: None,
            avg_volume_30d: None,
            range_52w_pos: None,
            atr_pct: None,
            float_shares: None,
            free_float_pct: None,
            short_interest_pct: None,
            market_cap_gbp: None,
            conviction: None,
            catalyst: None,
            source_url: source_url.into(),
            news_timestamp: None,
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey {
            trade_bucket: self.trade_bucket,
            ticker: self.ticker.clone(),
        }
    }
}
