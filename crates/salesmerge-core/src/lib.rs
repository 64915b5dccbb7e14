//! Core row model and provenance types for salesmerge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "salesmerge-core";

/// Default destination table for the merged rows.
pub const MASTER_SALES_TABLE: &str = "master_sales";

/// Provenance tag stamped on every canonical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceTag {
    Batch,
    Catalog,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Batch => "BATCH",
            SourceTag::Catalog => "CATALOG",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source tag `{0}`")]
pub struct UnknownSourceTag(pub String);

impl FromStr for SourceTag {
    type Err = UnknownSourceTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BATCH" => Ok(SourceTag::Batch),
            "CATALOG" => Ok(SourceTag::Catalog),
            other => Err(UnknownSourceTag(other.to_string())),
        }
    }
}

/// One row of the batch file, keyed by header name. Values are untrimmed cell text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBatchRecord {
    /// 1-based line number in the source file (the header is line 1).
    pub line: usize,
    pub fields: BTreeMap<String, String>,
    /// Fields whose bytes were not valid UTF-8. Their entry in `fields` is a lossy rendering.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub undecodable: BTreeSet<String>,
}

impl RawBatchRecord {
    pub fn new(line: usize, fields: BTreeMap<String, String>) -> Self {
        Self {
            line,
            fields,
            undecodable: BTreeSet::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_undecodable(&self, field: &str) -> bool {
        self.undecodable.contains(field)
    }
}

/// One element of the catalog collection, exactly as the endpoint returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCatalogRecord {
    /// 0-based index within the fetched collection.
    pub position: usize,
    pub value: JsonValue,
}

impl RawCatalogRecord {
    pub fn new(position: usize, value: JsonValue) -> Self {
        Self { position, value }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.value.as_object().and_then(|object| object.get(field))
    }
}

/// Extracted rows tagged by origin. The two shapes are never mixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawRows {
    Batch(Vec<RawBatchRecord>),
    Catalog(Vec<RawCatalogRecord>),
}

impl RawRows {
    pub fn empty(source: SourceTag) -> Self {
        match source {
            SourceTag::Batch => RawRows::Batch(Vec::new()),
            SourceTag::Catalog => RawRows::Catalog(Vec::new()),
        }
    }

    pub fn source(&self) -> SourceTag {
        match self {
            RawRows::Batch(_) => SourceTag::Batch,
            RawRows::Catalog(_) => SourceTag::Catalog,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawRows::Batch(rows) => rows.len(),
            RawRows::Catalog(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unified sale row. The only record shape that leaves the transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSaleRow {
    pub record_id: String,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub total_sale_value: Decimal,
    pub occurred_at: Option<DateTime<Utc>>,
    pub source: SourceTag,
}

impl CanonicalSaleRow {
    /// Builds a row with `total_sale_value` derived from price and quantity.
    ///
    /// Returns `None` when the product overflows the decimal range.
    pub fn new(
        record_id: impl Into<String>,
        product_name: impl Into<String>,
        unit_price: Decimal,
        quantity: u32,
        occurred_at: Option<DateTime<Utc>>,
        source: SourceTag,
    ) -> Option<Self> {
        let total_sale_value = total_sale_value(unit_price, quantity)?;
        Some(Self {
            record_id: record_id.into(),
            product_name: product_name.into(),
            unit_price,
            quantity,
            total_sale_value,
            occurred_at,
            source,
        })
    }
}

/// `unit_price * quantity`, or `None` on overflow.
pub fn total_sale_value(unit_price: Decimal, quantity: u32) -> Option<Decimal> {
    unit_price.checked_mul(Decimal::from(quantity))
}

/// Why a single raw row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowErrorKind {
    #[error("missing mandatory field `{field}`")]
    MissingField { field: String },
    #[error("field `{field}` value `{value}` is not a valid {expected}")]
    TypeCoercionFailure {
        field: String,
        value: String,
        expected: String,
    },
    #[error("field `{field}` has negative value `{value}`")]
    NegativeValue { field: String, value: String },
}

impl RowErrorKind {
    pub fn missing(field: &str) -> Self {
        RowErrorKind::MissingField {
            field: field.to_string(),
        }
    }

    pub fn coercion(field: &str, value: impl Into<String>, expected: &str) -> Self {
        RowErrorKind::TypeCoercionFailure {
            field: field.to_string(),
            value: value.into(),
            expected: expected.to_string(),
        }
    }

    pub fn negative(field: &str, value: impl ToString) -> Self {
        RowErrorKind::NegativeValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

/// A rejected row, with enough provenance to find it upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub source: SourceTag,
    /// CSV line number for batch rows, collection index for catalog rows.
    pub position: usize,
    pub record_id: Option<String>,
    #[serde(flatten)]
    pub kind: RowErrorKind,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} row {}", self.source, self.position)?;
        if let Some(record_id) = &self.record_id {
            write!(f, " ({record_id})")?;
        }
        write!(f, ": {}", self.kind)
    }
}

/// A source whose extraction failed outright for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: SourceTag,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub source: SourceTag,
    pub extracted: usize,
    pub normalized: usize,
    pub rejected: usize,
}

/// Outcome of one merge-and-load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub table: String,
    pub sources: Vec<SourceCounts>,
    pub total_rows_loaded: usize,
    pub row_errors: Vec<RowError>,
    pub source_failures: Vec<SourceFailure>,
}

impl LoadReport {
    pub fn counts_for(&self, source: SourceTag) -> Option<&SourceCounts> {
        self.sources.iter().find(|counts| counts.source == source)
    }

    pub fn has_warnings(&self) -> bool {
        !self.row_errors.is_empty() || !self.source_failures.is_empty()
    }
}
