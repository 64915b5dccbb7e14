//! Schema normalizer: maps each source's raw rows onto [`CanonicalSaleRow`].
//!
//! Every row is handled on its own. A row that cannot be coerced becomes a
//! [`RowError`] and the rest of the batch carries on.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use salesmerge_adapters::BATCH_FIELDS;
use salesmerge_core::{
    CanonicalSaleRow, RawBatchRecord, RawCatalogRecord, RawRows, RowError, RowErrorKind,
    SourceCounts, SourceFailure, SourceTag,
};
use serde_json::{Map, Value as JsonValue};

const MAX_SNIPPET_CHARS: usize = 64;

const DATE_TIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Canonical rows and rejections for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSource {
    pub source: SourceTag,
    pub extracted: usize,
    pub rows: Vec<CanonicalSaleRow>,
    pub row_errors: Vec<RowError>,
    pub extraction_failure: Option<SourceFailure>,
}

impl NormalizedSource {
    pub fn empty(source: SourceTag) -> Self {
        Self {
            source,
            extracted: 0,
            rows: Vec::new(),
            row_errors: Vec::new(),
            extraction_failure: None,
        }
    }

    /// A source that contributed nothing because extraction failed.
    pub fn failed(failure: SourceFailure) -> Self {
        let source = failure.source;
        Self {
            extraction_failure: Some(failure),
            ..Self::empty(source)
        }
    }

    pub fn counts(&self) -> SourceCounts {
        SourceCounts {
            source: self.source,
            extracted: self.extracted,
            normalized: self.rows.len(),
            rejected: self.row_errors.len(),
        }
    }
}

struct Rejection {
    record_id: Option<String>,
    kind: RowErrorKind,
}

impl Rejection {
    fn anonymous(kind: RowErrorKind) -> Self {
        Self { record_id: None, kind }
    }
}

/// Normalizes one source's rows. The union tag picks the field mapping and is
/// stamped onto every output row, whatever the raw row claims.
pub fn normalize(raw_rows: &RawRows) -> NormalizedSource {
    match raw_rows {
        RawRows::Batch(rows) => collect(
            SourceTag::Batch,
            rows.iter().map(|raw| (raw.line, normalize_batch_row(raw))),
        ),
        RawRows::Catalog(rows) => collect(
            SourceTag::Catalog,
            rows.iter().map(|raw| (raw.position, normalize_catalog_row(raw))),
        ),
    }
}

fn collect(
    source: SourceTag,
    results: impl Iterator<Item = (usize, Result<CanonicalSaleRow, Rejection>)>,
) -> NormalizedSource {
    let mut normalized = NormalizedSource::empty(source);
    for (position, result) in results {
        normalized.extracted += 1;
        match result {
            Ok(row) => normalized.rows.push(row),
            Err(rejection) => normalized.row_errors.push(RowError {
                source,
                position,
                record_id: rejection.record_id,
                kind: rejection.kind,
            }),
        }
    }
    normalized
}

// batch: order_id -> record_id, item -> product_name, price -> unit_price, qty -> quantity, date -> occurred_at
fn normalize_batch_row(raw: &RawBatchRecord) -> Result<CanonicalSaleRow, Rejection> {
    if let Some(field) = raw.undecodable.iter().find(|f| BATCH_FIELDS.contains(&f.as_str())) {
        let record_id = if raw.is_undecodable("order_id") {
            None
        } else {
            required_text(raw.get("order_id"), "order_id").ok()
        };
        return Err(Rejection {
            record_id,
            kind: RowErrorKind::coercion(field, snippet(raw.get(field).unwrap_or_default()), "UTF-8 text"),
        });
    }

    let record_id = required_text(raw.get("order_id"), "order_id").map_err(Rejection::anonymous)?;
    let reject = |kind| Rejection {
        record_id: Some(record_id.clone()),
        kind,
    };

    let product_name = required_text(raw.get("item"), "item").map_err(reject)?;
    let unit_price = match raw.get("price").map(str::trim) {
        None | Some("") => Err(RowErrorKind::missing("price")),
        Some(text) => parse_price(text, "price"),
    }
    .map_err(reject)?;
    let quantity = parse_quantity(raw.get("qty"), "qty").map_err(reject)?;
    let occurred_at = parse_timestamp(raw.get("date"), "date").map_err(reject)?;

    CanonicalSaleRow::new(
        record_id.clone(),
        product_name,
        unit_price,
        quantity,
        occurred_at,
        SourceTag::Batch,
    )
    .ok_or_else(|| reject(total_overflow(unit_price, quantity)))
}

// catalog: id -> record_id, title -> product_name, price -> unit_price; quantity 1, no timestamp
fn normalize_catalog_row(raw: &RawCatalogRecord) -> Result<CanonicalSaleRow, Rejection> {
    let Some(object) = raw.value.as_object() else {
        return Err(Rejection::anonymous(RowErrorKind::coercion(
            "record",
            snippet(&raw.value.to_string()),
            "JSON object",
        )));
    };

    let record_id = catalog_id(object).map_err(Rejection::anonymous)?;
    let reject = |kind| Rejection {
        record_id: Some(record_id.clone()),
        kind,
    };

    let product_name = match object.get("title") {
        None | Some(JsonValue::Null) => Err(RowErrorKind::missing("title")),
        Some(JsonValue::String(text)) => required_text(Some(text.as_str()), "title"),
        Some(other) => Err(RowErrorKind::coercion("title", snippet(&other.to_string()), "string")),
    }
    .map_err(reject)?;
    let unit_price = match object.get("price") {
        None | Some(JsonValue::Null) => Err(RowErrorKind::missing("price")),
        Some(JsonValue::Number(n)) => parse_price(&n.to_string(), "price"),
        Some(JsonValue::String(text)) if text.trim().is_empty() => Err(RowErrorKind::missing("price")),
        Some(JsonValue::String(text)) => parse_price(text.trim(), "price"),
        Some(other) => Err(RowErrorKind::coercion("price", snippet(&other.to_string()), "decimal")),
    }
    .map_err(reject)?;

    CanonicalSaleRow::new(
        record_id.clone(),
        product_name,
        unit_price,
        1,
        None,
        SourceTag::Catalog,
    )
    .ok_or_else(|| reject(total_overflow(unit_price, 1)))
}

fn catalog_id(object: &Map<String, JsonValue>) -> Result<String, RowErrorKind> {
    match object.get("id") {
        None | Some(JsonValue::Null) => Err(RowErrorKind::missing("id")),
        Some(JsonValue::String(text)) => required_text(Some(text.as_str()), "id"),
        Some(JsonValue::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(other) => Err(RowErrorKind::coercion(
            "id",
            snippet(&other.to_string()),
            "string or integer identifier",
        )),
    }
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= MAX_SNIPPET_CHARS {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(MAX_SNIPPET_CHARS).collect();
        cut.push('…');
        cut
    }
}

/// Trimmed, non-empty text; blank counts as missing.
fn required_text(value: Option<&str>, field: &str) -> Result<String, RowErrorKind> {
    match value.map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(RowErrorKind::missing(field)),
    }
}

fn parse_decimal(text: &str, field: &str) -> Result<Decimal, RowErrorKind> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| RowErrorKind::coercion(field, snippet(text), "decimal"))
}

fn parse_price(text: &str, field: &str) -> Result<Decimal, RowErrorKind> {
    let price = parse_decimal(text, field)?;
    if price < Decimal::ZERO {
        return Err(RowErrorKind::negative(field, price));
    }
    // abs() also clears the sign of a parsed "-0.00"
    Ok(price.abs())
}

/// Blank or absent defaults to 1. Integral decimals such as `3.0` are accepted.
fn parse_quantity(value: Option<&str>, field: &str) -> Result<u32, RowErrorKind> {
    let text = match value.map(str::trim) {
        None | Some("") => return Ok(1),
        Some(text) => text,
    };
    let coercion = || RowErrorKind::coercion(field, snippet(text), "non-negative integer");

    let whole = match text.parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            let decimal = parse_decimal(text, field).map_err(|_| coercion())?;
            if !decimal.fract().is_zero() {
                return Err(coercion());
            }
            decimal.trunc().to_i64().ok_or_else(coercion)?
        }
    };
    if whole < 0 {
        return Err(RowErrorKind::negative(field, whole));
    }
    u32::try_from(whole).map_err(|_| coercion())
}

/// Blank or absent is null. Bare dates map to midnight UTC.
fn parse_timestamp(value: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>, RowErrorKind> {
    let text = match value.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(text) => text,
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Some(naive.and_utc()))
        .ok_or_else(|| RowErrorKind::coercion(field, snippet(text), "date or timestamp"))
}

fn total_overflow(unit_price: Decimal, quantity: u32) -> RowErrorKind {
    RowErrorKind::coercion(
        "total_sale_value",
        format!("{unit_price} x {quantity}"),
        "decimal in range",
    )
}
