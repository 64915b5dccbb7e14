//! Source extractors: the batch CSV file and the remote product catalog.
//!
//! Extractors only produce raw rows. No field is validated or coerced here;
//! that is the normalizer's job.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salesmerge_core::{RawBatchRecord, RawCatalogRecord, RawRows, SourceTag};
use salesmerge_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "salesmerge-adapters";

/// Batch file header fields the normalizer maps from.
pub const BATCH_FIELDS: [&str; 5] = ["order_id", "item", "price", "qty", "date"];

/// Envelope keys searched, in order, when the catalog returns an object.
pub const CATALOG_ENVELOPE_KEYS: [&str; 4] = ["items", "products", "data", "results"];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },
    #[error("reading {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("network failure fetching {url}: {source}")]
    NetworkFailure {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("could not parse {origin}: {message}")]
    ParseFailure { origin: String, message: String },
}

impl ExtractionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::FileNotFound { .. } => "file_not_found",
            ExtractionError::Unreadable { .. } => "unreadable",
            ExtractionError::NetworkFailure { .. } => "network_failure",
            ExtractionError::ParseFailure { .. } => "parse_failure",
        }
    }

    fn parse(origin: impl Into<String>, message: impl ToString) -> Self {
        ExtractionError::ParseFailure {
            origin: origin.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Raw rows plus the bytes they were parsed from, kept for the provenance archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub rows: RawRows,
    pub origin: String,
    pub extension: &'static str,
    pub raw_bytes: Vec<u8>,
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn source(&self) -> SourceTag;

    async fn extract(&self, ctx: &ExtractContext) -> Result<Extraction, ExtractionError>;
}

async fn read_source_file(path: &Path) -> Result<Vec<u8>, ExtractionError> {
    tokio::fs::read(path).await.map_err(|source| match source.kind() {
        ErrorKind::NotFound => ExtractionError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => ExtractionError::Unreadable {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// Reads the periodic batch export, a CSV file with a header row.
#[derive(Debug, Clone)]
pub struct BatchFileExtractor {
    path: PathBuf,
}

impl BatchFileExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceExtractor for BatchFileExtractor {
    fn source(&self) -> SourceTag {
        SourceTag::Batch
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Extraction, ExtractionError> {
        let origin = self.path.display().to_string();
        let raw_bytes = read_source_file(&self.path).await?;
        let rows = parse_batch_csv(&raw_bytes, &origin)?;
        info!(run_id = %ctx.run_id, origin = %origin, rows = rows.len(), "extracted batch file");
        Ok(Extraction {
            rows: RawRows::Batch(rows),
            origin,
            extension: "csv",
            raw_bytes,
        })
    }
}

fn normalize_header_name(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

/// Splits CSV bytes into raw records keyed by normalized header name.
///
/// Short records simply lack the trailing fields; a record the reader cannot
/// decode becomes an empty record so the normalizer reports it. Cells that are
/// not valid UTF-8 are flagged on the record rather than repaired.
pub fn parse_batch_csv(bytes: &[u8], origin: &str) -> Result<Vec<RawBatchRecord>, ExtractionError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader
        .byte_headers()
        .map_err(|e| ExtractionError::parse(origin, format!("reading header: {e}")))?
        .iter()
        .map(|h| {
            std::str::from_utf8(h)
                .map(normalize_header_name)
                .map_err(|e| ExtractionError::parse(origin, format!("header is not UTF-8: {e}")))
        })
        .collect::<Result<Vec<String>, _>>()?;
    if headers.iter().all(String::is_empty) {
        return Err(ExtractionError::parse(origin, "file has no header row"));
    }
    check_duplicate_headers(&headers, origin)?;

    let missing: Vec<&str> = BATCH_FIELDS
        .iter()
        .copied()
        .filter(|f| !headers.iter().any(|h| h == f))
        .collect();
    if !missing.is_empty() {
        warn!(origin, ?missing, "batch header lacks expected fields; affected rows will be rejected");
    }

    let mut records = Vec::new();
    for (idx, result) in reader.byte_records().enumerate() {
        // records start on line 2, after the header
        let fallback_line = idx + 2;
        match result {
            Ok(record) => {
                let line = record
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(fallback_line);
                let mut raw = RawBatchRecord::new(line, BTreeMap::new());
                for (name, value) in headers.iter().zip(record.iter()) {
                    if name.is_empty() {
                        continue;
                    }
                    let text = match std::str::from_utf8(value) {
                        Ok(text) => text.to_string(),
                        Err(_) => {
                            raw.undecodable.insert(name.clone());
                            String::from_utf8_lossy(value).into_owned()
                        }
                    };
                    raw.fields.insert(name.clone(), text);
                }
                if !raw.undecodable.is_empty() {
                    warn!(origin, line, fields = ?raw.undecodable, "batch record has cells that are not UTF-8");
                }
                records.push(raw);
            }
            Err(err) => {
                warn!(origin, line = fallback_line, error = %err, "unreadable batch record");
                records.push(RawBatchRecord::new(fallback_line, BTreeMap::new()));
            }
        }
    }
    Ok(records)
}

/// A repeated mapped column makes every row ambiguous; other repeats only lose the earlier cell.
fn check_duplicate_headers(headers: &[String], origin: &str) -> Result<(), ExtractionError> {
    let mut seen = BTreeSet::new();
    let mut repeated = BTreeSet::new();
    for name in headers.iter().filter(|h| !h.is_empty()) {
        if !seen.insert(name.as_str()) {
            repeated.insert(name.as_str());
        }
    }
    if let Some(field) = repeated.iter().find(|name| BATCH_FIELDS.contains(*name)) {
        return Err(ExtractionError::parse(
            origin,
            format!("header repeats column `{field}`"),
        ));
    }
    if !repeated.is_empty() {
        warn!(origin, ?repeated, "batch header repeats columns; the last cell of each is kept");
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum CatalogLocation {
    Http { url: String, fetcher: HttpFetcher },
    Fixture { path: PathBuf },
}

/// Pulls the product collection from the catalog endpoint.
///
/// A `file://` URL reads a captured response from disk instead.
#[derive(Debug, Clone)]
pub struct CatalogApiExtractor {
    location: CatalogLocation,
}

impl CatalogApiExtractor {
    pub fn new(url: impl Into<String>, fetcher: HttpFetcher) -> Self {
        let url = url.into();
        let location = match url.strip_prefix("file://") {
            Some(path) => CatalogLocation::Fixture {
                path: PathBuf::from(path),
            },
            None => CatalogLocation::Http { url, fetcher },
        };
        Self { location }
    }

    pub fn from_fixture(path: impl Into<PathBuf>) -> Self {
        Self {
            location: CatalogLocation::Fixture { path: path.into() },
        }
    }

    pub fn origin(&self) -> String {
        match &self.location {
            CatalogLocation::Http { url, .. } => url.clone(),
            CatalogLocation::Fixture { path } => format!("file://{}", path.display()),
        }
    }
}

#[async_trait]
impl SourceExtractor for CatalogApiExtractor {
    fn source(&self) -> SourceTag {
        SourceTag::Catalog
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Extraction, ExtractionError> {
        let origin = self.origin();
        let raw_bytes = match &self.location {
            CatalogLocation::Http { url, fetcher } => fetcher
                .fetch_bytes(ctx.run_id, SourceTag::Catalog, url)
                .await
                .map_err(|source| ExtractionError::NetworkFailure {
                    url: url.clone(),
                    source,
                })?,
            CatalogLocation::Fixture { path } => read_source_file(path).await?,
        };
        let rows = parse_catalog_json(&raw_bytes, &origin)?;
        info!(run_id = %ctx.run_id, origin = %origin, rows = rows.len(), "extracted catalog");
        Ok(Extraction {
            rows: RawRows::Catalog(rows),
            origin,
            extension: "json",
            raw_bytes,
        })
    }
}

/// Accepts a top-level JSON array, or an object wrapping the array under one
/// of [`CATALOG_ENVELOPE_KEYS`].
pub fn parse_catalog_json(bytes: &[u8], origin: &str) -> Result<Vec<RawCatalogRecord>, ExtractionError> {
    let document: JsonValue =
        serde_json::from_slice(bytes).map_err(|e| ExtractionError::parse(origin, e))?;

    let items = match document {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut object) => CATALOG_ENVELOPE_KEYS
            .iter()
            .find_map(|key| match object.remove(*key) {
                Some(JsonValue::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                ExtractionError::parse(
                    origin,
                    format!(
                        "expected a JSON array or an object with one of {}",
                        CATALOG_ENVELOPE_KEYS.join("/")
                    ),
                )
            })?,
        other => {
            return Err(ExtractionError::parse(
                origin,
                format!("expected a JSON collection, found {}", json_type_name(&other)),
            ))
        }
    };

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(position, value)| RawCatalogRecord::new(position, value))
        .collect())
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn ctx() -> ExtractContext {
        ExtractContext {
            run_id: Uuid::nil(),
            fetched_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn csv_rows_are_keyed_by_normalized_header() {
        let csv = "\u{feff}Order_ID, item ,price,qty,date\nO1,Widget,9.99,3,2024-01-01\nO2,Gizmo,4.50\n";
        let rows = parse_batch_csv(csv.as_bytes(), "test.csv").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[0].get("order_id"), Some("O1"));
        assert_eq!(rows[0].get("item"), Some("Widget"));
        assert_eq!(rows[0].get("date"), Some("2024-01-01"));
        assert_eq!(rows[1].line, 3);
        assert_eq!(rows[1].get("price"), Some("4.50"));
        assert_eq!(rows[1].get("qty"), None);
    }

    #[test]
    fn csv_keeps_quoted_commas_and_skips_blank_lines() {
        let csv = "order_id,item,price,qty,date\n\"O1\",\"Widget, large\",9.99,1,\n\nO2,Nut,0.10,100,2024-02-02\n";
        let rows = parse_batch_csv(csv.as_bytes(), "test.csv").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("item"), Some("Widget, large"));
        assert_eq!(rows[0].get("date"), Some(""));
        assert_eq!(rows[1].get("order_id"), Some("O2"));
    }

    #[test]
    fn non_utf8_cells_are_flagged_not_repaired() {
        let csv = b"order_id,item,price,qty,date\nO1,Wid\xff\xfeget,9.99,3,2024-01-01\nO2,Gizmo,4.50,2,\n";
        let rows = parse_batch_csv(csv, "test.csv").unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_undecodable("item"));
        assert!(!rows[0].is_undecodable("order_id"));
        assert!(rows[1].undecodable.is_empty());
        assert_eq!(rows[1].get("item"), Some("Gizmo"));
    }

    #[test]
    fn repeated_mapped_column_is_a_parse_failure() {
        let csv = "order_id,item,price,price,qty,date\nO1,Widget,9.99,1.00,3,2024-01-01\n";
        let err = parse_batch_csv(csv.as_bytes(), "test.csv").unwrap_err();
        assert_eq!(err.kind(), "parse_failure");
        assert!(err.to_string().contains("price"));
    }

    #[test]
    fn repeated_unmapped_column_is_tolerated() {
        let csv = "order_id,item,price,qty,date,note,note\nO1,Widget,9.99,3,2024-01-01,a,b\n";
        let rows = parse_batch_csv(csv.as_bytes(), "test.csv").unwrap();
        assert_eq!(rows[0].get("note"), Some("b"));
    }

    #[test]
    fn empty_csv_is_a_parse_failure() {
        let err = parse_batch_csv(b"", "empty.csv").unwrap_err();
        assert_eq!(err.kind(), "parse_failure");
    }

    #[test]
    fn catalog_accepts_bare_arrays_and_envelopes() {
        let bare = parse_catalog_json(br#"[{"id":1},{"id":2}]"#, "t").unwrap();
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[1].position, 1);
        assert_eq!(bare[1].get("id"), Some(&json!(2)));

        let wrapped = parse_catalog_json(br#"{"total":1,"products":[{"id":"a"}]}"#, "t").unwrap();
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].get("id"), Some(&json!("a")));
    }

    #[test]
    fn catalog_rejects_non_collections_and_invalid_json() {
        assert_eq!(parse_catalog_json(b"{\"x\":1}", "t").unwrap_err().kind(), "parse_failure");
        assert_eq!(parse_catalog_json(b"42", "t").unwrap_err().kind(), "parse_failure");
        assert_eq!(parse_catalog_json(b"<html>", "t").unwrap_err().kind(), "parse_failure");
    }

    #[tokio::test]
    async fn missing_batch_file_is_file_not_found() {
        let dir = tempdir().expect("tempdir");
        let extractor = BatchFileExtractor::new(dir.path().join("nope.csv"));
        let err = extractor.extract(&ctx()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn catalog_http_error_status_is_network_failure() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let fetcher = HttpFetcher::new(Default::default()).expect("fetcher");
        let extractor = CatalogApiExtractor::new(format!("http://{addr}/products"), fetcher);
        let err = extractor.extract(&ctx()).await.unwrap_err();

        assert_eq!(err.kind(), "network_failure");
        assert!(matches!(
            err,
            ExtractionError::NetworkFailure {
                source: FetchError::HttpStatus { status: 503, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn file_url_reads_catalog_fixture() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"[{"id":5,"title":"Gadget","price":19.99}]"#).unwrap();

        let fetcher = HttpFetcher::new(Default::default()).expect("fetcher");
        let extractor = CatalogApiExtractor::new(format!("file://{}", path.display()), fetcher);
        let extraction = extractor.extract(&ctx()).await.expect("extract");

        assert_eq!(extractor.source(), SourceTag::Catalog);
        assert_eq!(extraction.rows.source(), SourceTag::Catalog);
        assert_eq!(extraction.rows.len(), 1);
        assert_eq!(extraction.extension, "json");
    }
}
