//! Pipeline orchestration: extract both sources, normalize, merge, load, report.

pub mod merge;
pub mod normalize;

pub use merge::{merge, merge_and_load, PipelineError};
pub use normalize::{normalize, NormalizedSource};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use salesmerge_adapters::{
    BatchFileExtractor, CatalogApiExtractor, ExtractContext, Extraction, ExtractionError,
    SourceExtractor,
};
use salesmerge_core::{CanonicalSaleRow, LoadReport, SourceFailure, SourceTag, MASTER_SALES_TABLE};
use salesmerge_storage::{
    sha256_hex, validate_table_name, write_file_atomically, ArtifactStore, HttpClientConfig,
    HttpFetcher, MasterSalesStore, SalesTableSink,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "salesmerge-sync";

const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_path: PathBuf,
    pub catalog_url: String,
    pub database_path: PathBuf,
    pub table: String,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_path: PathBuf::from("online_sales.csv"),
            catalog_url: "https://fakestoreapi.com/products".to_string(),
            database_path: PathBuf::from("sales_data.db"),
            table: MASTER_SALES_TABLE.to_string(),
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            user_agent: "salesmerge/0.1".to_string(),
            http_timeout_secs: 20,
            archive_enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_path: std::env::var("SALES_BATCH_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.batch_path),
            catalog_url: std::env::var("SALES_CATALOG_URL").unwrap_or(defaults.catalog_url),
            database_path: std::env::var("SALES_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            table: std::env::var("SALES_TABLE").unwrap_or(defaults.table),
            artifacts_dir: std::env::var("SALES_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            reports_dir: std::env::var("SALES_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            user_agent: std::env::var("SALES_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("SALES_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            archive_enabled: std::env::var("SALES_ARCHIVE_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.archive_enabled),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedArtifact {
    pub source: SourceTag,
    pub origin: String,
    pub content_hash: String,
    pub path: String,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: LoadReport,
    pub artifacts: Vec<ArchivedArtifact>,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// One extract → normalize → merge → load pass. Holds no state between runs.
pub struct SalesPipeline {
    table: String,
    batch: Box<dyn SourceExtractor>,
    catalog: Box<dyn SourceExtractor>,
    sink: Arc<dyn SalesTableSink>,
    artifact_store: Option<ArtifactStore>,
    reports_dir: Option<PathBuf>,
}

impl SalesPipeline {
    pub fn new(
        table: impl Into<String>,
        batch: Box<dyn SourceExtractor>,
        catalog: Box<dyn SourceExtractor>,
        sink: Arc<dyn SalesTableSink>,
    ) -> Self {
        Self {
            table: table.into(),
            batch,
            catalog,
            sink,
            artifact_store: None,
            reports_dir: None,
        }
    }

    pub fn from_config(config: &PipelineConfig, sink: Arc<dyn SalesTableSink>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let pipeline = Self::new(
            config.table.clone(),
            Box::new(BatchFileExtractor::new(config.batch_path.clone())),
            Box::new(CatalogApiExtractor::new(config.catalog_url.clone(), http)),
            sink,
        )
        .with_reports_dir(config.reports_dir.clone());

        Ok(if config.archive_enabled {
            pipeline.with_artifact_store(ArtifactStore::new(config.artifacts_dir.clone()))
        } else {
            pipeline
        })
    }

    pub fn with_artifact_store(mut self, store: ArtifactStore) -> Self {
        self.artifact_store = Some(store);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let ctx = ExtractContext {
            run_id,
            fetched_at: started_at,
        };
        info!(table = %self.table, "starting pipeline run");

        // independent sources; merge waits for both
        let (batch, catalog) = tokio::join!(self.batch.extract(&ctx), self.catalog.extract(&ctx));

        let mut artifacts = Vec::new();
        let batch = self
            .settle(self.batch.source(), batch, &ctx, &mut artifacts)
            .await;
        let catalog = self
            .settle(self.catalog.source(), catalog, &ctx, &mut artifacts)
            .await;

        let (report, rows) =
            merge::merge_and_load_rows(batch, catalog, self.sink.as_ref(), &self.table)
                .await
                .inspect_err(|err| warn!(error = %err, "pipeline run failed"))?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            report,
            artifacts,
            reports_dir: None,
            parquet_manifest: None,
        };

        if let Some(root) = &self.reports_dir {
            match write_run_reports(root, &summary, &rows).await {
                Ok((run_dir, manifest)) => {
                    summary.reports_dir = Some(run_dir.display().to_string());
                    summary.parquet_manifest = Some(manifest.display().to_string());
                }
                Err(err) => warn!(error = %format!("{err:#}"), "writing run reports failed; the load is already committed"),
            }
        }

        info!(
            rows = summary.report.total_rows_loaded,
            rejected = summary.report.row_errors.len(),
            failed_sources = summary.report.source_failures.len(),
            "pipeline run complete"
        );
        Ok(summary)
    }

    /// Turns one extractor's result into normalized rows, archiving the raw bytes on the way.
    async fn settle(
        &self,
        source: SourceTag,
        result: Result<Extraction, ExtractionError>,
        ctx: &ExtractContext,
        artifacts: &mut Vec<ArchivedArtifact>,
    ) -> NormalizedSource {
        let extraction = match result {
            Ok(extraction) => extraction,
            Err(err) => {
                warn!(%source, kind = err.kind(), error = %err, "extraction failed; source contributes no rows");
                return NormalizedSource::failed(SourceFailure {
                    source,
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
            }
        };

        if let Some(store) = &self.artifact_store {
            match store
                .store_bytes(ctx.fetched_at, source, extraction.extension, &extraction.raw_bytes)
                .await
            {
                Ok(stored) => artifacts.push(ArchivedArtifact {
                    source,
                    origin: extraction.origin.clone(),
                    content_hash: stored.content_hash,
                    path: stored.absolute_path.display().to_string(),
                    deduplicated: stored.deduplicated,
                }),
                Err(err) => warn!(%source, error = %format!("{err:#}"), "archiving raw artifact failed"),
            }
        }

        let normalized = normalize(&extraction.rows);
        for row_error in &normalized.row_errors {
            warn!(
                %source,
                position = row_error.position,
                record_id = ?row_error.record_id,
                error = %row_error.kind,
                "rejected row"
            );
        }
        info!(
            %source,
            extracted = normalized.extracted,
            normalized = normalized.rows.len(),
            rejected = normalized.row_errors.len(),
            "normalized source"
        );
        normalized
    }
}

/// Opens the destination store named by `config`, runs once, and logs a preview of the table.
pub async fn run_pipeline_once(config: &PipelineConfig) -> Result<RunSummary> {
    validate_table_name(&config.table)?;
    let store = MasterSalesStore::open(&config.database_path)
        .await
        .map_err(|source| PipelineError::LoadFailed {
            table: config.table.clone(),
            source,
        })?;
    let store = Arc::new(store);
    let pipeline = SalesPipeline::from_config(config, store.clone())?;
    let result = pipeline.run_once().await;

    if result.is_ok() {
        match store.fetch_rows(&config.table, Some(PREVIEW_ROWS)).await {
            Ok(preview) => {
                for row in preview {
                    info!(
                        record_id = %row.record_id,
                        product_name = %row.product_name,
                        unit_price = %row.unit_price,
                        quantity = row.quantity,
                        total_sale_value = %row.total_sale_value,
                        source = %row.source,
                        "preview"
                    );
                }
            }
            Err(err) => warn!(error = %err, "reading table preview failed"),
        }
    }
    store.close().await;
    Ok(result?)
}

pub async fn run_pipeline_once_from_env() -> Result<RunSummary> {
    run_pipeline_once(&PipelineConfig::from_env()).await
}

async fn write_run_reports(
    root: &Path,
    summary: &RunSummary,
    rows: &[CanonicalSaleRow],
) -> Result<(PathBuf, PathBuf)> {
    let run_dir = root.join(summary.run_id.to_string());

    let json = serde_json::to_vec_pretty(summary).context("serializing load report")?;
    write_file_atomically(&run_dir.join("load_report.json"), &json).await?;
    write_file_atomically(
        &run_dir.join("run_summary.md"),
        render_run_summary(summary).as_bytes(),
    )
    .await?;

    let manifest = export_parquet_snapshot(&run_dir, &summary.report.table, rows).await?;
    Ok((run_dir, manifest))
}

pub fn render_run_summary(summary: &RunSummary) -> String {
    let report = &summary.report;
    let mut lines = vec![
        "# Sales Merge Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Table: `{}`", report.table),
        format!("- Rows loaded: {}", report.total_rows_loaded),
        String::new(),
        "## Sources".to_string(),
    ];
    for counts in &report.sources {
        lines.push(format!(
            "- {}: extracted {}, normalized {}, rejected {}",
            counts.source, counts.extracted, counts.normalized, counts.rejected
        ));
    }

    if !report.source_failures.is_empty() {
        lines.push(String::new());
        lines.push("## Source Failures".to_string());
        for failure in &report.source_failures {
            lines.push(format!("- {} ({}): {}", failure.source, failure.kind, failure.message));
        }
    }

    if !report.row_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Rejected Rows".to_string());
        lines.extend(report.row_errors.iter().map(|e| format!("- {e}")));
    }

    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshot(
    run_dir: &Path,
    table: &str,
    rows: &[CanonicalSaleRow],
) -> Result<PathBuf> {
    let relative = PathBuf::from("snapshots").join(format!("{table}.parquet"));
    let bytes = encode_parquet(rows)?;
    write_file_atomically(&run_dir.join(&relative), &bytes).await?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![SnapshotManifestFile {
            name: table.to_string(),
            path: relative.display().to_string(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            rows: rows.len(),
        }],
    };
    let manifest_path = run_dir.join("snapshots").join("manifest.json");
    let json = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_file_atomically(&manifest_path, &json).await?;
    Ok(manifest_path)
}

fn encode_parquet(rows: &[CanonicalSaleRow]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("product_name", DataType::Utf8, false),
        ArrowField::new("unit_price", DataType::Utf8, false),
        ArrowField::new("quantity", DataType::UInt32, false),
        ArrowField::new("total_sale_value", DataType::Utf8, false),
        ArrowField::new("occurred_at", DataType::Utf8, true),
        ArrowField::new("source", DataType::Utf8, false),
    ]));

    let record_ids = StringArray::from(rows.iter().map(|r| Some(r.record_id.as_str())).collect::<Vec<_>>());
    let product_names = StringArray::from(
        rows.iter()
            .map(|r| Some(r.product_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let unit_prices = StringArray::from(rows.iter().map(|r| Some(r.unit_price.to_string())).collect::<Vec<_>>());
    let quantities = UInt32Array::from(rows.iter().map(|r| r.quantity).collect::<Vec<_>>());
    let totals = StringArray::from(
        rows.iter()
            .map(|r| Some(r.total_sale_value.to_string()))
            .collect::<Vec<_>>(),
    );
    let occurred = StringArray::from(
        rows.iter()
            .map(|r| r.occurred_at.map(|ts| ts.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let sources = StringArray::from(rows.iter().map(|r| Some(r.source.as_str())).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(record_ids),
            Arc::new(product_names),
            Arc::new(unit_prices),
            Arc::new(quantities),
            Arc::new(totals),
            Arc::new(occurred),
            Arc::new(sources),
        ],
    )
    .context("building master_sales record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use salesmerge_core::{RowError, RowErrorKind, SourceCounts};
    use std::str::FromStr;

    fn summary() -> RunSummary {
        let started_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        RunSummary {
            run_id: Uuid::nil(),
            started_at,
            finished_at: started_at,
            report: LoadReport {
                table: "master_sales".into(),
                sources: vec![
                    SourceCounts {
                        source: SourceTag::Batch,
                        extracted: 3,
                        normalized: 2,
                        rejected: 1,
                    },
                    SourceCounts {
                        source: SourceTag::Catalog,
                        extracted: 0,
                        normalized: 0,
                        rejected: 0,
                    },
                ],
                total_rows_loaded: 2,
                row_errors: vec![RowError {
                    source: SourceTag::Batch,
                    position: 4,
                    record_id: Some("O5".into()),
                    kind: RowErrorKind::coercion("price", "abc", "decimal"),
                }],
                source_failures: vec![SourceFailure {
                    source: SourceTag::Catalog,
                    kind: "network_failure".into(),
                    message: "http status 503".into(),
                }],
            },
            artifacts: vec![],
            reports_dir: None,
            parquet_manifest: None,
        }
    }

    #[test]
    fn run_summary_lists_sources_failures_and_rejections() {
        let text = render_run_summary(&summary());
        assert!(text.starts_with("# Sales Merge Run"));
        assert!(text.contains("- Rows loaded: 2"));
        assert!(text.contains("- BATCH: extracted 3, normalized 2, rejected 1"));
        assert!(text.contains("- CATALOG (network_failure): http status 503"));
        assert!(text.contains("- BATCH row 4 (O5): field `price` value `abc` is not a valid decimal"));
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.table, "master_sales");
        assert_eq!(config.batch_path, PathBuf::from("online_sales.csv"));
        assert_eq!(config.database_path, PathBuf::from("sales_data.db"));
        assert_eq!(config.http_timeout_secs, 20);
        assert!(config.archive_enabled);
    }

    #[tokio::test]
    async fn parquet_snapshot_and_manifest_are_written() {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let dir = tempfile::tempdir().expect("tempdir");
        let rows = vec![
            CanonicalSaleRow::new("O1", "Widget", Decimal::from_str("9.99").unwrap(), 3, None, SourceTag::Batch)
                .unwrap(),
            CanonicalSaleRow::new("5", "Gadget", Decimal::from_str("19.99").unwrap(), 1, None, SourceTag::Catalog)
                .unwrap(),
        ];

        let manifest_path = export_parquet_snapshot(dir.path(), "master_sales", &rows)
            .await
            .expect("export");

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["rows"], 2);
        assert_eq!(manifest["files"][0]["path"], "snapshots/master_sales.parquet");

        let parquet_path = dir.path().join("snapshots").join("master_sales.parquet");
        let bytes = std::fs::read(&parquet_path).unwrap();
        assert_eq!(manifest["files"][0]["sha256"], sha256_hex(&bytes));
        let reader = SerializedFileReader::new(std::fs::File::open(&parquet_path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }
}
