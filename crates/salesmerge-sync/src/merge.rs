//! Merge & load: concatenate both normalized sources and fully replace the destination table.

use salesmerge_core::{CanonicalSaleRow, LoadReport, SourceFailure, SourceTag};
use salesmerge_storage::{SalesTableSink, StoreError};
use thiserror::Error;
use tracing::info;

use crate::normalize::NormalizedSource;

/// Run-fatal failures. Row and source errors never end up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no rows to load: both sources produced zero valid rows ({rejected_rows} rejected, {} source failures)", .source_failures.len())]
    Empty {
        rejected_rows: usize,
        source_failures: Vec<SourceFailure>,
    },
    #[error("loading table `{table}` failed; previous contents kept: {source}")]
    LoadFailed {
        table: String,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Empty { .. } => 2,
            PipelineError::LoadFailed { .. } => 3,
        }
    }
}

/// Batch rows first, then catalog rows, each in its original order. No dedup.
pub fn merge(batch: Vec<CanonicalSaleRow>, catalog: Vec<CanonicalSaleRow>) -> Vec<CanonicalSaleRow> {
    let mut merged = batch;
    merged.extend(catalog);
    merged
}

/// Merges both sources and replaces `table` with the result.
pub async fn merge_and_load(
    batch: NormalizedSource,
    catalog: NormalizedSource,
    sink: &dyn SalesTableSink,
    table: &str,
) -> Result<LoadReport, PipelineError> {
    merge_and_load_rows(batch, catalog, sink, table)
        .await
        .map(|(report, _rows)| report)
}

/// As [`merge_and_load`], also handing back the rows that were written.
pub(crate) async fn merge_and_load_rows(
    batch: NormalizedSource,
    catalog: NormalizedSource,
    sink: &dyn SalesTableSink,
    table: &str,
) -> Result<(LoadReport, Vec<CanonicalSaleRow>), PipelineError> {
    debug_assert_eq!(batch.source, SourceTag::Batch);
    debug_assert_eq!(catalog.source, SourceTag::Catalog);

    let sources = vec![batch.counts(), catalog.counts()];
    let mut row_errors = batch.row_errors;
    row_errors.extend(catalog.row_errors);
    let source_failures: Vec<SourceFailure> = batch
        .extraction_failure
        .into_iter()
        .chain(catalog.extraction_failure)
        .collect();

    let merged = merge(batch.rows, catalog.rows);
    if merged.is_empty() {
        return Err(PipelineError::Empty {
            rejected_rows: row_errors.len(),
            source_failures,
        });
    }

    let loaded = sink
        .replace_table(table, &merged)
        .await
        .map_err(|source| PipelineError::LoadFailed {
            table: table.to_string(),
            source,
        })?;
    info!(table, rows = loaded, rejected = row_errors.len(), "merged and loaded");

    let report = LoadReport {
        table: table.to_string(),
        sources,
        total_rows_loaded: loaded,
        row_errors,
        source_failures,
    };
    Ok((report, merged))
}
