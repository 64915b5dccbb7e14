use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use salesmerge_core::{CanonicalSaleRow, SourceTag};
use salesmerge_storage::MasterSalesStore;
use salesmerge_sync::{run_pipeline_once, PipelineConfig, PipelineError};
use tempfile::TempDir;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn config_for(dir: &TempDir, batch: PathBuf, catalog: PathBuf) -> PipelineConfig {
    PipelineConfig {
        batch_path: batch,
        catalog_url: format!("file://{}", catalog.display()),
        database_path: dir.path().join("sales_data.db"),
        artifacts_dir: dir.path().join("artifacts"),
        reports_dir: dir.path().join("reports"),
        ..PipelineConfig::default()
    }
}

fn fixture_config(dir: &TempDir) -> PipelineConfig {
    config_for(
        dir,
        fixtures_dir().join("online_sales.csv"),
        fixtures_dir().join("catalog_products.json"),
    )
}

async fn table_rows(config: &PipelineConfig) -> Vec<CanonicalSaleRow> {
    let store = MasterSalesStore::open(&config.database_path).await.expect("open store");
    let rows = store.fetch_rows(&config.table, None).await.expect("fetch rows");
    store.close().await;
    rows
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write input");
    path
}

#[tokio::test]
async fn fixtures_load_valid_rows_batch_first_and_report_rejections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fixture_config(&dir);

    let summary = run_pipeline_once(&config).await.expect("pipeline run");
    let report = &summary.report;

    assert_eq!(report.total_rows_loaded, 6);
    assert_eq!(report.row_errors.len(), 5);
    assert!(report.source_failures.is_empty());
    let batch = report.counts_for(SourceTag::Batch).unwrap();
    assert_eq!((batch.extracted, batch.normalized, batch.rejected), (7, 4, 3));
    let catalog = report.counts_for(SourceTag::Catalog).unwrap();
    assert_eq!((catalog.extracted, catalog.normalized, catalog.rejected), (4, 2, 2));

    let rows = table_rows(&config).await;
    let ids: Vec<_> = rows.iter().map(|r| (r.source, r.record_id.as_str())).collect();
    assert_eq!(
        ids,
        vec![
            (SourceTag::Batch, "O1"),
            (SourceTag::Batch, "O2"),
            (SourceTag::Batch, "O3"),
            (SourceTag::Batch, "O7"),
            (SourceTag::Catalog, "5"),
            (SourceTag::Catalog, "6"),
        ]
    );
    assert_eq!(rows[2].quantity, 1);
    assert_eq!(rows[3].occurred_at, None);
    for row in &rows {
        assert_eq!(row.total_sale_value, row.unit_price * Decimal::from(row.quantity));
    }
}

#[tokio::test]
async fn one_batch_row_and_one_catalog_row_load_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let batch = write(
        dir.path(),
        "batch.csv",
        "order_id,item,price,qty,date\nO1,Widget,9.99,3,2024-01-01\n",
    );
    let catalog = write(
        dir.path(),
        "catalog.json",
        r#"[{"id": "5", "title": "Gadget", "price": 19.99}]"#,
    );
    let config = config_for(&dir, batch, catalog);

    run_pipeline_once(&config).await.expect("pipeline run");

    let expected = vec![
        CanonicalSaleRow {
            record_id: "O1".into(),
            product_name: "Widget".into(),
            unit_price: Decimal::from_str("9.99").unwrap(),
            quantity: 3,
            total_sale_value: Decimal::from_str("29.97").unwrap(),
            occurred_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            source: SourceTag::Batch,
        },
        CanonicalSaleRow {
            record_id: "5".into(),
            product_name: "Gadget".into(),
            unit_price: Decimal::from_str("19.99").unwrap(),
            quantity: 1,
            total_sale_value: Decimal::from_str("19.99").unwrap(),
            occurred_at: None,
            source: SourceTag::Catalog,
        },
    ];
    assert_eq!(table_rows(&config).await, expected);
}

#[tokio::test]
async fn rerunning_on_same_inputs_leaves_identical_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fixture_config(&dir);

    run_pipeline_once(&config).await.expect("first run");
    let first = table_rows(&config).await;
    let second_summary = run_pipeline_once(&config).await.expect("second run");
    let second = table_rows(&config).await;

    assert_eq!(first, second);
    assert_eq!(second_summary.report.total_rows_loaded, 6);
}

#[tokio::test]
async fn empty_sources_fail_and_keep_previous_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fixture_config(&dir);
    run_pipeline_once(&config).await.expect("seed run");
    let before = table_rows(&config).await;

    let batch = write(dir.path(), "empty.csv", "order_id,item,price,qty,date\n");
    let catalog = write(dir.path(), "empty.json", "[]");
    let empty = config_for(&dir, batch, catalog);

    let err = run_pipeline_once(&empty).await.unwrap_err();
    let pipeline_err = err.downcast_ref::<PipelineError>().expect("pipeline error");
    assert!(matches!(pipeline_err, PipelineError::Empty { .. }));
    assert_eq!(pipeline_err.exit_code(), 2);
    assert_eq!(table_rows(&config).await, before);
}

#[tokio::test]
async fn missing_batch_file_still_loads_catalog_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(
        &dir,
        dir.path().join("does_not_exist.csv"),
        fixtures_dir().join("catalog_products.json"),
    );

    let summary = run_pipeline_once(&config).await.expect("pipeline run");

    assert_eq!(summary.report.total_rows_loaded, 2);
    assert_eq!(summary.report.source_failures.len(), 1);
    assert_eq!(summary.report.source_failures[0].source, SourceTag::Batch);
    assert_eq!(summary.report.source_failures[0].kind, "file_not_found");
    let rows = table_rows(&config).await;
    assert!(rows.iter().all(|r| r.source == SourceTag::Catalog));
}

#[tokio::test]
async fn both_sources_failing_is_empty_with_both_failures_listed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_for(
        &dir,
        dir.path().join("missing.csv"),
        dir.path().join("missing.json"),
    );

    let err = run_pipeline_once(&config).await.unwrap_err();
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::Empty { source_failures, .. }) => assert_eq!(source_failures.len(), 2),
        other => panic!("expected empty pipeline error, got {other:?}"),
    }
}

#[tokio::test]
async fn run_writes_reports_snapshot_and_archive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fixture_config(&dir);

    let summary = run_pipeline_once(&config).await.expect("pipeline run");

    let run_dir = PathBuf::from(summary.reports_dir.as_deref().expect("reports dir"));
    assert!(run_dir.starts_with(&config.reports_dir));
    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("load_report.json")).unwrap()).unwrap();
    assert_eq!(report["report"]["total_rows_loaded"], 6);
    assert_eq!(report["report"]["row_errors"].as_array().unwrap().len(), 5);

    let markdown = std::fs::read_to_string(run_dir.join("run_summary.md")).unwrap();
    assert!(markdown.contains("## Rejected Rows"));

    assert!(run_dir.join("snapshots").join("master_sales.parquet").exists());
    assert!(PathBuf::from(summary.parquet_manifest.unwrap()).exists());

    assert_eq!(summary.artifacts.len(), 2);
    for artifact in &summary.artifacts {
        assert!(Path::new(&artifact.path).starts_with(&config.artifacts_dir));
        assert!(Path::new(&artifact.path).exists());
    }
}

#[tokio::test]
async fn catalog_outage_still_loads_batch_rows() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            let _ = socket.shutdown().await;
        }
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let config = PipelineConfig {
        catalog_url: format!("http://{addr}/products"),
        ..fixture_config(&dir)
    };

    let summary = run_pipeline_once(&config).await.expect("pipeline run");

    assert_eq!(summary.report.total_rows_loaded, 4);
    assert_eq!(summary.report.source_failures.len(), 1);
    assert_eq!(summary.report.source_failures[0].source, SourceTag::Catalog);
    assert_eq!(summary.report.source_failures[0].kind, "network_failure");
    let rows = table_rows(&config).await;
    assert!(rows.iter().all(|r| r.source == SourceTag::Batch));
}

#[tokio::test]
async fn unopenable_database_is_load_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PipelineConfig {
        database_path: dir.path().join("no_such_dir").join("sales_data.db"),
        ..fixture_config(&dir)
    };

    let err = run_pipeline_once(&config).await.unwrap_err();
    let pipeline_err = err.downcast_ref::<PipelineError>().expect("pipeline error");
    assert!(matches!(pipeline_err, PipelineError::LoadFailed { .. }));
    assert_eq!(pipeline_err.exit_code(), 3);
}
