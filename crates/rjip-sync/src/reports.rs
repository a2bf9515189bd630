//! Operator reports written under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use rjip_core::CanonicalListing;
use rjip_storage::sha256_hex;
use serde::Serialize;
use tokio::fs;

use crate::RunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn write_reports(
    workspace_root: &Path,
    summary: &RunSummary,
    listings: &[CanonicalListing],
) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), summary_json)
        .await
        .context("writing summary.json")?;

    fs::write(reports_dir.join("run_brief.md"), render_brief(summary))
        .await
        .context("writing run_brief.md")?;

    export_listing_snapshot(&reports_dir, summary, listings).await?;
    Ok(reports_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mode = if summary.dry_run { "dry run" } else { "live" };
    let totals = &summary.totals;

    let mut lines = vec![
        "# RJIP Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Mode: {mode}"),
        format!("- Status: {:?}", summary.status),
        String::new(),
        "## Totals".to_string(),
        format!("- fetched: {}", totals.total_fetched),
        format!("- fresh: {}", totals.total_fresh),
        format!("- stale filtered: {}", totals.stale_filtered_total),
        format!("- after source dedupe: {}", totals.total_after_source_dedupe),
        format!("- after global dedupe: {}", totals.total_after_global_dedupe),
        format!("- cross-source removed: {}", totals.cross_source_removed),
        format!("- ratio: {:.3}", totals.ratio),
    ];

    if let Some(persistence) = &summary.persistence {
        lines.push(format!(
            "- persisted: {} rows in {} chunks",
            persistence.written, persistence.chunks
        ));
    }
    if let Some(err) = &summary.persistence_error {
        lines.push(format!("- persistence error: {err}"));
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    lines.push("| source | fetched | fresh | unique | stale | status |".to_string());
    lines.push("|---|---|---|---|---|---|".to_string());
    for source in &summary.sources {
        let status = match (&source.error, &source.page_error) {
            (Some(err), _) => format!("error: {err}"),
            (None, Some(page_err)) => format!("partial: {page_err}"),
            (None, None) => "ok".to_string(),
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            source.source_id, source.fetched, source.fresh, source.unique, source.stale_filtered, status
        ));
    }

    if !summary.skipped_sources.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped".to_string());
        for skipped in &summary.skipped_sources {
            lines.push(format!(
                "- {}: {}",
                skipped.source_id,
                skipped.reason.as_deref().unwrap_or("inactive")
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

async fn export_listing_snapshot(
    reports_dir: &Path,
    summary: &RunSummary,
    listings: &[CanonicalListing],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    write_listings_parquet(&listings_path, listings)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files: vec![manifest_entry(
            "listings",
            reports_dir,
            &listings_path,
            listings.len(),
        )?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_column(
    listings: &[CanonicalListing],
    column: impl Fn(&CanonicalListing) -> &str,
) -> StringArray {
    StringArray::from(listings.iter().map(|l| Some(column(l))).collect::<Vec<_>>())
}

fn write_listings_parquet(path: &Path, listings: &[CanonicalListing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("contract_type", DataType::Utf8, false),
        ArrowField::new("remote_type", DataType::Utf8, false),
        ArrowField::new("experience_level", DataType::Utf8, true),
        ArrowField::new("posted_at", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("currency", DataType::Utf8, true),
        ArrowField::new("salary_min_eur", DataType::Float64, true),
        ArrowField::new("salary_max_eur", DataType::Float64, true),
        ArrowField::new("is_remote", DataType::Boolean, false),
    ]));

    let experience = StringArray::from(
        listings
            .iter()
            .map(|l| l.experience_level.map(|e| e.as_str()))
            .collect::<Vec<_>>(),
    );
    let posted_at = StringArray::from(
        listings
            .iter()
            .map(|l| l.posted_at.map(|at| at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let currency = StringArray::from(
        listings
            .iter()
            .map(|l| l.currency.as_deref())
            .collect::<Vec<_>>(),
    );
    let min_eur = Float64Array::from(listings.iter().map(|l| l.salary_min_eur).collect::<Vec<_>>());
    let max_eur = Float64Array::from(listings.iter().map(|l| l.salary_max_eur).collect::<Vec<_>>());
    let remote = BooleanArray::from(listings.iter().map(|l| l.is_remote).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text_column(listings, |l| l.source_id.as_str())),
            Arc::new(text_column(listings, |l| l.external_id.as_str())),
            Arc::new(text_column(listings, |l| l.title.as_str())),
            Arc::new(text_column(listings, |l| l.company.as_str())),
            Arc::new(text_column(listings, |l| l.contract_type.as_str())),
            Arc::new(text_column(listings, |l| l.remote_type.as_str())),
            Arc::new(experience),
            Arc::new(posted_at),
            Arc::new(text_column(listings, |l| l.url.as_str())),
            Arc::new(currency),
            Arc::new(min_eur),
            Arc::new(max_eur),
            Arc::new(remote),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
