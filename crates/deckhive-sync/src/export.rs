//! Flattens stored records into one row per entry, skipping records the
//! export tracker has already seen in their current state.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use deckhive_core::Record;
use deckhive_storage::{join_key, BlobStore};
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::executor::{deserialize_record, Executor, ExecutorError, Flow, TaskError};
use crate::pipeline::collections_prefix;
use crate::stats::ExtractStats;
use crate::trackers::ExportTracker;

pub const EXPORTS_DIR: &str = "exports";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ExportRow {
    pub deck_id: String,
    pub source: String,
    pub url: String,
    pub group: String,
    pub name: String,
    pub count: u32,
    pub format: Option<String>,
    pub archetype: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub run_id: Uuid,
    pub exported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows: usize,
    /// Blob key of the JSONL file; `None` when nothing changed.
    pub jsonl_key: Option<String>,
    pub parquet_path: Option<PathBuf>,
}

pub fn flatten_record(record: &Record) -> Vec<ExportRow> {
    record
        .groups
        .iter()
        .flat_map(|group| {
            group.entries.iter().map(move |entry| ExportRow {
                deck_id: record.id.clone(),
                source: record.source.clone(),
                url: record.url.clone(),
                group: group.name.clone(),
                name: entry.name.clone(),
                count: entry.count,
                format: record.meta.format.clone(),
                archetype: record.meta.archetype.clone(),
                updated_at: record.freshness(),
                version: record.version,
            })
        })
        .collect()
}

pub struct ExportPass {
    config: SyncConfig,
    store: Arc<dyn BlobStore>,
    tracker: Arc<ExportTracker>,
}

impl ExportPass {
    pub fn new(config: SyncConfig, store: Arc<dyn BlobStore>) -> Self {
        let tracker = ExportTracker::new(Arc::clone(&store), &config.prefix);
        Self {
            config,
            store,
            tracker: Arc::new(tracker),
        }
    }

    pub fn tracker(&self) -> &ExportTracker {
        &self.tracker
    }

    /// Nothing is marked exported unless the run completes and its output
    /// has been written.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExportSummary> {
        let run_id = Uuid::new_v4();
        self.tracker.load().await.context("loading export tracker")?;

        let stats = Arc::new(ExtractStats::new());
        let executor = Executor::new(self.config.parallel)?.with_stats("export", Arc::clone(&stats));
        let rows: Arc<Mutex<Vec<ExportRow>>> = Arc::default();
        let exported_keys: Arc<Mutex<Vec<String>>> = Arc::default();
        let skipped = Arc::new(AtomicUsize::new(0));

        let prefix = collections_prefix(&self.config.prefix);
        let handler = {
            let store = Arc::clone(&self.store);
            let tracker = Arc::clone(&self.tracker);
            let rows = Arc::clone(&rows);
            let exported_keys = Arc::clone(&exported_keys);
            let skipped = Arc::clone(&skipped);
            move |key: String, record: Record| {
                let store = Arc::clone(&store);
                let tracker = Arc::clone(&tracker);
                let rows = Arc::clone(&rows);
                let exported_keys = Arc::clone(&exported_keys);
                let skipped = Arc::clone(&skipped);
                async move {
                    let modified = store.modified(&key).await?;
                    if !tracker.should_export(&key, modified, record.updated_at, record.version) {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(Flow::Continue);
                    }
                    rows.lock().extend(flatten_record(&record));
                    exported_keys.lock().push(key);
                    Ok::<_, TaskError>(Flow::Continue)
                }
            }
        };
        let report = match executor
            .iter_prefix(cancel, Arc::clone(&self.store), &prefix, deserialize_record, handler)
            .await
        {
            Ok(report) => report,
            Err(ExecutorError::Cancelled { report }) => {
                warn!(%run_id, dispatched = report.dispatched, "export cancelled, nothing marked");
                anyhow::bail!("export {run_id} cancelled after {} records", report.dispatched);
            }
            Err(err) => return Err(err).with_context(|| format!("replaying {prefix}")),
        };

        let mut rows = std::mem::take(&mut *rows.lock());
        let exported_keys = std::mem::take(&mut *exported_keys.lock());
        rows.sort();

        let mut summary = ExportSummary {
            run_id,
            exported: exported_keys.len(),
            skipped: skipped.load(Ordering::Relaxed),
            failed: report.failed,
            rows: rows.len(),
            jsonl_key: None,
            parquet_path: None,
        };
        if !exported_keys.is_empty() {
            let key = join_key(
                &join_key(&self.config.prefix, EXPORTS_DIR),
                &format!("{run_id}.jsonl"),
            );
            self.store
                .write(&key, &encode_jsonl(&rows)?)
                .await
                .with_context(|| format!("writing {key}"))?;
            summary.jsonl_key = Some(key);

            if let Some(dir) = self.config.export_dir.clone() {
                let path = dir.join(format!("{run_id}.parquet"));
                let target = path.clone();
                // Arrow/Parquet writers are synchronous file I/O.
                tokio::task::spawn_blocking(move || -> Result<()> {
                    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
                    write_rows_parquet(&target, &rows)
                })
                .await
                .context("joining parquet writer")??;
                summary.parquet_path = Some(path);
            }

            for key in &exported_keys {
                self.tracker.mark_exported(key);
            }
        }
        self.tracker.save().await.context("saving export tracker")?;

        let (tracked, recent) = self.tracker.stats();
        info!(
            %run_id,
            exported = summary.exported,
            skipped = summary.skipped,
            failed = summary.failed,
            rows = summary.rows,
            tracked,
            recent,
            "export finished"
        );
        Ok(summary)
    }
}

fn encode_jsonl(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row).context("encoding export row")?;
        out.push(b'\n');
    }
    Ok(out)
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

fn write_rows_parquet(path: &Path, rows: &[ExportRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("deck_id", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("group", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt32, false),
        ArrowField::new("format", DataType::Utf8, true),
        ArrowField::new("archetype", DataType::Utf8, true),
        ArrowField::new("updated_at", DataType::Utf8, true),
        ArrowField::new("version", DataType::UInt32, true),
    ]));

    let updated_at: Vec<Option<String>> = rows
        .iter()
        .map(|r| r.updated_at.map(|at| at.to_rfc3339()))
        .collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(rows, |r| Some(r.deck_id.as_str()))),
            Arc::new(string_column(rows, |r| Some(r.source.as_str()))),
            Arc::new(string_column(rows, |r| Some(r.url.as_str()))),
            Arc::new(string_column(rows, |r| Some(r.group.as_str()))),
            Arc::new(string_column(rows, |r| Some(r.name.as_str()))),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.count).collect::<Vec<_>>())),
            Arc::new(string_column(rows, |r| r.format.as_deref())),
            Arc::new(string_column(rows, |r| r.archetype.as_deref())),
            Arc::new(StringArray::from(updated_at)),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.version).collect::<Vec<_>>())),
        ],
    )
    .context("building export record batch")?;
    write_parquet(path, batch)
}

fn string_column<'a>(rows: &'a [ExportRow], value: impl Fn(&'a ExportRow) -> Option<&'a str>) -> StringArray {
    StringArray::from(rows.iter().map(value).collect::<Vec<_>>())
}
