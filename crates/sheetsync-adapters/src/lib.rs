//! Collaborator contracts + archive row extraction + local adapters.
//!
//! The traits here are the seams the reconciler drives: a change source
//! (folder listing, byte fetch, change feed, watch registration), a
//! destination sink (a table with a managed range and a status cell), and a
//! best-effort artifact publisher. Local filesystem implementations make the
//! one-shot and test paths run end to end without any cloud client.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sheetsync_core::{CandidateFile, ChangePage, ExtractContract, WatchRegistration};
use sheetsync_storage::{ChatWebhook, UpstreamError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sheetsync-adapters";

/// Upstream folder of archives plus its change feed.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn list_files(&self, folder_id: &str) -> Result<Vec<CandidateFile>, UpstreamError>;

    async fn fetch_bytes(&self, file_id: &str) -> Result<Vec<u8>, UpstreamError>;

    async fn start_cursor(&self) -> Result<String, UpstreamError>;

    async fn changes_since(&self, cursor: &str) -> Result<ChangePage, UpstreamError>;

    async fn register_watch(
        &self,
        cursor: &str,
        callback_url: &str,
        secret: Option<&str>,
    ) -> Result<WatchRegistration, UpstreamError>;
}

/// Spreadsheet-like destination. Every operation is idempotent and
/// retryable; `overwrite` replaces the entire managed range.
#[async_trait]
pub trait DestinationSink: Send + Sync {
    async fn read_rows(&self) -> Result<Vec<Vec<String>>, UpstreamError>;

    async fn overwrite(&self, rows: &[Vec<String>]) -> Result<(), UpstreamError>;

    async fn clear(&self) -> Result<(), UpstreamError>;

    async fn write_status(&self, value: &str) -> Result<(), UpstreamError>;
}

/// Downstream notification sink. Best effort: implementations log per-artifact
/// failures and never abort the caller.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, artifacts: &[Vec<u8>], summary: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unreadable archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("unreadable tabular entry: {0}")]
    Csv(#[from] csv::Error),
    #[error("entry {entry}: filter column {column:?} not present")]
    MissingFilterColumn { entry: String, column: String },
}

/// Extract canonical rows from one ZIP archive of CSV exports.
///
/// Every `.csv` entry is parsed against the contract: headers are trimmed,
/// records must satisfy all equality filters (exact match after trim), and
/// surviving records are reindexed to the fixed destination column order with
/// missing columns as empty strings. The header row appears exactly once for
/// the whole archive, only when at least one record survives.
pub fn extract_rows(
    zip_bytes: &[u8],
    contract: &ExtractContract,
) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut header_written = false;

    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let entry_name = entry.name().to_string();
        if !entry_name.to_ascii_lowercase().ends_with(".csv") {
            continue;
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(entry);
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let index: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();

        for (column, _) in &contract.filters {
            if !index.contains_key(column.as_str()) {
                return Err(ExtractError::MissingFilterColumn {
                    entry: entry_name,
                    column: column.clone(),
                });
            }
        }

        let mut matched: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let field = |column: &str| -> &str {
                index
                    .get(column)
                    .and_then(|&idx| record.get(idx))
                    .unwrap_or("")
            };
            let keep = contract
                .filters
                .iter()
                .all(|(column, expected)| field(column).trim() == expected);
            if keep {
                matched.push(
                    contract
                        .columns
                        .iter()
                        .map(|column| field(column).to_string())
                        .collect(),
                );
            }
        }

        if matched.is_empty() {
            continue;
        }
        if !header_written {
            rows.push(contract.columns.clone());
            header_written = true;
        }
        rows.extend(matched);
    }

    Ok(rows)
}

fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Change source over a local directory of `.zip` archives. The folder id is
/// a path relative to the configured root (or absolute). Polling only: the
/// local filesystem has no durable change feed, so `changes_since` yields
/// empty pages and watch registration is unsupported.
#[derive(Debug, Clone)]
pub struct FsChangeSource {
    root: PathBuf,
}

impl FsChangeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn folder_path(&self, folder_id: &str) -> PathBuf {
        let path = Path::new(folder_id);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl ChangeSource for FsChangeSource {
    async fn list_files(&self, folder_id: &str) -> Result<Vec<CandidateFile>, UpstreamError> {
        let folder = self.folder_path(folder_id);
        let mut dir = fs::read_dir(&folder).await?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.to_ascii_lowercase().ends_with(".zip") {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            files.push(CandidateFile {
                id: entry.path().to_string_lossy().to_string(),
                name,
                modified_time: modified_time(&meta),
            });
        }
        // Stable listing order: directory iteration order is arbitrary.
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn fetch_bytes(&self, file_id: &str) -> Result<Vec<u8>, UpstreamError> {
        Ok(fs::read(file_id).await?)
    }

    async fn start_cursor(&self) -> Result<String, UpstreamError> {
        Ok(Utc::now().timestamp_millis().to_string())
    }

    async fn changes_since(&self, _cursor: &str) -> Result<ChangePage, UpstreamError> {
        Ok(ChangePage {
            changes: Vec::new(),
            next_cursor: None,
            new_start_cursor: Some(Utc::now().timestamp_millis().to_string()),
        })
    }

    async fn register_watch(
        &self,
        _cursor: &str,
        _callback_url: &str,
        _secret: Option<&str>,
    ) -> Result<WatchRegistration, UpstreamError> {
        Err(UpstreamError::Unsupported(
            "local folders deliver no push notifications; use the run command",
        ))
    }
}

/// Destination sink backed by one managed CSV file plus a sidecar status
/// file. `overwrite` replaces the file atomically, which collapses the
/// clear-then-write pair into one step.
#[derive(Debug, Clone)]
pub struct CsvTableSink {
    table_path: PathBuf,
    status_path: PathBuf,
}

impl CsvTableSink {
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        let table_path = table_path.into();
        let status_path = table_path.with_extension("status");
        Self {
            table_path,
            status_path,
        }
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    fn encode(rows: &[Vec<String>]) -> Result<Vec<u8>, UpstreamError> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        for row in rows {
            writer
                .write_record(row)
                .map_err(|err| UpstreamError::Payload(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| UpstreamError::Payload(err.to_string()))
    }
}

#[async_trait]
impl DestinationSink for CsvTableSink {
    async fn read_rows(&self) -> Result<Vec<Vec<String>>, UpstreamError> {
        let bytes = match fs::read(&self.table_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(Cursor::new(bytes));
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| UpstreamError::Payload(err.to_string()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(rows)
    }

    async fn overwrite(&self, rows: &[Vec<String>]) -> Result<(), UpstreamError> {
        let bytes = Self::encode(rows)?;
        if let Some(parent) = self.table_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self
            .table_path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);
        match fs::rename(&temp_path, &self.table_path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn clear(&self) -> Result<(), UpstreamError> {
        match fs::remove_file(&self.table_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_status(&self, value: &str) -> Result<(), UpstreamError> {
        if let Some(parent) = self.status_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.status_path, value.as_bytes()).await?;
        Ok(())
    }
}

/// Publishes merged-table snapshots to a chat webhook: one image frame per
/// artifact, then a trailing summary line. Configured without a webhook URL
/// it degrades to a no-op.
#[derive(Debug, Clone)]
pub struct ChatPublisher {
    webhook: Option<ChatWebhook>,
}

impl ChatPublisher {
    pub fn new(webhook: Option<ChatWebhook>) -> Self {
        Self { webhook }
    }
}

#[async_trait]
impl ArtifactPublisher for ChatPublisher {
    async fn publish(&self, artifacts: &[Vec<u8>], summary: &str) -> anyhow::Result<()> {
        let Some(webhook) = &self.webhook else {
            debug!("no chat webhook configured; skipping publication");
            return Ok(());
        };

        let total = artifacts.len();
        for (idx, artifact) in artifacts.iter().enumerate() {
            match webhook.post_image(artifact).await {
                Ok(()) => debug!(frame = idx + 1, total, "chat frame sent"),
                Err(err) => warn!(frame = idx + 1, total, %err, "chat frame failed"),
            }
        }
        if let Err(err) = webhook.post_text(summary, true).await {
            warn!(%err, "chat summary failed");
        }
        Ok(())
    }
}
