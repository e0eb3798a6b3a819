//! Change reconciliation and idempotent ingestion pipeline.
//!
//! One [`Workflow`] per watched folder and destination table: merge new
//! archives exactly once, advance durable state, and drive webhook
//! notifications through the dedupe/rescan/reset state machine.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use sheetsync_adapters::{extract_rows, ArtifactPublisher, ChangeSource, DestinationSink};
use sheetsync_core::{
    format_status_timestamp, ExtractContract, MergePolicy, Notification, WatchRegistration,
    WorkflowState,
};
use sheetsync_storage::{BackoffPolicy, StateStore, UpstreamError};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "sheetsync-sync";

pub const DEFAULT_COLUMNS: [&str; 10] = [
    "TO Number",
    "Tracking Number",
    "Receiver Name",
    "TO Order Quantity",
    "Operator",
    "Create Time",
    "Complete Time",
    "Remark",
    "Receive Status",
    "Staging Area ID",
];

pub const DEFAULT_FILTERS: [(&str, &str); 2] =
    [("Receiver type", "Station"), ("Current Station", "HUB 5")];

pub fn default_contract() -> ExtractContract {
    ExtractContract {
        columns: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
        filters: DEFAULT_FILTERS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {detail}")]
    Invalid { name: &'static str, detail: String },
    #[error("CHANNEL_TOKEN is required in production unless ALLOW_INSECURE_WEBHOOK=true")]
    InsecureWebhook,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid channel token")]
    Unauthorized,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shared-secret gate; an empty expected token disables the check.
pub fn verify_channel_token(expected: &str, provided: Option<&str>) -> Result<(), SyncError> {
    if expected.is_empty() || provided == Some(expected) {
        Ok(())
    } else {
        Err(SyncError::Unauthorized)
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub name: String,
    pub folder_id: String,
    pub dest_table: String,
    pub state_key: String,
    pub force_overwrite: bool,
    pub merge_policy: MergePolicy,
    pub archive_suffix: String,
    pub callback_url: String,
    pub skip_publish: bool,
    pub status_utc_offset_hours: i32,
    pub contract: ExtractContract,
}

impl WorkflowConfig {
    fn from_env_prefix(name: &str, prefix: &str) -> Result<Self, ConfigError> {
        let merge_policy = match env_string(prefix, "MERGE_POLICY") {
            Some(raw) => raw
                .parse::<MergePolicy>()
                .map_err(|detail| ConfigError::Invalid {
                    name: "MERGE_POLICY",
                    detail,
                })?,
            None => MergePolicy::AppendRewrite,
        };
        Ok(Self {
            name: name.to_string(),
            folder_id: env_string(prefix, "SOURCE_FOLDER").unwrap_or_default(),
            dest_table: env_string(prefix, "DEST_TABLE").unwrap_or_default(),
            state_key: name.to_string(),
            force_overwrite: env_bool(prefix, "FORCE_OVERWRITE", false),
            merge_policy,
            archive_suffix: env_string(prefix, "ARCHIVE_SUFFIX")
                .unwrap_or_else(|| ".zip".to_string())
                .to_ascii_lowercase(),
            callback_url: env_string(prefix, "CALLBACK_URL").unwrap_or_default(),
            skip_publish: env_bool(prefix, "SKIP_PUBLISH", false),
            status_utc_offset_hours: env_string(prefix, "STATUS_UTC_OFFSET_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            contract: default_contract(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub workflows: Vec<WorkflowConfig>,
    pub channel_token: String,
    pub allow_insecure_webhook: bool,
    pub app_env: String,
    pub source_root: PathBuf,
    pub state_dir: PathBuf,
    pub chat_webhook_url: String,
    pub chat_timeout_secs: u64,
    pub web_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let primary = WorkflowConfig::from_env_prefix("primary", "")?;
        let mut workflows = vec![primary];

        // The secondary workflow only exists when both of its identifiers
        // are present; a half-configured one is silently ignored.
        let secondary = WorkflowConfig::from_env_prefix("secondary", "SECONDARY_")?;
        if !secondary.folder_id.is_empty() && !secondary.dest_table.is_empty() {
            workflows.push(secondary);
        }

        Ok(Self {
            workflows,
            channel_token: env_string("", "CHANNEL_TOKEN").unwrap_or_default(),
            allow_insecure_webhook: env_bool("", "ALLOW_INSECURE_WEBHOOK", false),
            app_env: env_string("", "APP_ENV")
                .unwrap_or_else(|| "development".to_string())
                .to_ascii_lowercase(),
            source_root: env_string("", "SOURCE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            state_dir: env_string("", "STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("sheetsync-state")),
            chat_webhook_url: env_string("", "CHAT_WEBHOOK_URL").unwrap_or_default(),
            chat_timeout_secs: env_string("", "CHAT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            web_port: env_string("", "WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let primary = self
            .workflows
            .first()
            .ok_or(ConfigError::Missing("SOURCE_FOLDER"))?;
        if primary.folder_id.is_empty() {
            return Err(ConfigError::Missing("SOURCE_FOLDER"));
        }
        if primary.dest_table.is_empty() {
            return Err(ConfigError::Missing("DEST_TABLE"));
        }
        if matches!(self.app_env.as_str(), "production" | "prod")
            && self.channel_token.is_empty()
            && !self.allow_insecure_webhook
        {
            return Err(ConfigError::InsecureWebhook);
        }
        Ok(())
    }
}

fn env_string(prefix: &str, name: &str) -> Option<String> {
    let value = std::env::var(format!("{prefix}{name}")).ok()?;
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn env_bool(prefix: &str, name: &str, default: bool) -> bool {
    match env_string(prefix, name) {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

/// Bounded, time-windowed membership test collapsing duplicate webhook
/// deliveries. A live duplicate is never refreshed in place.
#[derive(Debug)]
pub struct DedupeCache {
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 2048)
    }
}

impl DedupeCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn seen(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::prune(&mut entries, now, self.ttl);

        if let Some(first_seen) = entries.get(key) {
            if now.duration_since(*first_seen) <= self.ttl {
                return true;
            }
        }
        entries.insert(key.to_string(), now);
        if entries.len() > self.max_size {
            Self::prune(&mut entries, now, self.ttl / 2);
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(entries: &mut HashMap<String, Instant>, now: Instant, window: Duration) {
        entries.retain(|_, first_seen| now.duration_since(*first_seen) <= window);
    }
}

/// Retry `op` with exponential backoff; only retryable failures loop.
pub async fn with_retries<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "upstream call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub rows_added: usize,
    pub files_merged: BTreeSet<String>,
    pub newest_modified: Option<DateTime<Utc>>,
}

/// Terminal state of one delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Handshake,
    Duplicate,
    CursorBootstrapped,
    NoChange,
    Rescanned(ReconcileOutcome),
    DestinationReset,
}

impl NotificationOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Rescanned(_) | Self::DestinationReset)
    }

    pub fn deduped(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

pub struct Workflow {
    config: WorkflowConfig,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn DestinationSink>,
    publisher: Arc<dyn ArtifactPublisher>,
    states: StateStore,
    backoff: BackoffPolicy,
}

impl Workflow {
    pub fn new(
        config: WorkflowConfig,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn DestinationSink>,
        publisher: Arc<dyn ArtifactPublisher>,
        states: StateStore,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            publisher,
            states,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub async fn current_state(&self) -> WorkflowState {
        self.states.load(&self.config.state_key).await
    }

    /// One full reconcile pass. `force` ignores the stored threshold;
    /// extraction failure for any archive aborts with no state committed.
    pub async fn reconcile(&self, force: bool) -> anyhow::Result<ReconcileOutcome> {
        let mut state = self.states.load(&self.config.state_key).await;
        self.write_status("Fetching data...").await?;

        let files = with_retries(&self.backoff, "list archives", || {
            self.source.list_files(&self.config.folder_id)
        })
        .await
        .context("listing candidate archives")?;

        let threshold = if force {
            None
        } else {
            state.last_processed_time
        };

        let mut new_rows: Vec<Vec<String>> = Vec::new();
        let mut merged: BTreeSet<String> = BTreeSet::new();
        let mut newest_merged: Option<DateTime<Utc>> = None;

        for file in &files {
            let is_new = self.config.force_overwrite
                || force
                || threshold.map_or(true, |t| file.modified_time > t)
                || !state.processed_file_ids.contains(&file.id);
            if !is_new {
                continue;
            }

            info!(workflow = %self.config.name, archive = %file.name, "merging archive");
            let bytes = with_retries(&self.backoff, "fetch archive", || {
                self.source.fetch_bytes(&file.id)
            })
            .await
            .with_context(|| format!("fetching archive {}", file.name))?;

            let rows = extract_rows(&bytes, &self.config.contract)
                .with_context(|| format!("extracting rows from {}", file.name))?;
            if rows.is_empty() {
                continue;
            }

            // First extracted row is the per-archive header.
            new_rows.extend(rows.into_iter().skip(1));
            merged.insert(file.id.clone());
            if newest_merged.map_or(true, |t| file.modified_time > t) {
                newest_merged = Some(file.modified_time);
            }
        }

        let heartbeat = self.status_now();
        if new_rows.is_empty() {
            self.write_status(&heartbeat).await?;
            info!(workflow = %self.config.name, "no new archives to import");
            return Ok(ReconcileOutcome::default());
        }

        let table = self.assemble_table(&new_rows).await?;
        with_retries(&self.backoff, "overwrite destination", || {
            self.sink.overwrite(&table)
        })
        .await
        .context("overwriting destination table")?;

        let rows_added = new_rows.len();
        state.record_merge(merged.iter().cloned(), newest_merged, rows_added as u64);
        self.states
            .save(&self.config.state_key, &state)
            .await
            .context("persisting workflow state")?;

        self.write_status(&heartbeat).await?;

        if self.config.skip_publish {
            info!(workflow = %self.config.name, "publication suppressed by configuration");
        } else {
            let summary =
                format!("Imported {rows_added} rows as of {heartbeat}. Thank you!");
            let snapshot = csv_snapshot(&table)?;
            if let Err(err) = self.publisher.publish(&[snapshot], &summary).await {
                warn!(workflow = %self.config.name, %err, "publication failed");
            }
        }

        info!(workflow = %self.config.name, rows_added, "import complete");
        Ok(ReconcileOutcome {
            rows_added,
            files_merged: merged,
            newest_modified: newest_merged,
        })
    }

    // Token verification happens at the HTTP boundary before this is called.
    pub async fn handle_notification(
        &self,
        note: &Notification,
        dedupe: &DedupeCache,
    ) -> Result<NotificationOutcome, SyncError> {
        if note.is_sync_handshake() {
            return Ok(NotificationOutcome::Handshake);
        }
        if let Some(key) = note.dedupe_key() {
            if dedupe.seen(&key) {
                return Ok(NotificationOutcome::Duplicate);
            }
        }

        let mut state = self.states.load(&self.config.state_key).await;
        let Some(mut cursor) = state.change_cursor.clone() else {
            // First-run bootstrap: no scan, just anchor the feed position.
            let token = with_retries(&self.backoff, "fetch start cursor", || {
                self.source.start_cursor()
            })
            .await
            .context("fetching start cursor")?;
            state.change_cursor = Some(token);
            self.states
                .save(&self.config.state_key, &state)
                .await
                .context("persisting bootstrap cursor")?;
            return Ok(NotificationOutcome::CursorBootstrapped);
        };

        let mut rescan_needed = false;
        let mut pending_delete = false;
        let mut new_start_cursor: Option<String> = None;

        loop {
            let page = with_retries(&self.backoff, "list changes", || {
                self.source.changes_since(&cursor)
            })
            .await
            .context("paging change feed")?;

            for change in &page.changes {
                match &change.file {
                    None => {
                        if state.processed_file_ids.contains(&change.file_id) {
                            pending_delete = true;
                        }
                    }
                    Some(file) if file.trashed => {
                        let suffix_match = file
                            .name
                            .to_ascii_lowercase()
                            .ends_with(&self.config.archive_suffix);
                        let parent_match = file.parents.is_empty()
                            || file.parents.iter().any(|p| p == &self.config.folder_id);
                        if (suffix_match && parent_match)
                            || state.processed_file_ids.contains(&change.file_id)
                        {
                            pending_delete = true;
                        }
                    }
                    Some(file) => {
                        if file.parents.iter().any(|p| p == &self.config.folder_id) {
                            rescan_needed = true;
                        }
                    }
                }
            }

            if let Some(token) = &page.new_start_cursor {
                new_start_cursor = Some(token.clone());
            }
            match page.next_cursor {
                Some(next) => cursor = next,
                None => break,
            }
        }

        // The cursor is a pure function of pages consumed: commit it before
        // acting on what the pages meant.
        if let Some(token) = new_start_cursor {
            state.change_cursor = Some(token);
            self.states
                .save(&self.config.state_key, &state)
                .await
                .context("persisting advanced cursor")?;
        }

        if pending_delete {
            info!(workflow = %self.config.name, "tracked archive deleted; clearing destination");
            self.clear_and_reset(&mut state).await?;
            return Ok(NotificationOutcome::DestinationReset);
        }
        if rescan_needed {
            info!(workflow = %self.config.name, "change detected in watched folder; rescanning");
            let outcome = self.reconcile(false).await?;
            return Ok(NotificationOutcome::Rescanned(outcome));
        }
        Ok(NotificationOutcome::NoChange)
    }

    /// Register (or renew) the push channel; replaces any previous one.
    pub async fn register_watch(
        &self,
        secret: Option<&str>,
    ) -> Result<WatchRegistration, SyncError> {
        if self.config.callback_url.is_empty() {
            return Err(ConfigError::Missing("CALLBACK_URL").into());
        }

        let mut state = self.states.load(&self.config.state_key).await;
        let cursor = match &state.change_cursor {
            Some(cursor) => cursor.clone(),
            None => {
                let token = with_retries(&self.backoff, "fetch start cursor", || {
                    self.source.start_cursor()
                })
                .await
                .context("fetching start cursor")?;
                state.change_cursor = Some(token.clone());
                self.states
                    .save(&self.config.state_key, &state)
                    .await
                    .context("persisting start cursor")?;
                token
            }
        };

        let registration = with_retries(&self.backoff, "register watch", || {
            self.source
                .register_watch(&cursor, &self.config.callback_url, secret)
        })
        .await
        .context("registering watch channel")?;

        state.watch = Some(registration.clone());
        self.states
            .save(&self.config.state_key, &state)
            .await
            .context("persisting watch registration")?;
        Ok(registration)
    }

    // The destination is a recomputable view, not a ledger: deleting a
    // tracked archive invalidates the whole accumulated table.
    pub async fn clear_and_reset(&self, state: &mut WorkflowState) -> anyhow::Result<()> {
        with_retries(&self.backoff, "clear destination", || self.sink.clear())
            .await
            .context("clearing destination table")?;
        state.reset_destination();
        self.states
            .save(&self.config.state_key, state)
            .await
            .context("persisting reset state")
    }

    async fn assemble_table(&self, new_rows: &[Vec<String>]) -> anyhow::Result<Vec<Vec<String>>> {
        let columns = self.config.contract.columns.clone();
        match self.config.merge_policy {
            MergePolicy::AppendRewrite => {
                let existing = with_retries(&self.backoff, "read destination rows", || {
                    self.sink.read_rows()
                })
                .await
                .context("reading existing destination rows")?;

                let mut table = Vec::with_capacity(existing.len() + new_rows.len() + 1);
                if let Some((header, body)) = existing.split_first() {
                    table.push(header.clone());
                    table.extend(body.iter().cloned());
                } else {
                    table.push(columns);
                }
                table.extend(new_rows.iter().cloned());
                Ok(table)
            }
            MergePolicy::FreshWindow => {
                let mut table = Vec::with_capacity(new_rows.len() + 1);
                table.push(columns);
                table.extend(new_rows.iter().cloned());
                Ok(table)
            }
        }
    }

    async fn write_status(&self, value: &str) -> anyhow::Result<()> {
        with_retries(&self.backoff, "write status cell", || {
            self.sink.write_status(value)
        })
        .await
        .context("writing destination status cell")?;
        Ok(())
    }

    fn status_now(&self) -> String {
        let offset = FixedOffset::east_opt(self.config.status_utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix());
        format_status_timestamp(Utc::now().with_timezone(&offset))
    }
}

fn csv_snapshot(rows: &[Vec<String>]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row).context("encoding snapshot row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("finishing table snapshot: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use sheetsync_core::{CandidateFile, ChangePage, ChangeRecord, ChangedFile};
    use std::collections::VecDeque;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn test_contract() -> ExtractContract {
        ExtractContract {
            columns: vec!["Order".to_string(), "Tracking".to_string()],
            filters: vec![("Kind".to_string(), "Keep".to_string())],
        }
    }

    fn archive(rows: &[(&str, &str, &str)]) -> Vec<u8> {
        let mut body = String::from("Order,Tracking,Kind\n");
        for (order, tracking, kind) in rows {
            body.push_str(&format!("{order},{tracking},{kind}\n"));
        }
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("export.csv", zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(body.as_bytes()).expect("write entry");
        writer.finish().expect("finish zip").into_inner()
    }

    #[derive(Default)]
    struct FakeSource {
        files: StdMutex<Vec<CandidateFile>>,
        payloads: StdMutex<HashMap<String, Vec<u8>>>,
        pages: StdMutex<VecDeque<ChangePage>>,
        start_cursors: AtomicUsize,
        transient_list_failures: AtomicUsize,
        permanent_list_failure: AtomicBool,
    }

    impl FakeSource {
        fn add_file(&self, id: &str, name: &str, modified: DateTime<Utc>, payload: Vec<u8>) {
            self.files.lock().unwrap().push(CandidateFile {
                id: id.to_string(),
                name: name.to_string(),
                modified_time: modified,
            });
            self.payloads.lock().unwrap().insert(id.to_string(), payload);
        }

        fn push_page(&self, page: ChangePage) {
            self.pages.lock().unwrap().push_back(page);
        }
    }

    #[async_trait]
    impl ChangeSource for FakeSource {
        async fn list_files(&self, _folder: &str) -> Result<Vec<CandidateFile>, UpstreamError> {
            if self.permanent_list_failure.load(Ordering::SeqCst) {
                return Err(UpstreamError::Status {
                    status: 404,
                    detail: "folder missing".into(),
                });
            }
            if self.transient_list_failures.load(Ordering::SeqCst) > 0 {
                self.transient_list_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(UpstreamError::Status {
                    status: 503,
                    detail: "try later".into(),
                });
            }
            Ok(self.files.lock().unwrap().clone())
        }

        async fn fetch_bytes(&self, file_id: &str) -> Result<Vec<u8>, UpstreamError> {
            self.payloads
                .lock()
                .unwrap()
                .get(file_id)
                .cloned()
                .ok_or_else(|| UpstreamError::Status {
                    status: 404,
                    detail: format!("no payload for {file_id}"),
                })
        }

        async fn start_cursor(&self) -> Result<String, UpstreamError> {
            let n = self.start_cursors.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("start-{n}"))
        }

        async fn changes_since(&self, _cursor: &str) -> Result<ChangePage, UpstreamError> {
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn register_watch(
            &self,
            _cursor: &str,
            _callback_url: &str,
            _secret: Option<&str>,
        ) -> Result<WatchRegistration, UpstreamError> {
            Ok(WatchRegistration {
                channel_id: "chan-1".to_string(),
                resource_id: "res-1".to_string(),
                expiration: Some("2026-04-01T00:00:00Z".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct MemorySink {
        rows: StdMutex<Vec<Vec<String>>>,
        status: StdMutex<Option<String>>,
        overwrites: AtomicUsize,
        clears: AtomicUsize,
    }

    #[async_trait]
    impl DestinationSink for MemorySink {
        async fn read_rows(&self) -> Result<Vec<Vec<String>>, UpstreamError> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn overwrite(&self, rows: &[Vec<String>]) -> Result<(), UpstreamError> {
            self.overwrites.fetch_add(1, Ordering::SeqCst);
            *self.rows.lock().unwrap() = rows.to_vec();
            Ok(())
        }

        async fn clear(&self) -> Result<(), UpstreamError> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.rows.lock().unwrap().clear();
            Ok(())
        }

        async fn write_status(&self, value: &str) -> Result<(), UpstreamError> {
            *self.status.lock().unwrap() = Some(value.to_string());
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl ArtifactPublisher for FailingPublisher {
        async fn publish(&self, _artifacts: &[Vec<u8>], _summary: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("chat endpoint down"))
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        summaries: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtifactPublisher for RecordingPublisher {
        async fn publish(&self, artifacts: &[Vec<u8>], summary: &str) -> anyhow::Result<()> {
            assert!(!artifacts.is_empty());
            self.summaries.lock().unwrap().push(summary.to_string());
            Ok(())
        }
    }

    struct Rig {
        state_dir: TempDir,
        source: Arc<FakeSource>,
        sink: Arc<MemorySink>,
        publisher: Arc<RecordingPublisher>,
        workflow: Workflow,
    }

    impl Rig {
        fn store(&self) -> StateStore {
            StateStore::new(self.state_dir.path())
        }

        async fn seed_state(&self, state: &WorkflowState) {
            self.store().save("primary", state).await.expect("seed");
        }

        async fn stored_state(&self) -> WorkflowState {
            self.store().load("primary").await
        }
    }

    fn test_config() -> WorkflowConfig {
        WorkflowConfig {
            name: "primary".to_string(),
            folder_id: "folder-1".to_string(),
            dest_table: "table.csv".to_string(),
            state_key: "primary".to_string(),
            force_overwrite: false,
            merge_policy: MergePolicy::AppendRewrite,
            archive_suffix: ".zip".to_string(),
            callback_url: "http://localhost/primary/webhook".to_string(),
            skip_publish: false,
            status_utc_offset_hours: 8,
            contract: test_contract(),
        }
    }

    fn rig_with(tweak: impl FnOnce(&mut WorkflowConfig)) -> Rig {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config();
        tweak(&mut config);
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(MemorySink::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let workflow = Workflow::new(
            config,
            source.clone(),
            sink.clone(),
            publisher.clone(),
            StateStore::new(state_dir.path()),
        )
        .with_backoff(BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        });
        Rig {
            state_dir,
            source,
            sink,
            publisher,
            workflow,
        }
    }

    fn rig() -> Rig {
        rig_with(|_| {})
    }

    fn note(resource_state: &str) -> Notification {
        Notification {
            resource_id: "res-1".to_string(),
            message_number: "1".to_string(),
            channel_id: "chan-1".to_string(),
            resource_state: resource_state.to_string(),
        }
    }

    #[tokio::test]
    async fn second_pass_with_no_new_files_adds_nothing() {
        let rig = rig();
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        rig.source
            .add_file("f2", "b.zip", ts(2, 8), archive(&[("2", "T2", "Keep")]));

        let first = rig.workflow.reconcile(false).await.expect("first pass");
        assert_eq!(first.rows_added, 2);
        assert_eq!(first.files_merged.len(), 2);
        assert_eq!(first.newest_modified, Some(ts(2, 8)));

        let second = rig.workflow.reconcile(false).await.expect("second pass");
        assert_eq!(second.rows_added, 0);
        assert!(second.files_merged.is_empty());
        assert_eq!(rig.sink.overwrites.load(Ordering::SeqCst), 1);

        let state = rig.stored_state().await;
        assert_eq!(state.processed_file_ids.len(), 2);
        assert_eq!(state.last_processed_time, Some(ts(2, 8)));
        assert_eq!(state.last_import_row_count, 2);
    }

    #[tokio::test]
    async fn processed_ids_only_grow_on_non_forced_runs() {
        let rig = rig();
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        rig.workflow.reconcile(false).await.expect("first");
        let before = rig.stored_state().await.processed_file_ids;

        rig.source
            .add_file("f2", "b.zip", ts(3, 8), archive(&[("2", "T2", "Keep")]));
        rig.workflow.reconcile(false).await.expect("second");
        let after = rig.stored_state().await.processed_file_ids;
        assert!(after.is_superset(&before));
    }

    #[tokio::test]
    async fn force_remerges_processed_file_older_than_threshold() {
        let rig = rig();
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        rig.workflow.reconcile(false).await.expect("first");

        let forced = rig.workflow.reconcile(true).await.expect("forced");
        assert_eq!(forced.rows_added, 1);
        assert!(forced.files_merged.contains("f1"));
    }

    #[tokio::test]
    async fn unrecorded_older_file_is_merged_as_safety_net() {
        let rig = rig();
        let mut state = WorkflowState::default();
        state.last_processed_time = Some(ts(10, 0));
        rig.seed_state(&state).await;

        rig.source
            .add_file("f1", "old.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        let outcome = rig.workflow.reconcile(false).await.expect("reconcile");
        assert_eq!(outcome.rows_added, 1);
        assert!(outcome.files_merged.contains("f1"));
        // Threshold never regresses.
        assert_eq!(rig.stored_state().await.last_processed_time, Some(ts(10, 0)));
    }

    #[tokio::test]
    async fn no_matching_rows_leaves_destination_untouched() {
        let rig = rig();
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Drop")]));

        let outcome = rig.workflow.reconcile(false).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(rig.sink.overwrites.load(Ordering::SeqCst), 0);
        assert!(rig.sink.status.lock().unwrap().is_some());
        assert!(rig.publisher.summaries.lock().unwrap().is_empty());
        // Nothing recorded: the archive is re-examined next pass.
        assert!(rig.stored_state().await.processed_file_ids.is_empty());
    }

    #[tokio::test]
    async fn extraction_failure_aborts_without_state_commit() {
        let rig = rig();
        rig.source
            .add_file("f1", "good.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        rig.source
            .add_file("f2", "bad.zip", ts(2, 8), b"not a zip".to_vec());

        let err = rig.workflow.reconcile(false).await.expect_err("must abort");
        assert!(err.to_string().contains("bad.zip"));
        assert_eq!(rig.sink.overwrites.load(Ordering::SeqCst), 0);
        assert_eq!(rig.stored_state().await, WorkflowState::default());
    }

    #[tokio::test]
    async fn append_rewrite_keeps_existing_body_rows() {
        let rig = rig();
        *rig.sink.rows.lock().unwrap() = vec![
            vec!["Order".to_string(), "Tracking".to_string()],
            vec!["0".to_string(), "T0".to_string()],
        ];
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));

        rig.workflow.reconcile(false).await.expect("reconcile");
        let rows = rig.sink.rows.lock().unwrap().clone();
        assert_eq!(
            rows,
            vec![
                vec!["Order".to_string(), "Tracking".to_string()],
                vec!["0".to_string(), "T0".to_string()],
                vec!["1".to_string(), "T1".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn fresh_window_keeps_only_new_batch() {
        let rig = rig_with(|c| c.merge_policy = MergePolicy::FreshWindow);
        *rig.sink.rows.lock().unwrap() = vec![
            vec!["Order".to_string(), "Tracking".to_string()],
            vec!["0".to_string(), "T0".to_string()],
        ];
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));

        rig.workflow.reconcile(false).await.expect("reconcile");
        let rows = rig.sink.rows.lock().unwrap().clone();
        assert_eq!(
            rows,
            vec![
                vec!["Order".to_string(), "Tracking".to_string()],
                vec!["1".to_string(), "T1".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn transient_listing_failures_are_retried() {
        let rig = rig();
        rig.source.transient_list_failures.store(2, Ordering::SeqCst);
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));

        let outcome = rig.workflow.reconcile(false).await.expect("reconcile");
        assert_eq!(outcome.rows_added, 1);
        assert_eq!(rig.source.transient_list_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_listing_failure_propagates_immediately() {
        let rig = rig();
        rig.source.permanent_list_failure.store(true, Ordering::SeqCst);

        let err = rig.workflow.reconcile(false).await.expect_err("must fail");
        assert!(err.to_string().contains("listing candidate archives"));
    }

    #[tokio::test]
    async fn publication_runs_once_after_merge_and_can_be_suppressed() {
        let rig = rig();
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        rig.workflow.reconcile(false).await.expect("reconcile");
        let summaries = rig.publisher.summaries.lock().unwrap().clone();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].contains("Imported 1 rows"));

        let quiet = rig_with(|c| c.skip_publish = true);
        quiet
            .source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        quiet.workflow.reconcile(false).await.expect("reconcile");
        assert!(quiet.publisher.summaries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publication_failure_does_not_fail_the_reconcile() {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(FakeSource::default());
        source.add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        let sink = Arc::new(MemorySink::default());
        let workflow = Workflow::new(
            test_config(),
            source,
            sink.clone(),
            Arc::new(FailingPublisher),
            StateStore::new(state_dir.path()),
        );

        let outcome = workflow.reconcile(false).await.expect("merge still succeeds");
        assert_eq!(outcome.rows_added, 1);
        assert_eq!(sink.overwrites.load(Ordering::SeqCst), 1);

        // The merge was committed before publication was attempted.
        let state = StateStore::new(state_dir.path()).load("primary").await;
        assert!(state.processed_file_ids.contains("f1"));
        assert_eq!(state.last_import_row_count, 1);
    }

    #[tokio::test]
    async fn sync_handshake_is_terminal_and_stateless() {
        let rig = rig();
        let dedupe = DedupeCache::default();
        let outcome = rig
            .workflow
            .handle_notification(&note("sync"), &dedupe)
            .await
            .expect("handshake");
        assert_eq!(outcome, NotificationOutcome::Handshake);
        assert!(!outcome.changed());
        assert_eq!(rig.stored_state().await, WorkflowState::default());
        // Handshakes bypass the dedupe cache entirely.
        assert!(dedupe.is_empty());
    }

    #[tokio::test]
    async fn first_notification_bootstraps_cursor_without_scanning() {
        let rig = rig();
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));
        let dedupe = DedupeCache::default();

        let outcome = rig
            .workflow
            .handle_notification(&note("exchange"), &dedupe)
            .await
            .expect("bootstrap");
        assert_eq!(outcome, NotificationOutcome::CursorBootstrapped);
        assert_eq!(
            rig.stored_state().await.change_cursor.as_deref(),
            Some("start-1")
        );
        // No reconcile ran: destination untouched.
        assert_eq!(rig.sink.overwrites.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_collapsed() {
        let rig = rig();
        let mut state = WorkflowState::default();
        state.change_cursor = Some("c0".to_string());
        rig.seed_state(&state).await;
        let dedupe = DedupeCache::default();

        let first = rig
            .workflow
            .handle_notification(&note("update"), &dedupe)
            .await
            .expect("first");
        assert_eq!(first, NotificationOutcome::NoChange);

        let second = rig
            .workflow
            .handle_notification(&note("update"), &dedupe)
            .await
            .expect("second");
        assert!(second.deduped());
    }

    #[tokio::test]
    async fn trashed_archive_with_no_parent_clears_destination() {
        let rig = rig();
        let mut state = WorkflowState::default();
        state.change_cursor = Some("c0".to_string());
        state.last_processed_time = Some(ts(1, 8));
        state.processed_file_ids.insert("f1".to_string());
        rig.seed_state(&state).await;
        *rig.sink.rows.lock().unwrap() = vec![vec!["Order".to_string()]];

        rig.source.push_page(ChangePage {
            changes: vec![ChangeRecord {
                // Not a tracked id: the suffix + parent heuristic alone fires.
                file_id: "f9".to_string(),
                file: Some(ChangedFile {
                    name: "report.zip".to_string(),
                    parents: vec![],
                    trashed: true,
                }),
            }],
            next_cursor: None,
            new_start_cursor: Some("c1".to_string()),
        });

        let outcome = rig
            .workflow
            .handle_notification(&note("update"), &DedupeCache::default())
            .await
            .expect("handle");
        assert_eq!(outcome, NotificationOutcome::DestinationReset);
        assert!(outcome.changed());
        assert_eq!(rig.sink.clears.load(Ordering::SeqCst), 1);
        assert!(rig.sink.rows.lock().unwrap().is_empty());

        let state = rig.stored_state().await;
        assert!(state.processed_file_ids.is_empty());
        assert_eq!(state.last_processed_time, None);
        assert_eq!(state.last_import_row_count, 0);
        assert_eq!(state.change_cursor.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn missing_metadata_for_tracked_file_clears_destination() {
        let rig = rig();
        let mut state = WorkflowState::default();
        state.change_cursor = Some("c0".to_string());
        state.processed_file_ids.insert("f1".to_string());
        rig.seed_state(&state).await;

        rig.source.push_page(ChangePage {
            changes: vec![ChangeRecord {
                file_id: "f1".to_string(),
                file: None,
            }],
            next_cursor: None,
            new_start_cursor: Some("c1".to_string()),
        });

        let outcome = rig
            .workflow
            .handle_notification(&note("update"), &DedupeCache::default())
            .await
            .expect("handle");
        assert_eq!(outcome, NotificationOutcome::DestinationReset);
    }

    #[tokio::test]
    async fn folder_change_triggers_rescan_and_advances_cursor() {
        let rig = rig();
        let mut state = WorkflowState::default();
        state.change_cursor = Some("c0".to_string());
        rig.seed_state(&state).await;
        rig.source
            .add_file("f1", "a.zip", ts(1, 8), archive(&[("1", "T1", "Keep")]));

        rig.source.push_page(ChangePage {
            changes: vec![ChangeRecord {
                file_id: "f1".to_string(),
                file: Some(ChangedFile {
                    name: "a.zip".to_string(),
                    parents: vec!["folder-1".to_string()],
                    trashed: false,
                }),
            }],
            next_cursor: None,
            new_start_cursor: Some("c1".to_string()),
        });

        let outcome = rig
            .workflow
            .handle_notification(&note("update"), &DedupeCache::default())
            .await
            .expect("handle");
        match outcome {
            NotificationOutcome::Rescanned(inner) => assert_eq!(inner.rows_added, 1),
            other => panic!("expected rescan, got {other:?}"),
        }
        assert_eq!(rig.stored_state().await.change_cursor.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn unrelated_change_advances_cursor_without_action() {
        let rig = rig();
        let mut state = WorkflowState::default();
        state.change_cursor = Some("c0".to_string());
        rig.seed_state(&state).await;

        rig.source.push_page(ChangePage {
            changes: vec![ChangeRecord {
                file_id: "f7".to_string(),
                file: Some(ChangedFile {
                    name: "elsewhere.zip".to_string(),
                    parents: vec!["other-folder".to_string()],
                    trashed: false,
                }),
            }],
            next_cursor: None,
            new_start_cursor: Some("c1".to_string()),
        });

        let outcome = rig
            .workflow
            .handle_notification(&note("update"), &DedupeCache::default())
            .await
            .expect("handle");
        assert_eq!(outcome, NotificationOutcome::NoChange);
        assert_eq!(rig.stored_state().await.change_cursor.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn register_watch_requires_callback_and_stores_registration() {
        let bare = rig_with(|c| c.callback_url = String::new());
        let err = bare.workflow.register_watch(None).await.expect_err("no url");
        assert!(matches!(err, SyncError::Config(ConfigError::Missing(_))));

        let rig = rig();
        let registration = rig
            .workflow
            .register_watch(Some("secret"))
            .await
            .expect("register");
        assert_eq!(registration.channel_id, "chan-1");

        let state = rig.stored_state().await;
        assert_eq!(state.watch, Some(registration));
        assert_eq!(state.change_cursor.as_deref(), Some("start-1"));
    }

    #[test]
    fn dedupe_repeat_within_ttl_is_duplicate() {
        let cache = DedupeCache::new(Duration::from_millis(200), 16);
        assert!(!cache.seen("k"));
        assert!(cache.seen("k"));
        assert!(cache.seen("k"));
    }

    #[test]
    fn dedupe_forgets_after_ttl() {
        let cache = DedupeCache::new(Duration::from_millis(30), 16);
        assert!(!cache.seen("k"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!cache.seen("k"));
    }

    #[test]
    fn dedupe_size_bound_triggers_half_window_prune() {
        let cache = DedupeCache::new(Duration::from_secs(2), 2);
        assert!(!cache.seen("old"));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!cache.seen("fresh-1"));
        assert!(!cache.seen("fresh-2"));
        // "old" predates the halved window and was evicted by the
        // aggressive pass; the fresh entries survive.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn token_verification_rules() {
        assert!(verify_channel_token("", None).is_ok());
        assert!(verify_channel_token("s3cret", Some("s3cret")).is_ok());
        assert!(matches!(
            verify_channel_token("s3cret", Some("wrong")),
            Err(SyncError::Unauthorized)
        ));
        assert!(matches!(
            verify_channel_token("s3cret", None),
            Err(SyncError::Unauthorized)
        ));
    }

    #[test]
    fn config_env_round_trip_builds_both_workflows() {
        // All env access for config tests lives in this one test to avoid
        // cross-test races over process environment.
        std::env::set_var("SOURCE_FOLDER", "inbox");
        std::env::set_var("DEST_TABLE", "out/table.csv");
        std::env::set_var("MERGE_POLICY", "fresh-window");
        std::env::set_var("SECONDARY_SOURCE_FOLDER", "inbox2");
        std::env::set_var("SECONDARY_DEST_TABLE", "out/table2.csv");
        std::env::set_var("CHANNEL_TOKEN", "tok");

        let config = AppConfig::from_env().expect("from_env");
        config.validate().expect("valid");
        assert_eq!(config.workflows.len(), 2);
        assert_eq!(config.workflows[0].merge_policy, MergePolicy::FreshWindow);
        assert_eq!(config.workflows[1].name, "secondary");
        assert_eq!(config.workflows[1].merge_policy, MergePolicy::AppendRewrite);
        assert_eq!(config.channel_token, "tok");

        std::env::set_var("MERGE_POLICY", "ledger");
        assert!(matches!(
            AppConfig::from_env(),
            Err(ConfigError::Invalid { .. })
        ));

        for name in [
            "SOURCE_FOLDER",
            "DEST_TABLE",
            "MERGE_POLICY",
            "SECONDARY_SOURCE_FOLDER",
            "SECONDARY_DEST_TABLE",
            "CHANNEL_TOKEN",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn production_requires_channel_token() {
        let mut config = AppConfig {
            workflows: vec![test_config()],
            channel_token: String::new(),
            allow_insecure_webhook: false,
            app_env: "production".to_string(),
            source_root: PathBuf::from("."),
            state_dir: PathBuf::from("/tmp/state"),
            chat_webhook_url: String::new(),
            chat_timeout_secs: 30,
            web_port: 8000,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InsecureWebhook)
        ));

        config.allow_insecure_webhook = true;
        assert!(config.validate().is_ok());

        config.allow_insecure_webhook = false;
        config.channel_token = "tok".to_string();
        assert!(config.validate().is_ok());
    }
}
