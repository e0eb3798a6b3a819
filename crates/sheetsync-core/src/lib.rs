//! Core domain model for the sheetsync ingestion pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sheetsync-core";

/// Resource-state marker sent when a watch channel activates.
pub const SYNC_HANDSHAKE_STATE: &str = "sync";

// Replaced wholesale on each (re)registration, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRegistration {
    pub channel_id: String,
    pub resource_id: String,
    pub expiration: Option<String>,
}

/// Durable per-workflow cursor/state record, reloaded fresh at the start of
/// every externally triggered operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default)]
    pub processed_file_ids: BTreeSet<String>,
    #[serde(default)]
    pub last_processed_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub change_cursor: Option<String>,
    #[serde(default)]
    pub watch: Option<WatchRegistration>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_import_row_count: u64,
}

impl WorkflowState {
    // Ids union in; the last-processed threshold only ever advances.
    pub fn record_merge(
        &mut self,
        merged_ids: impl IntoIterator<Item = String>,
        newest_modified: Option<DateTime<Utc>>,
        row_count: u64,
    ) {
        self.processed_file_ids.extend(merged_ids);
        if let Some(newest) = newest_modified {
            if self.last_processed_time.map_or(true, |prev| newest > prev) {
                self.last_processed_time = Some(newest);
            }
        }
        self.last_import_row_count = row_count;
        self.last_run = Some(Utc::now());
    }

    // The cursor and watch registration survive a destination reset.
    pub fn reset_destination(&mut self) {
        self.processed_file_ids.clear();
        self.last_processed_time = None;
        self.last_import_row_count = 0;
        self.last_run = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFile {
    pub id: String,
    pub name: String,
    pub modified_time: DateTime<Utc>,
}

/// File metadata attached to a change record, when the upstream still has it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub file_id: String,
    pub file: Option<ChangedFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    pub next_cursor: Option<String>,
    pub new_start_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub resource_id: String,
    pub message_number: String,
    pub channel_id: String,
    pub resource_state: String,
}

impl Notification {
    pub fn is_sync_handshake(&self) -> bool {
        self.resource_state == SYNC_HANDSHAKE_STATE
    }

    /// Ordered concatenation of identity fields, empty components dropped;
    /// `None` when every component is empty.
    pub fn dedupe_key(&self) -> Option<String> {
        let key = build_dedupe_key(&[
            &self.resource_id,
            &self.message_number,
            &self.channel_id,
            &self.resource_state,
        ]);
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

pub fn build_dedupe_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":")
}

// How the reconciler assembles the full row set handed to the sink. Stated
// in configuration, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    AppendRewrite,
    FreshWindow,
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append-rewrite" | "append_rewrite" | "append" => Ok(Self::AppendRewrite),
            "fresh-window" | "fresh_window" | "fresh" => Ok(Self::FreshWindow),
            other => Err(format!(
                "unknown merge policy {other:?} (expected append-rewrite or fresh-window)"
            )),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppendRewrite => f.write_str("append-rewrite"),
            Self::FreshWindow => f.write_str("fresh-window"),
        }
    }
}

/// Fixed column set and ANDed equality filters applied during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractContract {
    pub columns: Vec<String>,
    pub filters: Vec<(String, String)>,
}

impl ExtractContract {
    // Destination columns plus filter columns, order preserved, no repeats.
    pub fn wanted_columns(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut wanted = Vec::new();
        for name in self
            .columns
            .iter()
            .chain(self.filters.iter().map(|(k, _)| k))
        {
            if seen.insert(name.as_str()) {
                wanted.push(name.clone());
            }
        }
        wanted
    }
}

/// Status-cell heartbeat, e.g. `7:05 PM Mar-3`.
pub fn format_status_timestamp(dt: DateTime<FixedOffset>) -> String {
    use chrono::Timelike;

    let hour24 = dt.hour();
    let hour12 = match hour24 % 12 {
        0 => 12,
        h => h,
    };
    let ampm = if hour24 < 12 { "AM" } else { "PM" };
    format!(
        "{}:{:02} {} {}-{}",
        hour12,
        dt.minute(),
        ampm,
        dt.format("%b"),
        dt.format("%-d"),
    )
}
