//! Durable workflow state storage + upstream retry/backoff utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use sheetsync_core::WorkflowState;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sheetsync-storage";

/// File-backed store holding one JSON state document per workflow key.
///
/// Corrupt or missing documents read as the empty initial state: a broken
/// state file must never take the pipeline down, only widen the next scan.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub async fn load(&self, key: &str) -> WorkflowState {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(err) => {
                    warn!(key, %err, "state file unreadable; starting from empty state");
                    WorkflowState::default()
                }
            },
            Err(_) => WorkflowState::default(),
        }
    }

    /// Persist via temp-file write + atomic rename so a crash mid-save never
    /// leaves a truncated document behind.
    pub async fn save(&self, key: &str, state: &WorkflowState) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(state).context("serializing workflow state")?;
        let temp_path = self.root.join(format!(".{}.{key}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming state file {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    if (500..600).contains(&status) || status == 429 {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Failure from an upstream collaborator (change source or destination sink).
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("malformed upstream payload: {0}")]
    Payload(String),
    #[error("operation not supported by this collaborator: {0}")]
    Unsupported(&'static str),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    /// Only 5xx-class (and throttling) failures are worth another attempt;
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => classify_status(*status) == RetryDisposition::Retryable,
            Self::Transport(_) => true,
            Self::Payload(_) | Self::Unsupported(_) | Self::Io(_) => false,
        }
    }
}

/// Fixed-attempt exponential backoff for retryable upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum ChatWebhookError {
    #[error("chat webhook returned status {0}")]
    Status(u16),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Outbound chat-notification client. A single timeout bounds worst-case
/// latency; callers treat every failure as best-effort.
#[derive(Debug, Clone)]
pub struct ChatWebhook {
    client: reqwest::Client,
    url: String,
}

impl ChatWebhook {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building chat webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn post_image(&self, image_bytes: &[u8]) -> Result<(), ChatWebhookError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        self.post_payload(serde_json::json!({
            "tag": "image",
            "image_base64": {"content": encoded},
        }))
        .await
    }

    pub async fn post_text(&self, text: &str, mention_all: bool) -> Result<(), ChatWebhookError> {
        let mut payload = serde_json::json!({
            "tag": "text",
            "text": {"content": text, "format": 2},
        });
        if mention_all {
            payload["text"]["at_all"] = serde_json::Value::Bool(true);
        }
        self.post_payload(payload).await
    }

    async fn post_payload(&self, payload: serde_json::Value) -> Result<(), ChatWebhookError> {
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ChatWebhookError::Status(status.as_u16()))
        }
    }
}
