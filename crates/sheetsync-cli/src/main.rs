//! `sheetsync` binary: one-shot reconcile runs, the webhook server, watch
//! registration, and state inspection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sheetsync_adapters::{ChatPublisher, CsvTableSink, FsChangeSource};
use sheetsync_storage::{ChatWebhook, StateStore};
use sheetsync_sync::{AppConfig, Workflow};
use sheetsync_web::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sheetsync")]
#[command(about = "Archive-to-table ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One reconcile pass, exiting non-zero on failure.
    Run {
        /// Re-merge every listed archive regardless of stored state.
        #[arg(long)]
        force: bool,
        /// Restrict to one configured workflow by name.
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Serve the webhook and operational HTTP surface.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Register (or renew) the push-notification channel.
    Watch {
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Print the durable state of every configured workflow.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    config.validate()?;
    let workflows = build_workflows(&config)?;

    match cli.command.unwrap_or(Commands::Run {
        force: false,
        workflow: None,
    }) {
        Commands::Run { force, workflow } => {
            for wf in select(&workflows, workflow.as_deref())? {
                let outcome = wf.reconcile(force).await?;
                println!(
                    "run complete: workflow={} rows_added={} files_merged={}",
                    wf.name(),
                    outcome.rows_added,
                    outcome.files_merged.len()
                );
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            let state = AppState::new(workflows, config.channel_token.clone());
            sheetsync_web::serve(state, port).await?;
        }
        Commands::Watch { workflow } => {
            let secret = (!config.channel_token.is_empty()).then_some(config.channel_token.as_str());
            for wf in select(&workflows, workflow.as_deref())? {
                let registration = wf.register_watch(secret).await?;
                println!(
                    "watch registered: workflow={} channel={} expires={}",
                    wf.name(),
                    registration.channel_id,
                    registration.expiration.as_deref().unwrap_or("never")
                );
            }
        }
        Commands::Status => {
            for wf in &workflows {
                let state = wf.current_state().await;
                println!(
                    "workflow={} processed_files={} last_import_rows={} cursor={} watch={}",
                    wf.name(),
                    state.processed_file_ids.len(),
                    state.last_import_row_count,
                    state.change_cursor.as_deref().unwrap_or("-"),
                    if state.watch.is_some() { "active" } else { "none" },
                );
            }
        }
    }

    Ok(())
}

fn build_workflows(config: &AppConfig) -> Result<Vec<Arc<Workflow>>> {
    let source = Arc::new(FsChangeSource::new(&config.source_root));
    let webhook = if config.chat_webhook_url.is_empty() {
        None
    } else {
        Some(
            ChatWebhook::new(
                config.chat_webhook_url.clone(),
                Duration::from_secs(config.chat_timeout_secs),
            )
            .context("configuring chat webhook")?,
        )
    };
    let publisher = Arc::new(ChatPublisher::new(webhook));

    config
        .workflows
        .iter()
        .map(|wf| {
            let sink = Arc::new(CsvTableSink::new(&wf.dest_table));
            Ok(Arc::new(Workflow::new(
                wf.clone(),
                source.clone(),
                sink,
                publisher.clone(),
                StateStore::new(&config.state_dir),
            )))
        })
        .collect()
}

fn select<'a>(
    workflows: &'a [Arc<Workflow>],
    name: Option<&str>,
) -> Result<Vec<&'a Arc<Workflow>>> {
    match name {
        None => Ok(workflows.iter().collect()),
        Some(name) => workflows
            .iter()
            .find(|w| w.name() == name)
            .map(|w| vec![w])
            .ok_or_else(|| anyhow::anyhow!("unknown workflow {name:?}")),
    }
}
