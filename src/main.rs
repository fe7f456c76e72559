use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

mod client;
mod config;
mod courses;
mod error;
mod models;
mod report;
mod resource;
mod statuses;
mod sync;
mod users;

use crate::client::PercipioClient;
use crate::config::ConnectionArgs;
use crate::courses::CourseSyncer;
use crate::report::SyncSnapshot;
use crate::resource::ResourceSyncer;
use crate::sync::ReportSync;
use crate::users::UserSyncer;

#[derive(Parser)]
#[command(name = "percipio-report-sync")]
#[command(about = "Sync Percipio learning activity into users, courses and grants", long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Check credentials by generating the learning activity report
    Validate {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Run a full sync and write the resources, entitlements and grants as JSON
    Sync {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long, default_value = "sync.json")]
        out: PathBuf,
    },
    /// Generate a markdown summary of a sync run
    Report {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export course grants to a CSV file
    ExportGrants {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long)]
        csv: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn connect(connection: &ConnectionArgs) -> anyhow::Result<Arc<ReportSync>> {
    connection.validate()?;
    info!(organization_id = %connection.organization_id, "initializing Percipio connector");

    let client = PercipioClient::new(
        &connection.base_url,
        connection.organization_id.clone(),
        connection.api_token.clone(),
    )
    .context("failed to create Percipio client")?;

    Ok(Arc::new(ReportSync::new(
        Arc::new(client),
        connection.lookback(),
    )))
}

fn resource_syncers(sync: &Arc<ReportSync>) -> Vec<Box<dyn ResourceSyncer>> {
    vec![
        Box::new(UserSyncer::new(sync.clone())),
        Box::new(CourseSyncer::new(sync.clone())),
    ]
}

/// Applies the optional whole-run deadline. Dropping the future stops any
/// in-flight poll sleep.
async fn with_deadline<T, F>(connection: &ConnectionArgs, work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match connection.timeout() {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .with_context(|| format!("sync did not finish within {}s", limit.as_secs()))?,
        None => work.await,
    }
}

async fn run_sync(connection: &ConnectionArgs) -> anyhow::Result<SyncSnapshot> {
    let sync = connect(connection)?;
    let syncers = resource_syncers(&sync);
    let snapshot = with_deadline(connection, async {
        report::collect_snapshot(sync.run_id(), &syncers)
            .await
            .context("sync failed")
    })
    .await?;

    info!(
        run_id = %snapshot.run_id,
        resources = snapshot.resources.len(),
        entitlements = snapshot.entitlements.len(),
        grants = snapshot.grants.len(),
        "sync finished"
    );
    Ok(snapshot)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { connection } => {
            let sync = connect(&connection)?;
            let loaded = with_deadline(&connection, async {
                sync.validate()
                    .await
                    .context("failed to validate Percipio credentials")
            })
            .await?;
            let state = sync.state().await;
            info!(run_id = %sync.run_id(), state = ?state, "validation finished");
            println!(
                "Credentials valid. Report {} returned {} rows.",
                loaded.job.id,
                loaded.rows.len()
            );
        }
        Commands::Sync { connection, out } => {
            let snapshot = run_sync(&connection).await?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            std::fs::write(&out, json)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Synced {} resources and {} grants to {}.",
                snapshot.resources.len(),
                snapshot.grants.len(),
                out.display()
            );
        }
        Commands::Report { connection, out } => {
            let snapshot = run_sync(&connection).await?;
            let markdown = report::build_report(&snapshot);
            std::fs::write(&out, markdown)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::ExportGrants { connection, csv } => {
            let snapshot = run_sync(&connection).await?;
            let file = std::fs::File::create(&csv)
                .with_context(|| format!("failed to create {}", csv.display()))?;
            let written = report::write_grants_csv(&snapshot, file)?;
            println!("Exported {written} grants to {}.", csv.display());
        }
    }

    Ok(())
}
