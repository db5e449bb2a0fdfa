use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod api;
mod config;
mod crm;
mod error;
mod intake;
mod notify;
mod ocr;
mod ops;
mod pdf;
mod queue;
mod report;
mod split;
mod storage;
mod tracking;
mod validate;

use intake::MetadataOverrides;
use ops::{AppState, WorkerKind};

#[derive(Parser)]
#[command(name = "oficios")]
#[command(version)]
#[command(about = "Splits bundled legal oficios, validates them and feeds OCR and CRM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Also run the OCR and CRM workers in this process
        #[arg(long)]
        workers: bool,
    },
    /// Ingest a raw email (.eml) carrying a PDF bundle
    IngestEmail { path: PathBuf },
    /// Ingest a PDF bundle directly
    IngestPdf {
        path: PathBuf,
        #[arg(long)]
        declared: Option<u32>,
        #[arg(long)]
        empresa: Option<String>,
        #[arg(long)]
        contact_email: Option<String>,
    },
    /// Consume one queue until Ctrl-C
    Worker {
        kind: WorkerKind,
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
    /// Requeue failed jobs whose backoff has elapsed
    Retry {
        /// Also drop finished records older than --days
        #[arg(long)]
        cleanup: bool,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Print how a PDF would be split, without storing anything
    Split {
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        declared: u32,
    },
    /// Retry notifications saved in the outbox
    FlushNotifications,
    /// Print the status report of a batch as JSON
    Report { batch_id: String },
}

impl Commands {
    fn is_long_running(&self) -> bool {
        matches!(self, Commands::Serve { .. } | Commands::Worker { .. })
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = config::Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;

    // Setup logging
    let file_appender = tracing_appender::rolling::daily(&config.data_dir, "oficios.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let stderr_level = if cli.command.is_long_running() { "info" } else { "warn" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(stderr_level))),
        )
        .init();

    config.prepare()?;
    tracing::debug!("Configuration: {:?}", config);

    if let Commands::Split { path, declared } = &cli.command {
        let bytes = std::fs::read(path)?;
        validate::validate_pdf_bytes(&bytes)?;
        let bundle = pdf::PdfBundle::load(&bytes)?;
        let plan = split::plan_split_skipping_cover(bundle.page_texts(), *declared);
        println!(
            "{} pages, {} oficios via {}{}",
            plan.total_pages,
            plan.count(),
            plan.strategy,
            if plan.skipped_cover { " (cover page skipped)" } else { "" }
        );
        for (idx, range) in plan.ranges.iter().enumerate() {
            let preview = split::preview_text(bundle.page_texts(), *range, 500);
            println!(
                "  {:>3}. pages {:<9} {}",
                idx + 1,
                range.label(),
                split::classify_document(&preview)
            );
        }
        if *declared > 0 {
            let report = validate::validate_quantity(*declared, plan.count() as u32, config.count_policy);
            println!("{}", report.message);
        }
        return Ok(());
    }

    let state = Arc::new(AppState::from_config(config)?);

    match cli.command {
        Commands::Serve { workers } => {
            if workers {
                for kind in [WorkerKind::Ocr, WorkerKind::Crm] {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ops::run_worker(state, kind, Duration::from_secs(5)).await {
                            tracing::error!("{:?} worker exited: {:#}", kind, e);
                        }
                    });
                }
            }
            api::serve(state).await?;
        }
        Commands::IngestEmail { path } => {
            let raw = std::fs::read(&path)?;
            let outcome = ops::ingest_email(&state, &raw).await?;
            print_json(&outcome)?;
        }
        Commands::IngestPdf {
            path,
            declared,
            empresa,
            contact_email,
        } => {
            let bytes = std::fs::read(&path)?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload.pdf".to_string());
            let overrides = MetadataOverrides {
                empresa,
                declared_count: declared,
                contact_email,
                ..MetadataOverrides::default()
            };
            let outcome = ops::ingest_pdf(&state, bytes, &file_name, overrides).await?;
            print_json(&outcome)?;
        }
        Commands::Worker { kind, poll_secs } => {
            ops::run_worker(state, kind, Duration::from_secs(poll_secs)).await?;
        }
        Commands::Retry { cleanup, days } => {
            let now = chrono::Utc::now();
            let sweep = ops::sweep_retries(&state, now).await?;
            print_json(&sweep)?;
            if cleanup {
                let removed = ops::cleanup(&state, days, now).await?;
                println!("Removed {} finished records older than {} days", removed, days);
            }
        }
        Commands::FlushNotifications => {
            let report = state.notifier.flush_pending().await?;
            println!("Sent {}, still pending {}", report.sent, report.remaining);
        }
        Commands::Report { batch_id } => match state.tracking.get_batch(&batch_id)? {
            Some((summary, oficios)) => print_json(&report::build(summary, oficios, chrono::Utc::now()))?,
            None => anyhow::bail!("Batch {} not found", batch_id),
        },
        Commands::Split { .. } => unreachable!(), // Handled above
    }

    Ok(())
}
