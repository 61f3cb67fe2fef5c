//! Batch extraction CLI.
//!
//! Reads canonicalized document text files, runs them through the
//! pipeline against a local model server, and writes the batch report as
//! JSON. Ctrl-C cancels the batch cooperatively; partial results are
//! still reported.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ledgerlens::backend::HttpBackend;
use ledgerlens::pipeline::{cancel_pair, PipelineCoordinator};
use ledgerlens::{
    CoreConfig, Document, ExtractionRequest, SchemaRegistry, SchemaVersion, StatementType,
};

#[derive(Parser, Debug)]
#[command(
    name = "ledgerlens-batch",
    about = "Extract structured financial-statement data from document text files"
)]
struct Args {
    /// Canonicalized document text files to process.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Statement type to extract (balance_sheet, income_statement,
    /// cash_flow_statement, or schedule:<name>).
    #[arg(long, default_value = "balance_sheet")]
    statement: String,

    /// Schema version to extract against.
    #[arg(long, default_value_t = 1)]
    schema_version: u32,

    /// JSON pipeline config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with extra schema definitions (supporting schedules).
    #[arg(long)]
    schemas: Option<PathBuf>,

    /// Model server base URL.
    #[arg(long, default_value = "http://localhost:11434")]
    backend_url: String,

    /// Model name on the server.
    #[arg(long, default_value = "ledger-8b")]
    model: String,

    /// Recompute even when a cached result exists.
    #[arg(long)]
    force_refresh: bool,

    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<CoreConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CoreConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    let mut registry = SchemaRegistry::builtin();
    if let Some(path) = &args.schemas {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading schemas {}", path.display()))?;
        let loaded = registry
            .load_json(&raw)
            .with_context(|| format!("loading schemas {}", path.display()))?;
        info!(loaded, "loaded extra schema definitions");
    }

    let statement: StatementType = args
        .statement
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let version = SchemaVersion(args.schema_version);

    let backend = Arc::new(
        HttpBackend::new(&args.backend_url, &args.model, config.inference_timeout_secs)
            .context("building backend client")?,
    );
    let coordinator = PipelineCoordinator::new(backend, Arc::new(registry), &config)
        .context("building pipeline")?;
    coordinator
        .healthy()
        .await
        .context("backend health check failed")?;

    let mut requests = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading document {}", path.display()))?;
        let document = Arc::new(Document::from_text(content));
        let mut request = ExtractionRequest::new(document, statement.clone(), version);
        if args.force_refresh {
            request = request.force_refresh();
        }
        requests.push(request);
    }

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            handle.cancel();
        }
    });

    info!(
        documents = requests.len(),
        statement = %args.statement,
        "starting batch"
    );
    let report = coordinator.run_batch(requests, &signal).await;

    let rendered = serde_json::to_string_pretty(&report).context("serializing report")?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("writing report {}", path.display()))?;
            info!(report = %path.display(), "report written");
        }
        None => println!("{rendered}"),
    }

    info!(
        validated = report.metrics.validated,
        failed = report.metrics.failed,
        cancelled = report.metrics.cancelled,
        "batch complete"
    );
    if report.metrics.validated < report.metrics.total {
        std::process::exit(1);
    }
    Ok(())
}
