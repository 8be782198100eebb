//! Run one batch from the command line and print the report as JSON
//! Run with: cargo run --release --bin audit_batch -- <document>...

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use docaudit::{
    core::PipelineConfig, BatchOptions, BatchOrchestrator, Config, Document, DocumentInput,
    Metrics, ModelSet, ResultStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("docaudit=info,ort=off")
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("Usage: audit_batch <document>...");
        std::process::exit(2);
    }

    let config = Config::new()?;
    let metrics = Metrics::new();
    let models = ModelSet::load(&config, metrics.clone()).await?;
    let orchestrator = BatchOrchestrator::new(
        models.clone(),
        Arc::new(ResultStore::with_retention(config.max_retained_batches())),
        metrics,
        PipelineConfig::from_config(&config),
    );

    let mut inputs = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = tokio::fs::read(path).await?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        // Full path keeps ids unique when file names repeat
        inputs.push(DocumentInput::Inline(
            Document::new(path.clone(), bytes).with_filename(name),
        ));
    }

    info!("Auditing {} document(s)", inputs.len());
    let report = orchestrator
        .process_batch(inputs, &BatchOptions::default())
        .await?;
    models.shutdown();

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
