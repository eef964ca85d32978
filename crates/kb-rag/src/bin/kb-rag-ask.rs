//! kb-rag-ask: run one question through the pipeline and print the SSE stream.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kb_rag::{
    CancellationToken, KnowledgeBaseKey, PipelineConfig, PipelineOrchestrator, PipelineOutput,
    PipelineRequest,
};
use tracing_subscriber::EnvFilter;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Ask a knowledge base a question
#[derive(Parser, Debug)]
#[command(name = "kb-rag-ask", version, about, long_about = None)]
struct Cli {
    /// The question to answer
    question: String,

    /// Pipeline configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Knowledge base owner id
    #[arg(long, requires = "kb")]
    owner: Option<u64>,

    /// Knowledge base id; omit to answer without retrieval
    #[arg(long, requires = "owner")]
    kb: Option<u64>,

    /// Replace the default answer instructions
    #[arg(long)]
    system_prompt: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("KB_RAG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.with_target(true).json().init();
    } else {
        builder.with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env();
            config.validate()?;
            config
        }
    };

    let orchestrator = Arc::new(
        PipelineOrchestrator::from_config(config).context("failed to configure pipeline endpoints")?,
    );
    let shutdown = CancellationToken::new();
    let reaper = orchestrator
        .registry()
        .spawn_reaper(REAPER_INTERVAL, shutdown.child_token());

    let mut request = PipelineRequest::new(cli.question);
    request.system_prompt = cli.system_prompt;
    if let (Some(owner), Some(kb)) = (cli.owner, cli.kb) {
        request = request.with_knowledge_base(KnowledgeBaseKey::new(owner, kb));
    }

    let cancel = shutdown.child_token();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling request");
            ctrl_c.cancel();
        }
    });

    let mut rx = orchestrator.stream(request, cancel);
    let mut failed = false;
    let mut stdout = std::io::stdout().lock();
    while let Some(output) = rx.recv().await {
        failed |= matches!(output, PipelineOutput::Error(_));
        stdout.write_all(output.to_sse().as_bytes())?;
        stdout.flush()?;
    }
    drop(stdout);

    shutdown.cancel();
    let _ = reaper.await;
    orchestrator.registry().close_all().await;

    if failed {
        anyhow::bail!("answer generation failed");
    }
    Ok(())
}
