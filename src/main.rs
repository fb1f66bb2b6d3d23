//! Gitclaim Server
//!
//! Receives GitHub webhooks and pays out bounties against verified proofs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gitclaim::{
    BountyRepository, Config, EventRouter, GitHubClient, HttpProofVerifier, LighthouseUploader,
    PgBountyRepository, ProofPipeline, ProofQueue, ProofWorker, PullRequestLinker,
    SqliteBountyRepository, VlayerCli,
};

#[derive(Parser, Debug)]
#[command(name = "gitclaim-server", version, about = "GitHub bounty payout service")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "GITCLAIM_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?
        .with_env();
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("Starting gitclaim server v{}", env!("CARGO_PKG_VERSION"));

    let repository: Arc<dyn BountyRepository> = match &config.database.url {
        Some(url) => {
            let storage = PgBountyRepository::new(url).await?;
            info!("PostgreSQL storage initialized");
            Arc::new(storage)
        }
        None => {
            let storage = SqliteBountyRepository::new(&config.database.sqlite_path)
                .with_context(|| {
                    format!("Failed to open {}", config.database.sqlite_path.display())
                })?;
            info!(
                "SQLite storage initialized at {}",
                config.database.sqlite_path.display()
            );
            Arc::new(storage)
        }
    };

    if config.upload.api_key.is_none() {
        warn!("LIGHTHOUSE_API_KEY not set - proof sources cannot be uploaded");
    }
    if config.verifier.url.is_none() {
        warn!("VERIFIER_URL not set - proofs cannot be verified");
    }

    let github = Arc::new(GitHubClient::new(
        config.github.api_base.clone(),
        config.github_token(),
    ));
    let uploader = Arc::new(
        LighthouseUploader::new(
            config.upload.api_url.clone(),
            config.upload.gateway_url.clone(),
            config.upload.api_key.clone(),
        )
        .with_timeout(Duration::from_secs(config.upload.timeout_secs)),
    );
    let fetcher = Arc::new(VlayerCli::new(
        config.webproof.binary.clone(),
        config.webproof.notary_url.clone(),
    ));
    let verifier = Arc::new(HttpProofVerifier::new(config.verifier.url.clone()));

    let pipeline = Arc::new(ProofPipeline::new(
        repository.clone(),
        uploader.clone(),
        fetcher,
        verifier,
        github.clone(),
        config.pipeline_settings(),
    ));

    let (queue, jobs) = ProofQueue::new();
    tokio::spawn(ProofWorker::new(pipeline.clone(), jobs).run());
    info!("Background proof worker started");

    let linker = Arc::new(PullRequestLinker::new(
        repository.clone(),
        github,
        pipeline,
        Arc::new(queue),
    ));
    let state = Arc::new(gitclaim::server::AppState::new(
        EventRouter::new(linker),
        repository,
        uploader,
    ));

    gitclaim::server::run_server(&config.server, state).await?;

    Ok(())
}
