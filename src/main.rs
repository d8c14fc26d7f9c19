use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierverify::classifier::{
    ClassifierCache, CommandReasoningService, EvictionPolicy, ReasoningService,
    UnavailableReasoningService,
};
use tierverify::cli::{Cli, Commands, ConfigAction};
use tierverify::config::VerifyConfig;
use tierverify::corpus::CorpusIndex;
use tierverify::error::Result;
use tierverify::oracle::SubprocessOracle;
use tierverify::orchestrator::{Orchestrator, VerificationRequest};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tierverify=debug")
    } else {
        EnvFilter::new("tierverify=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = VerifyConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Verify { request } => cmd_verify(&config, &request).await,
        Commands::Route { query } => cmd_route(&config, &query).await,
        Commands::Config { action } => cmd_config(&config, &cli.config, action).await,
    }
}

async fn build_orchestrator(config: &VerifyConfig) -> Result<Orchestrator> {
    let corpus = Arc::new(
        CorpusIndex::load(&config.corpus.procedural_path, &config.corpus.primary_path).await?,
    );

    let reasoning: Arc<dyn ReasoningService> = match &config.classifier.command {
        Some(command) => Arc::new(CommandReasoningService::new(
            command,
            Duration::from_secs(config.classifier.timeout_secs),
        )),
        None => Arc::new(UnavailableReasoningService),
    };

    let eviction = match config.classifier.max_cache_entries {
        0 => EvictionPolicy::Unbounded,
        max_entries => EvictionPolicy::Lru { max_entries },
    };
    let cache = Arc::new(ClassifierCache::new(eviction));

    let oracle = Arc::new(SubprocessOracle::from_config(&config.oracle));

    Ok(Orchestrator::new(corpus, reasoning, oracle, cache, config))
}

async fn cmd_verify(config: &VerifyConfig, request_path: &std::path::Path) -> Result<()> {
    let content = tokio::fs::read_to_string(request_path).await?;
    let request: VerificationRequest = serde_json::from_str(&content)?;

    let orchestrator = build_orchestrator(config).await?;
    let result = orchestrator.verify(&request).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_route(config: &VerifyConfig, query: &str) -> Result<()> {
    let corpus = Arc::new(
        CorpusIndex::load(&config.corpus.procedural_path, &config.corpus.primary_path).await?,
    );
    let router = tierverify::router::Router::new(corpus, config.router.clone());
    let decision = router.route(query);

    let summary = serde_json::json!({
        "track": decision.track,
        "procedural_score": decision.procedural_score,
        "primary_score": decision.primary_score,
        "degenerate": decision.degenerate,
        "ranked_sections": decision
            .ranked
            .iter()
            .map(|r| r.section.clone())
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_config(
    config: &VerifyConfig,
    path: &std::path::Path,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Init => {
            if path.exists() {
                eprintln!("configuration already exists: {}", path.display());
                return Ok(());
            }
            VerifyConfig::default().save(path).await?;
            eprintln!("wrote default configuration: {}", path.display());
        }
    }
    Ok(())
}
