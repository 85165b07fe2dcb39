//! # Citation Core Server Driver
//!
//! ## Purpose
//! Main entry point: loads configuration, wires the service graph (corpus
//! store, retrieval engine, augmenter, model client, audit recorder,
//! telemetry), and starts the API server. Also exposes the offline
//! maintenance modes: health checks, retention cleanup, and the batch eval
//! sweep.
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging
//! 3. Open the corpus store and construct the service graph explicitly
//! 4. Run the requested mode (serve by default)
//! 5. Shut down cleanly on ctrl-c

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use std::sync::Arc;
use tracing::info;

use grounded_cite::api::ApiServer;
use grounded_cite::audit::{AuditRecorder, SledRunStore};
use grounded_cite::augment::{EmbeddingProvider, RecallAugmenter};
use grounded_cite::corpus::CorpusStore;
use grounded_cite::generator::{EmbeddingsClient, LlmClient};
use grounded_cite::pipeline::QueryPipeline;
use grounded_cite::retrieval::RetrievalEngine;
use grounded_cite::telemetry::{default_eval_set, TelemetryStore};
use grounded_cite::utils::LeakyBucket;
use grounded_cite::{AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("grounded-cite-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Grounded citation retrieval and verification core for patent opinions")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("check-health")
                .long("check-health")
                .help("Run health checks and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cleanup")
                .long("cleanup")
                .help("Run the retention cleanup and exit (dry-run unless --apply)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("apply")
                .long("apply")
                .help("Apply retention changes instead of reporting them")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("eval")
                .long("eval")
                .help("Run the batch eval sweep across doctrine families and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").expect("has default");
    let mut config = Config::load(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }
    let config = Arc::new(config);

    init_logging(&config);
    info!("Starting grounded-cite v{}", env!("CARGO_PKG_VERSION"));

    let state = build_services(config.clone()).context("failed to initialize services")?;

    if matches.get_flag("check-health") {
        state.corpus.health_check().context("storage health check failed")?;
        let corpus_state = state.corpus.corpus_state()?;
        info!(
            documents = corpus_state.document_count,
            pages = corpus_state.page_count,
            version = %corpus_state.version_id,
            "health check passed"
        );
        return Ok(());
    }

    if matches.get_flag("cleanup") {
        let report = state.recorder.cleanup(!matches.get_flag("apply"))?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if matches.get_flag("eval") {
        let report = state.pipeline.run_eval(default_eval_set()).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let server = ApiServer::new(state.clone())
        .build()
        .context("failed to build API server")?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Server error: {}", e);
        }
    });

    info!(
        "grounded-cite listening on {}:{}",
        config.server.host, config.server.port
    );

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    server_handle.abort();
    state.recorder.flush();
    Ok(())
}

/// Construct the full service graph. All shared state is explicit; there are
/// no module-level globals.
fn build_services(config: Arc<Config>) -> anyhow::Result<AppState> {
    let corpus = Arc::new(CorpusStore::open(config.storage.clone())?);
    let engine = Arc::new(RetrievalEngine::new(corpus.clone(), config.retrieval.clone()));

    let embedder: Option<Arc<dyn EmbeddingProvider>> = {
        let client = EmbeddingsClient::new(config.generation.clone());
        if client.available() {
            Some(Arc::new(client))
        } else {
            None
        }
    };
    let augmenter = RecallAugmenter::new(
        config.augment.clone(),
        corpus.clone(),
        engine.clone(),
        embedder,
    );

    let llm = Arc::new(LlmClient::new(config.generation.clone()));
    let recorder = Arc::new(AuditRecorder::new(
        Arc::new(SledRunStore::open(corpus.database())?),
        config.audit.clone(),
    ));
    let telemetry = Arc::new(TelemetryStore::new());
    let rate_limiter = Arc::new(LeakyBucket::new(
        config.server.rate_limit_per_second,
        config.server.rate_limit_burst,
    ));

    let pipeline = Arc::new(QueryPipeline::new(
        config.clone(),
        corpus.clone(),
        engine,
        augmenter,
        llm,
        recorder.clone(),
        telemetry.clone(),
        None,
    ));

    Ok(AppState {
        config,
        pipeline,
        corpus,
        recorder,
        telemetry,
        rate_limiter,
    })
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.json_format {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
