use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use evaluator::catalog::FileCatalog;
use evaluator::config::{AppConfig, StoreBackend};
use evaluator::feedback::{FeedbackAggregator, FeedbackAnalyzer, RemoteAnalyzer};
use evaluator::gateway::{GatewayLimits, SubmissionGateway};
use evaluator::runner::process::ProcessRunner;
use evaluator::scoring::ThresholdPolicy;
use evaluator::server::AppState;
use evaluator::session::{SessionDeps, SessionRegistry};
use evaluator::store::{MemoryStore, RedisStore, SubmissionStore};
use evaluator::{config, languages, server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("evaluator=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = config::init_config(AppConfig::from_env()?)?;

    languages::init_languages()?;
    info!("Loaded language configurations");

    let catalog = FileCatalog::load(&config.challenges_path)?;

    let store: Arc<dyn SubmissionStore> = match config.store_backend {
        StoreBackend::Redis => {
            Arc::new(RedisStore::connect(&config.redis_url, config.result_ttl_secs).await?)
        }
        StoreBackend::Memory => {
            info!("Using in-memory submission store");
            Arc::new(MemoryStore::new())
        }
    };

    let remote = match &config.ai_service_url {
        Some(url) => {
            info!("AI analysis enabled at {}", url);
            let analyzer = RemoteAnalyzer::new(url.clone(), config.ai_timeout)?;
            Some(Arc::new(analyzer) as Arc<dyn FeedbackAnalyzer>)
        }
        None => {
            info!("AI_SERVICE_URL not set, using rule-based feedback only");
            None
        }
    };

    let deps = SessionDeps {
        runner: Arc::new(ProcessRunner::default()),
        feedback: Arc::new(FeedbackAggregator::new(remote)),
        policy: Arc::new(ThresholdPolicy::new(config.partial_credit_percent)),
        store,
        outbound_capacity: config.outbound_capacity,
        feedback_grace: config.feedback_grace,
    };

    let gateway = SubmissionGateway::new(
        Arc::new(catalog),
        Arc::new(SessionRegistry::with_retention(config.stream_retention)),
        deps,
        GatewayLimits {
            max_code_bytes: config.max_code_bytes,
            default_deadline: config.default_deadline,
        },
    );

    let app = server::router(Arc::new(AppState {
        gateway,
        fast_path_wait: config.fast_path_wait,
    }));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Evaluator listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
