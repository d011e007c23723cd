use std::sync::Arc;

use pigeon::channels::webhook::{WebhookState, webhook_routes};
use pigeon::channels::{LogResponder, Responder, TwilioResponder};
use pigeon::config::{PigeonConfig, QueueBackend};
use pigeon::llm::create_provider;
use pigeon::pipeline::{
    AdmissionController, DeferredDispatcher, FallbackReplier, LlmAnalyzer, MessageProcessor,
};
use pigeon::queue::{AdmissionQueue, InMemoryQueue};
use pigeon::store::LibSqlBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PigeonConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export OPENAI_API_KEY=sk-...");
        std::process::exit(1);
    });

    eprintln!("🐦 Pigeon v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Analyzer: {}", config.analyzer.model);
    eprintln!("   Gate: {:?}, queue: {:?}", config.gate, config.queue_backend);
    eprintln!("   Webhook: http://0.0.0.0:{}/message\n", config.port);

    // Storage
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await?
            .with_collection(&config.collection),
    );
    let queue: Arc<dyn AdmissionQueue> = match config.queue_backend {
        QueueBackend::Sqlite => db.clone(),
        QueueBackend::Memory => Arc::new(InMemoryQueue::new()),
    };

    // LLMs
    let analyzer = Arc::new(LlmAnalyzer::new(create_provider(&config.analyzer)?));
    let fallback_llm = match &config.fallback {
        Some(llm) => Some(create_provider(llm)?),
        None => {
            tracing::warn!("XAI_API_KEY not set, fallback replies will be canned text");
            None
        }
    };

    // Outbound SMS
    let responder: Arc<dyn Responder> = match config.twilio.clone() {
        Some(twilio) => {
            tracing::info!(account = %twilio.account_sid, "Twilio responder enabled");
            Arc::new(TwilioResponder::new(twilio))
        }
        None => {
            tracing::warn!("Twilio not configured, deferred replies will only be logged");
            Arc::new(LogResponder)
        }
    };

    let admission = AdmissionController::new(db.clone(), queue.clone(), analyzer, &config.queue_name)
        .with_gate(config.gate);
    let dispatcher = Arc::new(DeferredDispatcher::new(
        queue,
        &config.queue_name,
        responder,
    ));
    let processor = Arc::new(MessageProcessor::new(
        admission,
        dispatcher,
        FallbackReplier::new(fallback_llm),
    ));

    processor
        .startup(config.reset_on_start, config.clear_log_on_start)
        .await?;

    let app = webhook_routes(WebhookState {
        processor: Arc::clone(&processor),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await?;

    processor.shutdown().await;
    tracing::info!("Pigeon stopped");
    Ok(())
}
