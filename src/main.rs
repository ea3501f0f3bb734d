use std::sync::Arc;

use anyhow::Result;
use vision_gateway::{
    api, config, metrics, ClassificationService, EngineEnvironment, OrtBootstrap, OrtEngine,
    TextExtractionService,
};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    // onnxruntime logs every session build at info
                    .add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    tracing::info!("Starting vision gateway...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    // Load configuration
    let config = config::Config::load()?;
    tracing::info!(
        model = %config.model.model_path.display(),
        ocr_command = %config.ocr.command.display(),
        ocr_device = %config.ocr.device,
        "Configuration loaded"
    );

    let environment = Arc::new(EngineEnvironment::new(OrtBootstrap {
        dylib_path: config.model.ort_dylib_path.clone(),
    }));

    // Bootstrap the runtime up front; a failure is cached and the OCR pipeline keeps serving
    let warmup = environment.clone();
    match tokio::task::spawn_blocking(move || warmup.ensure_initialized()).await? {
        Ok(()) => tracing::info!("Inference environment ready"),
        Err(e) => tracing::error!(
            "{}; classification requests will be rejected until restart",
            e
        ),
    }

    let classifier = ClassificationService::new(
        environment,
        Arc::new(OrtEngine::new(config.session_spec())),
        config.classify.max_concurrency,
        config.classify.wait_limit(),
    );
    let text_extraction = TextExtractionService::new(config.text_extraction_settings());

    let app = api::router(
        api::AppState {
            classifier: Arc::new(classifier),
            text_extraction: Arc::new(text_extraction),
        },
        config.max_upload_bytes,
    );

    tracing::info!("HTTP API listening on http://{}", config.bind_addr());
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining in-flight requests");
}
