use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use assistants_engine::api::{self, AppState};
use assistants_engine::config::{CONFIRMATION_POLL_INTERVAL, EngineConfig};
use assistants_engine::jobs::cleanup::spawn_cleanup;
use assistants_engine::jobs::completion::ChatCompletionWorker;
use assistants_engine::jobs::{Triggers, spawn_worker};
use assistants_engine::llm::{LlmProvider, OpenAiProvider};
use assistants_engine::runs::{RunService, RunWorker};
use assistants_engine::store::{Database, LibSqlBackend};
use assistants_engine::tools::{Confirmer, ShellExecutor, ToolExecutor, ToolRegistry, ToolStepWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export OPENAI_API_KEY=sk-...");
        std::process::exit(1);
    });

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("Assistants engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listen: http://{}", config.listen_addr);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Worker: {}", config.worker_id);
    eprintln!("   Default model: {}", config.llm.default_model);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path.display(), e);
                std::process::exit(1);
            }),
    );

    // ── Shared components ───────────────────────────────────────────────
    let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(&config.llm));
    let registry = Arc::new(ToolRegistry::with_defaults());
    let executor: Arc<dyn ToolExecutor> = Arc::new(ShellExecutor::new());
    let triggers = Triggers::new(config.triggers_enabled);
    let shutdown = CancellationToken::new();
    eprintln!("   Built-in tools: {}", registry.list().join(", "));
    eprintln!(
        "   Triggers: {}",
        if config.triggers_enabled { "in-process" } else { "polling only" }
    );

    // ── Workers ─────────────────────────────────────────────────────────
    let run_worker = RunWorker::new(
        Arc::clone(&db),
        Arc::clone(&llm),
        Arc::clone(&registry),
        Arc::clone(&triggers.runs),
        Arc::clone(&triggers.tool_steps),
        config.worker_id.clone(),
    )
    .with_default_model(config.llm.default_model.clone())
    .with_shutdown(shutdown.child_token());

    let confirmer = Confirmer::new(
        Arc::clone(&db),
        config.confirm_tools,
        CONFIRMATION_POLL_INTERVAL,
        config.run_ttl,
    );
    let tool_worker = ToolStepWorker::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        executor,
        confirmer,
        Arc::clone(&triggers.runs),
        Arc::clone(&triggers.tool_steps),
        config.worker_id.clone(),
    )
    .with_shutdown(shutdown.child_token());

    let chat_worker = ChatCompletionWorker::new(
        Arc::clone(&db),
        Arc::clone(&llm),
        Arc::clone(&triggers.chat_completions),
        config.worker_id.clone(),
    );

    let handles = vec![
        spawn_worker(
            Arc::new(run_worker),
            Arc::clone(&triggers.runs),
            config.poll_interval,
            shutdown.child_token(),
        ),
        spawn_worker(
            Arc::new(tool_worker),
            Arc::clone(&triggers.tool_steps),
            config.poll_interval,
            shutdown.child_token(),
        ),
        spawn_worker(
            Arc::new(chat_worker),
            Arc::clone(&triggers.chat_completions),
            config.poll_interval,
            shutdown.child_token(),
        ),
        spawn_cleanup(
            Arc::clone(&db),
            Arc::clone(&triggers.runs),
            config.retention,
            config.cleanup_interval,
            shutdown.child_token(),
        ),
    ];

    // ── HTTP ────────────────────────────────────────────────────────────
    let runs = Arc::new(RunService::new(
        Arc::clone(&db),
        Arc::clone(&triggers.runs),
        config.run_ttl,
        config.llm.default_model.clone(),
    )
    .with_tool_trigger(Arc::clone(&triggers.tool_steps)));
    let state = AppState::new(runs, Arc::clone(&triggers.chat_completions), config.poll_interval);
    let app = api::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "HTTP server started");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            server_shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Console logging, plus a daily rolling file when a log directory is set.
fn init_tracing(config: &EngineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "assistants-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
