//! legworkd - HTTP server entry point.
//!
//! Wires the live completion client, evidence sources, run history and the
//! engine together, then serves the request API.

use std::sync::Arc;

use legwork::api;
use legwork::config::Config;
use legwork::engine::Engine;
use legwork::evidence::{memory, MemorySource, SourceRouter, CALENDAR, CHAT, MAILBOX};
use legwork::history;
use legwork::llm::OpenRouterCompletions;
use legwork::strategy::StrategyRegistry;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "legwork=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!(
        planner = %config.planner_model,
        synthesis = %config.synthesis_model,
        "loaded configuration"
    );

    // Evidence sources: a fixture file when one is configured, otherwise
    // empty in-memory sources for the built-in ids.
    let router = match &config.evidence_fixture_path {
        Some(path) => {
            let router = memory::router_from_fixture(path)?;
            info!(path = %path.display(), sources = ?router.ids(), "loaded evidence fixture");
            router
        }
        None => {
            info!("no evidence fixture configured, starting with empty sources");
            let mut router = SourceRouter::new();
            router.register(Arc::new(MemorySource::new(MAILBOX)));
            router.register(Arc::new(MemorySource::new(CALENDAR)));
            router.register(Arc::new(MemorySource::new(CHAT)));
            router
        }
    };
    let registry = Arc::new(StrategyRegistry::with_defaults(Arc::new(router)));

    // Run history: sqlite when a path is configured, in-memory otherwise.
    let store = history::open_store(config.history_db_path.clone()).await?;

    let client = Arc::new(OpenRouterCompletions::new(config.api_key.clone()));
    let engine = Arc::new(Engine::new(client, registry, store, config));

    api::serve(engine).await?;

    Ok(())
}
