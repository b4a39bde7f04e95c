use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod chat;
mod config;
mod error;
mod generation;
mod model;
mod session;
mod store;
mod web;

#[cfg(test)]
mod testing;

const PRUNE_EVERY: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = config::Settings::parse();
    info!("🤖 Starting chat with model {}", settings.model);

    let provider = Arc::new(model::ModelProvider::onnx(settings.models_dir.clone(), &settings.model));

    if !settings.no_warmup {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            match provider.get().await {
                Ok(loaded) => info!(
                    "🎯 Model ready (end-of-turn id {}, pad id {}, context {} tokens)",
                    loaded.tokenizer.eos_token_id(),
                    loaded.tokenizer.pad_token_id(),
                    loaded.model.context_window()
                ),
                Err(e) => warn!("Warm-up failed, chat is unavailable: {}", e),
            }
        });
    }

    let state = web::AppState::new(provider)?.with_session_idle(settings.session_idle());
    state.store().spawn_pruning(PRUNE_EVERY);
    let app = web::router(state);
    let listener = tokio::net::TcpListener::bind(settings.bind).await?;
    info!("Serving on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
