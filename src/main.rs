#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use learnflow::logging::{init_tracing, setup_panic_hook};
use learnflow::routes::router;
use learnflow::{AppState, Args};

use clap::Parser;
use futures_util::FutureExt;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _log_guards = init_tracing(&args.log_dir);
    setup_panic_hook();

    let addr = format!("{}:{}", args.host, args.port);

    let state = match AppState::from_args(args).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to initialise application state: {}", e);
            std::process::exit(1);
        }
    };

    let vendors = state.vendors.availability();
    for (name, configured) in &vendors {
        if !*configured {
            tracing::warn!("[{}] No API key configured; its route will fail", name);
        }
    }
    match &state.archive {
        Some(_) => tracing::info!("Chat archive enabled"),
        None => tracing::warn!("No chat store configured; answers will not be archived"),
    }

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("LearnFlow relay listening on {}", addr);
    let server_future = async move { axum::serve(listener, app).await };

    match std::panic::AssertUnwindSafe(server_future)
        .catch_unwind()
        .await
    {
        Ok(result) => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        Err(panic_payload) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "Unknown panic"
            };
            tracing::error!(target: "panic", "CRITICAL: Server task panicked: {}", message);
        }
    }
}
