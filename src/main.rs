//! Conversational-completion gateway over a single shared session
//!
//! (c) Softlandia 2025

use session_llm_gateway::api::{self, AppState};
use session_llm_gateway::config::Settings;
use session_llm_gateway::core;
use session_llm_gateway::core::scheduler::SchedulerContext;
use session_llm_gateway::core::services::{EchoBackend, FragmentCache};
use session_llm_gateway::core::traits::{ExecutionBackend, StreamCache};

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use log::info;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tower_http::cors::{Any, CorsLayer};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // initialize tracing
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    // The scheduler context is built once, up front; producers, worker and
    // backend all share it by handle.
    let ctx = SchedulerContext::new(settings);
    let backend: Arc<dyn ExecutionBackend> = Arc::new(EchoBackend::new(ctx.gates.clone()));
    let cache: Arc<dyn StreamCache> = Arc::new(FragmentCache::default());

    let worker_handle = runtime.spawn(core::worker::run(ctx.clone(), backend, cache));
    let web_handle = runtime.spawn(web_server_task(ctx.clone()));

    runtime.block_on(async {
        web_handle.await.expect("failed to join web server task");
        worker_handle.await.expect("failed to join worker task");
    });

    Ok(())
}

async fn web_server_task(ctx: Arc<SchedulerContext>) {
    let state = AppState { ctx: ctx.clone() };

    // build our application with a route
    let app = Router::new()
        .route("/health", get(api::queue::health))
        .nest("/v1", api::chat::router().merge(api::queue::router()))
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(Any),
        )
        .with_state(state);

    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(&ctx.settings.bind_addr)
        .await
        .expect("failed to bind the listen address");
    info!(
        "listening on {}",
        listener.local_addr().expect("listener has a local address")
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(ctx.shutdown.clone().cancelled_owned())
        .await
        .expect("web server failed");
    info!("Shutting down...");
}
