use apitrace::{app, build_state_from_env, CaptureLayer};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout honours RUST_LOG; request capture sees debug and above regardless.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .with(CaptureLayer.with_filter(LevelFilter::DEBUG))
        .init();

    let state = build_state_from_env().await?;
    let tracer = state.tracer.clone();
    let port = state.config.port;
    let app = app(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // let in-flight trace pipelines land before exiting
    tracer.drain().await;
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
