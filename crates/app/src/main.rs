use std::sync::Arc;

use anyhow::Context;
use app::port::{DEFAULT_PORT_RANGE, find_available_port};
use app::{AppConfig, AppState, router};
use clap::Parser;
use codebox::Dispatcher;
use codebox::config::{CodeboxArgs, init_tracing};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// HTTP front end for the codebox dispatcher.
#[derive(Parser)]
#[command(name = "app", version, about, long_about = None)]
struct Args {
    /// Interface to listen on
    #[arg(long, env = "CODEBOX_HOST", default_value = "127.0.0.1")]
    host: String,

    /// First port tried
    #[arg(long, env = "CODEBOX_PORT_START", default_value_t = *DEFAULT_PORT_RANGE.start())]
    port_start: u16,

    /// Last port tried
    #[arg(long, env = "CODEBOX_PORT_END", default_value_t = *DEFAULT_PORT_RANGE.end())]
    port_end: u16,

    #[command(flatten)]
    codebox: CodeboxArgs,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.codebox.log_json)?;

    let config = args.codebox.to_config();
    let dispatcher =
        Dispatcher::from_config(&config).context("failed to initialize dispatcher")?;
    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        config: AppConfig {
            default_model: config.default_model.clone(),
            models: config.models.clone(),
        },
    };

    let port = find_available_port(&args.host, args.port_start..=args.port_end);
    let addr = format!("{}:{port}", args.host);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(async move {
        let app = router(state);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
