// switchboard-server/src/main.rs

mod auth;
mod context;
mod routes;

use std::net::SocketAddr;

use axum_server::Handle;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use switchboard_core::config::BridgeConfig;

use context::BridgeContext;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(author, version, about = "Twitch EventSub bridge")]
struct Args {
    /// Address to bind the HTTP/WS listener to
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Logging level: "info", "warn", "debug", "error", or "trace"
    #[arg(long = "log-level", short = 'L', default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let default_filter = format!("switchboard={0},switchboard_core={0},tower_http=warn", level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = BridgeConfig::from_env()?;
    let ctx = BridgeContext::build(config).await?;
    ctx.start().await?;

    let app = routes::build_router(ctx.clone());
    let handle = Handle::new();

    {
        let handle = handle.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Signal listener failed: {e}");
                return;
            }
            info!("Shutdown requested");
            ctx.shutdown().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });
    }

    info!("Listening on http://{}", args.bind);
    axum_server::bind(args.bind)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
