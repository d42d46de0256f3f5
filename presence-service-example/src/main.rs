//! Example binary hosting the presence service core behind `axum::serve`.

use std::net::SocketAddr;

use clap::Parser;
use presence_service::PresenceServiceBuilder;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct Args {
    #[clap(flatten)]
    service: presence_service::config::PresenceServiceConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let ws_port = args.service.ws_port;
    let cancellation_token = CancellationToken::new();

    let builder = PresenceServiceBuilder::init(args.service, cancellation_token.clone()).await?;
    let (router, sweepers) = builder.build();

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", ws_port)).await?;
    tracing::info!(port = ws_port, "listening");

    let serve_cancellation_token = cancellation_token.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        serve_cancellation_token.cancel();
    })
    .await?;

    for sweeper in sweepers {
        let _ = sweeper.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
