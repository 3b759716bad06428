use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use portico::gateway::http::{router, AppState};
use portico::gateway::sync::{Poller, Settings};
use portico::gateway::Gateway;
use portico::profiles::ProfileRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let gateway = Arc::new(Gateway::new(ProfileRegistry::builtin()));
    let state = AppState::new(gateway.clone());

    let cancel = CancellationToken::new();
    let poller = Poller::new(gateway, &settings)?;
    tokio::spawn(poller.run(cancel.clone()));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!(port = settings.port, "portico gateway listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                error!(error = %err, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    // No in-flight drain: sessions are resumable by clients.
    cancel.cancel();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
