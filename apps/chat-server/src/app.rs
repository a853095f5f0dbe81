//! Runs the chat hub until interrupted.

use std::sync::Arc;

use chathub_hub_server::{ChatHub, HubServer};

use crate::config::Config;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = HubServer::new(config.server_config(), ChatHub::new(config.hub_config()));

    let server_run = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { server_run.run().await });

    // Wait for the server to bind.
    let port = loop {
        if serve.is_finished() {
            break 0;
        }
        let p = server.port().await;
        if p > 0 {
            break p;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    if port == 0 {
        // Bind failed; surface the error.
        serve.await??;
        anyhow::bail!("server stopped before binding");
    }
    tracing::info!(port, path = %config.path, "chat hub listening");

    tokio::select! {
        result = &mut serve => {
            result??;
            tracing::warn!("server loop exited");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    tracing::info!(sessions = server.session_count(), "closing sessions");
    server.shutdown().await;
    serve.await??;
    Ok(())
}
