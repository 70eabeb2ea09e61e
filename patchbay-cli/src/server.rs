// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use futures::StreamExt;
use patchbay::common::daemon::{GatewayDaemon, RouterConfig};
use patchbay::common::worker::transport::HandoffStrategy;
use patchbay::common::worker::ProcessWorkerLauncher;
use patchbay::util::client_stream::ClientStream;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ServerArgs {
  pub bind_addr: SocketAddr,
  pub worker_executable: PathBuf,
  pub handoff: HandoffStrategy,
  pub handshake_timeout: Duration,
}

/// Run the routing daemon until interrupted.
pub async fn server_main(config: ServerArgs) -> Result<()> {
  let launcher = ProcessWorkerLauncher::new(config.worker_executable, config.handoff);
  let daemon = GatewayDaemon::new(
    launcher,
    RouterConfig {
      handshake_timeout: config.handshake_timeout,
    },
  );

  let listener = TcpListener::bind(config.bind_addr)
    .await
    .with_context(|| format!("unable to bind {}", config.bind_addr))?;
  tracing::info!(addr = %config.bind_addr, handoff = %config.handoff, "Listening for connections");

  let shutdown = CancellationToken::new();
  let sigint_handler_task = {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown requested");
        shutdown.cancel();
      }
    })
  };

  let connections = TcpListenerStream::new(listener).filter_map(|accepted| async move {
    match accepted {
      Ok(stream) => Some(ClientStream::from(stream)),
      Err(error) => {
        tracing::warn!(%error, "Failed to accept connection");
        None
      }
    }
  });

  daemon
    .run(connections, shutdown)
    .await
    .context("gateway pipeline exited abnormally")?;
  sigint_handler_task.abort();
  Ok(())
}
