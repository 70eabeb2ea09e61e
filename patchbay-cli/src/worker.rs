// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::os::fd::RawFd;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use patchbay::common::protocol::write_instruction;
use patchbay::common::worker::host::WorkerHost;
use patchbay::common::worker::transport::{HandoffStrategy, WorkerChannel};

pub struct WorkerArgs {
  pub protocol: String,
  pub session_id: String,
  pub control_fd: RawFd,
  pub handoff: HandoffStrategy,
}

/// Host one worker session: adopt the inherited control channel, report
/// readiness, and drive each attached user until the router goes away.
///
/// Protocol engines are linked in here in a full deployment; this host runs
/// the built-in loopback driver, which announces the session and then echoes
/// the user's bytes.
pub async fn worker_main(config: WorkerArgs) -> Result<()> {
  tracing::info!(
    protocol = %config.protocol,
    session = %config.session_id,
    "Worker host starting"
  );
  let mut host = unsafe { WorkerHost::adopt(config.control_fd, config.handoff) }
    .context("unable to adopt control channel")?;
  host
    .announce_ready()
    .await
    .context("unable to report readiness")?;

  let session_id = Arc::new(config.session_id);
  loop {
    match host.next_attachment().await {
      Ok(Some(channel)) => {
        tracing::info!("User attached");
        let session_id = Arc::clone(&session_id);
        tokio::spawn(async move {
          drive_user(channel, &session_id).await;
        });
      }
      Ok(None) => {
        tracing::info!("Routing daemon went away; worker host exiting");
        return Ok(());
      }
      Err(error) => {
        // The control channel is unusable once a transfer desyncs.
        tracing::warn!(%error, "Attachment failed; worker host exiting");
        return Ok(());
      }
    }
  }
}

async fn drive_user(channel: WorkerChannel, session_id: &str) {
  let (mut read, mut write) = tokio::io::split(channel);
  if write_instruction(&mut write, "ready", &[session_id])
    .await
    .is_err()
  {
    return;
  }
  let echoed = tokio::io::copy(&mut read, &mut write).await.unwrap_or(0);
  tracing::debug!(echoed, "User channel closed");
}
