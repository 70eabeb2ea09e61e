// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Worker-process side of the control channel: adopt the inherited socket,
//! report readiness, and surface one channel per attached user.

use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use super::transport::{HandoffStrategy, HandoffTransport, TransportError, WorkerChannel};
use super::READY_ACK;

pub struct WorkerHost {
  control: UnixStream,
  transport: Arc<dyn HandoffTransport>,
}

impl WorkerHost {
  /// Adopt the control descriptor inherited from the router process.
  ///
  /// # Safety
  /// `control_fd` must be the inherited control socket, open and owned by
  /// nothing else in this process.
  pub unsafe fn adopt(control_fd: RawFd, strategy: HandoffStrategy) -> std::io::Result<Self> {
    let control = std::os::unix::net::UnixStream::from_raw_fd(control_fd);
    control.set_nonblocking(true)?;
    Ok(Self::from_stream(UnixStream::from_std(control)?, strategy))
  }

  pub fn from_stream(control: UnixStream, strategy: HandoffStrategy) -> Self {
    Self {
      control,
      transport: strategy.transport(),
    }
  }

  /// Tell the router this worker is usable. The router does not hand the
  /// session identifier to anyone before this arrives.
  pub async fn announce_ready(&mut self) -> std::io::Result<()> {
    self.control.write_all(&[READY_ACK]).await?;
    self.control.flush().await
  }

  /// Wait for the next attached user's channel; `None` once the router has
  /// gone away and no further users can arrive.
  pub async fn next_attachment(&mut self) -> Result<Option<WorkerChannel>, TransportError> {
    match self.transport.receive(&self.control).await {
      Ok(channel) => Ok(Some(channel)),
      Err(TransportError::ChannelClosed) => Ok(None),
      Err(error) => Err(error),
    }
  }
}
