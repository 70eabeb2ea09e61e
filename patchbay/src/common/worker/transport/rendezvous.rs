// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Rendezvous handoff for configurations where no descriptor may cross the
//! control channel: the router binds a uniquely named, single-use listener,
//! sends its name to the worker, and the connection the worker makes back
//! becomes the worker-side transport itself.

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::{UnixListener, UnixStream};

use super::channel::WorkerChannel;
use super::{HandoffTransport, TransportError};

/// Fixed size of the name buffer exchanged over the control channel, sized
/// to the platform's socket-path limit.
pub const CHANNEL_NAME_LEN: usize = 108;

const CHANNEL_NAME_PREFIX: &str = "patchbay-";

const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RendezvousTransport {
  dir: PathBuf,
  accept_timeout: Duration,
}

impl RendezvousTransport {
  pub fn new() -> Self {
    Self::in_dir(std::env::temp_dir())
  }

  pub fn in_dir(dir: PathBuf) -> Self {
    Self {
      dir,
      accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
    }
  }

  pub fn with_accept_timeout(mut self, accept_timeout: Duration) -> Self {
    self.accept_timeout = accept_timeout;
    self
  }
}

impl Default for RendezvousTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl HandoffTransport for RendezvousTransport {
  fn deliver<'a>(
    &'a self,
    control: &'a UnixStream,
  ) -> BoxFuture<'a, Result<WorkerChannel, TransportError>> {
    async move {
      // Single-instance by construction: the name embeds a fresh token.
      let name = format!("{}{}.sock", CHANNEL_NAME_PREFIX, uuid::Uuid::new_v4());
      let path = self.dir.join(name);
      let encoded = path.as_os_str().as_bytes();
      if encoded.len() >= CHANNEL_NAME_LEN {
        return Err(TransportError::BadChannelName);
      }
      let mut record = [0u8; CHANNEL_NAME_LEN];
      record[..encoded.len()].copy_from_slice(encoded);

      let listener = UnixListener::bind(&path)?;
      let accepted = match write_all_control(control, &record).await {
        Ok(()) => tokio::time::timeout(self.accept_timeout, listener.accept()).await,
        Err(error) => {
          let _ = std::fs::remove_file(&path);
          return Err(error);
        }
      };
      let _ = std::fs::remove_file(&path);
      match accepted {
        Ok(Ok((stream, _addr))) => Ok(WorkerChannel::Socket(stream)),
        Ok(Err(error)) => Err(TransportError::Io(error)),
        Err(_elapsed) => Err(TransportError::RendezvousTimeout(self.accept_timeout)),
      }
    }
    .boxed()
  }

  fn receive<'a>(
    &'a self,
    control: &'a UnixStream,
  ) -> BoxFuture<'a, Result<WorkerChannel, TransportError>> {
    async move {
      let mut record = [0u8; CHANNEL_NAME_LEN];
      read_exact_control(control, &mut record).await?;
      let end = record
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(CHANNEL_NAME_LEN);
      let path = std::str::from_utf8(&record[..end])
        .map_err(|_| TransportError::BadChannelName)?;
      if path.is_empty() {
        return Err(TransportError::BadChannelName);
      }
      let stream = UnixStream::connect(path).await?;
      Ok(WorkerChannel::Socket(stream))
    }
    .boxed()
  }
}

async fn write_all_control(
  control: &UnixStream,
  mut data: &[u8],
) -> Result<(), TransportError> {
  while !data.is_empty() {
    control.writable().await?;
    match control.try_write(data) {
      Ok(0) => return Err(TransportError::ChannelClosed),
      Ok(written) => data = &data[written..],
      Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => continue,
      Err(error) => return Err(TransportError::Io(error)),
    }
  }
  Ok(())
}

async fn read_exact_control(
  control: &UnixStream,
  buffer: &mut [u8],
) -> Result<(), TransportError> {
  let mut filled = 0usize;
  while filled < buffer.len() {
    control.readable().await?;
    match control.try_read(&mut buffer[filled..]) {
      Ok(0) => return Err(TransportError::ChannelClosed),
      Ok(read) => filled += read,
      Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => continue,
      Err(error) => return Err(TransportError::Io(error)),
    }
  }
  Ok(())
}
