// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Ancillary-message handoff: the connection handle crosses the pre-existing
//! control channel as `SCM_RIGHTS` data, and the receiving process extracts
//! a fresh process-local descriptor indistinguishable from one it opened
//! itself.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use futures::future::{BoxFuture, FutureExt};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

use super::channel::{PipeChannel, WorkerChannel};
use super::{decode_handle_record, encode_handle_record, HandoffTransport, TransportError};
use super::{HANDLE_RECORD_LEN, NO_HANDLE};

pub struct AncillaryTransport {
  use_pipes: bool,
}

impl AncillaryTransport {
  /// Transfer one end of a fresh socketpair per attachment.
  pub fn sockets() -> Self {
    Self { use_pipes: false }
  }

  /// Transfer a read/write pipe pair per attachment.
  pub fn pipes() -> Self {
    Self { use_pipes: true }
  }

  async fn deliver_socketpair(
    control: &UnixStream,
  ) -> Result<WorkerChannel, TransportError> {
    let (mine, theirs) = std::os::unix::net::UnixStream::pair()?;
    let record = encode_handle_record(theirs.as_raw_fd(), None);
    send_handles(control, &record, &[theirs.as_raw_fd()]).await?;
    // The worker now holds its own reference; ours is closed here.
    drop(theirs);
    mine.set_nonblocking(true)?;
    Ok(WorkerChannel::Socket(UnixStream::from_std(mine)?))
  }

  async fn deliver_pipe_pair(control: &UnixStream) -> Result<WorkerChannel, TransportError> {
    let (worker_read, router_write) =
      nix::unistd::pipe().map_err(std::io::Error::from)?;
    let (router_read, worker_write) =
      nix::unistd::pipe().map_err(std::io::Error::from)?;
    let record =
      encode_handle_record(worker_read.as_raw_fd(), Some(worker_write.as_raw_fd()));
    send_handles(
      control,
      &record,
      &[worker_read.as_raw_fd(), worker_write.as_raw_fd()],
    )
    .await?;
    drop((worker_read, worker_write));
    Ok(WorkerChannel::Pipes(PipeChannel::new(
      router_read,
      router_write,
    )?))
  }
}

impl HandoffTransport for AncillaryTransport {
  fn deliver<'a>(
    &'a self,
    control: &'a UnixStream,
  ) -> BoxFuture<'a, Result<WorkerChannel, TransportError>> {
    async move {
      if self.use_pipes {
        Self::deliver_pipe_pair(control).await
      } else {
        Self::deliver_socketpair(control).await
      }
    }
    .boxed()
  }

  fn receive<'a>(
    &'a self,
    control: &'a UnixStream,
  ) -> BoxFuture<'a, Result<WorkerChannel, TransportError>> {
    async move {
      let (record, handles) = receive_handles(control).await?;
      let (first_slot, second_slot) = decode_handle_record(&record);
      tracing::trace!(first_slot, second_slot, "Received handle record");
      let mut handles = handles.into_iter();
      match (handles.next(), handles.next()) {
        (Some(read), Some(write)) => {
          Ok(WorkerChannel::Pipes(PipeChannel::new(read, write)?))
        }
        (Some(socket), None) => adopt_socket(socket),
        (None, _) => Err(TransportError::MissingHandles),
      }
    }
    .boxed()
  }
}

fn adopt_socket(socket: OwnedFd) -> Result<WorkerChannel, TransportError> {
  let stream = std::os::unix::net::UnixStream::from(socket);
  stream.set_nonblocking(true)?;
  Ok(WorkerChannel::Socket(UnixStream::from_std(stream)?))
}

/// Push a handle record plus its descriptors through the control channel in
/// one message. A short send leaves the worker without usable handles, so it
/// is reported as a failed transfer rather than retried.
async fn send_handles(
  control: &UnixStream,
  record: &[u8; HANDLE_RECORD_LEN],
  handles: &[RawFd],
) -> Result<(), TransportError> {
  let sent = control
    .async_io(Interest::WRITABLE, || {
      let iov = [IoSlice::new(record)];
      let rights = ControlMessage::ScmRights(handles);
      sendmsg::<()>(
        control.as_raw_fd(),
        &iov,
        &[rights],
        MsgFlags::empty(),
        None,
      )
      .map_err(std::io::Error::from)
    })
    .await?;
  if sent != HANDLE_RECORD_LEN {
    return Err(TransportError::Truncated(sent));
  }
  Ok(())
}

async fn receive_handles(
  control: &UnixStream,
) -> Result<([u8; HANDLE_RECORD_LEN], Vec<OwnedFd>), TransportError> {
  let (record, raw_handles, received) = control
    .async_io(Interest::READABLE, || {
      let mut record = [0u8; HANDLE_RECORD_LEN];
      let mut raw_handles: Vec<RawFd> = Vec::new();
      let received = {
        let mut iov = [IoSliceMut::new(&mut record)];
        let mut ancillary = nix::cmsg_space!([RawFd; 2]);
        let message = recvmsg::<()>(
          control.as_raw_fd(),
          &mut iov,
          Some(&mut ancillary),
          MsgFlags::empty(),
        )
        .map_err(std::io::Error::from)?;
        match message.cmsgs() {
          Ok(messages) => {
            for cmsg in messages {
              if let ControlMessageOwned::ScmRights(handles) = cmsg {
                raw_handles.extend(handles);
              }
            }
          }
          Err(errno) => return Err(std::io::Error::from(errno)),
        }
        message.bytes
      };
      Ok((record, raw_handles, received))
    })
    .await?;
  // Descriptors installed by the kernel are owned from this point on, even
  // if the record itself turns out to be unusable.
  let handles: Vec<OwnedFd> = raw_handles
    .into_iter()
    .filter(|handle| *handle != NO_HANDLE)
    .map(|handle| unsafe { OwnedFd::from_raw_fd(handle) })
    .collect();
  if received == 0 {
    return Err(TransportError::ChannelClosed);
  }
  if received != HANDLE_RECORD_LEN {
    return Err(TransportError::Truncated(received));
  }
  Ok((record, handles))
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::UnixStream;
  use tokio::time::timeout;

  use super::super::{HandoffTransport, TransportError};
  use super::AncillaryTransport;

  const TEST_TIMEOUT: Duration = Duration::from_secs(5);

  async fn round_trip(transport: AncillaryTransport) {
    let (router_control, worker_control) = UnixStream::pair().unwrap();
    let (delivered, received) = timeout(
      TEST_TIMEOUT,
      futures::future::try_join(
        transport.deliver(&router_control),
        transport.receive(&worker_control),
      ),
    )
    .await
    .expect("transfer never completed")
    .unwrap();

    let (mut router_side, mut worker_side) = (delivered, received);
    router_side.write_all(b"from-router").await.unwrap();
    let mut buf = [0u8; 11];
    timeout(TEST_TIMEOUT, worker_side.read_exact(&mut buf))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buf, b"from-router");

    worker_side.write_all(b"from-worker").await.unwrap();
    timeout(TEST_TIMEOUT, router_side.read_exact(&mut buf))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buf, b"from-worker");
  }

  #[tokio::test]
  async fn socketpair_handles_cross_the_boundary() {
    round_trip(AncillaryTransport::sockets()).await;
  }

  #[tokio::test]
  async fn pipe_pairs_cross_the_boundary() {
    round_trip(AncillaryTransport::pipes()).await;
  }

  #[tokio::test]
  async fn closed_control_channel_is_reported() {
    let (router_control, worker_control) = UnixStream::pair().unwrap();
    drop(router_control);
    let transport = AncillaryTransport::sockets();
    match timeout(TEST_TIMEOUT, transport.receive(&worker_control)).await {
      Ok(Err(TransportError::ChannelClosed)) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }
}
