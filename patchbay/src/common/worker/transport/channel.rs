// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::fs::File;
use std::io::{Error as IOError, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};

/// The router-or-worker side of a handed-off connection, whichever shape the
/// active transport produced. Socket channels come from socketpairs and
/// rendezvous connections; pipe channels from the two-handle transfer form.
pub enum WorkerChannel {
  Socket(tokio::net::UnixStream),
  Pipes(PipeChannel),
  Duplex(tokio::io::DuplexStream),
}

impl std::fmt::Debug for WorkerChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerChannel::Socket(_) => f.write_str("WorkerChannel::Socket"),
      WorkerChannel::Pipes(_) => f.write_str("WorkerChannel::Pipes"),
      WorkerChannel::Duplex(_) => f.write_str("WorkerChannel::Duplex"),
    }
  }
}

impl AsyncRead for WorkerChannel {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WorkerChannel::Socket(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WorkerChannel::Pipes(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WorkerChannel::Duplex(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for WorkerChannel {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WorkerChannel::Socket(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WorkerChannel::Pipes(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WorkerChannel::Duplex(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WorkerChannel::Socket(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WorkerChannel::Pipes(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WorkerChannel::Duplex(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WorkerChannel::Socket(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WorkerChannel::Pipes(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WorkerChannel::Duplex(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}

/// Duplex channel over a pair of pipe ends, one read and one write. Shutdown
/// closes the write end so the peer observes end-of-stream.
pub struct PipeChannel {
  read: AsyncFd<File>,
  write: Option<AsyncFd<File>>,
}

impl PipeChannel {
  pub fn new(read: OwnedFd, write: OwnedFd) -> Result<Self, IOError> {
    set_nonblocking(&read)?;
    set_nonblocking(&write)?;
    Ok(Self {
      read: AsyncFd::with_interest(File::from(read), Interest::READABLE)?,
      write: Some(AsyncFd::with_interest(File::from(write), Interest::WRITABLE)?),
    })
  }
}

fn set_nonblocking(fd: &impl AsRawFd) -> Result<(), IOError> {
  let raw = fd.as_raw_fd();
  let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
  if flags < 0 {
    return Err(IOError::last_os_error());
  }
  if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
    return Err(IOError::last_os_error());
  }
  Ok(())
}

impl AsyncRead for PipeChannel {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    loop {
      let mut ready = match this.read.poll_read_ready_mut(cx) {
        Poll::Ready(ready) => ready?,
        Poll::Pending => return Poll::Pending,
      };
      let unfilled = buf.initialize_unfilled();
      match ready.try_io(|inner| inner.get_mut().read(unfilled)) {
        Ok(Ok(read)) => {
          buf.advance(read);
          return Poll::Ready(Ok(()));
        }
        Ok(Err(error)) => return Poll::Ready(Err(error)),
        Err(_would_block) => continue,
      }
    }
  }
}

impl AsyncWrite for PipeChannel {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.get_mut();
    loop {
      let write = match this.write.as_mut() {
        Some(write) => write,
        None => return Poll::Ready(Err(IOError::from(std::io::ErrorKind::NotConnected))),
      };
      let mut ready = match write.poll_write_ready_mut(cx) {
        Poll::Ready(ready) => ready?,
        Poll::Pending => return Poll::Pending,
      };
      match ready.try_io(|inner| inner.get_mut().write(buf)) {
        Ok(result) => return Poll::Ready(result),
        Err(_would_block) => continue,
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    // Pipes carry no userspace buffer to drain.
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    // Dropping the write end is the only end-of-stream signal a pipe has.
    self.get_mut().write = None;
    Poll::Ready(Ok(()))
  }
}
