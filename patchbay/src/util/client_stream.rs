// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// The client-facing byte channel handled by the router and bridge.
///
/// TLS termination is an external concern: a secure-socket factory hands back
/// any read/write pair through the [`ClientStream::Boxed`] variant, and its
/// absence falls back to the plain TCP wrapper. Memory streams are used by
/// in-process tests.
pub enum ClientStream {
  Tcp(TcpStream),
  Boxed(
    Box<dyn AsyncRead + Send + Unpin + 'static>,
    Box<dyn AsyncWrite + Send + Unpin + 'static>,
  ),
  Duplex(tokio::io::DuplexStream),
}

impl From<TcpStream> for ClientStream {
  fn from(stream: TcpStream) -> Self {
    ClientStream::Tcp(stream)
  }
}

impl From<tokio::io::DuplexStream> for ClientStream {
  fn from(stream: tokio::io::DuplexStream) -> Self {
    ClientStream::Duplex(stream)
  }
}

impl AsyncRead for ClientStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut tokio::io::ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      ClientStream::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      ClientStream::Boxed(ref mut s, _) => AsyncRead::poll_read(Pin::new(&mut *s), cx, buf),
      ClientStream::Duplex(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for ClientStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      ClientStream::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      ClientStream::Boxed(_, ref mut s) => AsyncWrite::poll_write(Pin::new(&mut *s), cx, buf),
      ClientStream::Duplex(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      ClientStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      ClientStream::Boxed(_, ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut *s), cx),
      ClientStream::Duplex(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      ClientStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      ClientStream::Boxed(_, ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut *s), cx),
      ClientStream::Duplex(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}
