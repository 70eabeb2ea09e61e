// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Bidirectional pump between a client connection and the worker-side
//! channel produced by the handoff, run for the life of the session.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::protocol::Parser;

const BRIDGE_BUFFER_CAPACITY: usize = 8192;

/// Copy bytes in both directions until either side reaches end-of-stream or
/// errors, then close both halves.
///
/// Bytes the handshake parser buffered past the instruction boundary belong
/// to the worker and are forwarded first, before any fresh socket bytes, in
/// their original arrival order; the parser is released once that drain
/// completes. The two directions run as independent pump loops so a stalled
/// reader on one side cannot block the other, and each propagates its
/// end-of-stream to the peer half. Mid-session I/O failures end the loops
/// without further reporting; they are the ordinary way sessions end.
///
/// Returns the byte counts forwarded client-to-worker and worker-to-client.
pub async fn run<C, W>(client: C, worker: W, mut parser: Parser) -> (u64, u64)
where
  C: AsyncRead + AsyncWrite + Send + Unpin,
  W: AsyncRead + AsyncWrite + Send + Unpin,
{
  let (client_read, mut client_write) = tokio::io::split(client);
  let (worker_read, mut worker_write) = tokio::io::split(worker);

  let upstream = async move {
    let mut forwarded = 0u64;
    let leftover = parser.take_buffered();
    if !leftover.is_empty() {
      if worker_write.write_all(&leftover).await.is_err() {
        let _ = worker_write.shutdown().await;
        return forwarded;
      }
      forwarded += leftover.len() as u64;
    }
    // The parser is only released once its over-read bytes are delivered.
    drop(parser);
    let mut client_read = BufReader::with_capacity(BRIDGE_BUFFER_CAPACITY, client_read);
    if let Ok(copied) = tokio::io::copy_buf(&mut client_read, &mut worker_write).await {
      forwarded += copied;
    }
    let _ = worker_write.shutdown().await;
    forwarded
  };

  let downstream = async move {
    let mut worker_read = BufReader::with_capacity(BRIDGE_BUFFER_CAPACITY, worker_read);
    let copied = tokio::io::copy_buf(&mut worker_read, &mut client_write)
      .await
      .unwrap_or(0);
    let _ = client_write.shutdown().await;
    copied
  };

  let (to_worker, to_client) = futures::future::join(upstream, downstream).await;
  tracing::trace!(to_worker, to_client, "Bridge loops finished");
  (to_worker, to_client)
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::time::timeout;

  use super::run;
  use crate::common::protocol::Parser;

  const TEST_TIMEOUT: Duration = Duration::from_secs(5);

  /// Produce a parser that has consumed one instruction and over-read the
  /// given trailing bytes.
  async fn parser_with_leftover(leftover: &[u8]) -> Parser {
    let (mut near, mut far) = tokio::io::duplex(1024);
    let mut framed = b"4.sync;".to_vec();
    framed.extend_from_slice(leftover);
    near.write_all(&framed).await.unwrap();
    let mut parser = Parser::new();
    parser.expect(&mut far, "sync", TEST_TIMEOUT).await.unwrap();
    parser
  }

  #[tokio::test]
  async fn buffered_bytes_reach_the_worker_before_fresh_bytes() {
    let parser = parser_with_leftover(b"early").await;
    let (client_near, mut client_far) = tokio::io::duplex(1024);
    let (worker_near, mut worker_far) = tokio::io::duplex(1024);

    let bridge = tokio::spawn(async move { run(client_near, worker_near, parser).await });

    client_far.write_all(b"-late").await.unwrap();
    client_far.shutdown().await.unwrap();

    let mut seen = Vec::new();
    timeout(TEST_TIMEOUT, worker_far.read_to_end(&mut seen))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(seen, b"early-late");

    drop(worker_far);
    let (to_worker, _to_client) = timeout(TEST_TIMEOUT, bridge).await.unwrap().unwrap();
    assert_eq!(to_worker, 10);
  }

  #[tokio::test]
  async fn client_close_reaches_the_worker_side() {
    let (client_near, client_far) = tokio::io::duplex(1024);
    let (worker_near, mut worker_far) = tokio::io::duplex(1024);
    let _bridge = tokio::spawn(async move {
      run(client_near, worker_near, Parser::new()).await
    });

    drop(client_far);
    let mut seen = Vec::new();
    let read = timeout(TEST_TIMEOUT, worker_far.read_to_end(&mut seen))
      .await
      .expect("worker side never observed end-of-stream")
      .unwrap();
    assert_eq!(read, 0);
  }

  #[tokio::test]
  async fn worker_close_reaches_the_client_side() {
    let (client_near, mut client_far) = tokio::io::duplex(1024);
    let (worker_near, mut worker_far) = tokio::io::duplex(1024);
    let _bridge = tokio::spawn(async move {
      run(client_near, worker_near, Parser::new()).await
    });

    worker_far.write_all(b"tail").await.unwrap();
    drop(worker_far);
    let mut seen = Vec::new();
    timeout(TEST_TIMEOUT, client_far.read_to_end(&mut seen))
      .await
      .expect("client side never observed end-of-stream")
      .unwrap();
    assert_eq!(seen, b"tail");
  }

  #[tokio::test]
  async fn echoing_worker_round_trips_payload() {
    let (client_near, mut client_far) = tokio::io::duplex(1024);
    let (worker_near, worker_far) = tokio::io::duplex(1024);
    let _bridge = tokio::spawn(async move {
      run(client_near, worker_near, Parser::new()).await
    });
    let _echo = tokio::spawn(async move {
      let (mut read, mut write) = tokio::io::split(worker_far);
      let _ = tokio::io::copy(&mut read, &mut write).await;
    });

    client_far.write_all(b"marco").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(TEST_TIMEOUT, client_far.read_exact(&mut buf))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buf, b"marco");
  }
}
