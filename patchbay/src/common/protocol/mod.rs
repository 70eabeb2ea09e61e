// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Minimal reader/writer for the line-oriented handshake protocol.
//!
//! Instructions are length-prefixed elements separated by `,` and terminated
//! by `;`, e.g. `4.select,8.vnc-test;`. The router consumes exactly one
//! instruction from each connection; any bytes read past the instruction
//! boundary stay buffered in the [`Parser`] and belong to the worker, which
//! receives them ahead of all fresh socket bytes.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ceiling on a single instruction, matching the read buffer used by the
/// bridge loops.
pub const INSTRUCTION_MAX_LENGTH: usize = 8192;

const READ_CHUNK: usize = 4096;

/// Protocol-level status codes carried by `error` instructions, rendered as
/// decimal in the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  ServerError = 0x0200,
  ResourceNotFound = 0x0204,
}

impl Status {
  pub fn code(&self) -> u16 {
    *self as u16
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
  pub opcode: String,
  pub args: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("no complete instruction arrived within {0:?}")]
  Timeout(Duration),
  #[error("malformed instruction: {0}")]
  Malformed(&'static str),
  #[error("instruction exceeds the maximum permitted length")]
  TooLong,
  #[error("expected \"{expected}\" but received \"{received}\"")]
  UnexpectedOpcode { expected: String, received: String },
  #[error("stream closed during handshake")]
  Closed,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Incremental instruction reader. Reads from the stream in chunks, so it
/// may hold bytes belonging to the next protocol exchange once an
/// instruction has been consumed; those must be drained with
/// [`Parser::take_buffered`] before the underlying stream is read again.
#[derive(Default)]
pub struct Parser {
  buffer: Vec<u8>,
}

impl Parser {
  pub fn new() -> Self {
    Self { buffer: Vec::new() }
  }

  /// Read the next instruction, requiring the given opcode, within the
  /// given deadline.
  pub async fn expect<S: AsyncRead + Unpin>(
    &mut self,
    stream: &mut S,
    opcode: &str,
    deadline: Duration,
  ) -> Result<Instruction, HandshakeError> {
    let instruction = tokio::time::timeout(deadline, self.next_instruction(stream))
      .await
      .map_err(|_| HandshakeError::Timeout(deadline))??;
    if instruction.opcode != opcode {
      return Err(HandshakeError::UnexpectedOpcode {
        expected: opcode.to_owned(),
        received: instruction.opcode,
      });
    }
    Ok(instruction)
  }

  /// Read and consume the next complete instruction from the stream.
  pub async fn next_instruction<S: AsyncRead + Unpin>(
    &mut self,
    stream: &mut S,
  ) -> Result<Instruction, HandshakeError> {
    loop {
      if let Some((instruction, consumed)) = Self::try_parse(&self.buffer)? {
        self.buffer.drain(..consumed);
        return Ok(instruction);
      }
      if self.buffer.len() >= INSTRUCTION_MAX_LENGTH {
        return Err(HandshakeError::TooLong);
      }
      let mut chunk = [0u8; READ_CHUNK];
      let received = stream.read(&mut chunk).await?;
      if received == 0 {
        return Err(HandshakeError::Closed);
      }
      self.buffer.extend_from_slice(&chunk[..received]);
    }
  }

  /// Surrender all bytes read past the last consumed instruction, in their
  /// original arrival order.
  pub fn take_buffered(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buffer)
  }

  /// Attempt to decode one instruction from the front of `buffer`. Returns
  /// the instruction and the number of bytes it occupied, or `None` when
  /// more input is needed.
  fn try_parse(buffer: &[u8]) -> Result<Option<(Instruction, usize)>, HandshakeError> {
    let mut elements: Vec<String> = Vec::new();
    let mut position = 0usize;
    loop {
      // Decode the element length prefix. Element lengths count bytes.
      let digits_start = position;
      while position < buffer.len() && buffer[position].is_ascii_digit() {
        position += 1;
      }
      if position == buffer.len() {
        return Ok(None);
      }
      if position == digits_start {
        return Err(HandshakeError::Malformed("element length missing"));
      }
      if buffer[position] != b'.' {
        return Err(HandshakeError::Malformed("element length not terminated by '.'"));
      }
      let length: usize = std::str::from_utf8(&buffer[digits_start..position])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or(HandshakeError::Malformed("unparseable element length"))?;
      position += 1;
      if position + length >= INSTRUCTION_MAX_LENGTH {
        return Err(HandshakeError::TooLong);
      }
      if position + length + 1 > buffer.len() {
        return Ok(None);
      }
      let value = std::str::from_utf8(&buffer[position..position + length])
        .map_err(|_| HandshakeError::Malformed("element is not valid UTF-8"))?;
      elements.push(value.to_owned());
      position += length;
      match buffer[position] {
        b',' => position += 1,
        b';' => {
          position += 1;
          let mut elements = elements.into_iter();
          let opcode = elements
            .next()
            .ok_or(HandshakeError::Malformed("instruction carries no opcode"))?;
          return Ok(Some((
            Instruction {
              opcode,
              args: elements.collect(),
            },
            position,
          )));
        }
        _ => return Err(HandshakeError::Malformed("element not terminated by ',' or ';'")),
      }
    }
  }
}

/// Render an instruction in wire form.
pub fn format_instruction(opcode: &str, args: &[&str]) -> String {
  use std::fmt::Write;
  let mut rendered = String::new();
  let _ = write!(rendered, "{}.{}", opcode.len(), opcode);
  for arg in args {
    let _ = write!(rendered, ",{}.{}", arg.len(), arg);
  }
  rendered.push(';');
  rendered
}

pub async fn write_instruction<S: AsyncWrite + Unpin>(
  stream: &mut S,
  opcode: &str,
  args: &[&str],
) -> std::io::Result<()> {
  stream
    .write_all(format_instruction(opcode, args).as_bytes())
    .await?;
  stream.flush().await
}

/// Emit the protocol-level `error` instruction carrying a human-readable
/// message and a status code, used to ward off a client before closing.
pub async fn send_error<S: AsyncWrite + Unpin>(
  stream: &mut S,
  message: &str,
  status: Status,
) -> std::io::Result<()> {
  write_instruction(stream, "error", &[message, &status.code().to_string()]).await
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::AsyncWriteExt;

  use super::{format_instruction, HandshakeError, Parser, Status};

  const TEST_TIMEOUT: Duration = Duration::from_secs(5);

  #[tokio::test]
  async fn reads_select_instruction() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"6.select,8.vnc-test;").await.unwrap();
    let mut parser = Parser::new();
    let instruction = parser
      .expect(&mut server, "select", TEST_TIMEOUT)
      .await
      .unwrap();
    assert_eq!(instruction.opcode, "select");
    assert_eq!(instruction.args, vec!["vnc-test".to_owned()]);
    assert!(parser.take_buffered().is_empty());
  }

  #[tokio::test]
  async fn reassembles_instructions_split_across_reads() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let writer = tokio::spawn(async move {
      for chunk in [&b"6.sele"[..], &b"ct,3.v"[..], &b"nc;"[..]] {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
      client
    });
    let mut parser = Parser::new();
    let instruction = parser
      .expect(&mut server, "select", TEST_TIMEOUT)
      .await
      .unwrap();
    assert_eq!(instruction.args, vec!["vnc".to_owned()]);
    writer.await.unwrap();
  }

  #[tokio::test]
  async fn retains_bytes_past_the_instruction_boundary() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"4.sync;trailing-bytes").await.unwrap();
    let mut parser = Parser::new();
    parser.expect(&mut server, "sync", TEST_TIMEOUT).await.unwrap();
    assert_eq!(parser.take_buffered(), b"trailing-bytes".to_vec());
  }

  #[tokio::test]
  async fn rejects_unexpected_opcode() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"4.sync;").await.unwrap();
    let mut parser = Parser::new();
    match parser.expect(&mut server, "select", TEST_TIMEOUT).await {
      Err(HandshakeError::UnexpectedOpcode { expected, received }) => {
        assert_eq!(expected, "select");
        assert_eq!(received, "sync");
      }
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn times_out_on_silence() {
    let (_client, mut server) = tokio::io::duplex(1024);
    let mut parser = Parser::new();
    match parser
      .expect(&mut server, "select", Duration::from_millis(50))
      .await
    {
      Err(HandshakeError::Timeout(_)) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn reports_closed_stream() {
    let (client, mut server) = tokio::io::duplex(1024);
    drop(client);
    let mut parser = Parser::new();
    match parser.expect(&mut server, "select", TEST_TIMEOUT).await {
      Err(HandshakeError::Closed) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn rejects_malformed_length_prefix() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"x.select;").await.unwrap();
    let mut parser = Parser::new();
    match parser.expect(&mut server, "select", TEST_TIMEOUT).await {
      Err(HandshakeError::Malformed(_)) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[tokio::test]
  async fn rejects_oversized_elements() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"10000.x;").await.unwrap();
    let mut parser = Parser::new();
    match parser.expect(&mut server, "select", TEST_TIMEOUT).await {
      Err(HandshakeError::TooLong) => {}
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn formats_error_reply() {
    let rendered = format_instruction(
      "error",
      &["No such connection.", &Status::ResourceNotFound.code().to_string()],
    );
    assert_eq!(rendered, "5.error,19.No such connection.,3.516;");
  }
}
