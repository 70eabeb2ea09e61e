// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! End-to-end routing checks against the real daemon and worker processes.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Total length of a session identifier as rendered on the wire.
const SESSION_ID_LEN: usize = 37;

fn free_port() -> u16 {
  // Bind-then-drop; the daemon rebinds the port immediately afterwards.
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}

fn spawn_daemon(port: u16, handoff: &str) -> tokio::process::Child {
  let exe = env!("CARGO_BIN_EXE_patchbayd");
  tokio::process::Command::new(exe)
    .args([
      "serve",
      "--bind",
      &format!("127.0.0.1:{port}"),
      "--worker-exe",
      exe,
      "--handoff",
      handoff,
    ])
    .kill_on_drop(true)
    .spawn()
    .expect("daemon failed to start")
}

async fn connect(port: u16) -> TcpStream {
  let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
  loop {
    match TcpStream::connect(("127.0.0.1", port)).await {
      Ok(stream) => return stream,
      Err(_) if tokio::time::Instant::now() < deadline => {
        tokio::time::sleep(Duration::from_millis(50)).await;
      }
      Err(error) => panic!("daemon never came up: {error}"),
    }
  }
}

/// Read one `;`-terminated instruction off the stream.
async fn read_instruction(stream: &mut TcpStream) -> String {
  let mut out = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    timeout(TEST_TIMEOUT, stream.read_exact(&mut byte))
      .await
      .expect("no instruction arrived")
      .expect("connection closed mid-instruction");
    out.push(byte[0]);
    if byte[0] == b';' {
      break;
    }
  }
  String::from_utf8(out).unwrap()
}

fn session_id_from_ready(instruction: &str) -> String {
  let rendered_length = format!("{SESSION_ID_LEN}.");
  let start = instruction
    .find(&rendered_length)
    .expect("ready instruction carries no identifier")
    + rendered_length.len();
  instruction[start..start + SESSION_ID_LEN].to_owned()
}

async fn create_join_and_echo(handoff: &str) {
  let port = free_port();
  let _daemon = spawn_daemon(port, handoff);

  // Client A asks for a new session and tacks payload bytes onto the same
  // write; they must come back (echoed) after the ready announcement.
  let mut client_a = connect(port).await;
  client_a
    .write_all(b"6.select,8.loopback;HELLO")
    .await
    .unwrap();
  let ready = read_instruction(&mut client_a).await;
  assert!(ready.starts_with("5.ready,"), "unexpected reply: {ready}");
  let session_id = session_id_from_ready(&ready);
  assert!(session_id.starts_with('G'), "unexpected id: {session_id}");

  let mut echoed = [0u8; 5];
  timeout(TEST_TIMEOUT, client_a.read_exact(&mut echoed))
    .await
    .expect("handshake-adjacent payload was dropped")
    .unwrap();
  assert_eq!(&echoed, b"HELLO");

  // Client B joins with the exact identifier and lands on the same worker.
  let mut client_b = connect(port).await;
  client_b
    .write_all(format!("6.select,{SESSION_ID_LEN}.{session_id};").as_bytes())
    .await
    .unwrap();
  let ready_b = read_instruction(&mut client_b).await;
  assert_eq!(session_id_from_ready(&ready_b), session_id);

  client_b.write_all(b"PING").await.unwrap();
  let mut echoed = [0u8; 4];
  timeout(TEST_TIMEOUT, client_b.read_exact(&mut echoed))
    .await
    .expect("echo never arrived for the joining client")
    .unwrap();
  assert_eq!(&echoed, b"PING");
}

#[tokio::test]
async fn routes_over_ancillary_handoff() {
  create_join_and_echo("ancillary").await;
}

#[tokio::test]
async fn routes_over_ancillary_pipe_handoff() {
  create_join_and_echo("ancillary-pipes").await;
}

#[tokio::test]
async fn routes_over_rendezvous_handoff() {
  create_join_and_echo("rendezvous").await;
}

#[tokio::test]
async fn join_of_unknown_session_is_refused() {
  let port = free_port();
  let _daemon = spawn_daemon(port, "ancillary");

  let mut client = connect(port).await;
  let bogus = format!("G{}", "0".repeat(SESSION_ID_LEN - 1));
  client
    .write_all(format!("6.select,{SESSION_ID_LEN}.{bogus};").as_bytes())
    .await
    .unwrap();
  let reply = read_instruction(&mut client).await;
  assert!(reply.starts_with("5.error,"), "unexpected reply: {reply}");
  assert!(reply.ends_with(",3.516;"), "unexpected status: {reply}");
}
