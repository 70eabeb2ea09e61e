// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Moves an open connection from the router process into a worker process.
//!
//! One interface, two interchangeable backends selected by configuration;
//! the router never learns which is active. Handle records exchanged over
//! the control channel are fixed-size and native-endian: they are only
//! meaningful between cooperating processes on one host and make no attempt
//! at network transparency.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::UnixStream;

pub mod ancillary;
pub mod channel;
pub mod rendezvous;

pub use ancillary::AncillaryTransport;
pub use channel::{PipeChannel, WorkerChannel};
pub use rendezvous::RendezvousTransport;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("control channel closed before the transfer completed")]
  ChannelClosed,
  #[error("handle record was truncated ({0} bytes)")]
  Truncated(usize),
  #[error("no handles arrived in the ancillary payload")]
  MissingHandles,
  #[error("worker did not connect to the rendezvous channel within {0:?}")]
  RendezvousTimeout(Duration),
  #[error("rendezvous channel name was malformed")]
  BadChannelName,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Transfer of one open connection to the worker behind a control channel.
///
/// Both operations are one-shot and atomic from the caller's perspective:
/// `deliver` either leaves the worker holding a fully usable channel and
/// returns the matching router-side half for the bridge, or fails having
/// delivered nothing.
pub trait HandoffTransport: Send + Sync {
  /// Router side: deliver a fresh channel to the worker, returning the
  /// router-side half.
  fn deliver<'a>(
    &'a self,
    control: &'a UnixStream,
  ) -> BoxFuture<'a, Result<WorkerChannel, TransportError>>;

  /// Worker side: receive the channel for one attachment.
  fn receive<'a>(
    &'a self,
    control: &'a UnixStream,
  ) -> BoxFuture<'a, Result<WorkerChannel, TransportError>>;
}

/// Which transfer backend a daemon (and the workers it spawns) uses. Both
/// sides of a control channel must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStrategy {
  /// One socketpair end crosses as ancillary data.
  Ancillary,
  /// A read/write pipe pair crosses as ancillary data.
  AncillaryPipes,
  /// The worker connects back to a uniquely named channel; no handle
  /// object crosses the boundary.
  Rendezvous,
}

impl HandoffStrategy {
  pub fn transport(&self) -> Arc<dyn HandoffTransport> {
    match self {
      HandoffStrategy::Ancillary => Arc::new(AncillaryTransport::sockets()),
      HandoffStrategy::AncillaryPipes => Arc::new(AncillaryTransport::pipes()),
      HandoffStrategy::Rendezvous => Arc::new(RendezvousTransport::new()),
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      HandoffStrategy::Ancillary => "ancillary",
      HandoffStrategy::AncillaryPipes => "ancillary-pipes",
      HandoffStrategy::Rendezvous => "rendezvous",
    }
  }
}

impl std::fmt::Display for HandoffStrategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for HandoffStrategy {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value {
      "ancillary" => Ok(HandoffStrategy::Ancillary),
      "ancillary-pipes" => Ok(HandoffStrategy::AncillaryPipes),
      "rendezvous" => Ok(HandoffStrategy::Rendezvous),
      other => Err(format!("unknown handoff strategy \"{other}\"")),
    }
  }
}

/// Slot value marking an unused handle position in a record.
pub(crate) const NO_HANDLE: RawFd = -1;

/// Fixed record size: two native-endian handle slots, the second `-1` when
/// only one handle travels.
pub(crate) const HANDLE_RECORD_LEN: usize = 2 * std::mem::size_of::<RawFd>();

pub(crate) fn encode_handle_record(
  first: RawFd,
  second: Option<RawFd>,
) -> [u8; HANDLE_RECORD_LEN] {
  let mut record = [0u8; HANDLE_RECORD_LEN];
  let slot = std::mem::size_of::<RawFd>();
  record[..slot].copy_from_slice(&first.to_ne_bytes());
  record[slot..].copy_from_slice(&second.unwrap_or(NO_HANDLE).to_ne_bytes());
  record
}

pub(crate) fn decode_handle_record(record: &[u8; HANDLE_RECORD_LEN]) -> (RawFd, RawFd) {
  let slot = std::mem::size_of::<RawFd>();
  let mut first = [0u8; std::mem::size_of::<RawFd>()];
  let mut second = [0u8; std::mem::size_of::<RawFd>()];
  first.copy_from_slice(&record[..slot]);
  second.copy_from_slice(&record[slot..]);
  (RawFd::from_ne_bytes(first), RawFd::from_ne_bytes(second))
}
