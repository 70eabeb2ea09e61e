// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

pub mod registry;

/// The reserved marker distinguishing a session identifier from a protocol
/// name in a `select` request. Checked before any registry access.
pub const SESSION_ID_PREFIX: char = 'G';

/// Total length of a rendered session identifier: the prefix plus a
/// 36-character hyphenated UUID.
pub const SESSION_ID_LEN: usize = 37;

/// An opaque token naming one live worker/session for the lifetime of its
/// worker process. Generated fresh for every new worker and immutable once
/// assigned; later clients present it verbatim to join the session.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct SessionId(Arc<String>);

impl SessionId {
  /// Mint a fresh identifier.
  pub fn generate() -> SessionId {
    let mut rendered = String::with_capacity(SESSION_ID_LEN);
    rendered.push(SESSION_ID_PREFIX);
    let mut buffer = uuid::Uuid::encode_buffer();
    rendered.push_str(uuid::Uuid::new_v4().hyphenated().encode_lower(&mut buffer));
    SessionId(Arc::new(rendered))
  }

  /// Accept a client-presented token, requiring the reserved prefix and the
  /// fixed rendered length. Anything else is not a session identifier.
  pub fn parse(raw: &str) -> Option<SessionId> {
    if raw.len() == SESSION_ID_LEN && raw.starts_with(SESSION_ID_PREFIX) {
      Some(SessionId(Arc::new(raw.to_owned())))
    } else {
      None
    }
  }

  pub fn raw(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionId").field("id", &self.0).finish()
  }
}
