// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::SessionId;
use crate::util::reentrant::ReentrantRwLock;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
  /// Identifiers are minted collision-free, so an occupied slot means a
  /// bookkeeping failure somewhere upstream, not a client mistake.
  #[error("session \"{0}\" is already registered")]
  IdOccupied(SessionId),
}

/// Directory of live worker records, keyed by session identifier.
///
/// A record is present exactly while its worker process is alive and has
/// been published by the task that created it; lookups during the window
/// before publication simply miss. The sharded map carries the entries, and
/// the reentrant read/write lock imposes the compound-operation discipline:
/// lookups ride the read lock and are never serialized behind each other,
/// while add/remove take the write lock.
pub struct SessionRegistry<R> {
  sessions: ReentrantRwLock<DashMap<SessionId, R>>,
}

impl<R> SessionRegistry<R>
where
  R: Clone + Send + Sync,
{
  pub fn new() -> Self {
    Self {
      sessions: ReentrantRwLock::new(DashMap::new()),
    }
  }

  /// Publish a record, making the session visible to future joiners. Fails
  /// without touching the map if the identifier is already present.
  pub async fn add(&self, id: SessionId, record: R) -> Result<(), RegistryError> {
    let sessions = self.sessions.write().await;
    let result = match sessions.entry(id) {
      Entry::Occupied(occupied) => {
        let id = occupied.key().clone();
        tracing::error!(session = %id, "Session identifier collision; record not replaced");
        Err(RegistryError::IdOccupied(id))
      }
      Entry::Vacant(vacant) => {
        vacant.insert(record);
        Ok(())
      }
    };
    result
  }

  /// Retrieve the record for a live session, or `None` when the identifier
  /// names no published session.
  pub async fn lookup(&self, id: &SessionId) -> Option<R> {
    let sessions = self.sessions.read().await;
    sessions.get(id).map(|entry| entry.value().clone())
  }

  /// Withdraw and return a record, or `None` when the identifier was absent.
  pub async fn remove(&self, id: &SessionId) -> Option<R> {
    let sessions = self.sessions.write().await;
    sessions.remove(id).map(|(_, record)| record)
  }

  pub async fn len(&self) -> usize {
    let sessions = self.sessions.read().await;
    sessions.len()
  }
}

impl<R> Default for SessionRegistry<R>
where
  R: Clone + Send + Sync,
{
  fn default() -> Self {
    Self::new()
  }
}
