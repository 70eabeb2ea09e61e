// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// The value indicating that the current caller holds neither the read nor
/// the write lock.
const NO_LOCK: usize = 0;

/// The value indicating that the current caller holds the read lock.
const READ_LOCK: usize = 1;

/// The value indicating that the current caller holds the write lock.
const WRITE_LOCK: usize = 2;

/// Extract the flag indicating which lock is held, if any, from the given
/// state word. The flag is always stored in the least-significant nibble.
fn get_lock_flag(word: usize) -> usize {
  word & 0xF
}

/// Extract the lock depth from the given state word: the difference between
/// the number of acquire and release calls made by the current caller. The
/// depth occupies the remaining bits above the flag nibble.
fn get_lock_depth(word: usize) -> usize {
  word >> 4
}

/// Pack a held-lock flag and a recursion depth back into a single state word.
fn make_word(flag: usize, depth: usize) -> usize {
  (flag & 0xF) | (depth << 4)
}

/// Identity of the logical caller owning a lock level. Lock recursion is
/// tracked per tokio task rather than per OS thread, since the runtime
/// multiplexes tasks over a thread pool; outside of any task context the
/// thread itself is the caller.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum CallerId {
  Task(tokio::task::Id),
  Thread(std::thread::ThreadId),
}

impl CallerId {
  fn current() -> Self {
    match tokio::task::try_id() {
      Some(id) => CallerId::Task(id),
      None => CallerId::Thread(std::thread::current().id()),
    }
  }
}

/// The guard actually parked on the inner lock for a caller's outermost
/// acquisition. Nested acquisitions never touch the inner lock.
enum Slot {
  Read(OwnedRwLockReadGuard<()>),
  Write(OwnedRwLockWriteGuard<()>),
}

struct Holder {
  word: usize,
  slot: Option<Slot>,
}

/// A read/write lock that tolerates re-acquisition by the caller already
/// holding it. A caller holding the write lock may take read or write again;
/// a caller holding the read lock may take read again, while a write request
/// releases its read lock before acquiring write. The inner lock is acquired
/// and released only at the outermost level of a caller's recursion.
///
/// Guards expose shared access only; containers guarded by this lock provide
/// their own interior mutability, and the lock supplies just the read/write
/// exclusion discipline. Guards must be dropped by the task that acquired
/// them.
pub struct ReentrantRwLock<T> {
  data: T,
  inner: Arc<RwLock<()>>,
  holders: DashMap<CallerId, Holder>,
}

impl<T> ReentrantRwLock<T> {
  pub fn new(data: T) -> Self {
    Self {
      data,
      inner: Arc::new(RwLock::new(())),
      holders: DashMap::new(),
    }
  }

  /// Acquire the read lock, or bump the recursion depth if this caller
  /// already holds either lock.
  pub async fn read(&self) -> ReentrantReadGuard<'_, T> {
    let caller = CallerId::current();
    let held = match self.holders.get_mut(&caller) {
      Some(mut holder) => {
        // A caller may read whenever it holds the read or the write lock.
        let word = holder.word;
        holder.word = make_word(get_lock_flag(word), get_lock_depth(word) + 1);
        true
      }
      None => false,
    };
    if !held {
      let guard = Arc::clone(&self.inner).read_owned().await;
      self.holders.insert(
        caller,
        Holder {
          word: make_word(READ_LOCK, 1),
          slot: Some(Slot::Read(guard)),
        },
      );
    }
    ReentrantReadGuard { lock: self, caller }
  }

  /// Acquire the write lock, or bump the recursion depth if this caller
  /// already holds it. A caller holding only the read lock has that lock
  /// released before the write lock is acquired: a function further down the
  /// stack may thus find its read lock silently upgraded, and another writer
  /// may slip in between the release and the acquisition.
  pub async fn write(&self) -> ReentrantWriteGuard<'_, T> {
    let caller = CallerId::current();
    let prior_depth = match self.holders.get_mut(&caller) {
      Some(mut holder) => {
        let word = holder.word;
        if get_lock_flag(word) == WRITE_LOCK {
          holder.word = make_word(WRITE_LOCK, get_lock_depth(word) + 1);
          return ReentrantWriteGuard { lock: self, caller };
        }
        // Dropping the slot releases the inner read lock so the write
        // acquisition below cannot deadlock against ourselves.
        holder.slot = None;
        Some(get_lock_depth(word))
      }
      None => None,
    };
    let guard = Arc::clone(&self.inner).write_owned().await;
    self.holders.insert(
      caller,
      Holder {
        word: make_word(WRITE_LOCK, prior_depth.unwrap_or(NO_LOCK) + 1),
        slot: Some(Slot::Write(guard)),
      },
    );
    ReentrantWriteGuard { lock: self, caller }
  }

  fn release(&self, caller: CallerId) {
    let depth = match self.holders.get_mut(&caller) {
      Some(mut holder) => {
        let word = holder.word;
        let depth = get_lock_depth(word);
        if depth > 1 {
          holder.word = make_word(get_lock_flag(word), depth - 1);
        }
        depth
      }
      // A release without a matching acquire indicates guard misuse across
      // tasks; there is nothing sane to unwind.
      None => return,
    };
    if depth <= 1 {
      // Outermost level: removing the entry drops the slot, which releases
      // the inner lock.
      self.holders.remove(&caller);
    }
  }
}

pub struct ReentrantReadGuard<'a, T> {
  lock: &'a ReentrantRwLock<T>,
  caller: CallerId,
}

pub struct ReentrantWriteGuard<'a, T> {
  lock: &'a ReentrantRwLock<T>,
  caller: CallerId,
}

impl<T> std::ops::Deref for ReentrantReadGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.lock.data
  }
}

impl<T> std::ops::Deref for ReentrantWriteGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.lock.data
  }
}

impl<T> Drop for ReentrantReadGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.release(self.caller);
  }
}

impl<T> Drop for ReentrantWriteGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.release(self.caller);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  use tokio::sync::Barrier;
  use tokio::time::timeout;

  use super::ReentrantRwLock;

  const TEST_TIMEOUT: Duration = Duration::from_secs(5);

  #[tokio::test]
  async fn nested_read_does_not_deadlock() {
    let lock = ReentrantRwLock::new(41usize);
    let fut = async {
      let outer = lock.read().await;
      let inner = lock.read().await;
      assert_eq!(*outer + 1, 42);
      assert_eq!(*inner + 1, 42);
    };
    timeout(TEST_TIMEOUT, fut).await.expect("nested read deadlocked");
  }

  #[tokio::test]
  async fn nested_write_does_not_deadlock() {
    let lock = ReentrantRwLock::new(());
    let fut = async {
      let _outer = lock.write().await;
      let _inner = lock.write().await;
      let _deeper = lock.read().await;
    };
    timeout(TEST_TIMEOUT, fut).await.expect("nested write deadlocked");
  }

  #[tokio::test]
  async fn read_upgrades_to_write() {
    let lock = ReentrantRwLock::new(());
    let fut = async {
      let _read = lock.read().await;
      let _write = lock.write().await;
    };
    timeout(TEST_TIMEOUT, fut).await.expect("upgrade deadlocked");
  }

  #[tokio::test]
  async fn releases_only_at_outermost_level() {
    let lock = Arc::new(ReentrantRwLock::new(()));
    {
      let outer = lock.write().await;
      let inner = lock.write().await;
      drop(inner);
      // Still held: another writer must not get in yet.
      let contender = {
        let lock = Arc::clone(&lock);
        tokio::spawn(async move {
          let _guard = lock.write().await;
        })
      };
      tokio::time::sleep(Duration::from_millis(50)).await;
      assert!(!contender.is_finished());
      drop(outer);
      timeout(TEST_TIMEOUT, contender)
        .await
        .expect("contender never acquired after outermost release")
        .unwrap();
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn readers_run_concurrently() {
    let lock = Arc::new(ReentrantRwLock::new(()));
    let rendezvous = Arc::new(Barrier::new(2));
    let mut tasks = Vec::new();
    for _ in 0..2 {
      let lock = Arc::clone(&lock);
      let rendezvous = Arc::clone(&rendezvous);
      tasks.push(tokio::spawn(async move {
        let _guard = lock.read().await;
        // Both tasks can only pass the barrier if both hold the read lock
        // at the same time.
        rendezvous.wait().await;
      }));
    }
    for task in tasks {
      timeout(TEST_TIMEOUT, task)
        .await
        .expect("readers were serialized behind each other")
        .unwrap();
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn writers_are_exclusive() {
    let lock = Arc::new(ReentrantRwLock::new(AtomicUsize::new(0)));
    let active = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..8 {
      let lock = Arc::clone(&lock);
      let active = Arc::clone(&active);
      tasks.push(tokio::spawn(async move {
        for _ in 0..16 {
          let guard = lock.write().await;
          assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
          guard.fetch_add(1, Ordering::SeqCst);
          tokio::task::yield_now().await;
          active.fetch_sub(1, Ordering::SeqCst);
        }
      }));
    }
    for task in tasks {
      timeout(TEST_TIMEOUT, task).await.expect("writer starved").unwrap();
    }
    let guard = lock.read().await;
    assert_eq!(guard.load(Ordering::SeqCst), 8 * 16);
  }
}
