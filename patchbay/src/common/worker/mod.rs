// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Worker processes own the actual remote-protocol engines; the router
//! spawns and monitors them but never looks inside. Each worker exposes a
//! control channel for connection handoff, a process id for exit waiting,
//! and the session identifier it was minted with.

use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

use self::transport::{HandoffStrategy, HandoffTransport, TransportError, WorkerChannel};
use super::session::SessionId;

pub mod host;
pub mod transport;

/// Descriptor number the spawned worker host finds its control socket on.
pub const CONTROL_FD: RawFd = 3;

/// Byte a worker host writes once it is ready to accept attachments.
pub(crate) const READY_ACK: u8 = 0x06;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
  #[error("unable to spawn worker process: {0}")]
  Spawn(#[source] std::io::Error),
  #[error("worker process never reported ready")]
  NotReady,
}

/// One running backend worker process, as seen by the router.
pub trait WorkerInstance: Send + Sync {
  fn pid(&self) -> u32;

  fn session_id(&self) -> &SessionId;

  /// Deliver a fresh connection channel into the worker, returning the
  /// router-side half for the bridge.
  fn attach(&self) -> BoxFuture<'_, Result<WorkerChannel, TransportError>>;

  /// Resolve once the worker process has terminated. Consumed by the one
  /// reaper task responsible for deregistration.
  fn wait(&self) -> BoxFuture<'_, std::io::Result<ExitStatus>>;

  /// Force the worker to stop; used when a freshly spawned worker never
  /// received its first user.
  fn stop(&self) -> BoxFuture<'_, ()>;
}

pub trait WorkerLauncher: Send + Sync {
  /// Spawn a worker for the named protocol, minting its session identifier.
  fn launch<'a>(
    &'a self,
    protocol: &'a str,
  ) -> BoxFuture<'a, Result<Arc<dyn WorkerInstance>, LaunchError>>;
}

/// Launcher that spawns the worker-host executable with an inherited
/// control socket.
pub struct ProcessWorkerLauncher {
  executable: PathBuf,
  strategy: HandoffStrategy,
  ready_timeout: Duration,
}

impl ProcessWorkerLauncher {
  pub fn new(executable: PathBuf, strategy: HandoffStrategy) -> Self {
    Self {
      executable,
      strategy,
      ready_timeout: DEFAULT_READY_TIMEOUT,
    }
  }
}

impl WorkerLauncher for ProcessWorkerLauncher {
  fn launch<'a>(
    &'a self,
    protocol: &'a str,
  ) -> BoxFuture<'a, Result<Arc<dyn WorkerInstance>, LaunchError>> {
    async move {
      let session_id = SessionId::generate();
      let (control, child_control) =
        std::os::unix::net::UnixStream::pair().map_err(LaunchError::Spawn)?;

      let mut command = tokio::process::Command::new(&self.executable);
      command
        .arg("worker")
        .arg("--protocol")
        .arg(protocol)
        .arg("--session-id")
        .arg(session_id.raw())
        .arg("--control-fd")
        .arg(CONTROL_FD.to_string())
        .arg("--handoff")
        .arg(self.strategy.as_str());
      let child_raw = child_control.as_raw_fd();
      unsafe {
        command.pre_exec(move || {
          // Map the control socket onto the descriptor the worker host
          // expects. dup2 clears close-on-exec on the new slot, except when
          // the slots coincide, where the flag must be cleared by hand.
          if child_raw == CONTROL_FD {
            let flags = libc::fcntl(CONTROL_FD, libc::F_GETFD);
            if flags < 0
              || libc::fcntl(CONTROL_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
            {
              return Err(std::io::Error::last_os_error());
            }
          } else if libc::dup2(child_raw, CONTROL_FD) < 0 {
            return Err(std::io::Error::last_os_error());
          }
          Ok(())
        });
      }
      let mut child = command.spawn().map_err(LaunchError::Spawn)?;
      drop(child_control);

      control.set_nonblocking(true).map_err(LaunchError::Spawn)?;
      let mut control = UnixStream::from_std(control).map_err(LaunchError::Spawn)?;

      // The identifier is only handed out once the worker reports usable.
      let mut ready = [0u8; 1];
      match tokio::time::timeout(self.ready_timeout, control.read_exact(&mut ready)).await {
        Ok(Ok(_)) if ready[0] == READY_ACK => {}
        _ => {
          let _ = child.start_kill();
          return Err(LaunchError::NotReady);
        }
      }

      let pid = child.id().unwrap_or_default();
      tracing::debug!(session = %session_id, pid, protocol, "Worker process ready");
      Ok(Arc::new(ProcessWorker {
        pid,
        session_id,
        control: tokio::sync::Mutex::new(control),
        transport: self.strategy.transport(),
        child: tokio::sync::Mutex::new(Some(child)),
      }) as Arc<dyn WorkerInstance>)
    }
    .boxed()
  }
}

pub struct ProcessWorker {
  pid: u32,
  session_id: SessionId,
  control: tokio::sync::Mutex<UnixStream>,
  transport: Arc<dyn HandoffTransport>,
  child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

impl WorkerInstance for ProcessWorker {
  fn pid(&self) -> u32 {
    self.pid
  }

  fn session_id(&self) -> &SessionId {
    &self.session_id
  }

  fn attach(&self) -> BoxFuture<'_, Result<WorkerChannel, TransportError>> {
    async move {
      // Concurrent joiners serialize here; the control channel carries one
      // transfer at a time.
      let control = self.control.lock().await;
      self.transport.deliver(&control).await
    }
    .boxed()
  }

  fn wait(&self) -> BoxFuture<'_, std::io::Result<ExitStatus>> {
    async move {
      let taken = self.child.lock().await.take();
      match taken {
        Some(mut child) => child.wait().await,
        None => Err(std::io::Error::new(
          std::io::ErrorKind::Other,
          "worker process was already reaped",
        )),
      }
    }
    .boxed()
  }

  fn stop(&self) -> BoxFuture<'_, ()> {
    async move {
      if let Some(child) = self.child.lock().await.as_mut() {
        if let Err(error) = child.start_kill() {
          tracing::warn!(pid = self.pid, %error, "Unable to stop worker process");
        }
      }
    }
    .boxed()
  }
}
