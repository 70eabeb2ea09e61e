// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Routes each accepted connection to a new or existing worker process,
//! creating and reaping workers as needed.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::bridge;
use crate::common::protocol::{self, HandshakeError, Parser, Status};
use crate::common::session::registry::SessionRegistry;
use crate::common::session::{SessionId, SESSION_ID_PREFIX};
use crate::common::worker::transport::TransportError;
use crate::common::worker::{LaunchError, WorkerInstance, WorkerLauncher};

use tokio::io::{AsyncRead, AsyncWrite};

/// Default ceiling on the handshake read, matching the historical daemon
/// timeout of fifteen seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct RouterConfig {
  pub handshake_timeout: Duration,
}

impl Default for RouterConfig {
  fn default() -> Self {
    Self {
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
  #[error("handshake failed: {0}")]
  Handshake(#[from] HandshakeError),
  #[error("\"select\" carried {0} arguments where exactly one is expected")]
  BadSelectArity(usize),
  #[error("session \"{0}\" does not exist")]
  NoSuchSession(String),
  #[error("worker spawn failed: {0}")]
  Launch(#[from] LaunchError),
  #[error("connection handoff failed: {0}")]
  Handoff(#[from] TransportError),
}

/// Resolves handshaken connections against the session registry, spawning
/// new workers on demand and reaping the ones it created.
pub struct ConnectionRouter<L> {
  registry: SessionRegistry<Arc<dyn WorkerInstance>>,
  launcher: L,
  config: RouterConfig,
}

impl<L> ConnectionRouter<L>
where
  L: WorkerLauncher,
{
  pub fn new(launcher: L, config: RouterConfig) -> Self {
    Self {
      registry: SessionRegistry::new(),
      launcher,
      config,
    }
  }

  pub fn registry(&self) -> &SessionRegistry<Arc<dyn WorkerInstance>> {
    &self.registry
  }

  /// Route one freshly accepted connection: read its `select` request, join
  /// it to an existing session or create a new one, and hand the stream off
  /// to the bridge. For a newly created session this call additionally acts
  /// as the reaper, returning only once the worker process has terminated
  /// and its registry record is withdrawn.
  pub async fn route<S>(&self, mut stream: S) -> Result<(), RouteError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let mut parser = Parser::new();
    let select = match parser
      .expect(&mut stream, "select", self.config.handshake_timeout)
      .await
    {
      Ok(instruction) => instruction,
      Err(error) => {
        tracing::debug!(%error, "Error reading \"select\"");
        return Err(RouteError::Handshake(error));
      }
    };
    if select.args.len() != 1 {
      tracing::debug!(argc = select.args.len(), "Bad number of arguments to \"select\"");
      return Err(RouteError::BadSelectArity(select.args.len()));
    }
    let identifier = select.args.into_iter().next().unwrap_or_default();

    // The reserved marker decides the path before any registry access.
    if identifier.starts_with(SESSION_ID_PREFIX) {
      self.join_session(stream, parser, &identifier).await
    } else {
      self.create_session(stream, parser, &identifier).await
    }
  }

  async fn join_session<S>(
    &self,
    mut stream: S,
    parser: Parser,
    identifier: &str,
  ) -> Result<(), RouteError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let record = match SessionId::parse(identifier) {
      Some(id) => self.registry.lookup(&id).await,
      None => None,
    };
    let Some(worker) = record else {
      // Warn and ward off the client before dropping the connection.
      tracing::info!("Connection \"{identifier}\" does not exist");
      let _ = protocol::send_error(
        &mut stream,
        "No such connection.",
        Status::ResourceNotFound,
      )
      .await;
      return Err(RouteError::NoSuchSession(identifier.to_owned()));
    };

    tracing::info!("Joining existing connection \"{identifier}\"");
    let channel = worker.attach().await?;
    spawn_bridge(stream, channel, parser, worker.session_id().clone());
    Ok(())
  }

  async fn create_session<S>(
    &self,
    stream: S,
    parser: Parser,
    protocol_name: &str,
  ) -> Result<(), RouteError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    tracing::info!("Creating new client for protocol \"{protocol_name}\"");
    let worker = match self.launcher.launch(protocol_name).await {
      Ok(worker) => worker,
      Err(error) => {
        tracing::error!(%error, "Connection did not succeed");
        return Err(RouteError::Launch(error));
      }
    };

    // The first attachment is the owner. Until it lands, the worker has no
    // user at all; a failed transfer therefore tears the worker down.
    let channel = match worker.attach().await {
      Ok(channel) => channel,
      Err(error) => {
        tracing::error!(%error, "Unable to add user to new connection");
        worker.stop().await;
        return Err(RouteError::Handoff(error));
      }
    };
    let id = worker.session_id().clone();
    spawn_bridge(stream, channel, parser, id.clone());

    // Store the record, allowing other users to join.
    tracing::info!("Connection ID is \"{id}\"");
    if let Err(error) = self.registry.add(id.clone(), Arc::clone(&worker)).await {
      tracing::error!(%error, "Internal failure publishing new connection");
    }

    // The task that created a session reaps and deregisters it.
    match worker.wait().await {
      Ok(status) => tracing::info!(pid = worker.pid(), ?status, "Worker process exited"),
      Err(error) => tracing::warn!(pid = worker.pid(), %error, "Unable to await worker process"),
    }
    if self.registry.remove(&id).await.is_none() {
      // The process is already gone, so this is only a bookkeeping leak.
      tracing::error!(
        "Internal failure removing connection \"{id}\". Record will never be freed."
      );
    } else {
      tracing::info!("Connection \"{id}\" removed.");
    }
    Ok(())
  }
}

/// Detach the pump loops for one attached user. The bridge owns the stream,
/// the worker-side channel, and the parser's buffered bytes from here on.
fn spawn_bridge<S, W>(stream: S, channel: W, parser: Parser, session: SessionId)
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  W: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let span = tracing::span!(tracing::Level::DEBUG, "bridge", session = %session);
  tokio::task::spawn(
    async move {
      bridge::run(stream, channel, parser).await;
    }
    .instrument(span),
  );
}

/// Accept-side pipeline: feeds a stream of connections through the router,
/// one routing task per connection, until shutdown is requested.
pub struct GatewayDaemon<L> {
  router: Arc<ConnectionRouter<L>>,
}

impl<L> GatewayDaemon<L>
where
  L: WorkerLauncher + Send + Sync + 'static,
{
  pub fn new(launcher: L, config: RouterConfig) -> Self {
    Self {
      router: Arc::new(ConnectionRouter::new(launcher, config)),
    }
  }

  pub fn router(&self) -> &Arc<ConnectionRouter<L>> {
    &self.router
  }

  /// Run the daemon against a connection source.
  ///
  /// The implementation assumes that cancelling `shutdown` will also halt
  /// the connection source.
  pub fn run<Connections, S>(
    &self,
    connections: Connections,
    shutdown: CancellationToken,
  ) -> tokio::task::JoinHandle<()>
  where
    Connections: Stream<Item = S> + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let router = Arc::clone(&self.router);
    let pipeline = connections
      .take_until({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
      })
      .for_each_concurrent(None, move |stream| {
        let router = Arc::clone(&router);
        async move {
          if let Err(error) = router.route(stream).await {
            tracing::debug!(%error, "Connection exited with error");
          }
        }
      });
    tokio::task::spawn(pipeline.instrument(tracing::span!(tracing::Level::INFO, "gateway")))
  }
}
