// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The serving side: a listener that answers [`Greeter`](crate::Greeter) calls and keeps itself
//! registered under a service name while it runs.

use crate::{
    registry::{self, Registry, RegistryError, Service},
    Greeter, GreeterRequest, GreeterResponse, HelloServer, SERVICE_NAME,
};
use futures::prelude::*;
use std::{io, net::SocketAddr, time::Duration};
use tarpc::{
    serde_transport,
    server::{BaseChannel, Channel},
    tokio_serde::formats::Json,
    ClientMessage, Response,
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Instant, MissedTickBehavior},
};

type ServerTransport = serde_transport::Transport<
    TcpStream,
    ClientMessage<GreeterRequest>,
    Response<GreeterResponse>,
    Json<ClientMessage<GreeterRequest>, Response<GreeterResponse>>,
>;

/// Configures a [`Node`].
#[derive(Clone, Debug)]
pub struct Options {
    /// The name clients resolve to reach this node.
    pub service_name: String,
    /// The address to listen on. Port 0 picks any free port.
    pub address: SocketAddr,
    /// How long a registration stays valid. `None` never expires.
    pub register_ttl: Option<Duration>,
    /// How often the node registers itself again while running.
    pub register_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            register_ttl: Some(Duration::from_secs(90)),
            register_interval: Duration::from_secs(30),
        }
    }
}

/// Errors that stop a node from starting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to listen: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to register: {0}")]
    Register(#[source] RegistryError),
}

/// A bound and registered greeter server.
#[derive(Debug)]
pub struct Node<R> {
    listener: TcpListener,
    registry: R,
    service: Service,
    register_ttl: Option<Duration>,
    register_interval: Duration,
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits for the next accepted connection. A failed accept is logged and retried after
/// [`ACCEPT_BACKOFF`], so a persistent error such as running out of file descriptors cannot spin.
async fn next_connection<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!("failed to accept a connection: {e}");
                time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Returns a future that completes when the process is asked to stop: SIGINT, SIGTERM or SIGQUIT
/// on unix, Ctrl-C elsewhere.
///
/// The signal handlers are installed before this returns, so a signal sent any time after the
/// call is observed by the future.
#[cfg(unix)]
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    Ok(async move {
        let received = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        };
        tracing::info!("received {received}, shutting down");
    })
}

/// Returns a future that completes when the process is asked to stop: SIGINT, SIGTERM or SIGQUIT
/// on unix, Ctrl-C elsewhere.
#[cfg(not(unix))]
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()> + Send> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            futures::future::pending::<()>().await;
        }
    })
}

impl<R: Registry> Node<R> {
    /// Binds the listener and registers the bound address under the configured service name.
    /// Calls are not answered until [`Node::run`].
    pub async fn start(options: &Options, registry: R) -> Result<Self, Error> {
        let listener = TcpListener::bind(options.address)
            .await
            .map_err(Error::Bind)?;
        let local_addr = listener.local_addr().map_err(Error::Bind)?;
        let service = Service::new(
            options.service_name.clone(),
            vec![registry::Node::new(&options.service_name, local_addr)],
        );
        registry
            .register(&service, options.register_ttl)
            .await
            .map_err(Error::Register)?;
        tracing::info!(
            service = %service.name,
            node = %service.nodes[0].id,
            "Listening on {local_addr}"
        );

        Ok(Self {
            listener,
            registry,
            service,
            register_ttl: options.register_ttl,
            register_interval: options.register_interval.max(Duration::from_millis(1)),
        })
    }

    /// The address the node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.service.nodes[0].address
    }

    /// What the node registered.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Serves calls until `shutdown` completes, then stops listening and deregisters.
    ///
    /// Each connection is served on its own task, and each request on a task of its own.
    /// Connections already accepted keep running after shutdown until their clients hang up.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let Self {
            listener,
            registry,
            service,
            register_ttl,
            register_interval,
        } = self;

        let mut heartbeat = time::interval_at(Instant::now() + register_interval, register_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                (conn, peer) = next_connection(|| listener.accept()) => {
                    tracing::debug!(%peer, "accepted connection");
                    let transport = ServerTransport::from((conn, Json::default()));
                    tokio::spawn(
                        BaseChannel::with_defaults(transport)
                            .execute(HelloServer.serve())
                            .for_each(spawn),
                    );
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = registry.register(&service, register_ttl).await {
                        tracing::warn!(service = %service.name, "failed to renew registration: {e}");
                    }
                }
            }
        }

        drop(listener);
        match registry.deregister(&service).await {
            Ok(()) => tracing::info!(service = %service.name, "deregistered"),
            Err(e) => tracing::error!(service = %service.name, "failed to deregister: {e}"),
        }
    }
}
