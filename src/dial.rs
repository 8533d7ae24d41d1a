// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The calling side: resolve a service name, connect to one of its nodes, and call it.

use crate::{
    registry::{RegistryError, Resolver},
    GreeterClient, HelloRequest, HelloResponse,
};
use std::{io, net::SocketAddr, time::Duration};
use tarpc::{
    client::{self, RpcError},
    context,
    tokio_serde::formats::Json,
};
use tokio::time;

/// Configures how a client reaches a node.
#[derive(Clone, Debug)]
pub struct Options {
    /// How long to wait for the TCP connection to be established.
    pub connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Any way a call can fail. Callers typically report all of them the same way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Resolve(#[from] RegistryError),
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
    #[error(transparent)]
    Call(#[from] RpcError),
}

/// Resolves `service_name` and returns a client connected to one of its nodes, chosen at random.
pub async fn connect<R: Resolver>(
    resolver: &R,
    service_name: &str,
    options: &Options,
) -> Result<GreeterClient, Error> {
    let service = resolver.resolve(service_name).await?;
    let node = service
        .select()
        .ok_or_else(|| RegistryError::NotFound(service_name.to_string()))?;
    let address = node.address;
    tracing::debug!(node = %node.id, "connecting to {address}");

    let transport = time::timeout(
        options.connect_timeout,
        tarpc::serde_transport::tcp::connect(address, Json::default),
    )
    .await
    .map_err(|_| Error::ConnectTimeout(address))?
    .map_err(|source| Error::Connect { address, source })?;

    Ok(GreeterClient::new(client::Config::default(), transport).spawn())
}

/// Resolves `service_name` and makes one `hello` call for `name` with the default deadline.
#[tracing::instrument(skip(resolver, options))]
pub async fn say_hello<R: Resolver>(
    resolver: &R,
    service_name: &str,
    name: String,
    options: &Options,
) -> Result<HelloResponse, Error> {
    let client = connect(resolver, service_name, options).await?;
    let response = client
        .hello(context::current(), HelloRequest { name })
        .await?;
    Ok(response)
}
