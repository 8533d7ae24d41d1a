// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Maps logical service names to the addresses of the nodes serving them.
//!
//! Servers publish themselves through a [`Registry`]; clients only need a [`Resolver`]. Three
//! implementations are provided: [`MemoryRegistry`] for a single process, [`FileRegistry`] for
//! processes sharing a host, and [`StaticResolver`] for a fixed table of addresses.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

/// Errors returned by registry and resolver operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No live node is registered under the name.
    #[error("service {0} not found")]
    NotFound(String),
    /// The name cannot be used as a service or node identity.
    #[error("invalid registry name {0:?}")]
    InvalidName(String),
    #[error("registry i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed registry record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One running instance of a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: SocketAddr,
}

impl Node {
    /// Returns a node for `address` with a fresh random id derived from `service_name`.
    pub fn new(service_name: &str, address: SocketAddr) -> Self {
        Self {
            id: format!("{service_name}-{:016x}", rand::random::<u64>()),
            address,
        }
    }
}

/// A service identity together with the nodes currently serving it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Picks one node uniformly at random, or `None` if there are no nodes.
    pub fn select(&self) -> Option<&Node> {
        self.nodes.choose(&mut rand::thread_rng())
    }
}

/// Looks up the nodes serving a service name.
pub trait Resolver: Send + Sync {
    /// Returns the live nodes registered under `name`.
    ///
    /// Fails with [`RegistryError::NotFound`] when there are none.
    fn resolve(&self, name: &str) -> impl Future<Output = Result<Service, RegistryError>> + Send;
}

/// A [`Resolver`] that nodes can also publish themselves to.
pub trait Registry: Resolver {
    /// Records every node of `service`. A registration with a `ttl` stops resolving once the
    /// ttl elapses unless it is registered again first.
    fn register(
        &self,
        service: &Service,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Removes every node of `service`. Nodes that are not registered are ignored.
    fn deregister(&self, service: &Service)
        -> impl Future<Output = Result<(), RegistryError>> + Send;
}

/// Service and node names become path components in a [`FileRegistry`], so both are restricted
/// to names that cannot escape the registry directory.
fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate(service: &Service) -> Result<(), RegistryError> {
    validate_name(&service.name)?;
    service
        .nodes
        .iter()
        .try_for_each(|node| validate_name(&node.id))
}

fn expiry(ttl: Option<Duration>) -> Option<SystemTime> {
    ttl.map(|ttl| SystemTime::now() + ttl)
}

fn is_live(expires_at: Option<SystemTime>, now: SystemTime) -> bool {
    expires_at.map_or(true, |expires_at| expires_at > now)
}

type NodeTable = HashMap<String, (Node, Option<SystemTime>)>;

/// An in-process registry. Clones share the same table.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    services: Arc<Mutex<HashMap<String, NodeTable>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Resolver for MemoryRegistry {
    async fn resolve(&self, name: &str) -> Result<Service, RegistryError> {
        validate_name(name)?;
        let now = SystemTime::now();
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(table) = services.get_mut(name) else {
            return Err(RegistryError::NotFound(name.to_string()));
        };
        table.retain(|_, (_, expires_at)| is_live(*expires_at, now));
        let mut nodes: Vec<Node> = table.values().map(|(node, _)| node.clone()).collect();
        if nodes.is_empty() {
            services.remove(name);
            return Err(RegistryError::NotFound(name.to_string()));
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Service::new(name, nodes))
    }
}

impl Registry for MemoryRegistry {
    async fn register(&self, service: &Service, ttl: Option<Duration>) -> Result<(), RegistryError> {
        validate(service)?;
        let expires_at = expiry(ttl);
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let table = services.entry(service.name.clone()).or_default();
        for node in &service.nodes {
            table.insert(node.id.clone(), (node.clone(), expires_at));
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        validate(service)?;
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = services.get_mut(&service.name) {
            for node in &service.nodes {
                table.remove(&node.id);
            }
            if table.is_empty() {
                services.remove(&service.name);
            }
        }
        Ok(())
    }
}

/// The on-disk form of one registered node.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    id: String,
    address: SocketAddr,
    expires_at: Option<SystemTime>,
}

/// A registry kept in a directory, shared by every process on the host that uses the same root.
///
/// Each node is stored as `<root>/<service>/<node id>.json`. Records are written to a staging
/// file and renamed into place, so readers never observe a partial record.
#[derive(Clone, Debug)]
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$TMPDIR/greeter-registry`.
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("greeter-registry")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn service_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

async fn read_record(path: &Path) -> Result<Record, RegistryError> {
    let contents = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&contents)?)
}

impl Resolver for FileRegistry {
    async fn resolve(&self, name: &str) -> Result<Service, RegistryError> {
        validate_name(name)?;
        let mut entries = match tokio::fs::read_dir(self.service_dir(name)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut nodes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) if is_live(record.expires_at, now) => nodes.push(Node {
                    id: record.id,
                    address: record.address,
                }),
                Ok(_) => {
                    tracing::debug!("removing expired record {}", path.display());
                    // A node renewing at this moment rewrites the record on its next heartbeat.
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::debug!("failed to remove {}: {e}", path.display());
                    }
                }
                Err(e) => tracing::debug!("skipping unreadable record {}: {e}", path.display()),
            }
        }

        if nodes.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Service::new(name, nodes))
    }
}

impl Registry for FileRegistry {
    async fn register(&self, service: &Service, ttl: Option<Duration>) -> Result<(), RegistryError> {
        validate(service)?;
        let dir = self.service_dir(&service.name);
        tokio::fs::create_dir_all(&dir).await?;

        let expires_at = expiry(ttl);
        for node in &service.nodes {
            let record = Record {
                id: node.id.clone(),
                address: node.address,
                expires_at,
            };
            let staging = dir.join(format!(".{}.tmp", node.id));
            tokio::fs::write(&staging, serde_json::to_vec_pretty(&record)?).await?;
            tokio::fs::rename(&staging, dir.join(format!("{}.json", node.id))).await?;
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        validate(service)?;
        let dir = self.service_dir(&service.name);
        for node in &service.nodes {
            match tokio::fs::remove_file(dir.join(format!("{}.json", node.id))).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// A fixed table of service names to addresses. Never changes after construction.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    services: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addresses` to the nodes of `name`.
    pub fn with_service(
        mut self,
        name: impl Into<String>,
        addresses: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        self.services
            .entry(name.into())
            .or_default()
            .extend(addresses);
        self
    }
}

impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Service, RegistryError> {
        let nodes: Vec<Node> = self
            .services
            .get(name)
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(i, &address)| Node {
                id: format!("{name}-{i}"),
                address,
            })
            .collect();
        if nodes.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(Service::new(name, nodes))
    }
}
