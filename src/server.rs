// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use greeter::{
    init_tracing,
    node::{self, Node},
    probe,
    registry::FileRegistry,
    shutdown_tracing, SERVICE_NAME,
};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Parser)]
#[clap(about = "Serves greetings under a service name.")]
struct Flags {
    /// The service name to register under.
    #[clap(long, default_value = SERVICE_NAME)]
    service: String,
    /// The address to listen on. Port 0 picks any free port.
    #[clap(long, default_value = "127.0.0.1:0")]
    address: SocketAddr,
    /// The directory shared with clients for service resolution.
    #[clap(long, env = "GREETER_REGISTRY_DIR")]
    registry_dir: Option<PathBuf>,
    /// Seconds a registration stays valid.
    #[clap(long, default_value_t = 90)]
    register_ttl: u64,
    /// Seconds between re-registrations.
    #[clap(long, default_value_t = 30)]
    register_interval: u64,
    /// The address the background probe connects to.
    #[clap(long, default_value_t = probe::DEFAULT_TARGET)]
    probe_addr: SocketAddr,
    /// Milliseconds between probe attempts.
    #[clap(long, default_value_t = 1000)]
    probe_interval: u64,
    /// Disables the background probe.
    #[clap(long)]
    no_probe: bool,
    /// Exports spans to an OTLP collector.
    #[clap(long)]
    otlp: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let tracer_provider = init_tracing("Greeter Server", flags.otlp)?;

    let registry = flags
        .registry_dir
        .map(FileRegistry::new)
        .unwrap_or_default();
    let options = node::Options {
        service_name: flags.service,
        address: flags.address,
        register_ttl: Some(Duration::from_secs(flags.register_ttl)),
        register_interval: Duration::from_secs(flags.register_interval),
    };

    // Installed before registering so a stop request can never skip deregistration.
    let shutdown = node::shutdown_signal()?;
    let node = match Node::start(&options, registry).await {
        Ok(node) => node,
        Err(e) => {
            shutdown_tracing(tracer_provider);
            return Err(e.into());
        }
    };

    if !flags.no_probe {
        probe::spawn(
            flags.probe_addr,
            Duration::from_millis(flags.probe_interval.max(1)),
        );
    }

    node.run(shutdown).await;

    shutdown_tracing(tracer_provider);
    Ok(())
}
