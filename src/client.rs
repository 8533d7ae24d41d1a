// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use greeter::{
    dial,
    init_tracing,
    registry::{FileRegistry, StaticResolver},
    shutdown_tracing, SERVICE_NAME,
};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Parser)]
#[clap(about = "Asks a greeter service for a greeting and prints it.")]
struct Flags {
    /// The service name to resolve.
    #[clap(long, default_value = SERVICE_NAME)]
    service: String,
    /// The name to greet.
    #[clap(long, default_value = "John")]
    name: String,
    /// The directory the server registered in.
    #[clap(long, env = "GREETER_REGISTRY_DIR")]
    registry_dir: Option<PathBuf>,
    /// Resolves the service to this address instead of using the registry. May be repeated.
    #[clap(long = "node")]
    nodes: Vec<SocketAddr>,
    /// Milliseconds to wait for the connection.
    #[clap(long, default_value_t = 5000)]
    connect_timeout: u64,
    /// Exports spans to an OTLP collector.
    #[clap(long)]
    otlp: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let tracer_provider = init_tracing("Greeter Client", flags.otlp)?;

    let options = dial::Options {
        connect_timeout: Duration::from_millis(flags.connect_timeout),
    };
    let hello = if flags.nodes.is_empty() {
        let registry = flags
            .registry_dir
            .map(FileRegistry::new)
            .unwrap_or_default();
        dial::say_hello(&registry, &flags.service, flags.name, &options).await
    } else {
        let resolver = StaticResolver::new().with_service(flags.service.clone(), flags.nodes);
        dial::say_hello(&resolver, &flags.service, flags.name, &options).await
    };

    match hello {
        Ok(response) => println!("{}", response.message),
        Err(e) => println!("{e}"),
    }

    shutdown_tracing(tracer_provider);
    Ok(())
}
