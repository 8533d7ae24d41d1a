// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A greeter service reachable by name.
//!
//! Servers register a [`node::Node`] under a logical service name in a
//! [`registry::Registry`]; clients find it again through a [`registry::Resolver`] and make a
//! single [`Greeter::hello`] call over tarpc's JSON transport.

use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tarpc::context;
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};

pub mod dial;
pub mod node;
pub mod probe;
pub mod registry;

/// The name the greeter registers under when none is given.
pub const SERVICE_NAME: &str = "go.micro.srv.greeter";

/// Asks the server to greet `name`.
#[tarpc::derive_serde]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelloRequest {
    pub name: String,
}

/// The greeting produced for a [`HelloRequest`].
#[tarpc::derive_serde]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelloResponse {
    pub message: String,
}

/// This is the service definition. It defines one RPC, hello, which takes a request naming
/// someone and returns a greeting for them.
#[tarpc::service]
pub trait Greeter {
    /// Returns a greeting for the requested name.
    async fn hello(request: HelloRequest) -> HelloResponse;
}

/// The type that implements the generated Greeter trait. It holds no state, so every call is
/// independent of every other.
#[derive(Clone, Copy, Debug, Default)]
pub struct HelloServer;

impl Greeter for HelloServer {
    async fn hello(self, _: context::Context, request: HelloRequest) -> HelloResponse {
        greet(&request)
    }
}

/// Builds the greeting for `request`. The name is used verbatim.
pub fn greet(request: &HelloRequest) -> HelloResponse {
    HelloResponse {
        message: format!("Hello {}", request.name),
    }
}

/// Initializes a tracing subscriber that logs to stderr, filtered by `RUST_LOG`.
///
/// When `otlp` is set, spans are also exported to an OTLP collector, and the returned provider
/// must be passed to [`shutdown_tracing`] before the process exits so buffered spans are flushed.
pub fn init_tracing(
    service_name: &'static str,
    otlp: bool,
) -> anyhow::Result<Option<SdkTracerProvider>> {
    let tracer_provider = if otlp {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()?;
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder()
                    .with_attribute(KeyValue::new(
                        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                        service_name,
                    ))
                    .build(),
            )
            .build();
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        Some(tracer_provider)
    } else {
        None
    };
    let otel_layer = tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name)));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
        )
        .with(otel_layer)
        .try_init()?;

    Ok(tracer_provider)
}

/// Flushes and stops span export started by [`init_tracing`].
pub fn shutdown_tracing(tracer_provider: Option<SdkTracerProvider>) {
    if let Some(tracer_provider) = tracer_provider {
        if let Err(e) = tracer_provider.shutdown() {
            tracing::warn!("failed to shut down the tracer provider: {e}");
        }
    }
}
