use assert_matches::assert_matches;
use futures::{future::join_all, prelude::*};
use greeter::{
    dial,
    node::{self, Node},
    registry::{FileRegistry, MemoryRegistry, Registry, RegistryError, Resolver},
    Greeter, GreeterClient, HelloRequest, HelloServer,
};
use tarpc::{
    client, context,
    server::{BaseChannel, Channel},
    transport::channel,
};
use tokio::{sync::oneshot, task::JoinHandle};

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Starts a node under `service_name` and returns the handle that stops it.
async fn start<R>(service_name: &str, registry: R) -> anyhow::Result<(oneshot::Sender<()>, JoinHandle<()>)>
where
    R: Registry + 'static,
{
    let options = node::Options {
        service_name: service_name.to_string(),
        ..node::Options::default()
    };
    let node = Node::start(&options, registry).await?;
    let (tx, rx) = oneshot::channel::<()>();
    let running = tokio::spawn(node.run(rx.map(|_| ())));
    Ok((tx, running))
}

#[tokio::test]
async fn in_process_channel() -> anyhow::Result<()> {
    let (tx, rx) = channel::unbounded();
    tokio::spawn(
        BaseChannel::with_defaults(rx)
            .execute(HelloServer.serve())
            .for_each(spawn),
    );
    let client = GreeterClient::new(client::Config::default(), tx).spawn();

    let response = client
        .hello(
            context::current(),
            HelloRequest {
                name: "Stim".into(),
            },
        )
        .await?;
    assert_eq!(response.message, "Hello Stim");
    Ok(())
}

#[tokio::test]
async fn resolve_and_call() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = MemoryRegistry::new();
    let (stop, running) = start("greeter", registry.clone()).await?;

    let response =
        dial::say_hello(&registry, "greeter", "John".into(), &dial::Options::default()).await?;
    assert_eq!(response.message, "Hello John");

    stop.send(()).unwrap();
    running.await?;
    Ok(())
}

#[tokio::test]
async fn empty_name_keeps_trailing_space() -> anyhow::Result<()> {
    let registry = MemoryRegistry::new();
    let (stop, running) = start("greeter", registry.clone()).await?;

    let response =
        dial::say_hello(&registry, "greeter", String::new(), &dial::Options::default()).await?;
    assert_eq!(response.message, "Hello ");

    stop.send(()).unwrap();
    running.await?;
    Ok(())
}

#[tokio::test]
async fn unregistered_service_fails_fast() {
    let registry = MemoryRegistry::new();
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        dial::say_hello(&registry, "greeter", "John".into(), &dial::Options::default()),
    )
    .await
    .expect("resolution should not hang");
    assert_matches!(
        result,
        Err(dial::Error::Resolve(RegistryError::NotFound(_)))
    );
}

#[tokio::test]
async fn concurrent_calls_get_their_own_greetings() -> anyhow::Result<()> {
    let registry = MemoryRegistry::new();
    let (stop, running) = start("greeter", registry.clone()).await?;

    let client = dial::connect(&registry, "greeter", &dial::Options::default()).await?;
    let names: Vec<String> = (0..32).map(|i| format!("caller-{i}")).collect();
    let responses = join_all(names.iter().map(|name| {
        client.hello(
            context::current(),
            HelloRequest { name: name.clone() },
        )
    }))
    .await;

    for (name, response) in names.iter().zip(responses) {
        assert_eq!(response?.message, format!("Hello {name}"));
    }

    stop.send(()).unwrap();
    running.await?;
    Ok(())
}

#[tokio::test]
async fn clients_resolve_through_a_shared_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (stop, running) = start("go.micro.srv.greeter", FileRegistry::new(dir.path())).await?;

    let resolver = FileRegistry::new(dir.path());
    assert_eq!(resolver.resolve("go.micro.srv.greeter").await?.nodes.len(), 1);
    let response = dial::say_hello(
        &resolver,
        "go.micro.srv.greeter",
        "Zoë".into(),
        &dial::Options::default(),
    )
    .await?;
    assert_eq!(response.message, "Hello Zoë");

    stop.send(()).unwrap();
    running.await?;
    assert_matches!(
        resolver.resolve("go.micro.srv.greeter").await,
        Err(RegistryError::NotFound(_))
    );
    Ok(())
}

#[tokio::test]
async fn calls_spread_over_several_nodes() -> anyhow::Result<()> {
    let registry = MemoryRegistry::new();
    let (stop_a, running_a) = start("greeter", registry.clone()).await?;
    let (stop_b, running_b) = start("greeter", registry.clone()).await?;
    assert_eq!(registry.resolve("greeter").await?.nodes.len(), 2);

    for i in 0..8 {
        let response = dial::say_hello(
            &registry,
            "greeter",
            format!("n{i}"),
            &dial::Options::default(),
        )
        .await?;
        assert_eq!(response.message, format!("Hello n{i}"));
    }

    stop_a.send(()).unwrap();
    running_a.await?;
    // The remaining node still answers.
    let response =
        dial::say_hello(&registry, "greeter", "last".into(), &dial::Options::default()).await?;
    assert_eq!(response.message, "Hello last");

    stop_b.send(()).unwrap();
    running_b.await?;
    Ok(())
}
