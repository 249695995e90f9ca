//! Container binary - hosts processes listed in the configuration.
//!
//! Runs against the in-memory broker and policy store and ships a single
//! `echo` service class (`ion.services.echo.EchoService`) for smoke testing.

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Map, Value};
use std::path::PathBuf;

use ion_container::container::{CallContext, ProcessCatalog, ProcessType, Service};
use ion_container::{Config, Container, Result};

#[derive(Debug, Parser)]
#[command(name = "ion-container", about = "Capability container runtime")]
struct Args {
    /// JSON configuration file.
    #[arg(short, long, env = "ION_CONFIG")]
    config: Option<PathBuf>,

    /// Spawn one echo service under this name at startup.
    #[arg(long)]
    echo: Option<String>,
}

#[derive(Debug, Default)]
struct EchoService;

#[async_trait]
impl Service for EchoService {
    fn operations(&self) -> Vec<&'static str> {
        vec!["echo"]
    }

    async fn call(&mut self, _op: &str, args: Map<String, Value>, _ctx: &CallContext) -> Result<Value> {
        Ok(Value::Object(args))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    ion_container::observability::init_tracing_with(&config.observability);

    let catalog = ProcessCatalog::new().with(
        "ion.services.echo",
        "EchoService",
        ProcessType::Service,
        |_| Ok(Box::new(EchoService)),
    );
    let container = Container::builder().config(config).catalog(catalog).build()?;
    container.start().await?;

    if let Some(name) = &args.echo {
        let pid = container
            .spawn_process(name, "ion.services.echo", "EchoService", Value::Null, None)
            .await?;
        tracing::info!("Echo service {} running as {}", name, pid);
    }

    tracing::info!("Container {} running, ctrl-c to stop", container.id());
    tokio::signal::ctrl_c().await?;

    container.stop().await?;
    Ok(())
}
