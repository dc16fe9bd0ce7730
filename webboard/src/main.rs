use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http::{Method, Request};
use service_async::{stack::FactoryStack, MakeService, Service};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};
use webboard_core::{
    element::{ClassRegistry, ElementKind, ElementModel},
    server::{Batch, Change, WebServer},
};
use webboard_services::{
    builtin::{register_builtins, InspectServlet},
    engine::InProcessEngine,
    http::{DispatchService, ErrorResponse},
};

use crate::config::{manager::StaticFileConfigManager, Config};

mod config;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Applies the config and prints the resulting model
    Check,
    /// Prints what each path resolves to
    Route { paths: Vec<String> },
    /// Dispatches one request and prints the response
    Request {
        uri: String,
        #[clap(short = 'X', long, default_value = "GET")]
        method: Method,
    },
    /// Applies the config and keeps reloading it when the file changes
    Watch {
        #[clap(long, default_value_t = 1)]
        interval_secs: u64,
    },
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let server = build_server(&config)?;
    let mut manager = StaticFileConfigManager::new(server.clone());

    match args.command {
        Command::Watch { interval_secs } => {
            manager
                .load_and_watch(&args.config, Duration::from_secs(interval_secs))
                .await?;
        }
        Command::Check => {
            manager.apply(config.declared()?)?;
            check(&server)?;
        }
        Command::Route { paths } => {
            manager.apply(config.declared()?)?;
            for path in paths {
                println!("{}", serde_json::to_string_pretty(&server.request_info(&path))?);
            }
        }
        Command::Request { uri, method } => {
            manager.apply(config.declared()?)?;
            request(&server, method, uri).await?;
        }
    }
    server.stop()?;
    Ok(())
}

fn build_server(config: &Config) -> Result<Arc<WebServer>> {
    let registry = Arc::new(ClassRegistry::default());
    register_builtins(&registry);
    let engine = Arc::new(InProcessEngine::new(registry.clone()));
    let server = Arc::new(WebServer::new(config.server.clone(), engine, registry));
    server.start()?;

    if let Some(path) = &config.inspect {
        let inspect = ElementModel::builder(ElementKind::Servlet)
            .name("inspect")
            .servlet(Arc::new(InspectServlet::new(&server)))
            .url_pattern(path.as_str())
            .service_id(server.next_service_id())
            .build()?;
        server.submit(Batch::new("inspect").with(Change::add_element(inspect)))?;
    }
    Ok(server)
}

fn check(server: &WebServer) -> Result<()> {
    let snapshot = server.model_snapshot();
    for element in &snapshot.elements {
        if !element.shadowed_in.is_empty() {
            tracing::warn!(
                element = %element.name,
                kind = %element.kind,
                shadowed_in = ?element.shadowed_in,
                "element is shadowed"
            );
        }
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn request(server: &Arc<WebServer>, method: Method, uri: String) -> Result<()> {
    let stack = FactoryStack::new(())
        .replace(DispatchService::factory(server.clone()))
        .push(ErrorResponse::layer())
        .into_inner();
    let svc = stack.make()?;
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::new())?;
    let resp = svc.call(request).await?;
    println!("{:?} {}", resp.version(), resp.status());
    for (name, value) in resp.headers() {
        println!("{name}: {}", String::from_utf8_lossy(value.as_bytes()));
    }
    println!();
    println!("{}", String::from_utf8_lossy(resp.body()));
    Ok(())
}
