use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kres_api::{handle, ApplyResource, GetResource, ResourceHandler};
use kres_core::{ProxyRequest, Request, ResourceIdentity, Settings};
use kres_exec::{serve_proxy_request, Executor};
use kres_manifest::{ManifestLimits, ManifestResolver};
use kres_ops::{CommandRunner, LocalRunner};
use kres_router::AwsCli;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kresctl", version, about = "Reconcile Kubernetes manifests on behalf of a provisioning engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Json)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Resource { Apply, Get }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one handler step for an invocation request
    Handle {
        #[arg(long, value_enum)]
        resource: Resource,
        /// Request JSON file, `-` for stdin
        #[arg(long, default_value = "-")]
        request: PathBuf,
    },
    /// Serve one proxied command (runs inside the proxy unit)
    Proxy {
        /// Proxy request JSON file, `-` for stdin
        #[arg(long, default_value = "-")]
        request: PathBuf,
    },
    /// Encode or decode resource identity tokens
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
}

#[derive(Subcommand, Debug)]
enum IdentityCommand {
    Encode {
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "")]
        cluster: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        /// kubectl resource type, e.g. job.v1.batch
        #[arg(long)]
        kind: String,
    },
    Decode { id: String },
}

fn init_tracing() {
    let env = std::env::var("KRES_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KRES_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KRES_METRICS_ADDR; expected host:port");
        }
    }
}

async fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await.context("reading stdin")?;
        return Ok(buf);
    }
    tokio::fs::read_to_string(path).await.with_context(|| format!("reading {}", path.display()))
}

async fn run_step<H>(handler: &H, input: &str) -> Result<String>
where
    H: ResourceHandler,
    H::Model: Serialize + DeserializeOwned,
{
    let mut req: Request<H::Model> = serde_json::from_str(input).context("decoding invocation request")?;
    if req.client_request_token.as_deref().map_or(true, str::is_empty) {
        let token = uuid::Uuid::new_v4().to_string();
        warn!(token = %token, "request carries no client token; generated one");
        req.client_request_token = Some(token);
    }
    let event = handle(handler, &req).await;
    Ok(serde_json::to_string_pretty(&event)?)
}

fn local_runner(settings: &Settings) -> Arc<dyn CommandRunner> {
    Arc::new(LocalRunner::from_settings(settings))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Handle { resource, request } => {
            let input = read_input(&request).await?;
            info!(resource = ?resource, bytes = input.len(), "handle invoked");
            let runner = local_runner(&settings);
            let cloud = Arc::new(AwsCli::new(runner.clone()));
            let out = match resource {
                Resource::Apply => {
                    let resolver = ManifestResolver::new(settings.manifest_path.clone())
                        .with_limits(ManifestLimits::from_settings(&settings))
                        .with_object_store(cloud.clone());
                    let exec = Executor::new(runner, settings).with_cloud(cloud);
                    run_step(&ApplyResource::new(Arc::new(exec), resolver), &input).await?
                }
                Resource::Get => {
                    let settings = Settings { allow_public_endpoint: false, ..settings };
                    let exec = Executor::new(runner, settings).with_cloud(cloud);
                    run_step(&GetResource::new(Arc::new(exec)), &input).await?
                }
            };
            println!("{}", out);
        }
        Commands::Proxy { request } => {
            let input = read_input(&request).await?;
            let req: ProxyRequest = serde_json::from_str(&input).context("decoding proxy request")?;
            info!(cluster = %req.cluster_name, with_manifest = req.manifest.is_some(), "proxy invoked");
            let exec = Executor::new(local_runner(&settings), settings);
            let resp = serve_proxy_request(&exec, req).await;
            println!("{}", serde_json::to_string(&resp)?);
        }
        Commands::Identity { command } => match command {
            IdentityCommand::Encode { token, cluster, namespace, kind } => {
                println!("{}", ResourceIdentity::new(token, cluster, namespace, kind).encode());
            }
            IdentityCommand::Decode { id } => {
                let identity = ResourceIdentity::decode(&id).context("decoding identity")?;
                match cli.output {
                    Output::Json => println!("{}", serde_json::to_string_pretty(&identity)?),
                    Output::Human => {
                        println!("token     {}", identity.client_token);
                        println!("cluster   {}", identity.cluster().unwrap_or("(current context)"));
                        println!("namespace {}", identity.namespace);
                        println!("kind      {}", identity.kind);
                    }
                }
            }
        },
    }
    Ok(())
}
