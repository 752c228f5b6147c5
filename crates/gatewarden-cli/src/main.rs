//! Gatewarden CLI
//!
//! Command-line interface for checking and exercising a gateway configuration

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use gatewarden_core::clock::system_clock;
use gatewarden_observability::{Metrics, init_logging};
use gatewarden_routing::{
    GatewayConfig, KongSync, RequestContext, RoutingOrchestrator, ServiceRegistration,
    ServiceRegistry, SyncSummary,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "gatewarden")]
#[command(about = "Gatewarden - API gateway routing and resilience core", long_about = None)]
struct Cli {
    /// Gateway configuration file (YAML, or TOML by extension)
    #[arg(short, long, global = true, env = "GATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    Validate,
    /// Route one request through a gateway built from the configuration
    Route {
        /// Request path, optionally versioned (`/api/v2/...`)
        path: String,

        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header as `name: value`; repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,

        /// Send the request this many times
        #[arg(short = 'n', long, default_value = "1")]
        repeat: u32,

        /// Print the health report after routing
        #[arg(long)]
        stats: bool,
    },
    /// Pull services from a Kong admin API into a registry
    SyncKong {
        /// Admin API base URL; defaults to control_plane.kong_admin_url
        #[arg(long)]
        admin_url: Option<String>,
    },
    /// Run one health check cycle and print component stats
    Stats {
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Serialize)]
struct SyncReport<'a> {
    summary: &'a SyncSummary,
    services: Vec<ServiceRegistration>,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let mut config = match path {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config.merge_env();
    config.validate()?;
    Ok(config)
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("Invalid header '{}', expected 'name: value'", raw);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid header '{}', empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary(config: &GatewayConfig) {
    println!("Configuration OK");
    println!("  routes:   {}", config.routes.len());
    for route in &config.routes {
        let methods = if route.methods.is_empty() {
            "*".to_string()
        } else {
            route.methods.join(",")
        };
        println!(
            "    {} [{}] -> {}{}",
            route.path,
            methods,
            route.service,
            if route.auth_required { " (auth)" } else { "" }
        );
    }
    println!("  services: {}", config.services.len());
    for service in &config.services {
        println!(
            "    {} ({} instances, {})",
            service.name,
            service.instances.len(),
            service
                .algorithm
                .unwrap_or(config.load_balancer.default_algorithm)
                .as_str()
        );
    }
    println!("  api keys: {}", config.api_keys.len());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Validate => print_summary(&config),
        Commands::Route {
            path,
            method,
            headers,
            body,
            repeat,
            stats,
        } => {
            let metrics = Arc::new(Metrics::new()?);
            let gateway = RoutingOrchestrator::from_config(&config, system_clock(), Some(metrics))?;

            let mut request = RequestContext::new(method, path);
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                request = request.with_header(name, value);
            }
            if let Some(body) = body {
                let body = serde_json::from_str(&body).context("--body is not valid JSON")?;
                request = request.with_body(body);
            }

            for _ in 0..repeat.max(1) {
                let outcome = gateway.route_request(&request).await;
                print_json(&outcome)?;
            }
            if stats {
                print_json(&gateway.health_report())?;
            }
            gateway.shutdown();
        }
        Commands::SyncKong { admin_url } => {
            let Some(admin_url) = admin_url.or_else(|| config.control_plane.kong_admin_url.clone())
            else {
                bail!("No Kong admin URL: pass --admin-url or set control_plane.kong_admin_url");
            };

            let registry = ServiceRegistry::new(config.registry.clone());
            let sync = KongSync::new(&admin_url)?;
            let summary = sync.sync_with_kong(&registry).await?;
            info!(admin_url = %admin_url, synced = summary.synced, "Sync finished");

            print_json(&SyncReport {
                summary: &summary,
                services: registry.list_services(),
            })?;
            registry.shutdown();
        }
        Commands::Stats { metrics: show_metrics } => {
            let metrics = Arc::new(Metrics::new()?);
            let gateway =
                RoutingOrchestrator::from_config(&config, system_clock(), Some(metrics.clone()))?;

            let load_balancer = gateway.load_balancer();
            let services = load_balancer.services();
            futures::future::join_all(
                services
                    .iter()
                    .map(|service| load_balancer.run_health_check_cycle(service)),
            )
            .await;
            gateway.registry().check_all_heartbeats();

            print_json(&gateway.health_report())?;
            if show_metrics {
                print!("{}", metrics.render()?);
            }
            gateway.shutdown();
        }
    }

    Ok(())
}
