//! CLI tool for managing the route list
//!
//! Usage:
//!   hostproxy-routes add <hostname> <http> <https> [--upgrade]
//!   hostproxy-routes update <hostname> [--http <port>] [--https <port>] [--upgrade <bool>]
//!   hostproxy-routes delete <hostname>
//!   hostproxy-routes list [--json]
//!   hostproxy-routes check

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hostproxy::config::{normalize_host, save_routes, validate_routes};
use hostproxy::{load_routes, RouteRecord, RouteTables};
use std::path::{Path, PathBuf};

/// CLI tool for managing proxy routes
#[derive(Parser, Debug)]
#[command(name = "hostproxy-routes")]
#[command(author = "HostProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage the route list for HostProxy")]
struct Args {
    /// Settings file holding the route list
    #[arg(long, env = "SETTINGS_PATH", default_value = "./settings.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a new route
    Add {
        /// Hostname (e.g., api.example.com)
        hostname: String,

        /// Local backend port for plaintext traffic (e.g., :8080)
        http: String,

        /// Local backend port for HTTPS traffic (e.g., :8443)
        https: String,

        /// Redirect plaintext GET/HEAD requests to HTTPS
        #[arg(short = 'u', long)]
        upgrade: bool,
    },

    /// Update an existing route
    Update {
        /// Hostname
        hostname: String,

        /// New plaintext backend port
        #[arg(long)]
        http: Option<String>,

        /// New HTTPS backend port
        #[arg(long)]
        https: Option<String>,

        /// Turn HTTPS redirects on or off
        #[arg(long)]
        upgrade: Option<bool>,
    },

    /// Delete a route
    Delete {
        /// Hostname
        hostname: String,
    },

    /// List all routes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the settings file and print the resolved backends
    Check,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Add {
            hostname,
            http,
            https,
            upgrade,
        } => {
            let mut routes = read_or_empty(&args.settings)?;
            let route = RouteRecord::new(&hostname, &http, &https, upgrade);
            routes.push(route.clone());

            validate_routes(&routes)?;
            save_routes(&args.settings, &routes)?;

            println!("Added route:");
            print_route(&route);
        }

        Commands::Update {
            hostname,
            http,
            https,
            upgrade,
        } => {
            let mut routes = load_routes(&args.settings)?;
            let key = normalize_host(&hostname);

            let Some(route) = routes.iter_mut().find(|r| normalize_host(&r.hostname) == key) else {
                bail!("No route found for {}", hostname);
            };
            if let Some(http) = http {
                route.plaintext_port = http;
            }
            if let Some(https) = https {
                route.secure_port = https;
            }
            if let Some(upgrade) = upgrade {
                route.force_upgrade = upgrade;
            }
            let updated = route.clone();

            validate_routes(&routes)?;
            save_routes(&args.settings, &routes)?;

            println!("Updated route:");
            print_route(&updated);
        }

        Commands::Delete { hostname } => {
            let mut routes = load_routes(&args.settings)?;
            let key = normalize_host(&hostname);
            let before = routes.len();
            routes.retain(|r| normalize_host(&r.hostname) != key);

            if routes.len() == before {
                bail!("No route found for {}", hostname);
            }
            save_routes(&args.settings, &routes)?;
            println!("Deleted route for {}", hostname);
        }

        Commands::List { json } => {
            let routes = read_or_empty(&args.settings)?;

            if routes.is_empty() {
                println!("No routes configured");
                return Ok(());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&routes)?);
            } else {
                println!("{:<40} {:<10} {:<10} {:<8}", "HOSTNAME", "HTTP", "HTTPS", "UPGRADE");
                println!("{}", "-".repeat(71));

                for route in &routes {
                    println!(
                        "{:<40} {:<10} {:<10} {:<8}",
                        route.hostname,
                        route.plaintext_port,
                        route.secure_port,
                        if route.force_upgrade { "yes" } else { "no" }
                    );
                }

                println!("\nTotal: {} route(s)", routes.len());
            }
        }

        Commands::Check => {
            let routes = load_routes(&args.settings)?;
            let tables = RouteTables::build(&routes)?;

            for hostname in &tables.whitelist {
                let (Some(plain), Some(secure)) =
                    (tables.plaintext.lookup(hostname), tables.encrypted.lookup(hostname))
                else {
                    bail!("{} missing from a route table", hostname);
                };
                println!(
                    "{:<40} http -> {}{}  https -> {}",
                    hostname,
                    plain.backend,
                    if plain.upgrade { " (redirects GET/HEAD)" } else { "" },
                    secure.backend
                );
            }
            println!("\n{} route(s) OK", tables.whitelist.len());
        }
    }

    Ok(())
}

fn read_or_empty(path: &Path) -> Result<Vec<RouteRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(load_routes(path)?)
}

fn print_route(route: &RouteRecord) {
    println!("  Hostname:   {}", route.hostname);
    println!("  HTTP:       127.0.0.1{}", route.plaintext_port);
    println!("  HTTPS:      127.0.0.1{}", route.secure_port);
    println!("  Upgrade:    {}", route.force_upgrade);
}
