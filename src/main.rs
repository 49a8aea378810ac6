//! Webherd dispatcher entry point
//!
//! Thin operational shell around the library: loads the TOML configuration,
//! connects to the store, and either runs the dispatcher loop, sweeps
//! claims after a fleet restart, or just validates the configuration.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use webherd::config::{load_config, Config};
use webherd::store::CassandraStore;
use webherd::{Datastore, Dispatcher};

/// Webherd: distributed crawl control plane
#[derive(Parser, Debug)]
#[command(name = "webherd")]
#[command(version = "1.0.0")]
#[command(about = "Dispatcher for a distributed crawler fleet", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Release every dispatched domain and exit (fleet-restart recovery)
    #[arg(long, conflicts_with = "dry_run")]
    unclaim_all: bool,

    /// Validate config, print the effective settings, and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("loading configuration from {}", path.display());
            load_config(path)?
        }
        None => Config::default(),
    };

    if cli.dry_run {
        print_effective_config(&config);
        return Ok(());
    }

    let store = Arc::new(
        CassandraStore::connect(
            &config.store.hosts,
            &config.store.keyspace,
            config.store.num_query_retries,
        )
        .await?,
    );

    if cli.unclaim_all {
        tracing::info!("releasing all dispatched domains");
        let datastore = Datastore::new(store, config);
        datastore.unclaim_all().await?;
        return Ok(());
    }

    let dispatcher = Dispatcher::new(store, config);
    let stop = dispatcher.stop_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping dispatcher");
            stop.stop();
        }
    });

    dispatcher.run().await;
    Ok(())
}

/// Sets up the tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("webherd=info,warn"),
            1 => EnvFilter::new("webherd=debug,info"),
            2 => EnvFilter::new("webherd=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_effective_config(config: &Config) {
    println!("Store:");
    println!("  hosts: {:?}", config.store.hosts);
    println!("  keyspace: {}", config.store.keyspace);
    println!("  query retries: {}", config.store.num_query_retries);

    println!("\nLinks:");
    println!("  add new domains: {}", config.links.add_new_domains);
    println!(
        "  existence cache size: {}",
        config.links.added_domains_cache_size
    );
    println!(
        "  default domain priority: {}",
        config.links.default_domain_priority
    );
    println!("  purge sid list: {:?}", config.links.purge_sid_list);

    println!("\nFetchers:");
    println!(
        "  active fetchers TTL: {:?}",
        config.fetcher.active_fetchers_ttl
    );

    println!("\nDispatcher:");
    println!(
        "  concurrent domains: {}",
        config.dispatcher.num_concurrent_domains
    );
    println!(
        "  dispatch interval: {:?}",
        config.dispatcher.dispatch_interval
    );
    println!(
        "  min link refresh time: {:?}",
        config.dispatcher.min_link_refresh_time
    );
    println!(
        "  max links per segment: {}",
        config.dispatcher.max_links_per_segment
    );
    println!(
        "  refresh percentage: {}",
        config.dispatcher.refresh_percentage
    );
    println!(
        "  correct link normalization: {}",
        config.dispatcher.correct_link_normalization
    );
    println!(
        "  empty dispatch retry interval: {:?}",
        config.dispatcher.empty_dispatch_retry_interval
    );

    println!("\n✓ Configuration is valid");
}
