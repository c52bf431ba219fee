use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lanlord::config::Config;
use lanlord::dhcp::engine::DhcpEngine;
use lanlord::dhcp::pool::LeasePool;
use lanlord::dhcp::server::DhcpServer;
use lanlord::dns::cache::DnsCache;
use lanlord::dns::record::RecordType;
use lanlord::dns::resolver::{Resolution, Resolver};
use lanlord::dns::server::DnsServer;
use lanlord::error::{Error, Result};

#[derive(Parser)]
#[command(name = "lanlord", version, about = "DNS resolver and DHCP server for small networks")]
struct Cli {
    /// Path to the configuration file; created with defaults if missing.
    #[arg(short, long, default_value = "lanlord.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the DNS and DHCP servers (the default).
    Run,
    /// Print the active configuration.
    ShowConfig,
    /// List lease records from the lease file.
    ListLeases,
    /// Reclaim timed-out offers and expired leases in the lease file.
    SweepLeases,
    /// Resolve a name against the configured zones and exit.
    Resolve {
        name: String,
        /// Record type to query (A, AAAA, CNAME, MX, TXT, PTR, ...).
        #[arg(short, long, default_value = "A")]
        record_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::ListLeases => list_leases(&config).await,
        Command::SweepLeases => sweep_leases(&config).await,
        Command::Resolve { name, record_type } => resolve(&config, &name, &record_type),
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let store = Arc::new(config.dns.record_store()?);
    let cache = Arc::new(DnsCache::new());
    let resolver = Arc::new(
        Resolver::new(store, cache)
            .with_referrals(config.dns.referral_table()?)
            .with_max_referral_depth(config.dns.max_referral_depth),
    );
    let dns = DnsServer::new(resolver, config.dns.bind_ip, config.dns.port);

    let engine = Arc::new(DhcpEngine::new(
        config.dhcp.engine_settings(),
        Arc::new(build_pool(&config)?),
    ));
    let dhcp = DhcpServer::new(engine).with_bind_ip(config.dhcp.bind_ip);

    tokio::select! {
        result = dns.run() => {
            error!("DNS server stopped");
            result
        }
        result = dhcp.run() => {
            error!("DHCP server stopped");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

fn build_pool(config: &Config) -> Result<LeasePool> {
    let pool = LeasePool::new(config.dhcp.pool_settings());
    match &config.dhcp.lease_file {
        Some(path) => pool.with_persistence(path.clone()),
        None => Ok(pool),
    }
}

async fn list_leases(config: &Config) -> Result<()> {
    let pool = build_pool(config)?;
    let leases = pool.leases().await;
    if leases.is_empty() {
        println!("No leases ({} address(es) free)", pool.free_count().await);
        return Ok(());
    }
    println!(
        "{:<16} {:<18} {:<9} {}",
        "ADDRESS", "CLIENT", "STATE", "EXPIRES"
    );
    for lease in leases {
        println!(
            "{:<16} {:<18} {:<9} {}",
            lease.ip.to_string(),
            lease.mac.to_string(),
            format!("{:?}", lease.state),
            lease.expires_at.to_rfc3339()
        );
    }
    println!("{} address(es) free", pool.free_count().await);
    Ok(())
}

async fn sweep_leases(config: &Config) -> Result<()> {
    let pool = build_pool(config)?;
    let report = pool.expire_sweep(Utc::now()).await?;
    println!(
        "{} offer(s) reclaimed, {} lease(s) expired, {} address(es) freed",
        report.offers_reclaimed, report.leases_expired, report.addresses_reclaimed
    );
    Ok(())
}

fn resolve(config: &Config, name: &str, record_type: &str) -> Result<()> {
    let rtype: RecordType = record_type
        .parse()
        .map_err(Error::InvalidConfig)?;

    let store = Arc::new(config.dns.record_store()?);
    let resolver = Resolver::new(store, Arc::new(DnsCache::new()))
        .with_referrals(config.dns.referral_table()?)
        .with_max_referral_depth(config.dns.max_referral_depth);

    match resolver.resolve(name, rtype, Utc::now()) {
        Resolution::Answered { records, .. } => {
            for record in records {
                println!("{}\t{}\t{:?}", record.name, record.ttl_seconds, record.data);
            }
        }
        Resolution::NxDomain { .. } => println!("NXDOMAIN"),
        Resolution::ServFail => println!("SERVFAIL"),
    }
    Ok(())
}
