//! Lookup service entry point: crawls from a set of seed actors, archives
//! what it finds, and serves the query API other Lookups and Verifiers
//! consume.

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trustlookup::{
    config::EngineConfig,
    crawler::Crawler,
    memstore::MemoryStore,
    stats::LookupStats,
    storage::SignatureStorage,
};

/// Runs a Lookup instance: crawl from seed actors and/or serve the query API.
#[derive(Parser)]
#[command(name = "lookup", version)]
struct Args {
    /// Local domain this instance runs under.
    #[arg(long)]
    domain: String,
    /// Seed actor (absolute URI or `acct:` identifier) to start crawling
    /// from. May be repeated.
    #[arg(long = "from", value_name = "URI")]
    from: Vec<String>,
    /// Pre-register a verifier's actor uri so it can be granted actors to
    /// sign immediately. May be repeated.
    #[arg(long = "add-ver", value_name = "URI")]
    add_ver: Vec<String>,
    /// Don't run the crawl engine; serve the query API against whatever is
    /// already archived.
    #[arg(long)]
    no_crawl: bool,
    /// Don't serve the query API; only run the crawl engine.
    #[arg(long)]
    no_server: bool,
    /// Port the query API listens on.
    #[arg(long, default_value_t = 8080)]
    web_port: u16,
    /// Increase log verbosity (default: info, `-v`: debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    if args.no_crawl && args.no_server {
        eprintln!("nothing to do: both --no-crawl and --no-server were given");
        return std::process::ExitCode::FAILURE;
    }

    let level = if args.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).expect("static level filter"))
        .init();

    let storage = Arc::new(MemoryStore::new());
    for verifier in &args.add_ver {
        if let Err(e) = storage.register_verifier(verifier).await {
            tracing::warn!("failed to pre-register verifier {verifier}: {e}");
        }
    }

    let config = match EngineConfig::builder().domain(args.domain.clone()).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let stats = Arc::new(LookupStats::default());

    if !args.no_crawl {
        let crawler = Crawler::new(config, storage.clone(), stats.clone());
        crawler.run(args.from.clone()).await;
    }

    if !args.no_server {
        let app = trustlookup::lookup::router(storage.clone(), stats.clone());
        let addr = format!("0.0.0.0:{}", args.web_port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("failed to bind {addr}: {e}");
                return std::process::ExitCode::FAILURE;
            }
        };
        tracing::info!("lookup query API listening on {addr}");
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("server error: {e}");
            return std::process::ExitCode::FAILURE;
        }
    } else {
        tokio::signal::ctrl_c().await.ok();
    }

    std::process::ExitCode::SUCCESS
}
