//! Verifier service entry point: watches one or more Lookup instances,
//! re-fetches and signs matching actors, and serves this verifier's own
//! actor document and status counters.

use clap::Parser;
use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trustlookup::{
    fetcher::Fetcher,
    memstore::MemoryStore,
    signatures::Signer,
    stats::VerifierStats,
    verifier::{router, VerifierConfig, Worker},
};

/// Runs a Verifier instance watching one or more Lookup services.
#[derive(Parser)]
#[command(name = "verifier", version)]
struct Args {
    /// Base URL of a Lookup instance to watch. May be repeated.
    #[arg(long = "watch", value_name = "URI")]
    watch: Vec<String>,
    /// This verifier's own actor uri, advertised to every watched Lookup.
    #[arg(long)]
    actor_uri: String,
    /// Display name for this verifier's actor document.
    #[arg(long, default_value = "Lookup verifier")]
    actor_name: String,
    /// Path this verifier's actor document is served at.
    #[arg(long, default_value = "/actor")]
    actor_key_path: String,
    /// PEM file holding this verifier's RSA private key. A fresh key is
    /// generated (and not persisted) if omitted.
    #[arg(long)]
    private_key: Option<std::path::PathBuf>,
    /// Port this verifier's actor/status HTTP surface listens on.
    #[arg(long, default_value_t = 9123)]
    web_port: u16,
    /// Increase log verbosity (default: info, `-v`: debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    if args.watch.is_empty() {
        eprintln!("nothing to do: no --watch target given");
        return std::process::ExitCode::FAILURE;
    }

    let level = if args.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).expect("static level filter"))
        .init();

    let signer = match load_or_generate_signer(args.private_key.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to load signing key: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let storage = Arc::new(MemoryStore::new());
    let stats = Arc::new(VerifierStats::default());
    let client = reqwest_middleware::ClientWithMiddleware::from(reqwest::Client::default());

    let mut workers = Vec::with_capacity(args.watch.len());
    for lookup_address in &args.watch {
        let config = match VerifierConfig::builder()
            .lookup_address(lookup_address.clone())
            .actor_uri(args.actor_uri.clone())
            .actor_name(args.actor_name.clone())
            .actor_key_path(args.actor_key_path.clone())
            .web_port(args.web_port)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                eprintln!("invalid configuration for {lookup_address}: {e}");
                return std::process::ExitCode::FAILURE;
            }
        };
        let connect_timeout = std::time::Duration::from_secs(5);
        let fetcher = Fetcher::new(client.clone(), config.request_timeout, connect_timeout, false);
        let worker = Worker::new(config, storage.clone(), signer.clone(), fetcher, stats.clone());
        worker.run().await;
        workers.push(worker);
    }

    let app = router(workers[0].clone());
    let addr = format!("0.0.0.0:{}", args.web_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {addr}: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    tracing::info!("verifier actor/status surface listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("server error: {e}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn load_or_generate_signer(path: Option<&std::path::Path>) -> anyhow::Result<Signer> {
    let pem = match path {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            tracing::warn!("no --private-key given, generating an ephemeral signing key");
            let mut rng = rand::thread_rng();
            let key = RsaPrivateKey::new(&mut rng, 2048)?;
            key.to_pkcs8_pem(Default::default())?.to_string()
        }
    };
    Ok(Signer::from_pem(&pem, 4)?)
}
