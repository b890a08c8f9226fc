use clap::Parser;
use geocode_engine::location::{GeocodeProvider, NominatimProvider, ResolutionCache, StaticProvider};
use geocode_engine::{Address, EngineConfig, GeocodeEngine, GeocodeError, ProviderKind};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Geocode: resolve addresses to coordinates and measure distances.
///
/// Addresses are normalized, cached, coalesced and rate-limited before any
/// provider call. Multiple addresses are resolved concurrently.
///
/// Examples:
///   geocode "1600 Amphitheatre Parkway, Mountain View, CA"
///   geocode "10 Downing Street" --locality London --country GB
///   geocode "Stockholm" --to "Oslo"
///   geocode --offline --config geocode.toml "stockholm"
#[derive(Parser)]
#[command(name = "geocode", version, about, long_about = None)]
struct Cli {
    /// Addresses to resolve.
    #[arg(required = true)]
    addresses: Vec<String>,

    /// Locality hint applied to every address (e.g. "Mountain View").
    #[arg(long)]
    locality: Option<String>,

    /// Country hint (ISO 3166-1 alpha-2 or country name).
    #[arg(long)]
    country: Option<String>,

    /// Print the great-circle distance from the first address to this one.
    #[arg(long)]
    to: Option<String>,

    /// TOML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Offline mode: answer from the static gazetteer only.
    #[arg(long)]
    offline: bool,

    /// Load and save the cache snapshot between runs.
    #[arg(long)]
    persist: bool,
}

#[derive(Serialize)]
struct ResolvedOutput<'a> {
    address: &'a str,
    key: String,
    lat: f64,
    lon: f64,
    precision: String,
    confidence: f64,
    provider: String,
    display_name: Option<String>,
}

#[derive(Serialize)]
struct DistanceOutput<'a> {
    from: &'a str,
    to: &'a str,
    meters: f64,
}

#[derive(Serialize)]
struct Output<'a> {
    results: Vec<ResolvedOutput<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance: Option<DistanceOutput<'a>>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("geocode_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    });
    if cli.offline {
        config.provider.kind = ProviderKind::Static;
    }

    let provider = build_provider(&config).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    });
    let engine = GeocodeEngine::new(&config, provider);

    let snapshot = cli.persist.then(|| {
        config
            .cache
            .snapshot_path
            .clone()
            .unwrap_or_else(ResolutionCache::default_snapshot_path)
    });
    if let Some(path) = &snapshot {
        match engine.load_snapshot(path) {
            Ok(n) => tracing::debug!(entries = n, path = %path.display(), "cache snapshot loaded"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable cache snapshot"),
        }
    }

    let addresses: Vec<Address> = cli.addresses.iter().map(|text| hinted(&cli, text)).collect();

    let mut tasks = Vec::with_capacity(addresses.len());
    for address in addresses.iter().cloned() {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.resolve_entry(&address).await }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (text, task) in cli.addresses.iter().zip(tasks) {
        let entry = task
            .await
            .unwrap_or(Err(GeocodeError::LookupAborted))
            .unwrap_or_else(|e| fail(text, &e));
        eprintln!(
            "  \u{1F4CD} {} -> {:.5}, {:.5} ({}, confidence {:.2})",
            text, entry.coordinate.lat, entry.coordinate.lon, entry.coordinate.precision, entry.coordinate.confidence
        );
        results.push(ResolvedOutput {
            address: text,
            key: entry.key.to_string(),
            lat: entry.coordinate.lat,
            lon: entry.coordinate.lon,
            precision: entry.coordinate.precision.to_string(),
            confidence: entry.coordinate.confidence,
            provider: entry.metadata.provider,
            display_name: entry.metadata.display_name,
        });
    }

    let distance = match &cli.to {
        Some(to) => {
            let from = &cli.addresses[0];
            let meters = engine
                .distance_between(&addresses[0], &hinted(&cli, to))
                .await
                .unwrap_or_else(|e| fail(to, &e));
            eprintln!("  \u{1F4CF} {} -> {}: {:.1} km", from, to, meters / 1000.0);
            Some(DistanceOutput {
                from: from.as_str(),
                to: to.as_str(),
                meters,
            })
        }
        None => None,
    };

    if let Some(path) = &snapshot {
        if let Err(e) = engine.save_snapshot(path) {
            tracing::warn!(path = %path.display(), error = %e, "cannot write cache snapshot");
        }
    }

    match serde_json::to_string_pretty(&Output { results, distance }) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: cannot encode output: {}", e);
            std::process::exit(1);
        }
    }
}

fn build_provider(config: &EngineConfig) -> Result<Arc<dyn GeocodeProvider>, String> {
    match config.provider.kind {
        ProviderKind::Nominatim => Ok(Arc::new(
            NominatimProvider::new(
                config.provider.endpoint.clone(),
                config.provider.user_agent.clone(),
                config.provider_timeout(),
            )
            .with_api_key(config.provider.api_key.clone()),
        )),
        ProviderKind::Static => {
            let provider = match &config.provider.gazetteer {
                Some(path) => StaticProvider::from_file(path)
                    .map_err(|e| format!("cannot load gazetteer {}: {}", path.display(), e))?,
                None => StaticProvider::default(),
            };
            if provider.is_empty() {
                tracing::warn!("static provider has no gazetteer entries; only cached addresses will resolve");
            }
            Ok(Arc::new(provider))
        }
    }
}

fn hinted(cli: &Cli, text: &str) -> Address {
    Address {
        text: text.to_string(),
        locality: cli.locality.clone(),
        country: cli.country.clone(),
    }
}

fn fail(address: &str, error: &GeocodeError) -> ! {
    eprintln!("Error [{}]: {} ({})", error.code(), error, address);
    std::process::exit(1);
}
