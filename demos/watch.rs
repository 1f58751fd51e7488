use clap::Parser;
use plex_bridge::{
    BridgeConfig, ClientIdentifier, Credential, EventSink, MemoryWatermarkStore, PinAuth,
    PlexBridge, ServerIdentity, ServerLocator,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Watch a Plex server and print every bridge event
#[derive(Parser)]
struct Args {
    /// Account token, unless pairing with --pair
    #[arg(long)]
    token: Option<String>,

    /// Machine identifier of the server to watch
    #[arg(long)]
    server: Option<String>,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pair with the account via PIN before watching
    #[arg(long)]
    pair: bool,
}

struct PrintSink;

impl EventSink for PrintSink {
    fn emit(&self, name: &str, payload: Value) {
        println!("{:<16} {}", name, payload);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plex_bridge=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    let client_identifier = ClientIdentifier::generate();

    let credential = if args.pair {
        let auth = PinAuth::new(Arc::new(config.clone()), client_identifier)?;
        let pin = auth.create_pin().await?;
        println!("Open {} and enter code {}", auth.auth_url(&pin), pin.code);
        auth.wait_for_token(&pin).await?
    } else {
        let Some(token) = args.token.clone() else {
            eprintln!("Pass --token or --pair");
            return Ok(());
        };
        Credential::new(token, client_identifier)
    };

    let Some(server) = args.server.clone() else {
        // no server picked yet, list what the account offers
        for summary in ServerLocator::list_servers(&config, &credential).await? {
            println!("{}  {}", summary.machine_identifier, summary.name);
        }
        return Ok(());
    };

    let mut bridge = PlexBridge::new(
        config,
        credential,
        ServerIdentity::new(server),
        Arc::new(MemoryWatermarkStore::default()),
    )?;

    let sink = bridge.spawn_sink(Arc::new(PrintSink));
    let mut availability = bridge.availability();
    tokio::spawn(async move {
        while availability.changed().await.is_ok() {
            println!("availability     {:?}", *availability.borrow());
        }
    });

    bridge.start().await;
    println!("Watching, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    bridge.stop().await;
    sink.abort();
    Ok(())
}
