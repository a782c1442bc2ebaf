mod node;

use clap::{Parser, Subcommand};
use node::{NodeConfig, SmsGatewayNode};
use secrecy::ExposeSecret;
use smsgate_service::{Account, AccountStore};
use smsgate_store::PgStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "smsgate-node",
    about = "Run an SMS gateway node (API, ingest, dispatch and settlement bundle)"
)]
struct Opts {
    /// Path to a config file (JSON, TOML or YAML). Environment variables
    /// with the SMSGATE prefix override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a tenant account and print its API key. The key is shown
    /// exactly once; only its fingerprint is stored.
    Provision {
        username: String,
        #[arg(long, default_value_t = 100)]
        rate_limit: u32,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let config = match load_configuration(opts.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error in configuration: {}", err);
            std::process::exit(1);
        }
    };

    let result = match opts.command {
        Some(Command::Provision {
            username,
            rate_limit,
        }) => provision(&config, &username, rate_limit).await,
        None => SmsGatewayNode::new(config).serve().await,
    };

    if let Err(err) = result {
        eprintln!("fatal: {}", err);
        std::process::exit(1);
    }
}

fn load_configuration(path: Option<&std::path::Path>) -> Result<NodeConfig, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    builder = builder.add_source(config::Environment::with_prefix("SMSGATE").separator("__"));
    builder.build()?.try_deserialize()
}

async fn provision(
    config: &NodeConfig,
    username: &str,
    rate_limit: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = PgStore::connect(&config.database_url).await?;
    let (account, api_key) = store.insert_account(username, rate_limit).await?;
    println!("account id: {}", account.id());
    println!("username:   {}", account.username());
    println!("api key:    {}", api_key.expose_secret());
    println!("(store this key now; only its fingerprint is kept)");
    Ok(())
}
