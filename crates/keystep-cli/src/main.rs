//! Keystep command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Generate an identity on a server
//! keystep keygen --server https://server.example
//!
//! # Run an owner and five contacts through channel creation and a details
//! # publication, persisting every device to redb
//! keystep simulate --contacts 5 --seed 42 --db ./keystep-sim
//! ```

mod simulate;
mod system_env;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keystep_core::{EngineConfig, Environment};
use keystep_crypto::{EncryptionKeyPair, wrap::KEYPAIR_RANDOMNESS_SIZE};
use keystep_proto::CryptoIdentity;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    simulate::{SimulationConfig, SimulationError},
    system_env::SystemEnv,
};

/// Keystep protocol engine tools
#[derive(Parser, Debug)]
#[command(name = "keystep")]
#[command(about = "Keystep protocol engine tools")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a fresh identity and print it with its private key
    Keygen {
        /// Server the identity is registered on
        #[arg(long)]
        server: String,
    },
    /// Run an in-process world of one owner and its contacts
    Simulate {
        /// Number of contacts
        #[arg(long, default_value = "3")]
        contacts: usize,

        /// RNG seed; drawn from the OS when omitted
        #[arg(long)]
        seed: Option<u64>,

        /// Directory holding one redb database per device
        #[arg(long)]
        db: Option<PathBuf>,

        /// Local deliveries processed per inbound message
        #[arg(long, default_value = "64")]
        max_local_deliveries: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match args.command {
        Command::Keygen { server } => keygen(&server),
        Command::Simulate { contacts, seed, db, max_local_deliveries } => {
            let seed = seed.unwrap_or_else(|| SystemEnv.random_u64());
            tracing::info!(seed, contacts, db = ?db, "starting simulation");

            let config = SimulationConfig {
                contacts,
                seed,
                db_dir: db,
                engine: EngineConfig {
                    max_local_deliveries_per_message: max_local_deliveries,
                    ..EngineConfig::default()
                },
            };
            let summary = simulate::run(&config).inspect_err(|err: &SimulationError| {
                tracing::error!(seed, error = %err, "simulation failed");
            })?;
            tracing::info!(seed, summary = ?summary, "done");
        },
    }

    Ok(())
}

#[allow(clippy::print_stdout)]
fn keygen(server: &str) {
    let keys = EncryptionKeyPair::generate(&SystemEnv.random_array::<KEYPAIR_RANDOMNESS_SIZE>());
    let identity = CryptoIdentity::new(server, keys.public_key().to_bytes());

    println!("identity:    {}", hex::encode(identity.encoded()));
    println!("private key: {}", hex::encode(keys.private_key().to_bytes()));
    tracing::info!(identity = %identity, "identity generated");
}
