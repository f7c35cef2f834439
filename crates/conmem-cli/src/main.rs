use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod target;

use commands::hex_utils::parse_hex_u32;
use commands::watch::ValueKind;
use config::Config;
use target::TargetArgs;

#[derive(Parser)]
#[command(name = "conmem")]
#[command(about = "Remote console memory tools")]
struct Args {
    #[arg(short, long, default_value = "conmem.toml")]
    config: PathBuf,

    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve an address expression and print the value it points at
    Resolve {
        /// Address, e.g. 82600000->20->5C or {48 8B ?? 05}->10
        address: String,
    },
    /// Dump raw memory in hexdump format
    Hexdump {
        address: String,

        /// Number of bytes
        #[arg(default_value = "256")]
        size: usize,

        /// Hide the ASCII column
        #[arg(long)]
        no_ascii: bool,
    },
    /// Poll addresses and print every change until Ctrl-C
    Watch {
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Poll interval in milliseconds
        #[arg(short, long, default_value = "500")]
        interval: u64,

        #[arg(short, long, value_enum, default_value = "u32")]
        kind: ValueKind,
    },
    /// List console processes, optionally attaching to one
    Processes {
        #[arg(long)]
        json: bool,

        /// Attach to this process id (hex)
        #[arg(long, value_parser = parse_hex_u32, conflicts_with = "attach_game")]
        attach: Option<u32>,

        /// Attach to the running game
        #[arg(long)]
        attach_game: bool,
    },
    /// Serve a memory image over the surrogate protocol
    SurrogateImage {
        file: PathBuf,

        port: u16,

        /// Console address of the first byte of the image (hex)
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        base: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("conmem=info".parse()?))
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => {
            info!("Loaded config from {:?}", args.config);
            c
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    if let Command::SurrogateImage { file, port, base } = &args.command {
        return commands::surrogate_image::run(file, *port, *base).await;
    }

    let connection = args.target.open(&config).await?;
    let result = match args.command {
        Command::Resolve { address } => commands::resolve::run(&connection, &address).await,
        Command::Hexdump {
            address,
            size,
            no_ascii,
        } => commands::hexdump::run(&connection, &config, &address, size, !no_ascii).await,
        Command::Watch {
            addresses,
            interval,
            kind,
        } => commands::watch::run(connection.clone(), &addresses, interval, kind).await,
        Command::Processes {
            json,
            attach,
            attach_game,
        } => commands::processes::run(&connection, json, attach, attach_game).await,
        // served above without a connection
        Command::SurrogateImage { .. } => Ok(()),
    };

    if let Err(e) = connection.close().await {
        warn!("Failed to close connection: {}", e);
    }
    result
}
