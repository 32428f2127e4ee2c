//! CLI entry point for the UNet exchange
//!
//! Run an exchange from a configuration file:
//! ```bash
//! unet-exchange run --config unet.toml
//! ```
//!
//! Print the packets arriving on one endpoint:
//! ```bash
//! unet-exchange listen --addr 192.168.56.255:3001 --values
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use unet_exchange::config::{ExchangeConfig, LoggingConfig};
use unet_exchange::packet::{Packet, MAX_PACKET_SIZE};
use unet_exchange::transport::{MulticastOptions, Transport, TransportFactory, TransportKind, UdpFactory};
use unet_exchange::{logging, Exchange, MemoryStore, Result, SystemMessage, UNetError, UNET_VERSION};

#[derive(Parser)]
#[command(name = "unet-exchange")]
#[command(about = "Redundant UDP process-data exchange", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the exchange described by a configuration file
    Run {
        /// TOML configuration file
        #[arg(long)]
        config: PathBuf,

        /// Print the exchange state every N seconds
        #[arg(long)]
        info_interval: Option<u64>,
    },

    /// Decode and print packets received on one endpoint
    Listen {
        /// Address and port to bind
        #[arg(long)]
        addr: SocketAddr,

        /// Join `addr` as a multicast group
        #[arg(long)]
        multicast: bool,

        /// Print every value, not just the header
        #[arg(long)]
        values: bool,

        /// Stop after this many packets
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            info_interval,
        } => run(config, info_interval.map(Duration::from_secs)).await,
        Commands::Listen {
            addr,
            multicast,
            values,
            count,
        } => listen(addr, multicast, values, count).await,
    }
}

async fn run(path: PathBuf, info_interval: Option<Duration>) -> Result<()> {
    let config = ExchangeConfig::load_from(&path)?;
    let logs = logging::init(&config.logging)?;
    info!(version = UNET_VERSION, config = %path.display(), "unet exchange starting");

    let store = Arc::new(MemoryStore::new());
    let exchange = Exchange::new(config, store)?;
    exchange.set_log_handle(logs);

    match exchange.start().await {
        Ok(()) => {}
        Err(UNetError::Cancelled) => return Ok(()),
        Err(e) => {
            error!(error = %e, "startup failed");
            exchange.shutdown().await;
            return Err(e);
        }
    }

    let mut ticker = tokio::time::interval(info_interval.unwrap_or(Duration::from_secs(3600)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick(), if info_interval.is_some() => {
                println!("{}", exchange.info());
                exchange.sys_command(SystemMessage::WatchDog).await?;
            }
        }
    }

    exchange.sys_command(SystemMessage::FoldUp).await?;
    exchange.shutdown().await;
    println!("{}", exchange.info());
    Ok(())
}

async fn listen(addr: SocketAddr, multicast: bool, values: bool, count: Option<u64>) -> Result<()> {
    logging::init(&LoggingConfig::default())?;

    let kind = if multicast {
        TransportKind::Multicast
    } else {
        TransportKind::Broadcast
    };
    let mut transport = UdpFactory::new(kind, MulticastOptions::default()).create_receiver(addr)?;
    transport.connect().await?;
    println!("listening on {addr} ({kind})");

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut received = 0u64;
    while count.map_or(true, |c| received < c) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ready = transport.is_ready_for_receive(Duration::from_secs(1)) => {
                if !ready {
                    continue;
                }
            }
        }

        while let Some(n) = transport.receive(&mut buf)? {
            received += 1;
            match Packet::decode(&buf[..n]) {
                Ok(packet) => print_packet(&packet, values),
                Err(e) => println!("bad packet ({n} bytes): {e}"),
            }
        }
    }
    Ok(())
}

fn print_packet(packet: &Packet, values: bool) {
    println!("{packet}");
    if !values {
        return;
    }
    for entry in packet.analog() {
        println!("  a {:>8} = {}", entry.id, entry.val);
    }
    for (id, val) in packet.digital_values() {
        println!("  d {:>8} = {}", id, u8::from(val));
    }
}
