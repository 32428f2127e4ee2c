//! UNet exchange - redundant UDP process-data exchange between nodes
//!
//! Every node periodically broadcasts the values of its local sensors in
//! fixed-layout packets and receives the packets of every other node,
//! writing the received values into a shared sensor store. Each remote node
//! may be reachable over two independent networks; the exchange keeps one
//! channel active and fails over when its link goes quiet.
//!
//! # Layers
//! - [`packet`]: wire codec with sequence numbers and section CRCs
//! - [`sequencer`]: ordering, duplicate and loss handling on the receive side
//! - [`transport`]: UDP broadcast and multicast sockets behind one trait
//! - [`receiver`] / [`transmitter`]: one receive channel, one periodic sender
//! - [`exchange`]: per-node redundancy, diagnostics and lifecycle

pub mod config;
pub mod errors;
pub mod exchange;
pub mod log_server;
pub mod logging;
pub mod memory_net;
pub mod packet;
pub mod receiver;
pub mod sequencer;
pub mod store;
pub mod transmitter;
pub mod transport;

pub use config::ExchangeConfig;
pub use errors::{DecodeError, Result, UNetError};
pub use exchange::{Exchange, NodeStatus, SystemMessage};
pub use packet::Packet;
pub use receiver::{ChannelNumber, Receiver, ReceiverBuilder};
pub use store::{MemoryStore, SensorId, SharedStore};
pub use transmitter::{Transmitter, TransmitterBuilder};

/// Protocol version reported by the CLI
pub const UNET_VERSION: u16 = 1;
