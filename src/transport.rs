//! Datagram transports
//!
//! A [`Transport`] is one socket seen through the few operations the channels
//! and senders need: open, close, bounded readiness polls and raw datagram
//! send/receive. Two concrete kinds are selected by configuration:
//! [`UdpTransport`] for unicast/broadcast and [`MulticastTransport`] for
//! multicast groups.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::errors::{Result, UNetError};

/// Raw datagram link used by one receiver or transmitter
#[async_trait]
pub trait Transport: Send {
    /// Open the socket; idempotent once connected
    async fn connect(&mut self) -> Result<()>;

    /// Close the socket
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Wait at most `timeout` for an incoming datagram
    async fn is_ready_for_receive(&mut self, timeout: Duration) -> bool;

    /// Wait at most `timeout` for the socket to accept a datagram
    async fn is_ready_for_send(&mut self, timeout: Duration) -> bool;

    /// Send one datagram, returning the number of bytes written
    async fn send(&mut self, buf: &[u8]) -> Result<usize>;

    /// Take one pending datagram without blocking, `None` when nothing is queued
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Human readable endpoint, e.g. `192.168.1.255:3000`
    fn id(&self) -> String;
}

/// Builds transports for the endpoints named in the node list
pub trait TransportFactory: Send + Sync {
    fn create_receiver(&self, addr: SocketAddr) -> Result<Box<dyn Transport>>;

    fn create_sender(&self, addr: SocketAddr) -> Result<Box<dyn Transport>>;
}

/// Which socket flavour the exchange uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unicast or broadcast UDP
    #[default]
    Broadcast,
    /// IPv4 multicast groups
    Multicast,
}

/// Multicast socket options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastOptions {
    /// Hop limit for outgoing datagrams
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Deliver our own datagrams to local group members
    #[serde(default = "default_loopback")]
    pub loopback: bool,

    /// Interface address used to join groups and send
    #[serde(default)]
    pub iface: Option<Ipv4Addr>,
}

fn default_ttl() -> u32 {
    1
}

fn default_loopback() -> bool {
    true
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            loopback: default_loopback(),
            iface: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Receive,
    Send,
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

async fn wait_readable(socket: Option<&UdpSocket>, timeout: Duration) -> bool {
    match socket {
        Some(s) => matches!(tokio::time::timeout(timeout, s.readable()).await, Ok(Ok(()))),
        None => false,
    }
}

async fn wait_writable(socket: Option<&UdpSocket>, timeout: Duration) -> bool {
    match socket {
        Some(s) => matches!(tokio::time::timeout(timeout, s.writable()).await, Ok(Ok(()))),
        None => false,
    }
}

fn try_receive(socket: Option<&UdpSocket>, buf: &mut [u8], name: &str) -> Result<Option<usize>> {
    let socket = socket.ok_or_else(|| UNetError::transport(name, "not connected"))?;
    match socket.try_recv(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(UNetError::transport(name, e)),
    }
}

/// Unicast/broadcast UDP socket
///
/// A receiving transport binds to the configured address and port; a sending
/// transport binds an ephemeral port with `SO_BROADCAST` set and sends to the
/// configured address.
pub struct UdpTransport {
    role: Role,
    addr: SocketAddr,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn receiver(addr: SocketAddr) -> Self {
        Self {
            role: Role::Receive,
            addr,
            socket: None,
        }
    }

    pub fn sender(addr: SocketAddr) -> Self {
        Self {
            role: Role::Send,
            addr,
            socket: None,
        }
    }

    /// Address the socket is actually bound to, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let socket = match self.role {
            Role::Receive => UdpSocket::bind(self.addr).await,
            Role::Send => UdpSocket::bind(unspecified_for(&self.addr)).await,
        }
        .map_err(|e| UNetError::transport(self.id(), e))?;

        if self.role == Role::Send {
            socket
                .set_broadcast(true)
                .map_err(|e| UNetError::transport(self.id(), e))?;
        }

        debug!(endpoint = %self.addr, role = ?self.role, "udp socket open");
        self.socket = Some(socket);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn is_ready_for_receive(&mut self, timeout: Duration) -> bool {
        wait_readable(self.socket.as_ref(), timeout).await
    }

    async fn is_ready_for_send(&mut self, timeout: Duration) -> bool {
        wait_writable(self.socket.as_ref(), timeout).await
    }

    async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| UNetError::transport(self.id(), "not connected"))?;
        socket
            .send_to(buf, self.addr)
            .await
            .map_err(|e| UNetError::transport(self.id(), e))
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        try_receive(self.socket.as_ref(), buf, &self.id())
    }

    fn id(&self) -> String {
        self.addr.to_string()
    }
}

/// IPv4 multicast socket
///
/// A receiving transport binds the group port on all interfaces and joins the
/// group; a sending transport sends to the group with the configured TTL.
pub struct MulticastTransport {
    role: Role,
    group: SocketAddrV4,
    options: MulticastOptions,
    socket: Option<UdpSocket>,
}

impl MulticastTransport {
    pub fn receiver(group: SocketAddr, options: MulticastOptions) -> Result<Self> {
        Self::build(Role::Receive, group, options)
    }

    pub fn sender(group: SocketAddr, options: MulticastOptions) -> Result<Self> {
        Self::build(Role::Send, group, options)
    }

    fn build(role: Role, group: SocketAddr, options: MulticastOptions) -> Result<Self> {
        match group {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => Ok(Self {
                role,
                group: v4,
                options,
                socket: None,
            }),
            other => Err(UNetError::Configuration(format!(
                "{other} is not an IPv4 multicast group"
            ))),
        }
    }

    fn iface(&self) -> Ipv4Addr {
        self.options.iface.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let name = self.id();
        let socket = match self.role {
            Role::Receive => {
                let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.group.port());
                let socket = UdpSocket::bind(bind)
                    .await
                    .map_err(|e| UNetError::transport(&name, e))?;
                socket
                    .join_multicast_v4(*self.group.ip(), self.iface())
                    .map_err(|e| UNetError::transport(&name, e))?;
                socket
            }
            Role::Send => {
                let socket = UdpSocket::bind(SocketAddrV4::new(self.iface(), 0))
                    .await
                    .map_err(|e| UNetError::transport(&name, e))?;
                socket
                    .set_multicast_ttl_v4(self.options.ttl)
                    .map_err(|e| UNetError::transport(&name, e))?;
                socket
                    .set_multicast_loop_v4(self.options.loopback)
                    .map_err(|e| UNetError::transport(&name, e))?;
                socket
            }
        };

        debug!(group = %self.group, role = ?self.role, "multicast socket open");
        self.socket = Some(socket);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            if self.role == Role::Receive {
                let _ = socket.leave_multicast_v4(*self.group.ip(), self.iface());
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn is_ready_for_receive(&mut self, timeout: Duration) -> bool {
        wait_readable(self.socket.as_ref(), timeout).await
    }

    async fn is_ready_for_send(&mut self, timeout: Duration) -> bool {
        wait_writable(self.socket.as_ref(), timeout).await
    }

    async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| UNetError::transport(self.id(), "not connected"))?;
        socket
            .send_to(buf, self.group)
            .await
            .map_err(|e| UNetError::transport(self.id(), e))
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        try_receive(self.socket.as_ref(), buf, &self.id())
    }

    fn id(&self) -> String {
        format!("mcast({})", self.group)
    }
}

/// Factory producing real sockets of the configured kind
#[derive(Debug, Clone, Default)]
pub struct UdpFactory {
    kind: TransportKind,
    multicast: MulticastOptions,
}

impl UdpFactory {
    pub fn new(kind: TransportKind, multicast: MulticastOptions) -> Self {
        Self { kind, multicast }
    }
}

impl TransportFactory for UdpFactory {
    fn create_receiver(&self, addr: SocketAddr) -> Result<Box<dyn Transport>> {
        Ok(match self.kind {
            TransportKind::Broadcast => Box::new(UdpTransport::receiver(addr)),
            TransportKind::Multicast => {
                Box::new(MulticastTransport::receiver(addr, self.multicast.clone())?)
            }
        })
    }

    fn create_sender(&self, addr: SocketAddr) -> Result<Box<dyn Transport>> {
        Ok(match self.kind {
            TransportKind::Broadcast => Box::new(UdpTransport::sender(addr)),
            TransportKind::Multicast => {
                Box::new(MulticastTransport::sender(addr, self.multicast.clone())?)
            }
        })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::Multicast => write!(f, "multicast"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_requires_group_address() {
        let opts = MulticastOptions::default();
        assert!(MulticastTransport::receiver("127.0.0.1:3000".parse().unwrap(), opts.clone()).is_err());
        assert!(MulticastTransport::sender("239.255.0.1:3000".parse().unwrap(), opts).is_ok());

        let factory = UdpFactory::new(TransportKind::Multicast, MulticastOptions::default());
        assert!(factory.create_receiver("10.0.0.255:3000".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_udp_loopback_datagram() {
        let mut rx = UdpTransport::receiver("127.0.0.1:0".parse().unwrap());
        rx.connect().await.unwrap();
        let bound = rx.local_addr().unwrap();

        let mut tx = UdpTransport::sender(bound);
        tx.connect().await.unwrap();
        assert!(tx.is_ready_for_send(Duration::from_secs(1)).await);
        assert_eq!(tx.send(b"unet").await.unwrap(), 4);

        let mut buf = [0u8; 16];
        let mut got = None;
        for _ in 0..10 {
            if rx.is_ready_for_receive(Duration::from_millis(200)).await {
                got = rx.receive(&mut buf).unwrap();
                if got.is_some() {
                    break;
                }
            }
        }
        assert_eq!(got, Some(4));
        assert_eq!(&buf[..4], b"unet");

        rx.disconnect();
        assert!(!rx.is_connected());
        assert!(!rx.is_ready_for_receive(Duration::from_millis(10)).await);
    }
}
