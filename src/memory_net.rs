//! In-process datagram network
//!
//! [`MemoryNetwork`] is a [`TransportFactory`] whose transports exchange
//! datagrams through channels instead of sockets. Every transport bound to an
//! address receives what is sent to it (broadcast semantics). Links can be cut
//! and endpoints made unreachable, which drives failover and reconnect logic
//! deterministically under a paused tokio clock.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::{Result, UNetError};
use crate::transport::{Transport, TransportFactory};

#[derive(Default)]
struct NetState {
    bound: HashMap<SocketAddr, Vec<mpsc::UnboundedSender<Bytes>>>,
    cut: HashSet<SocketAddr>,
    refused: HashSet<SocketAddr>,
    dropped: u64,
}

/// Shared simulated network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently drop every datagram addressed to `addr` while `down`
    pub fn set_link_down(&self, addr: SocketAddr, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.cut.insert(addr);
        } else {
            state.cut.remove(&addr);
        }
    }

    /// Make binding `addr` fail while `refuse` is set
    pub fn refuse_bind(&self, addr: SocketAddr, refuse: bool) {
        let mut state = self.state.lock();
        if refuse {
            state.refused.insert(addr);
        } else {
            state.refused.remove(&addr);
        }
    }

    /// Deliver a raw datagram to every transport bound at `addr`
    pub fn inject(&self, addr: SocketAddr, datagram: impl Into<Bytes>) -> usize {
        self.deliver(addr, datagram.into())
    }

    /// Number of transports currently bound at `addr`
    pub fn bound_count(&self, addr: SocketAddr) -> usize {
        self.state
            .lock()
            .bound
            .get(&addr)
            .map(|v| v.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    fn deliver(&self, addr: SocketAddr, datagram: Bytes) -> usize {
        let mut state = self.state.lock();
        if state.cut.contains(&addr) {
            state.dropped += 1;
            return 0;
        }

        let mut count = 0;
        if let Some(sinks) = state.bound.get_mut(&addr) {
            sinks.retain(|tx| tx.send(datagram.clone()).is_ok());
            count = sinks.len();
        }
        count
    }

    fn bind(&self, addr: SocketAddr) -> Result<mpsc::UnboundedReceiver<Bytes>> {
        let mut state = self.state.lock();
        if state.refused.contains(&addr) {
            return Err(UNetError::transport(addr.to_string(), "address unavailable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.bound.entry(addr).or_default().push(tx);
        Ok(rx)
    }
}

impl TransportFactory for MemoryNetwork {
    fn create_receiver(&self, addr: SocketAddr) -> Result<Box<dyn Transport>> {
        Ok(Box::new(MemoryTransport::new(self.clone(), addr, true)))
    }

    fn create_sender(&self, addr: SocketAddr) -> Result<Box<dyn Transport>> {
        Ok(Box::new(MemoryTransport::new(self.clone(), addr, false)))
    }
}

/// One endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    net: MemoryNetwork,
    addr: SocketAddr,
    receiving: bool,
    connected: bool,
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    ready: Option<Bytes>,
}

impl MemoryTransport {
    fn new(net: MemoryNetwork, addr: SocketAddr, receiving: bool) -> Self {
        Self {
            net,
            addr,
            receiving,
            connected: false,
            rx: None,
            ready: None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if self.receiving {
            self.rx = Some(self.net.bind(self.addr)?);
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.rx = None;
        self.ready = None;
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn is_ready_for_receive(&mut self, timeout: Duration) -> bool {
        if self.ready.is_some() {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(datagram)) => {
                self.ready = Some(datagram);
                true
            }
            _ => false,
        }
    }

    async fn is_ready_for_send(&mut self, _timeout: Duration) -> bool {
        self.connected
    }

    async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.connected {
            return Err(UNetError::transport(self.id(), "not connected"));
        }
        self.net.deliver(self.addr, Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let datagram = match self.ready.take() {
            Some(d) => d,
            None => match self.rx.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(d)) => d,
                Some(Err(_)) => return Ok(None),
                None => return Err(UNetError::transport(self.id(), "not connected")),
            },
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(Some(n))
    }

    fn id(&self) -> String {
        format!("mem({})", self.addr)
    }
}
