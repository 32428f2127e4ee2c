//! Receive channel: one physical link to one remote node
//!
//! A [`Receiver`] owns a transport and a background task that drains it,
//! decodes packets, runs them through the [`Sequencer`] and merges accepted
//! values into the shared store. Link health is derived from packet activity;
//! transitions are reported to a registered [`ChannelListener`].
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::errors::{Result, UNetError};
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::sequencer::{Sequencer, Verdict};
use crate::store::{SensorId, SharedStore};
use crate::transport::Transport;

/// Which of the two redundant links a channel is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelNumber {
    Primary = 1,
    Secondary = 2,
}

impl ChannelNumber {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected = 0,
    Connecting = 1,
    /// Connected, values are not written until the prepare time elapsed
    Initializing = 2,
    Synced = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Initializing,
            3 => Self::Synced,
            _ => Self::Disconnected,
        }
    }
}

/// Health of the link as last determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing decided yet (prepare time still running)
    Unknown = 0,
    Up = 1,
    Down = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Up,
            2 => Self::Down,
            _ => Self::Unknown,
        }
    }
}

/// Link transition reported to the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Up,
    Down,
}

/// Receives link transitions of every channel it is registered on
pub trait ChannelListener: Send + Sync {
    fn on_channel_event(&self, node_id: i64, channel: ChannelNumber, event: ChannelEvent);
}

/// Snapshot of receive counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveMetrics {
    pub packets_received: u64,

    pub bytes_received: u64,

    /// Datagrams that failed to decode
    pub bad_packets: u64,

    pub duplicates: u64,

    /// Packets released by the sequencer
    pub applied: u64,

    /// Applied packets skipped because their CRCs matched the previous one
    pub crc_skips: u64,

    pub lost_packets: u64,

    pub store_errors: u64,

    pub last_sequence: u32,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    bad_packets: AtomicU64,
    duplicates: AtomicU64,
    applied: AtomicU64,
    crc_skips: AtomicU64,
    store_errors: AtomicU64,
}

struct Core {
    sequencer: Sequencer,
    last_crc: Option<(u16, u16)>,
    pending: HashMap<SensorId, i64>,
    started_at: Option<Instant>,
    last_activity: Option<Instant>,
    last_flush: Option<Instant>,
    last_diagnostics: Option<Instant>,
    written_respond: Option<bool>,
    written_lost: Option<u64>,
}

struct Task {
    token: CancellationToken,
    handle: JoinHandle<Box<dyn Transport>>,
}

struct Shared {
    name: String,
    node_id: i64,
    channel: ChannelNumber,
    address: SocketAddr,
    tuning: ReceiverConfig,
    store: Arc<dyn SharedStore>,
    respond_id: Option<SensorId>,
    respond_invert: bool,
    lost_packets_id: Option<SensorId>,
    state: AtomicU8,
    link: AtomicU8,
    active: AtomicBool,
    counters: Counters,
    core: Mutex<Core>,
    listener: Mutex<Option<Weak<dyn ChannelListener>>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    task: Mutex<Option<Task>>,
}

/// Handle to one receive channel
///
/// Cloning is cheap and every clone drives the same channel.
#[derive(Clone)]
pub struct Receiver {
    shared: Arc<Shared>,
}

impl Receiver {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn node_id(&self) -> i64 {
        self.shared.node_id
    }

    pub fn channel(&self) -> ChannelNumber {
        self.shared.channel
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.shared.tuning
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.link_state()
    }

    pub fn is_link_up(&self) -> bool {
        self.shared.link_state() == LinkState::Up
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Make this channel authoritative (or not) for the store
    ///
    /// Activation drops the CRC cache so the next packet rewrites every value.
    pub fn set_active(&self, active: bool) {
        let was = self.shared.active.swap(active, Ordering::AcqRel);
        let mut core = self.shared.core.lock();
        if active {
            core.last_crc = None;
        } else {
            core.pending.clear();
        }
        if was != active {
            debug!(channel = %self.shared.name, active, "activity changed");
        }
    }

    /// Next applied packet rewrites the store even if its CRCs are unchanged
    pub fn force_update(&self) {
        self.shared.core.lock().last_crc = None;
    }

    pub fn lost_packets(&self) -> u64 {
        self.shared.core.lock().sequencer.lost_packets()
    }

    /// Register the listener for Up/Down transitions, replacing any previous one
    pub fn set_listener(&self, listener: Weak<dyn ChannelListener>) {
        *self.shared.listener.lock() = Some(listener);
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the receive task
    ///
    /// Idempotent while running. Fails if the task does not come up within
    /// `evrun_timeout` or the transport was lost by a crashed task.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        // a task that ended with its parent token still holds the transport
        let finished = {
            let mut task = self.shared.task.lock();
            match task.as_ref() {
                Some(t) if t.handle.is_finished() => task.take(),
                _ => None,
            }
        };
        if let Some(finished) = finished {
            match finished.handle.await {
                Ok(transport) => *self.shared.transport.lock() = Some(transport),
                Err(e) => error!(channel = %self.shared.name, error = %e, "receive task failed"),
            }
        }

        let started = {
            let mut task = self.shared.task.lock();
            if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
                return Ok(());
            }

            let transport = self.shared.transport.lock().take().ok_or_else(|| {
                UNetError::transport(&self.shared.name, "transport lost by a previous run")
            })?;

            let token = parent.child_token();
            let (started_tx, started_rx) = oneshot::channel();
            let handle = tokio::spawn(receive_loop(
                self.shared.clone(),
                transport,
                token.clone(),
                started_tx,
            ));
            *task = Some(Task { token, handle });
            started_rx
        };

        let evrun = self.shared.tuning.evrun_timeout;
        match tokio::time::timeout(evrun, started).await {
            Ok(Ok(())) => {
                info!(channel = %self.shared.name, address = %self.shared.address, "receive task started");
                Ok(())
            }
            _ => Err(UNetError::transport(
                &self.shared.name,
                format!("receive task did not start within {evrun:?}"),
            )),
        }
    }

    /// Cancel the receive task and wait for it to release the transport
    pub async fn stop(&self) {
        let task = self.shared.task.lock().take();
        let Some(task) = task else {
            return;
        };

        task.token.cancel();
        match task.handle.await {
            Ok(transport) => *self.shared.transport.lock() = Some(transport),
            Err(e) => error!(channel = %self.shared.name, error = %e, "receive task failed"),
        }
        self.shared.set_state(ChannelState::Disconnected);
        info!(channel = %self.shared.name, "receive task stopped");
    }

    /// Feed one raw datagram as if it had arrived on the transport
    pub fn process_datagram(&self, datagram: &[u8], now: Instant) {
        self.shared.process_datagram(datagram, now);
    }

    /// Run the periodic part: hole expiry, prepare timer, store flush, link check
    pub fn update(&self, now: Instant) {
        self.shared.update(now);
    }

    pub fn metrics(&self) -> ReceiveMetrics {
        let c = &self.shared.counters;
        let core = self.shared.core.lock();
        ReceiveMetrics {
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bad_packets: c.bad_packets.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            crc_skips: c.crc_skips.load(Ordering::Relaxed),
            lost_packets: core.sequencer.lost_packets(),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            last_sequence: core.sequencer.last_applied(),
        }
    }

    pub fn short_info(&self) -> String {
        let m = self.metrics();
        format!(
            "{} {} state={:?} link={:?} active={} recv={} lost={} bad={} seq={}",
            self.shared.name,
            self.shared.address,
            self.state(),
            self.link_state(),
            self.is_active(),
            m.packets_received,
            m.lost_packets,
            m.bad_packets,
            m.last_sequence,
        )
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.shared.name)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("link", &self.link_state())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::Acquire))
    }

    fn poll_interval(&self) -> Duration {
        self.tuning
            .update_pause
            .min(self.tuning.recv_timeout)
            .max(Duration::from_millis(1))
    }

    fn on_started(&self, now: Instant) {
        let mut core = self.core.lock();
        core.started_at = Some(now);
        core.last_activity = None;
        core.sequencer.reset();
        self.link.store(LinkState::Unknown as u8, Ordering::Release);
    }

    fn on_connected(&self, now: Instant) {
        let prepared = self
            .core
            .lock()
            .started_at
            .is_some_and(|t| now.saturating_duration_since(t) >= self.tuning.prepare_time);
        self.set_state(if prepared {
            ChannelState::Synced
        } else {
            ChannelState::Initializing
        });
        info!(channel = %self.name, state = ?self.state(), "link opened");
    }

    fn process_datagram(&self, datagram: &[u8], now: Instant) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let packet = match Packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                self.counters.bad_packets.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %self.name, error = %e, "dropping malformed packet");
                return;
            }
        };

        let event = {
            let mut core = self.core.lock();
            core.last_activity = Some(now);
            self.check_prepared(&mut core, now);

            let seq = packet.sequence;
            let primary = packet.primary_id();
            let mut released = Vec::new();
            match core.sequencer.push(packet, now, &mut released) {
                Verdict::Applied | Verdict::Buffered => {}
                Verdict::Duplicate => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                Verdict::Gap { lost } => {
                    warn!(channel = %self.name, seq, lost, sensor = primary, "sequence gap, new baseline");
                }
                Verdict::Restart => {
                    info!(channel = %self.name, seq, "sender restarted, new baseline");
                }
                Verdict::Invalid => {
                    self.counters.bad_packets.fetch_add(1, Ordering::Relaxed);
                    debug!(channel = %self.name, "packet with reserved sequence 0");
                }
            }
            self.accept(&mut core, released);
            self.evaluate_link(&core, now)
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn update(&self, now: Instant) {
        let event = {
            let mut core = self.core.lock();

            let mut released = Vec::new();
            let lost = core.sequencer.poll(now, &mut released);
            if lost > 0 {
                warn!(channel = %self.name, lost, "hole expired, applying buffered packets");
            }
            self.accept(&mut core, released);

            self.check_prepared(&mut core, now);
            self.flush(&mut core, now);
            self.evaluate_link(&core, now)
        };

        if let Some(event) = event {
            self.emit(event);
        }
        self.write_diagnostics(now);
    }

    /// Leave Initializing once `prepare_time` has passed since the task started
    fn check_prepared(&self, core: &mut Core, now: Instant) {
        if self.state() == ChannelState::Initializing
            && core
                .started_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.tuning.prepare_time)
        {
            self.set_state(ChannelState::Synced);
            core.last_crc = None;
            info!(channel = %self.name, "prepare time over, writing values");
        }
    }

    fn accept(&self, core: &mut Core, packets: Vec<Packet>) {
        for packet in packets {
            self.counters.applied.fetch_add(1, Ordering::Relaxed);
            if self.state() != ChannelState::Synced {
                continue;
            }

            let crcs = (packet.analog_crc(), packet.digital_crc());
            if !self.tuning.ignore_crc && core.last_crc == Some(crcs) {
                self.counters.crc_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            core.last_crc = Some(crcs);

            if !self.active.load(Ordering::Acquire) {
                continue;
            }
            for entry in packet.analog() {
                core.pending.insert(entry.id, entry.val);
            }
            for (id, bit) in packet.digital_values() {
                core.pending.insert(id, i64::from(bit));
            }
        }
    }

    fn flush(&self, core: &mut Core, now: Instant) {
        if !self.active.load(Ordering::Acquire) || self.state() != ChannelState::Synced {
            core.pending.clear();
            return;
        }
        if core.pending.is_empty() {
            return;
        }
        if core
            .last_flush
            .is_some_and(|t| now.saturating_duration_since(t) < self.tuning.update_pause)
        {
            return;
        }

        for (id, value) in core.pending.drain() {
            if let Err(e) = self.store.set_value(id, value) {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %self.name, sensor = id, error = %e, "store write failed");
            }
        }
        core.last_flush = Some(now);
    }

    /// Decide the link state, returning the event to emit on a transition
    fn evaluate_link(&self, core: &Core, now: Instant) -> Option<ChannelEvent> {
        let started = core.started_at?;
        let since_start = now.saturating_duration_since(started);
        if since_start < self.tuning.prepare_time {
            return None;
        }

        let timeout = self.tuning.recv_timeout;
        let healthy = core
            .last_activity
            .is_some_and(|t| now.saturating_duration_since(t) < timeout);

        let current = self.link_state();
        let next = match (healthy, current) {
            (true, LinkState::Up) => return None,
            (true, _) => LinkState::Up,
            (false, LinkState::Up) => LinkState::Down,
            (false, LinkState::Unknown) if since_start >= timeout => LinkState::Down,
            (false, _) => return None,
        };

        self.link.store(next as u8, Ordering::Release);
        if next == LinkState::Up {
            info!(channel = %self.name, "link up");
            Some(ChannelEvent::Up)
        } else {
            warn!(channel = %self.name, timeout = ?timeout, "no packets, link down");
            Some(ChannelEvent::Down)
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_channel_event(self.node_id, self.channel, event);
        }
    }

    fn write_diagnostics(&self, now: Instant) {
        if self.respond_id.is_none() && self.lost_packets_id.is_none() {
            return;
        }

        let mut core = self.core.lock();
        if core
            .last_diagnostics
            .is_some_and(|t| now.saturating_duration_since(t) < self.tuning.update_pause)
        {
            return;
        }
        core.last_diagnostics = Some(now);

        if let Some(id) = self.respond_id {
            let respond = (self.link_state() == LinkState::Up) != self.respond_invert;
            if core.written_respond != Some(respond) {
                match self.store.set_value(id, i64::from(respond)) {
                    Ok(()) => core.written_respond = Some(respond),
                    Err(e) => debug!(channel = %self.name, sensor = id, error = %e, "respond write failed"),
                }
            }
        }

        if let Some(id) = self.lost_packets_id {
            let lost = core.sequencer.lost_packets();
            if core.written_lost != Some(lost) {
                match self.store.set_value(id, lost as i64) {
                    Ok(()) => core.written_lost = Some(lost),
                    Err(e) => debug!(channel = %self.name, sensor = id, error = %e, "lost packets write failed"),
                }
            }
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    token: CancellationToken,
    started: oneshot::Sender<()>,
) -> Box<dyn Transport> {
    let _ = started.send(());

    let init_pause = shared.tuning.init_pause;
    if !init_pause.is_zero() {
        tokio::select! {
            _ = token.cancelled() => return transport,
            _ = tokio::time::sleep(init_pause) => {}
        }
    }

    shared.on_started(Instant::now());
    let poll = shared.poll_interval();
    let reconnect = shared.tuning.check_connection_pause;
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    while !token.is_cancelled() {
        if !transport.is_connected() {
            shared.set_state(ChannelState::Connecting);
            if let Err(e) = transport.connect().await {
                warn!(channel = %shared.name, error = %e, retry = ?reconnect, "cannot open link");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(reconnect) => {}
                }
                shared.update(Instant::now());
                continue;
            }
            shared.on_connected(Instant::now());
        }

        let ready = tokio::select! {
            _ = token.cancelled() => break,
            ready = transport.is_ready_for_receive(poll) => ready,
        };

        if ready {
            for _ in 0..shared.tuning.max_receive_at_time {
                match transport.receive(&mut buf) {
                    Ok(Some(n)) => shared.process_datagram(&buf[..n], Instant::now()),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(channel = %shared.name, error = %e, "receive failed, reopening");
                        transport.disconnect();
                        break;
                    }
                }
            }
        }

        shared.update(Instant::now());
    }

    transport.disconnect();
    shared.set_state(ChannelState::Disconnected);
    transport
}

/// Builder for [`Receiver`]
pub struct ReceiverBuilder {
    node_id: i64,
    channel: ChannelNumber,
    address: SocketAddr,
    name: Option<String>,
    config: ReceiverConfig,
    respond_id: Option<SensorId>,
    respond_invert: bool,
    lost_packets_id: Option<SensorId>,
    active: bool,
}

impl ReceiverBuilder {
    pub fn new(node_id: i64, channel: ChannelNumber, address: SocketAddr) -> Self {
        Self {
            node_id,
            channel,
            address,
            name: None,
            config: ReceiverConfig::default(),
            respond_id: None,
            respond_invert: false,
            lost_packets_id: None,
            active: channel == ChannelNumber::Primary,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_crc_check(mut self, enable: bool) -> Self {
        self.config.ignore_crc = !enable;
        self
    }

    pub fn with_respond_id(mut self, id: Option<SensorId>, invert: bool) -> Self {
        self.respond_id = id;
        self.respond_invert = invert;
        self
    }

    pub fn with_lost_packets_id(mut self, id: Option<SensorId>) -> Self {
        self.lost_packets_id = id;
        self
    }

    /// Initial authority; primaries start active, secondaries passive
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn get_config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn get_address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_crc_check_enabled(&self) -> bool {
        !self.config.ignore_crc
    }

    pub fn build(self, transport: Box<dyn Transport>, store: Arc<dyn SharedStore>) -> Receiver {
        let name = self
            .name
            .unwrap_or_else(|| format!("node{}:{}", self.node_id, self.channel.as_i64()));
        let sequencer = Sequencer::new(
            self.config.max_difference,
            self.config.buffer_size,
            self.config.lost_timeout,
        );

        let shared = Shared {
            name,
            node_id: self.node_id,
            channel: self.channel,
            address: self.address,
            store,
            respond_id: self.respond_id,
            respond_invert: self.respond_invert,
            lost_packets_id: self.lost_packets_id,
            state: AtomicU8::new(ChannelState::Disconnected as u8),
            link: AtomicU8::new(LinkState::Unknown as u8),
            active: AtomicBool::new(self.active),
            counters: Counters::default(),
            core: Mutex::new(Core {
                sequencer,
                last_crc: None,
                pending: HashMap::new(),
                started_at: None,
                last_activity: None,
                last_flush: None,
                last_diagnostics: None,
                written_respond: None,
                written_lost: None,
            }),
            listener: Mutex::new(None),
            transport: Mutex::new(Some(transport)),
            task: Mutex::new(None),
            tuning: self.config,
        };

        Receiver {
            shared: Arc::new(shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_net::MemoryNetwork;
    use crate::store::MemoryStore;
    use crate::transport::TransportFactory;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(i64, ChannelNumber, ChannelEvent)>>,
    }

    impl ChannelListener for Recorder {
        fn on_channel_event(&self, node_id: i64, channel: ChannelNumber, event: ChannelEvent) {
            self.events.lock().push((node_id, channel, event));
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3002))
    }

    fn tuning() -> ReceiverConfig {
        ReceiverConfig {
            recv_timeout: Duration::from_millis(500),
            prepare_time: Duration::from_millis(100),
            lost_timeout: Duration::from_millis(200),
            update_pause: Duration::from_millis(10),
            max_difference: 10,
            ..ReceiverConfig::default()
        }
    }

    fn build(store: Arc<MemoryStore>) -> Receiver {
        let transport = MemoryNetwork::new().create_receiver(addr()).unwrap();
        ReceiverBuilder::new(2, ChannelNumber::Primary, addr())
            .with_config(tuning())
            .build(transport, store)
    }

    fn datagram(seq: u32, value: i64) -> Vec<u8> {
        let mut p = Packet::new(2, 1);
        p.sequence = seq;
        p.add_analog(10, value).unwrap();
        p.add_digital(11, value % 2 == 1).unwrap();
        p.encode().to_vec()
    }

    /// Start timers and connect without a task
    fn prime(rx: &Receiver, at: Instant) {
        rx.shared.on_started(at);
        rx.shared.on_connected(at);
    }

    #[test]
    fn test_receiver_builder() {
        let builder = ReceiverBuilder::new(1, ChannelNumber::Secondary, addr())
            .with_config(tuning())
            .with_crc_check(false);

        assert_eq!(builder.get_address(), addr());
        assert!(!builder.is_crc_check_enabled());
        assert_eq!(builder.get_config().max_difference, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_time_holds_writes() {
        let store = Arc::new(MemoryStore::new());
        let rx = build(store.clone());
        let t0 = Instant::now();
        prime(&rx, t0);
        assert_eq!(rx.state(), ChannelState::Initializing);

        rx.process_datagram(&datagram(1, 5), t0);
        rx.update(t0);
        assert!(store.get_value(10).is_err());

        let t1 = t0 + Duration::from_millis(100);
        rx.update(t1);
        assert_eq!(rx.state(), ChannelState::Synced);
        rx.process_datagram(&datagram(2, 5), t1);
        rx.update(t1);
        assert_eq!(store.get_value(10).unwrap(), 5);
        assert_eq!(store.get_value(11).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_packet_after_prepare_is_written() {
        let store = Arc::new(MemoryStore::new());
        let rx = build(store.clone());
        let t0 = Instant::now();
        prime(&rx, t0);

        // no update() ran since prepare ended; the packet itself must sync the channel
        let t1 = t0 + Duration::from_millis(150);
        rx.process_datagram(&datagram(1, 9), t1);
        assert_eq!(rx.state(), ChannelState::Synced);
        rx.update(t1);
        assert_eq!(store.get_value(10).unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_short_circuit() {
        let store = Arc::new(MemoryStore::new());
        let rx = build(store.clone());
        let t0 = Instant::now() - Duration::from_secs(1);
        prime(&rx, t0);
        let now = Instant::now();

        rx.process_datagram(&datagram(1, 7), now);
        rx.update(now);
        assert_eq!(store.get_value(10).unwrap(), 7);

        // same payload: store untouched even if someone else wrote meanwhile
        store.set_value(10, 0).unwrap();
        rx.process_datagram(&datagram(2, 7), now);
        rx.update(now + Duration::from_millis(20));
        assert_eq!(store.get_value(10).unwrap(), 0);
        assert_eq!(rx.metrics().crc_skips, 1);

        rx.force_update();
        rx.process_datagram(&datagram(3, 7), now);
        rx.update(now + Duration::from_millis(40));
        assert_eq!(store.get_value(10).unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_channel_does_not_write() {
        let store = Arc::new(MemoryStore::new());
        let rx = build(store.clone());
        rx.set_active(false);
        let now = Instant::now();
        prime(&rx, now - Duration::from_secs(1));

        rx.process_datagram(&datagram(1, 3), now);
        rx.update(now);
        assert!(store.get_value(10).is_err());
        assert_eq!(rx.metrics().applied, 1);

        rx.set_active(true);
        rx.process_datagram(&datagram(2, 3), now);
        rx.update(now);
        assert_eq!(store.get_value(10).unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_does_not_count_as_activity() {
        let store = Arc::new(MemoryStore::new());
        let rx = build(store);
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ChannelListener> = Arc::downgrade(&(recorder.clone() as Arc<dyn ChannelListener>));
        rx.set_listener(weak);
        let t0 = Instant::now();
        prime(&rx, t0);

        let mut junk = datagram(1, 1);
        junk[0] ^= 0xFF;
        let t1 = t0 + Duration::from_millis(200);
        rx.process_datagram(&junk, t1);
        rx.update(t1);
        assert_eq!(rx.metrics().bad_packets, 1);
        assert_eq!(rx.link_state(), LinkState::Unknown);
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_events() {
        let store = Arc::new(MemoryStore::new());
        let rx = build(store);
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn ChannelListener> = Arc::downgrade(&(recorder.clone() as Arc<dyn ChannelListener>));
        rx.set_listener(weak);
        let t0 = Instant::now();
        prime(&rx, t0);

        // during prepare: no events
        rx.process_datagram(&datagram(1, 1), t0);
        assert!(recorder.events.lock().is_empty());

        let t1 = t0 + Duration::from_millis(150);
        rx.process_datagram(&datagram(2, 1), t1);
        assert!(rx.is_link_up());

        rx.update(t1 + Duration::from_millis(499));
        assert!(rx.is_link_up());
        rx.update(t1 + Duration::from_millis(500));
        assert_eq!(rx.link_state(), LinkState::Down);
        rx.update(t1 + Duration::from_millis(900));

        rx.process_datagram(&datagram(3, 1), t1 + Duration::from_secs(1));
        let events: Vec<_> = recorder.events.lock().iter().map(|e| e.2).collect();
        assert_eq!(events, vec![ChannelEvent::Up, ChannelEvent::Down, ChannelEvent::Up]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_from_start_goes_down() {
        let rx = build(Arc::new(MemoryStore::new()));
        let t0 = Instant::now();
        prime(&rx, t0);

        rx.update(t0 + Duration::from_millis(499));
        assert_eq!(rx.link_state(), LinkState::Unknown);
        rx.update(t0 + Duration::from_millis(500));
        assert_eq!(rx.link_state(), LinkState::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_diagnostics() {
        let store = Arc::new(MemoryStore::new());
        let transport = MemoryNetwork::new().create_receiver(addr()).unwrap();
        let rx = ReceiverBuilder::new(2, ChannelNumber::Secondary, addr())
            .with_config(tuning())
            .with_respond_id(Some(100), false)
            .with_lost_packets_id(Some(101))
            .build(transport, store.clone());
        let t0 = Instant::now();
        prime(&rx, t0);

        let t1 = t0 + Duration::from_millis(150);
        rx.process_datagram(&datagram(1, 1), t1);
        rx.process_datagram(&datagram(50, 1), t1);
        rx.update(t1);
        assert_eq!(store.get_value(100).unwrap(), 1);
        assert_eq!(store.get_value(101).unwrap(), 48);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_receives_over_memory_network() {
        let net = MemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let rx = ReceiverBuilder::new(2, ChannelNumber::Primary, addr())
            .with_config(tuning())
            .build(net.create_receiver(addr()).unwrap(), store.clone());

        let token = CancellationToken::new();
        rx.start(&token).await.unwrap();
        assert!(rx.is_running());
        tokio::time::sleep(Duration::from_millis(150)).await;

        net.inject(addr(), datagram(1, 42));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_value(10).unwrap(), 42);
        assert!(rx.is_link_up());

        rx.stop().await;
        assert!(!rx.is_running());
        assert_eq!(rx.state(), ChannelState::Disconnected);

        // restart reuses the transport
        rx.start(&token).await.unwrap();
        rx.stop().await;
    }
}
