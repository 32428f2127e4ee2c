//! Transmitter module - local node publishing logic
//!
//! Serializes the local node's sensors into fixed-capacity packets and sends
//! a full snapshot every `send_pause`. Sensor sets larger than one packet are
//! spread over several packets per tick.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SenderConfig, SensorKind};
use crate::errors::{Result, UNetError};
use crate::packet::{next_sequence, Packet};
use crate::store::{SensorId, SharedStore};
use crate::transport::Transport;

/// Whether the transmitter puts anything on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Enabled,
    /// Socket stays open, nothing is sent
    Disabled,
}

/// Where a sensor lives inside the outgoing packets
#[derive(Debug, Clone, Copy)]
struct Slot {
    pack: usize,
    idx: usize,
    kind: SensorKind,
}

struct SendState {
    packets: Vec<Packet>,
    index: HashMap<SensorId, Slot>,
    sequence: u32,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    store_errors: AtomicU64,
}

struct Task {
    token: CancellationToken,
    handle: JoinHandle<Box<dyn Transport>>,
}

struct Shared {
    name: String,
    address: SocketAddr,
    tuning: SenderConfig,
    store: Arc<dyn SharedStore>,
    refresh_from_store: bool,
    enabled: AtomicBool,
    state: Mutex<SendState>,
    counters: Counters,
    transport: Mutex<Option<Box<dyn Transport>>>,
    task: Mutex<Option<Task>>,
}

/// Transmitter - publishes the local node's sensor snapshot
///
/// Cloning yields another handle to the same transmitter.
#[derive(Clone)]
pub struct Transmitter {
    shared: Arc<Shared>,
}

impl Transmitter {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    /// Ids of every published sensor, in packet order
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        let state = self.shared.state.lock();
        let mut ids: Vec<_> = state
            .index
            .iter()
            .map(|(id, slot)| ((slot.pack, slot.kind == SensorKind::Digital, slot.idx), *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of packets one snapshot takes
    pub fn packet_count(&self) -> usize {
        self.shared.state.lock().packets.len()
    }

    /// Store the latest value of a published sensor
    ///
    /// # Arguments
    /// * `id` - Sensor id as configured
    /// * `value` - New value; digital sensors treat any non-zero value as set
    ///
    /// # Returns
    /// `false` if the sensor is not published by this transmitter
    pub fn update_sensor(&self, id: SensorId, value: i64) -> bool {
        let mut state = self.shared.state.lock();
        let Some(slot) = state.index.get(&id).copied() else {
            return false;
        };
        let packet = &mut state.packets[slot.pack];
        match slot.kind {
            SensorKind::Analog => packet.set_analog(slot.idx, value),
            SensorKind::Digital => packet.set_digital_bit(slot.idx, value != 0),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        let enabled = mode == Mode::Enabled;
        if self.shared.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!(sender = %self.shared.name, ?mode, "mode changed");
        }
    }

    pub fn mode(&self) -> Mode {
        if self.shared.enabled.load(Ordering::Acquire) {
            Mode::Enabled
        } else {
            Mode::Disabled
        }
    }

    /// Build the datagrams for one tick
    ///
    /// Refreshes values from the store first when the transmitter is not fed
    /// by subscriptions, then stamps every packet with the next sequence
    /// number and encodes it.
    ///
    /// # Returns
    /// One encoded datagram per packet, in send order
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.shared.snapshot()
    }

    /// Sequence number of the last stamped packet
    pub fn last_sequence(&self) -> u32 {
        self.shared.state.lock().sequence
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the send task
    ///
    /// # Arguments
    /// * `parent` - Cancelling this token stops the task as well
    ///
    /// # Returns
    /// Ok once the task runs; idempotent while running
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
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
                Err(e) => error!(sender = %self.shared.name, error = %e, "send task failed"),
            }
        }

        let started = {
            let mut task = self.shared.task.lock();
            if task.is_some() {
                return Ok(());
            }

            let transport = self.shared.transport.lock().take().ok_or_else(|| {
                UNetError::transport(&self.shared.name, "transport lost by a previous run")
            })?;

            let token = parent.child_token();
            let (started_tx, started_rx) = oneshot::channel();
            let handle = tokio::spawn(send_loop(
                self.shared.clone(),
                transport,
                token.clone(),
                started_tx,
            ));
            *task = Some(Task { token, handle });
            started_rx
        };

        started
            .await
            .map_err(|_| UNetError::transport(&self.shared.name, "send task exited on start"))?;
        info!(sender = %self.shared.name, address = %self.shared.address, "send task started");
        Ok(())
    }

    /// Cancel the send task and wait for it to release the transport
    pub async fn stop(&self) {
        let task = self.shared.task.lock().take();
        let Some(task) = task else {
            return;
        };

        task.token.cancel();
        match task.handle.await {
            Ok(transport) => *self.shared.transport.lock() = Some(transport),
            Err(e) => error!(sender = %self.shared.name, error = %e, "send task failed"),
        }
        info!(sender = %self.shared.name, "send task stopped");
    }

    pub fn metrics(&self) -> TransmitMetrics {
        let c = &self.shared.counters;
        TransmitMetrics {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            last_sequence: self.last_sequence(),
        }
    }

    pub fn short_info(&self) -> String {
        let m = self.metrics();
        format!(
            "{} {} mode={:?} packets={} sent={} errors={} seq={}",
            self.shared.name,
            self.shared.address,
            self.mode(),
            self.packet_count(),
            m.packets_sent,
            m.send_errors,
            m.last_sequence,
        )
    }
}

impl fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmitter")
            .field("name", &self.shared.name)
            .field("address", &self.shared.address)
            .field("mode", &self.mode())
            .finish()
    }
}

impl Shared {
    fn snapshot(&self) -> Vec<Bytes> {
        if self.refresh_from_store {
            self.refresh();
        }

        let mut state = self.state.lock();
        let mut sequence = state.sequence;
        let datagrams = state
            .packets
            .iter_mut()
            .map(|packet| {
                sequence = next_sequence(sequence);
                packet.sequence = sequence;
                packet.encode()
            })
            .collect();
        state.sequence = sequence;
        datagrams
    }

    fn refresh(&self) {
        let mut state = self.state.lock();
        let SendState { packets, index, .. } = &mut *state;
        for (id, slot) in index.iter() {
            match self.store.get_value(*id) {
                Ok(value) => {
                    let packet = &mut packets[slot.pack];
                    match slot.kind {
                        SensorKind::Analog => packet.set_analog(slot.idx, value),
                        SensorKind::Digital => packet.set_digital_bit(slot.idx, value != 0),
                    };
                }
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(sender = %self.name, sensor = id, error = %e, "value refresh failed");
                }
            }
        }
    }

    /// Whether to pause after the packet at position `sent` (zero based)
    fn pause_after(&self, sent: usize, total: usize) -> bool {
        if sent + 1 >= total || self.tuning.pack_send_pause.is_zero() {
            return false;
        }
        let factor = self.tuning.pack_send_pause_factor;
        factor == 0 || (sent + 1) % factor == 0
    }
}

async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    token: CancellationToken,
    started: oneshot::Sender<()>,
) -> Box<dyn Transport> {
    let _ = started.send(());
    let mut open_failed = false;

    while !token.is_cancelled() {
        if !transport.is_connected() {
            match transport.connect().await {
                Ok(()) => {
                    open_failed = false;
                    debug!(sender = %shared.name, "socket opened");
                }
                Err(e) => {
                    if !open_failed {
                        warn!(sender = %shared.name, error = %e, "cannot open socket, retrying");
                    }
                    open_failed = true;
                    if !pause(&token, shared.tuning.send_pause).await {
                        break;
                    }
                    continue;
                }
            }
        }

        if shared.enabled.load(Ordering::Acquire) {
            let datagrams = shared.snapshot();
            let total = datagrams.len();

            for (i, datagram) in datagrams.iter().enumerate() {
                match transport.send(datagram).await {
                    Ok(n) => {
                        shared.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                        shared.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        shared.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(sender = %shared.name, error = %e, "send failed, reopening");
                        transport.disconnect();
                        break;
                    }
                }

                if shared.pause_after(i, total) && !pause(&token, shared.tuning.pack_send_pause).await {
                    break;
                }
            }
        }

        if !pause(&token, shared.tuning.send_pause).await {
            break;
        }
    }

    transport.disconnect();
    transport
}

/// TransmitterBuilder - Fluent interface for transmitter configuration
///
/// Collects the published sensors and lays them out over as many packets as
/// their count requires.
pub struct TransmitterBuilder {
    node_id: i64,
    proc_id: i64,
    address: SocketAddr,
    name: Option<String>,
    config: SenderConfig,
    sensors: Vec<(SensorId, SensorKind)>,
    refresh_from_store: bool,
}

impl TransmitterBuilder {
    /// Create a new TransmitterBuilder with defaults
    ///
    /// # Arguments
    /// * `node_id` - Node id stamped on every packet
    /// * `proc_id` - Process id stamped on every packet
    /// * `address` - Destination (broadcast, unicast or multicast group)
    pub fn new(node_id: i64, proc_id: i64, address: SocketAddr) -> Self {
        Self {
            node_id,
            proc_id,
            address,
            name: None,
            config: SenderConfig::default(),
            sensors: Vec::new(),
            refresh_from_store: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: SenderConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish one sensor; duplicates are ignored
    pub fn with_sensor(mut self, id: SensorId, kind: SensorKind) -> Self {
        if !self.sensors.iter().any(|(s, _)| *s == id) {
            self.sensors.push((id, kind));
        }
        self
    }

    pub fn with_sensors(self, sensors: impl IntoIterator<Item = (SensorId, SensorKind)>) -> Self {
        sensors
            .into_iter()
            .fold(self, |b, (id, kind)| b.with_sensor(id, kind))
    }

    /// Poll the store for every value before each tick
    pub fn with_store_refresh(mut self, enable: bool) -> Self {
        self.refresh_from_store = enable;
        self
    }

    /// Get the configured cadence
    pub fn get_config(&self) -> &SenderConfig {
        &self.config
    }

    /// Get the number of published sensors
    pub fn get_sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn build(self, transport: Box<dyn Transport>, store: Arc<dyn SharedStore>) -> Transmitter {
        let name = self
            .name
            .unwrap_or_else(|| format!("sender({})", self.address));

        let mut packets = vec![Packet::new(self.node_id, self.proc_id)];
        let mut index = HashMap::with_capacity(self.sensors.len());
        let (mut analog_pack, mut digital_pack) = (0, 0);

        for (id, kind) in self.sensors {
            let cursor = match kind {
                SensorKind::Analog => &mut analog_pack,
                SensorKind::Digital => &mut digital_pack,
            };
            let idx = place(&mut packets, cursor, self.node_id, self.proc_id, id, kind);
            index.insert(id, Slot { pack: *cursor, idx, kind });
        }

        debug!(sender = %name, packets = packets.len(), sensors = index.len(), "packet layout built");

        Transmitter {
            shared: Arc::new(Shared {
                name,
                address: self.address,
                tuning: self.config,
                store,
                refresh_from_store: self.refresh_from_store,
                enabled: AtomicBool::new(true),
                state: Mutex::new(SendState {
                    packets,
                    index,
                    sequence: 0,
                }),
                counters: Counters::default(),
                transport: Mutex::new(Some(transport)),
                task: Mutex::new(None),
            }),
        }
    }
}

/// Append a sensor to the first packet at or after `cursor` with room for its kind
fn place(
    packets: &mut Vec<Packet>,
    cursor: &mut usize,
    node_id: i64,
    proc_id: i64,
    id: SensorId,
    kind: SensorKind,
) -> usize {
    loop {
        if *cursor == packets.len() {
            packets.push(Packet::new(node_id, proc_id));
        }
        let packet = &mut packets[*cursor];
        let added = match kind {
            SensorKind::Analog => packet.add_analog(id, 0),
            SensorKind::Digital => packet.add_digital(id, false),
        };
        match added {
            Some(idx) => return idx,
            None => *cursor += 1,
        }
    }
}

/// Performance metrics for transmitter operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitMetrics {
    /// Total datagrams transmitted
    pub packets_sent: u64,

    /// Total bytes transmitted
    pub bytes_sent: u64,

    /// Failed sends (each one reopens the socket)
    pub send_errors: u64,

    /// Failed value refreshes from the store
    pub store_errors: u64,

    pub last_sequence: u32,
}
