//! Exchange: redundant channels per remote node plus the local senders
//!
//! For every remote node the exchange owns a primary [`Receiver`] and, when
//! the node has a second address, a secondary one. Exactly one of them is
//! active (writes to the store) while at least one link is up; the primary is
//! preferred whenever it is healthy. The local node is published by one
//! [`Transmitter`] per configured address.
//!
//! Lifecycle follows the host's system messages: [`SystemMessage::StartUp`]
//! waits for the store and for activation, then starts everything;
//! [`Exchange::shutdown`] cancels and stops every task.
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ExchangeConfig, NodeConfig};
use crate::errors::{Result, UNetError};
use crate::log_server::LogServer;
use crate::logging::LogHandle;
use crate::receiver::{ChannelEvent, ChannelListener, ChannelNumber, Receiver, ReceiverBuilder};
use crate::store::{SensorEvent, SensorId, SensorSink, SharedStore, SubscribeMode};
use crate::transmitter::{Mode, Transmitter, TransmitterBuilder};
use crate::transport::{TransportFactory, UdpFactory};

const ACTIVATE_POLL: Duration = Duration::from_millis(100);

/// Lifecycle commands delivered by the hosting process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    StartUp,
    FoldUp,
    Finish,
    WatchDog,
    LogRotate,
}

/// Diagnostic snapshot of one remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub respond: bool,
    pub lost_packets: u64,
    /// 0 when no link is up, otherwise the number of the active channel
    pub channel_num: i64,
    pub switch_count: u64,
}

struct NodeEntry {
    name: String,
    id: i64,
    respond_invert: bool,
    respond_id: Option<SensorId>,
    lost_packets_id: Option<SensorId>,
    channel_num_id: Option<SensorId>,
    channel_switch_count_id: Option<SensorId>,
    primary: Receiver,
    secondary: Option<Receiver>,
    switching: Mutex<Switching>,
}

/// Failover bookkeeping of one node
#[derive(Debug, Default)]
struct Switching {
    count: u64,
    /// Switches are counted only after the primary has been up once
    primary_seen_up: bool,
}

impl NodeEntry {
    fn receivers(&self) -> impl Iterator<Item = &Receiver> {
        std::iter::once(&self.primary).chain(self.secondary.as_ref())
    }

    fn status(&self, switch_count: u64) -> NodeStatus {
        let any_up = self.receivers().any(Receiver::is_link_up);
        let channel_num = if !any_up {
            0
        } else {
            self.receivers()
                .find(|r| r.is_active())
                .map(|r| r.channel().as_i64())
                .unwrap_or(0)
        };

        NodeStatus {
            respond: any_up != self.respond_invert,
            lost_packets: self.receivers().map(Receiver::lost_packets).sum(),
            channel_num,
            switch_count,
        }
    }

    /// Make `target` the only active channel, counting real switches
    fn select(&self, target: ChannelNumber, switching: &mut Switching) {
        let Some(secondary) = &self.secondary else {
            return;
        };
        let (to, from) = match target {
            ChannelNumber::Primary => (&self.primary, secondary),
            ChannelNumber::Secondary => (secondary, &self.primary),
        };
        if to.is_active() && !from.is_active() {
            return;
        }

        let switched = from.is_active();
        from.set_active(false);
        to.set_active(true);
        if !switched {
            return;
        }
        if switching.primary_seen_up {
            switching.count += 1;
        }
        info!(
            node = %self.name,
            from = from.name(),
            to = to.name(),
            switches = switching.count,
            "channel switched"
        );
    }
}

struct Inner {
    config: ExchangeConfig,
    store: Arc<dyn SharedStore>,
    nodes: Vec<NodeEntry>,
    node_index: HashMap<i64, usize>,
    senders: Vec<Transmitter>,
    token: CancellationToken,
    activated: RwLock<bool>,
    logs: Mutex<LogHandle>,
    log_server: Mutex<Option<LogServer>>,
    sensor_tx: SensorSink,
    sensor_rx: Mutex<Option<mpsc::UnboundedReceiver<SensorEvent>>>,
    last_heartbeat: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    step_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a configured exchange; clones share it
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

impl Exchange {
    /// Build from configuration with real UDP or multicast sockets
    pub fn new(config: ExchangeConfig, store: Arc<dyn SharedStore>) -> Result<Self> {
        let factory = UdpFactory::new(config.transport, config.multicast.clone());
        Self::with_factory(config, store, Arc::new(factory))
    }

    /// Build from configuration with transports from `factory`
    ///
    /// A primary channel or primary sender that cannot be created is a
    /// configuration error; secondary ones are skipped with a warning.
    pub fn with_factory(
        config: ExchangeConfig,
        store: Arc<dyn SharedStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        for node in config.remote_nodes() {
            if node.ignore {
                info!(node = %node.name, "node ignored by configuration");
                continue;
            }
            if let Some(entry) = build_node(&config, node, &store, factory.as_ref(), &mut seen)? {
                nodes.push(entry);
            }
        }

        let senders = if config.no_sender {
            Vec::new()
        } else {
            build_senders(&config, &store, factory.as_ref())?
        };

        let node_index = nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        let (sensor_tx, sensor_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            store,
            nodes,
            node_index,
            senders,
            token: CancellationToken::new(),
            activated: RwLock::new(false),
            logs: Mutex::new(LogHandle::detached()),
            log_server: Mutex::new(None),
            sensor_tx,
            sensor_rx: Mutex::new(Some(sensor_rx)),
            last_heartbeat: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            step_task: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let listener: Weak<dyn ChannelListener> = weak;
        for node in &inner.nodes {
            for receiver in node.receivers() {
                receiver.set_listener(listener.clone());
            }
        }

        info!(
            exchange = %inner.config.name,
            nodes = inner.nodes.len(),
            senders = inner.senders.len(),
            transport = %inner.config.transport,
            "exchange configured"
        );
        Ok(Self { inner })
    }

    /// Use `logs` for LogRotate and the diagnostic log server
    pub fn set_log_handle(&self, logs: LogHandle) {
        *self.inner.logs.lock() = logs;
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    /// Token cancelled by [`Exchange::shutdown`]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Whether the periodic `step()` task is running
    pub fn is_step_running(&self) -> bool {
        self.inner
            .step_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn is_activated(&self) -> bool {
        *self.inner.activated.read().await
    }

    /// Mark the exchange activated
    ///
    /// Holds the activation write lock while the sensor dispatcher is set up,
    /// so no sensor update or `step()` observes a half-initialized exchange.
    pub async fn activate(&self) {
        let mut activated = self.inner.activated.write().await;
        *activated = false;

        if let Some(rx) = self.inner.sensor_rx.lock().take() {
            let handle = tokio::spawn(dispatch_sensors(self.inner.clone(), rx));
            self.inner.tasks.lock().push(handle);
        }
        *self.inner.last_heartbeat.lock() = None;

        *activated = true;
        debug!(exchange = %self.inner.config.name, "activated");
    }

    /// Activate and run the StartUp sequence
    pub async fn start(&self) -> Result<()> {
        self.activate().await;
        self.sys_command(SystemMessage::StartUp).await
    }

    pub async fn sys_command(&self, message: SystemMessage) -> Result<()> {
        debug!(exchange = %self.inner.config.name, ?message, "system message");
        match message {
            SystemMessage::StartUp => self.startup().await,
            SystemMessage::FoldUp | SystemMessage::Finish => {
                if self.inner.config.standalone {
                    self.ask_sensors(SubscribeMode::DontNotify).await?;
                }
                Ok(())
            }
            SystemMessage::WatchDog => {
                if self.inner.config.standalone {
                    self.ask_sensors(SubscribeMode::Notify).await?;
                }
                self.start_all().await;
                Ok(())
            }
            SystemMessage::LogRotate => {
                info!(exchange = %self.inner.config.name, "log rotate");
                let logs = self.inner.logs.lock().clone();
                logs.rotate()
            }
        }
    }

    async fn startup(&self) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;

        if let Some(addr) = config.logging.log_server {
            let logs = inner.logs.lock().clone();
            match LogServer::start(addr, logs, &inner.token).await {
                Ok(server) => *inner.log_server.lock() = Some(server),
                Err(e) => warn!(address = %addr, error = %e, "log server not started"),
            }
        }

        let ready = tokio::select! {
            _ = inner.token.cancelled() => return Err(UNetError::Cancelled),
            ready = inner.store.wait_ready(config.sm_ready_timeout) => ready,
        };
        if !ready {
            if inner.token.is_cancelled() {
                return Err(UNetError::Cancelled);
            }
            error!(timeout = ?config.sm_ready_timeout, "shared store not ready");
            return Err(UNetError::StoreNotReady {
                timeout: config.sm_ready_timeout,
            });
        }

        if !config.init_pause.is_zero() {
            tokio::select! {
                _ = inner.token.cancelled() => return Err(UNetError::Cancelled),
                _ = tokio::time::sleep(config.init_pause) => {}
            }
        }

        if !self.wait_activated().await {
            if inner.token.is_cancelled() {
                return Err(UNetError::Cancelled);
            }
            error!(timeout = ?config.activate_timeout, "exchange not activated, starting anyway");
        }

        if config.standalone {
            let _activation = inner.activated.read().await;
            self.ask_sensors(SubscribeMode::Notify).await?;
        }

        {
            let mut step = inner.step_task.lock();
            if step.as_ref().map_or(true, JoinHandle::is_finished) {
                *step = Some(tokio::spawn(step_loop(inner.clone())));
            } else {
                debug!(exchange = %config.name, "step loop already running");
            }
        }
        self.start_all().await;

        info!(exchange = %config.name, "started");
        Ok(())
    }

    async fn wait_activated(&self) -> bool {
        let deadline = Instant::now() + self.inner.config.activate_timeout;
        loop {
            if *self.inner.activated.read().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = self.inner.token.cancelled() => return false,
                _ = tokio::time::sleep(ACTIVATE_POLL) => {}
            }
        }
    }

    /// Start every channel and sender not yet running; failures are logged
    async fn start_all(&self) {
        let token = &self.inner.token;
        for node in &self.inner.nodes {
            for receiver in node.receivers() {
                let was_running = receiver.is_running();
                if let Err(e) = receiver.start(token).await {
                    error!(channel = receiver.name(), error = %e, "channel not started");
                } else if !was_running {
                    receiver.force_update();
                }
            }
        }
        for sender in &self.inner.senders {
            if let Err(e) = sender.start(token).await {
                error!(sender = sender.name(), error = %e, "sender not started");
            }
        }
    }

    /// Subscribe (or unsubscribe) every published sensor
    ///
    /// Waits up to `activate_timeout` for the store first.
    pub async fn ask_sensors(&self, mode: SubscribeMode) -> Result<()> {
        let inner = &self.inner;
        let timeout = inner.config.activate_timeout;
        let ready = tokio::select! {
            _ = inner.token.cancelled() => return Err(UNetError::Cancelled),
            ready = inner.store.wait_ready(timeout) => ready,
        };
        if !ready {
            error!(timeout = ?timeout, "shared store not working, cannot subscribe");
            return Err(UNetError::StoreNotReady { timeout });
        }

        let ids: HashSet<SensorId> = inner.senders.iter().flat_map(Transmitter::sensor_ids).collect();
        for id in ids {
            if let Err(e) = inner.store.subscribe(id, mode, &inner.sensor_tx) {
                warn!(sensor = id, ?mode, error = %e, "subscription failed");
            }
        }
        Ok(())
    }

    /// Publish diagnostics once; called periodically by the step task
    pub async fn step(&self) {
        self.inner.step().await;
    }

    /// Route one value change to the senders, as the store subscription does
    pub fn update_sensor(&self, id: SensorId, value: i64) {
        let _ = self.inner.sensor_tx.send(SensorEvent { id, value });
    }

    pub fn set_sender_mode(&self, mode: Mode) {
        for sender in &self.inner.senders {
            sender.set_mode(mode);
        }
    }

    pub fn senders(&self) -> &[Transmitter] {
        &self.inner.senders
    }

    /// Primary and optional secondary channel of a remote node
    pub fn channels(&self, node_id: i64) -> Option<(&Receiver, Option<&Receiver>)> {
        self.inner
            .node(node_id)
            .map(|n| (&n.primary, n.secondary.as_ref()))
    }

    pub fn node_ids(&self) -> Vec<i64> {
        self.inner.nodes.iter().map(|n| n.id).collect()
    }

    pub fn node_status(&self, node_id: i64) -> Option<NodeStatus> {
        self.inner
            .node(node_id)
            .map(|n| n.status(n.switching.lock().count))
    }

    /// Stop everything; every item is stopped even if others fail
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(exchange = %inner.config.name, "shutting down");
        inner.token.cancel();
        *inner.activated.write().await = false;

        for node in &inner.nodes {
            for receiver in node.receivers() {
                receiver.stop().await;
            }
        }
        for sender in &inner.senders {
            sender.stop().await;
        }

        let server = inner.log_server.lock().take();
        if let Some(server) = server {
            server.stop().await;
        }

        let mut tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        tasks.extend(inner.step_task.lock().take());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
    }

    /// Multi-line human readable state
    pub fn info(&self) -> String {
        let inner = &self.inner;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: node_id={} transport={} nodes={} senders={}",
            inner.config.name,
            inner.config.local_node_id(),
            inner.config.transport,
            inner.nodes.len(),
            inner.senders.len()
        );
        for node in &inner.nodes {
            let status = node.status(node.switching.lock().count);
            let _ = writeln!(
                out,
                "  {}({}): respond={} lost={} channel={} switches={}",
                node.name, node.id, status.respond, status.lost_packets, status.channel_num, status.switch_count
            );
            for receiver in node.receivers() {
                let _ = writeln!(out, "    {}", receiver.short_info());
            }
        }
        for sender in &inner.senders {
            let _ = writeln!(out, "  {}", sender.short_info());
        }
        out
    }
}

impl Inner {
    fn node(&self, node_id: i64) -> Option<&NodeEntry> {
        self.node_index.get(&node_id).map(|i| &self.nodes[*i])
    }

    async fn step(&self) {
        let activated = self.activated.read().await;
        if !*activated {
            return;
        }

        if let Some(id) = self.config.heartbeat.id {
            let now = Instant::now();
            let mut last = self.last_heartbeat.lock();
            if last.map_or(true, |t| now.saturating_duration_since(t) >= self.config.heartbeat.time) {
                match self.store.set_value(id, self.config.heartbeat.max) {
                    Ok(()) => *last = Some(now),
                    Err(e) => error!(sensor = id, error = %e, "heartbeat write failed"),
                }
            }
        }

        for node in &self.nodes {
            let switching = node.switching.lock();
            let status = node.status(switching.count);

            let writes = [
                ("respond", node.respond_id, i64::from(status.respond)),
                ("lost packets", node.lost_packets_id, status.lost_packets as i64),
                ("channel number", node.channel_num_id, status.channel_num),
                ("channel switch count", node.channel_switch_count_id, switching.count as i64),
            ];
            for (field, id, value) in writes {
                let Some(id) = id else { continue };
                if let Err(e) = self.store.set_value(id, value) {
                    error!(node = %node.name, field, sensor = id, error = %e, "diagnostic write failed");
                }
            }
        }
    }
}

impl ChannelListener for Inner {
    fn on_channel_event(&self, node_id: i64, channel: ChannelNumber, event: ChannelEvent) {
        let Some(node) = self.node(node_id) else {
            return;
        };
        let Some(secondary) = &node.secondary else {
            return;
        };

        let mut switching = node.switching.lock();
        match (channel, event) {
            // primary is preferred as soon as it is healthy
            (ChannelNumber::Primary, ChannelEvent::Up) => {
                node.select(ChannelNumber::Primary, &mut switching);
                switching.primary_seen_up = true;
            }
            (ChannelNumber::Primary, ChannelEvent::Down) => {
                if secondary.is_link_up() {
                    node.select(ChannelNumber::Secondary, &mut switching);
                }
            }
            (ChannelNumber::Secondary, ChannelEvent::Up) => {
                if !node.primary.is_link_up() {
                    node.select(ChannelNumber::Secondary, &mut switching);
                }
            }
            (ChannelNumber::Secondary, ChannelEvent::Down) => {
                if node.primary.is_link_up() {
                    node.select(ChannelNumber::Primary, &mut switching);
                }
            }
        }
    }
}

async fn dispatch_sensors(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<SensorEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let activated = inner.activated.read().await;
        if !*activated {
            continue;
        }
        for sender in &inner.senders {
            sender.update_sensor(event.id, event.value);
        }
    }
}

async fn step_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.step_time);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = interval.tick() => inner.step().await,
        }
    }
}

fn build_node(
    config: &ExchangeConfig,
    node: &NodeConfig,
    store: &Arc<dyn SharedStore>,
    factory: &dyn TransportFactory,
    seen: &mut HashSet<std::net::SocketAddr>,
) -> Result<Option<NodeEntry>> {
    let tuning = node.receiver_config(&config.receiver).clone();

    let endpoint = node.endpoint()?;
    if !seen.insert(endpoint) {
        info!(node = %node.name, %endpoint, "endpoint already used by another node, ignored");
        return Ok(None);
    }

    let transport = factory.create_receiver(endpoint)?;
    let primary = ReceiverBuilder::new(node.id, ChannelNumber::Primary, endpoint)
        .with_name(format!("{}:1", node.name))
        .with_config(tuning.clone())
        .with_respond_id(node.respond1_id, node.respond_invert)
        .with_lost_packets_id(node.lost_packets1_id)
        .build(transport, store.clone());

    let mut secondary = None;
    if let Some(endpoint2) = node.endpoint2()? {
        if !seen.insert(endpoint2) {
            info!(node = %node.name, endpoint = %endpoint2, "secondary endpoint already used, ignored");
        } else {
            match factory.create_receiver(endpoint2) {
                Ok(transport) => {
                    secondary = Some(
                        ReceiverBuilder::new(node.id, ChannelNumber::Secondary, endpoint2)
                            .with_name(format!("{}:2", node.name))
                            .with_config(tuning)
                            .with_respond_id(node.respond2_id, node.respond_invert)
                            .with_lost_packets_id(node.lost_packets2_id)
                            .build(transport, store.clone()),
                    );
                }
                Err(e) => warn!(node = %node.name, error = %e, "secondary channel unavailable"),
            }
        }
    }

    Ok(Some(NodeEntry {
        name: node.name.clone(),
        id: node.id,
        respond_invert: node.respond_invert,
        respond_id: node.respond_id,
        lost_packets_id: node.lost_packets_id,
        channel_num_id: node.channel_num_id,
        channel_switch_count_id: node.channel_switch_count_id,
        primary,
        secondary,
        switching: Mutex::new(Switching::default()),
    }))
}

fn build_senders(
    config: &ExchangeConfig,
    store: &Arc<dyn SharedStore>,
    factory: &dyn TransportFactory,
) -> Result<Vec<Transmitter>> {
    let local = config.local_node().ok_or_else(|| {
        UNetError::Configuration(format!("local node '{}' not found", config.local_node))
    })?;
    let sensors: Vec<_> = config.published_sensors().map(|s| (s.id, s.kind)).collect();

    let builder = |n: usize, endpoint| {
        TransmitterBuilder::new(config.local_node_id(), config.proc_id, endpoint)
            .with_name(format!("{}:send{n}", local.name))
            .with_config(config.sender.clone())
            .with_sensors(sensors.iter().copied())
            .with_store_refresh(!config.standalone)
    };

    let endpoint = local.endpoint()?;
    let mut senders = vec![builder(1, endpoint).build(factory.create_sender(endpoint)?, store.clone())];

    if let Some(endpoint2) = local.endpoint2()? {
        match factory.create_sender(endpoint2) {
            Ok(transport) => senders.push(builder(2, endpoint2).build(transport, store.clone())),
            Err(e) => warn!(node = %local.name, error = %e, "secondary sender unavailable"),
        }
    }
    Ok(senders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReceiverConfig, SenderConfig, SensorConfig, SensorKind};
    use crate::memory_net::MemoryNetwork;
    use crate::store::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tracing_test::traced_test;

    fn ip(a: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, a, 255))
    }

    fn config(local: &str) -> ExchangeConfig {
        let mut node1 = NodeConfig::new("node1", 3001, ip(1));
        node1.address2 = Some(ip(2));
        let mut node2 = NodeConfig::new("node2", 3002, ip(1));
        node2.address2 = Some(ip(2));
        for node in [&mut node1, &mut node2] {
            node.respond_id = Some(100 + node.id);
            node.lost_packets_id = Some(200 + node.id);
            node.channel_num_id = Some(300 + node.id);
            node.channel_switch_count_id = Some(400 + node.id);
        }

        ExchangeConfig {
            name: format!("unet-{local}"),
            local_node: local.to_string(),
            standalone: true,
            step_time: Duration::from_millis(50),
            receiver: ReceiverConfig {
                recv_timeout: Duration::from_millis(300),
                prepare_time: Duration::from_millis(100),
                lost_timeout: Duration::from_millis(100),
                update_pause: Duration::from_millis(10),
                ..ReceiverConfig::default()
            },
            sender: SenderConfig {
                send_pause: Duration::from_millis(20),
                ..SenderConfig::default()
            },
            nodes: vec![node1, node2],
            sensors: vec![
                SensorConfig {
                    id: 1,
                    name: "a1".into(),
                    kind: SensorKind::Analog,
                    props: Default::default(),
                },
                SensorConfig {
                    id: 2,
                    name: "d1".into(),
                    kind: SensorKind::Digital,
                    props: Default::default(),
                },
            ],
            ..ExchangeConfig::default()
        }
    }

    fn exchange(local: &str, net: &MemoryNetwork, store: Arc<MemoryStore>) -> Exchange {
        Exchange::with_factory(config(local), store, Arc::new(net.clone())).unwrap()
    }

    #[test]
    fn test_build_channels_and_senders() {
        let net = MemoryNetwork::new();
        let ex = exchange("node1", &net, Arc::new(MemoryStore::new()));

        assert_eq!(ex.node_ids(), vec![3002]);
        let (primary, secondary) = ex.channels(3002).unwrap();
        assert!(primary.is_active());
        assert!(!secondary.unwrap().is_active());
        assert_eq!(ex.senders().len(), 2);
        assert_eq!(ex.senders()[0].sensor_ids(), vec![1, 2]);
    }

    #[test]
    fn test_ignored_and_duplicate_nodes() {
        let mut cfg = config("node1");
        let mut dup = NodeConfig::new("node3", 3003, ip(1));
        dup.port = Some(3002);
        cfg.nodes.push(dup);
        let mut ignored = NodeConfig::new("node4", 3004, ip(1));
        ignored.ignore = true;
        cfg.nodes.push(ignored);

        let ex = Exchange::with_factory(cfg, Arc::new(MemoryStore::new()), Arc::new(MemoryNetwork::new())).unwrap();
        assert_eq!(ex.node_ids(), vec![3002]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_and_failback() {
        let net = MemoryNetwork::new();
        let store1 = Arc::new(MemoryStore::new());
        let store2 = Arc::new(MemoryStore::new());
        let ex1 = exchange("node1", &net, store1.clone());
        let ex2 = exchange("node2", &net, store2.clone());
        ex1.start().await.unwrap();
        ex2.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = ex1.node_status(3002).unwrap();
        assert!(status.respond);
        assert_eq!(status.channel_num, 1);
        assert_eq!(status.switch_count, 0);

        // node2's primary network goes quiet
        let primary_ep = SocketAddr::new(ip(1), 3002);
        net.set_link_down(primary_ep, true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = ex1.node_status(3002).unwrap();
        assert!(status.respond);
        assert_eq!(status.channel_num, 2);
        assert_eq!(status.switch_count, 1);

        net.set_link_down(primary_ep, false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = ex1.node_status(3002).unwrap();
        assert_eq!(status.channel_num, 1);
        assert_eq!(status.switch_count, 2);

        // step publishes the same picture
        ex1.step().await;
        assert_eq!(store1.get_value(100 + 3002).unwrap(), 1);
        assert_eq!(store1.get_value(300 + 3002).unwrap(), 1);
        assert_eq!(store1.get_value(400 + 3002).unwrap(), 2);

        ex1.shutdown().await;
        ex2.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_takes_over_from_silent_primary() {
        let net = MemoryNetwork::new();
        net.set_link_down(SocketAddr::new(ip(1), 3002), true);

        let store1 = Arc::new(MemoryStore::new());
        let store2 = Arc::new(MemoryStore::new());
        let mut cfg1 = config("node1");
        cfg1.receiver.recv_timeout = Duration::from_secs(5);
        let ex1 = Exchange::with_factory(cfg1, store1.clone(), Arc::new(net.clone())).unwrap();
        let ex2 = exchange("node2", &net, store2.clone());
        ex1.start().await.unwrap();
        ex2.start().await.unwrap();

        // well inside recv_timeout: the primary has never been heard from
        tokio::time::sleep(Duration::from_millis(400)).await;
        store2.set_value(1, 77).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (primary, secondary) = ex1.channels(3002).unwrap();
        assert!(!primary.is_link_up());
        assert!(secondary.unwrap().is_active());
        let status = ex1.node_status(3002).unwrap();
        assert!(status.respond);
        assert_eq!(status.channel_num, 2);
        assert_eq!(status.switch_count, 0);
        assert_eq!(store1.get_value(1).unwrap(), 77);

        // first contact with the primary moves back without counting
        net.set_link_down(SocketAddr::new(ip(1), 3002), false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = ex1.node_status(3002).unwrap();
        assert_eq!(status.channel_num, 1);
        assert_eq!(status.switch_count, 0);

        ex1.shutdown().await;
        ex2.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_links_lost() {
        let net = MemoryNetwork::new();
        let ex1 = exchange("node1", &net, Arc::new(MemoryStore::new()));
        let ex2 = exchange("node2", &net, Arc::new(MemoryStore::new()));
        ex1.start().await.unwrap();
        ex2.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        ex2.set_sender_mode(Mode::Disabled);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = ex1.node_status(3002).unwrap();
        assert!(!status.respond);
        assert_eq!(status.channel_num, 0);

        ex2.set_sender_mode(Mode::Enabled);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = ex1.node_status(3002).unwrap();
        assert!(status.respond);
        assert_eq!(status.channel_num, 1);

        ex1.shutdown().await;
        ex2.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_step_isolates_write_failures() {
        let net = MemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config("node1");
        cfg.heartbeat.id = Some(900);
        let ex = Exchange::with_factory(cfg, store.clone(), Arc::new(net)).unwrap();

        // not activated: nothing is written
        ex.step().await;
        assert!(store.get_value(900).is_err());

        ex.activate().await;
        store.fail_writes(100 + 3002, true);
        ex.step().await;

        assert_eq!(store.get_value(900).unwrap(), 10);
        assert!(store.get_value(100 + 3002).is_err());
        assert_eq!(store.get_value(200 + 3002).unwrap(), 0);
        assert_eq!(store.get_value(300 + 3002).unwrap(), 0);
        assert_eq!(store.get_value(400 + 3002).unwrap(), 0);
        assert!(logs_contain("diagnostic write failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config("node1");
        cfg.heartbeat.id = Some(900);
        cfg.heartbeat.time = Duration::from_secs(1);
        let ex = Exchange::with_factory(cfg, store.clone(), Arc::new(MemoryNetwork::new())).unwrap();
        ex.activate().await;

        ex.step().await;
        assert_eq!(store.get_value(900).unwrap(), 10);

        // a consumer counts the heartbeat down; we only refresh it once per period
        store.set_value(900, 3).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        ex.step().await;
        assert_eq!(store.get_value(900).unwrap(), 3);
        tokio::time::advance(Duration::from_millis(500)).await;
        ex.step().await;
        assert_eq!(store.get_value(900).unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_not_ready_is_fatal() {
        let store = Arc::new(MemoryStore::not_ready());
        let mut cfg = config("node1");
        cfg.sm_ready_timeout = Duration::from_millis(200);
        let ex = Exchange::with_factory(cfg, store, Arc::new(MemoryNetwork::new())).unwrap();

        assert!(matches!(
            ex.start().await,
            Err(UNetError::StoreNotReady { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_startup() {
        let store = Arc::new(MemoryStore::not_ready());
        let ex = Exchange::with_factory(config("node1"), store, Arc::new(MemoryNetwork::new())).unwrap();

        let starter = ex.clone();
        let startup = tokio::spawn(async move { starter.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        ex.shutdown().await;

        assert!(matches!(startup.await.unwrap(), Err(UNetError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fold_up_after_shutdown_does_not_wait_for_store() {
        let store = Arc::new(MemoryStore::not_ready());
        let mut cfg = config("node1");
        cfg.activate_timeout = Duration::from_secs(60);
        let ex = Exchange::with_factory(cfg, store, Arc::new(MemoryNetwork::new())).unwrap();
        ex.shutdown().await;

        let started = Instant::now();
        assert!(matches!(
            ex.sys_command(SystemMessage::FoldUp).await,
            Err(UNetError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_startup_keeps_one_step_loop() {
        let store = Arc::new(MemoryStore::new());
        let ex = exchange("node1", &MemoryNetwork::new(), store.clone());
        assert!(!ex.is_step_running());
        ex.start().await.unwrap();
        assert!(ex.is_step_running());
        ex.sys_command(SystemMessage::StartUp).await.unwrap();
        ex.sys_command(SystemMessage::StartUp).await.unwrap();
        assert!(ex.is_step_running());

        ex.shutdown().await;
        assert!(!ex.is_step_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_follow_system_messages() {
        let store = Arc::new(MemoryStore::new());
        let ex = exchange("node1", &MemoryNetwork::new(), store.clone());
        ex.start().await.unwrap();
        assert_eq!(store.subscriber_count(1), 1);

        ex.sys_command(SystemMessage::FoldUp).await.unwrap();
        assert_eq!(store.subscriber_count(1), 0);

        ex.sys_command(SystemMessage::WatchDog).await.unwrap();
        assert_eq!(store.subscriber_count(1), 1);
        ex.sys_command(SystemMessage::LogRotate).await.unwrap();

        // subscription events reach the senders
        store.set_value(1, 77).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let packet = crate::packet::Packet::decode(&ex.senders()[0].snapshot()[0]).unwrap();
        assert_eq!(packet.analog()[0].val, 77);

        assert!(ex.info().contains("node2(3002)"));
        ex.shutdown().await;
    }
}
