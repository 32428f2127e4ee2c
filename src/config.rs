//! Exchange configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `UNET_`, nested keys split on `__`
//!    (`UNET_RECEIVER__RECV_TIMEOUT=2s`)
//!
//! Every section has defaults, so a file only needs the node list and the
//! name of the local node.
//!
//! # Example
//! ```no_run
//! use unet_exchange::config::ExchangeConfig;
//!
//! let config = ExchangeConfig::load_from("unet.toml")?;
//! println!("local node: {}", config.local_node);
//! # Ok::<(), unet_exchange::UNetError>(())
//! ```
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, UNetError};
use crate::store::SensorId;
use crate::transport::{MulticastOptions, TransportKind};

/// Top-level exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Exchange name used in logs
    pub name: String,
    /// Name of the node entry describing this process
    pub local_node: String,
    /// Node id stamped on outgoing packets, defaults to the local node's id
    pub node_id: Option<i64>,
    /// Process id stamped on outgoing packets
    pub proc_id: i64,
    pub transport: TransportKind,
    /// Publish subscribed values instead of polling the store every tick
    pub standalone: bool,
    /// Receive only
    pub no_sender: bool,
    #[serde(with = "humantime_serde")]
    pub sm_ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub activate_timeout: Duration,
    /// Period of [`crate::exchange::Exchange::step`]
    #[serde(with = "humantime_serde")]
    pub step_time: Duration,
    /// Pause between activation and starting channels
    #[serde(with = "humantime_serde")]
    pub init_pause: Duration,
    pub receiver: ReceiverConfig,
    pub sender: SenderConfig,
    pub heartbeat: HeartbeatConfig,
    pub multicast: MulticastOptions,
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
    pub nodes: Vec<NodeConfig>,
    pub sensors: Vec<SensorConfig>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: "unet".to_string(),
            local_node: String::new(),
            node_id: None,
            proc_id: 0,
            transport: TransportKind::default(),
            standalone: false,
            no_sender: false,
            sm_ready_timeout: Duration::from_secs(15),
            activate_timeout: Duration::from_secs(20),
            step_time: Duration::from_secs(1),
            init_pause: Duration::ZERO,
            receiver: ReceiverConfig::default(),
            sender: SenderConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            multicast: MulticastOptions::default(),
            filter: FilterConfig::default(),
            logging: LoggingConfig::default(),
            nodes: Vec::new(),
            sensors: Vec::new(),
        }
    }
}

/// Receive channel tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Silence longer than this marks the link down
    #[serde(with = "humantime_serde")]
    pub recv_timeout: Duration,
    /// After start, values are not written and no link events fire for this long
    #[serde(with = "humantime_serde")]
    pub prepare_time: Duration,
    /// Upper bound for the receive task to come up
    #[serde(with = "humantime_serde")]
    pub evrun_timeout: Duration,
    /// How long a hole may stay open before the missing packets count as lost
    #[serde(with = "humantime_serde")]
    pub lost_timeout: Duration,
    /// Minimum interval between store flushes
    #[serde(with = "humantime_serde")]
    pub update_pause: Duration,
    /// Retry interval when the socket cannot be opened
    #[serde(with = "humantime_serde")]
    pub check_connection_pause: Duration,
    /// Delay before the first socket open
    #[serde(with = "humantime_serde")]
    pub init_pause: Duration,
    pub max_difference: u32,
    pub buffer_size: usize,
    /// Datagrams drained per wake-up
    pub max_receive_at_time: usize,
    pub ignore_crc: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(5),
            prepare_time: Duration::from_secs(2),
            evrun_timeout: Duration::from_secs(60),
            lost_timeout: Duration::from_secs(5),
            update_pause: Duration::from_millis(100),
            check_connection_pause: Duration::from_secs(10),
            init_pause: Duration::ZERO,
            max_difference: 1000,
            buffer_size: 100,
            max_receive_at_time: 5,
            ignore_crc: false,
        }
    }
}

/// Sender cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SenderConfig {
    /// Interval between snapshots
    #[serde(with = "humantime_serde")]
    pub send_pause: Duration,
    /// Pause between packets of one snapshot
    #[serde(with = "humantime_serde")]
    pub pack_send_pause: Duration,
    /// Pause only after every n-th packet, 0 pauses after each one
    pub pack_send_pause_factor: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            send_pause: Duration::from_millis(100),
            pack_send_pause: Duration::from_millis(5),
            pack_send_pause_factor: 0,
        }
    }
}

/// Local heartbeat written by `step()`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub id: Option<SensorId>,
    #[serde(with = "humantime_serde")]
    pub time: Duration,
    pub max: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            id: None,
            time: Duration::from_secs(3),
            max: 10,
        }
    }
}

/// Selects the local sensors a sender publishes
///
/// An empty `field` matches every sensor. Otherwise the sensor's property
/// `field` must equal `value`, or merely be non-empty when `value` is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub field: String,
    pub value: String,
}

impl FilterConfig {
    pub fn matches(&self, props: &BTreeMap<String, String>) -> bool {
        if self.field.is_empty() {
            return true;
        }
        match props.get(&self.field) {
            Some(v) if self.value.is_empty() => !v.is_empty(),
            Some(v) => *v == self.value,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error or an EnvFilter string)
    pub level: String,
    /// Optional log file, reopened on LogRotate
    pub file: Option<PathBuf>,
    /// Address of the diagnostic log server, disabled when absent
    pub log_server: Option<SocketAddr>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            log_server: None,
        }
    }
}

/// One entry of the static node list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub id: i64,
    pub address: IpAddr,
    /// Defaults to the node id
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub address2: Option<IpAddr>,
    /// Defaults to `port`
    #[serde(default)]
    pub port2: Option<u16>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub respond_invert: bool,
    #[serde(default)]
    pub respond_id: Option<SensorId>,
    #[serde(default)]
    pub respond1_id: Option<SensorId>,
    #[serde(default)]
    pub respond2_id: Option<SensorId>,
    #[serde(default)]
    pub lost_packets_id: Option<SensorId>,
    #[serde(default)]
    pub lost_packets1_id: Option<SensorId>,
    #[serde(default)]
    pub lost_packets2_id: Option<SensorId>,
    #[serde(default)]
    pub channel_num_id: Option<SensorId>,
    #[serde(default)]
    pub channel_switch_count_id: Option<SensorId>,
    /// Replaces the global receiver tuning for this node
    #[serde(default)]
    pub receiver: Option<ReceiverConfig>,
}

impl NodeConfig {
    /// Minimal node entry, everything optional left unset
    pub fn new(name: impl Into<String>, id: i64, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            id,
            address,
            port: None,
            address2: None,
            port2: None,
            ignore: false,
            respond_invert: false,
            respond_id: None,
            respond1_id: None,
            respond2_id: None,
            lost_packets_id: None,
            lost_packets1_id: None,
            lost_packets2_id: None,
            channel_num_id: None,
            channel_switch_count_id: None,
            receiver: None,
        }
    }

    pub fn port(&self) -> Result<u16> {
        match self.port {
            Some(port) => Ok(port),
            None => u16::try_from(self.id)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    UNetError::Configuration(format!(
                        "node '{}': no port and id {} is not a valid port",
                        self.name, self.id
                    ))
                }),
        }
    }

    /// Primary channel endpoint
    pub fn endpoint(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.address, self.port()?))
    }

    /// Secondary channel endpoint, if the node has a second address
    pub fn endpoint2(&self) -> Result<Option<SocketAddr>> {
        let Some(address2) = self.address2 else {
            return Ok(None);
        };
        let port = match self.port2 {
            Some(p) => p,
            None => self.port()?,
        };
        Ok(Some(SocketAddr::new(address2, port)))
    }

    pub fn receiver_config<'a>(&'a self, global: &'a ReceiverConfig) -> &'a ReceiverConfig {
        self.receiver.as_ref().unwrap_or(global)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Analog,
    Digital,
}

/// Local sensor known to the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    pub id: SensorId,
    #[serde(default)]
    pub name: String,
    pub kind: SensorKind,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl ExchangeConfig {
    /// Load from a TOML file and `UNET_` environment variables, then validate
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load from TOML text and `UNET_` environment variables, then validate
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .merge(Env::prefixed("UNET_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(UNetError::Configuration(msg));

        if !self.no_sender && self.local_node().is_none() {
            return err(format!(
                "local node '{}' not found in the node list",
                self.local_node
            ));
        }

        check_receiver("receiver", &self.receiver)?;

        if self.heartbeat.id.is_some() && self.heartbeat.max <= 0 {
            return err("heartbeat.max must be positive when heartbeat.id is set".into());
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return err(format!("duplicate node id {}", node.id));
            }

            node.port()?;
            if let Some(tuning) = &node.receiver {
                check_receiver(&node.name, tuning)?;
            }

            if self.transport == TransportKind::Multicast {
                for addr in std::iter::once(node.address).chain(node.address2) {
                    if !addr.is_multicast() {
                        return err(format!(
                            "node '{}': {addr} is not a multicast group",
                            node.name
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn local_node(&self) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == self.local_node)
    }

    /// Node id stamped on outgoing packets
    pub fn local_node_id(&self) -> i64 {
        self.node_id
            .or_else(|| self.local_node().map(|n| n.id))
            .unwrap_or_default()
    }

    /// Remote nodes this process receives from
    pub fn remote_nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes
            .iter()
            .filter(move |n| n.name != self.local_node)
    }

    /// Sensors selected by the filter, in configuration order
    pub fn published_sensors(&self) -> impl Iterator<Item = &SensorConfig> {
        self.sensors
            .iter()
            .filter(move |s| self.filter.matches(&s.props))
    }
}

fn check_receiver(section: &str, tuning: &ReceiverConfig) -> Result<()> {
    if tuning.buffer_size == 0 {
        return Err(UNetError::Configuration(format!(
            "{section}: buffer_size must be positive"
        )));
    }
    if tuning.max_receive_at_time == 0 {
        return Err(UNetError::Configuration(format!(
            "{section}: max_receive_at_time must be positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        name = "unet1"
        local_node = "node1"
        proc_id = 7

        [receiver]
        recv_timeout = "2s"
        update_pause = "50ms"

        [sender]
        send_pause = "20ms"

        [heartbeat]
        id = 900
        max = 5

        [filter]
        field = "unet"

        [[nodes]]
        name = "node1"
        id = 3001
        address = "127.255.255.255"

        [[nodes]]
        name = "node2"
        id = 3002
        address = "192.168.1.255"
        address2 = "192.168.2.255"
        respond_id = 10
        [nodes.receiver]
        recv_timeout = "1s"

        [[sensors]]
        id = 1
        kind = "analog"
        props = { unet = "1" }

        [[sensors]]
        id = 2
        kind = "digital"
        props = { unet = "" }

        [[sensors]]
        id = 3
        kind = "digital"
    "#;

    #[test]
    fn test_load_from_str() {
        let config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.name, "unet1");
        assert_eq!(config.local_node_id(), 3001);
        assert_eq!(config.receiver.recv_timeout, Duration::from_secs(2));
        assert_eq!(config.receiver.update_pause, Duration::from_millis(50));
        // untouched keys keep their defaults
        assert_eq!(config.receiver.max_difference, 1000);
        assert_eq!(config.sender.pack_send_pause, Duration::from_millis(5));
        assert_eq!(config.heartbeat.time, Duration::from_secs(3));

        let node2 = &config.nodes[1];
        assert_eq!(node2.endpoint().unwrap().port(), 3002);
        assert_eq!(node2.endpoint2().unwrap().unwrap().port(), 3002);
        assert_eq!(
            node2.receiver_config(&config.receiver).recv_timeout,
            Duration::from_secs(1)
        );
        assert_eq!(config.remote_nodes().count(), 1);
    }

    #[test]
    fn test_filter() {
        let config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        let ids: Vec<_> = config.published_sensors().map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);

        let mut props = BTreeMap::new();
        props.insert("unet".to_string(), "2".to_string());
        let filter = FilterConfig {
            field: "unet".into(),
            value: "2".into(),
        };
        assert!(filter.matches(&props));
        assert!(!FilterConfig {
            field: "unet".into(),
            value: "1".into()
        }
        .matches(&props));
        assert!(FilterConfig::default().matches(&BTreeMap::new()));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ExchangeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.proc_id, 7);
        assert_eq!(config.nodes.len(), 2);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        config.local_node = "missing".into();
        assert!(config.validate().is_err());
        config.no_sender = true;
        assert!(config.validate().is_ok());

        let mut config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        config.nodes[1].id = 3001;
        assert!(config.validate().is_err());

        let mut config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        config.transport = TransportKind::Multicast;
        assert!(matches!(
            config.validate(),
            Err(UNetError::Configuration(_))
        ));

        let mut config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        config.receiver.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        config.heartbeat.max = 0;
        assert!(config.validate().is_err());

        let mut config = ExchangeConfig::from_toml_str(SAMPLE).unwrap();
        config.nodes[0].id = 70000;
        assert!(config.validate().is_err());
        config.nodes[0].port = Some(3001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_has_no_nodes() {
        let err = ExchangeConfig::load_from("/nonexistent/unet.toml").unwrap_err();
        assert!(err.to_string().contains("local node"));
    }
}
