//! Shared sensor store seam
//!
//! The exchange never owns sensor values. Everything it learns from the
//! network goes through [`SharedStore::set_value`], everything it publishes
//! comes from [`SharedStore::get_value`] or from subscription events.
//! [`MemoryStore`] is a complete in-process implementation used by the CLI and
//! by tests.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::errors::{Result, UNetError};

/// Sensor identifier as carried on the wire
pub type SensorId = i64;

/// Subscription command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Deliver the current value and every later change
    Notify,
    /// Stop delivering changes
    DontNotify,
}

/// A value change delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorEvent {
    pub id: SensorId,
    pub value: i64,
}

/// Channel end subscribers receive events on
pub type SensorSink = mpsc::UnboundedSender<SensorEvent>;

/// Shared-state store consumed by receivers, transmitters and the exchange
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Current value of a sensor
    fn get_value(&self, id: SensorId) -> Result<i64>;

    /// Write a sensor value
    fn set_value(&self, id: SensorId, value: i64) -> Result<()>;

    /// Start or stop change notifications for `id` on `sink`
    fn subscribe(&self, id: SensorId, mode: SubscribeMode, sink: &SensorSink) -> Result<()>;

    /// Wait until the store accepts traffic, `false` on timeout
    async fn wait_ready(&self, timeout: Duration) -> bool;
}

#[derive(Default)]
struct Slot {
    value: i64,
    subscribers: Vec<SensorSink>,
}

/// In-memory [`SharedStore`]
///
/// By default any id may be written and is created on first write. A store
/// built with [`MemoryStore::with_sensors`] only knows the listed ids and
/// rejects the rest with [`UNetError::UnknownSensor`].
pub struct MemoryStore {
    slots: RwLock<HashMap<SensorId, Slot>>,
    strict: bool,
    failing: RwLock<HashSet<SensorId>>,
    ready: watch::Sender<bool>,
}

impl MemoryStore {
    /// Lenient store, ready immediately
    pub fn new() -> Self {
        Self::build(HashMap::new(), false, true)
    }

    /// Strict store knowing only `ids` (initialised to 0), ready immediately
    pub fn with_sensors(ids: impl IntoIterator<Item = SensorId>) -> Self {
        let slots = ids.into_iter().map(|id| (id, Slot::default())).collect();
        Self::build(slots, true, true)
    }

    /// Lenient store that reports not ready until [`MemoryStore::set_ready`]
    pub fn not_ready() -> Self {
        Self::build(HashMap::new(), false, false)
    }

    fn build(slots: HashMap<SensorId, Slot>, strict: bool, ready: bool) -> Self {
        let (ready, _) = watch::channel(ready);
        Self {
            slots: RwLock::new(slots),
            strict,
            failing: RwLock::new(HashSet::new()),
            ready,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Make every write to `id` fail, for exercising error isolation
    pub fn fail_writes(&self, id: SensorId, fail: bool) {
        let mut failing = self.failing.write();
        if fail {
            failing.insert(id);
        } else {
            failing.remove(&id);
        }
    }

    /// Number of live subscriptions on `id`
    pub fn subscriber_count(&self, id: SensorId) -> usize {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn get_value(&self, id: SensorId) -> Result<i64> {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.value)
            .ok_or(UNetError::UnknownSensor(id))
    }

    fn set_value(&self, id: SensorId, value: i64) -> Result<()> {
        if self.failing.read().contains(&id) {
            return Err(UNetError::Store(format!("write to sensor {id} rejected")));
        }

        let mut slots = self.slots.write();
        if self.strict && !slots.contains_key(&id) {
            return Err(UNetError::UnknownSensor(id));
        }
        let slot = slots.entry(id).or_default();

        if slot.value == value {
            return Ok(());
        }

        slot.value = value;
        slot.subscribers
            .retain(|sink| sink.send(SensorEvent { id, value }).is_ok());
        Ok(())
    }

    fn subscribe(&self, id: SensorId, mode: SubscribeMode, sink: &SensorSink) -> Result<()> {
        let mut slots = self.slots.write();
        if self.strict && !slots.contains_key(&id) {
            return Err(UNetError::UnknownSensor(id));
        }
        let slot = slots.entry(id).or_default();

        slot.subscribers.retain(|s| !s.is_closed() && !s.same_channel(sink));
        if mode == SubscribeMode::Notify {
            // current value goes out first, like a fresh subscription on a real store
            let _ = sink.send(SensorEvent {
                id,
                value: slot.value,
            });
            slot.subscribers.push(sink.clone());
        }
        debug!(sensor = id, ?mode, "subscription updated");
        Ok(())
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let ready = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .is_ok_and(|r| r.is_ok());
        ready
    }
}
