//! Mirrored device status
//!
//! The device reports its state as a JSON object; every `result` object in a
//! response is shallow-merged into the local copy, key by key. Keys this crate
//! does not model are kept in [`DeviceStatus::extra`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Readiness of one filament slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SlotState {
    /// No filament loaded
    Empty,
    /// Filament loaded and ready to feed
    Ready,
    /// Any other state string, kept verbatim
    Other(String),
}

impl From<String> for SlotState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "empty" => SlotState::Empty,
            "ready" => SlotState::Ready,
            _ => SlotState::Other(s),
        }
    }
}

impl From<SlotState> for String {
    fn from(state: SlotState) -> Self {
        match state {
            SlotState::Empty => "empty".to_string(),
            SlotState::Ready => "ready".to_string(),
            SlotState::Other(s) => s,
        }
    }
}

/// Overall device state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceState {
    /// Hub reports no host link
    Disconnected,
    /// Idle
    Ready,
    /// Running a feed, retract or dry
    Busy,
    /// Any other state string, kept verbatim
    Other(String),
}

impl From<String> for DeviceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "disconnected" => DeviceState::Disconnected,
            "ready" => DeviceState::Ready,
            "busy" => DeviceState::Busy,
            _ => DeviceState::Other(s),
        }
    }
}

impl From<DeviceState> for String {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Disconnected => "disconnected".to_string(),
            DeviceState::Ready => "ready".to_string(),
            DeviceState::Busy => "busy".to_string(),
            DeviceState::Other(s) => s,
        }
    }
}

/// Dryer sub-state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DryerStatus {
    /// `stop` or `drying`
    pub status: String,
    /// Degrees Celsius
    pub target_temp: f64,
    /// Seconds
    pub duration: f64,
    /// Seconds
    pub remain_time: f64,
    /// Keys this mirror does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DryerStatus {
    fn default() -> Self {
        Self {
            status: "stop".to_string(),
            target_temp: 0.0,
            duration: 0.0,
            remain_time: 0.0,
            extra: Map::new(),
        }
    }
}

/// One filament slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Position on the hub
    pub index: u8,
    /// Load state
    pub status: SlotState,
    /// RFID tag SKU
    #[serde(default, deserialize_with = "null_as_default")]
    pub sku: String,
    /// Material name from the RFID tag
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    pub material: String,
    /// RGB
    #[serde(default, deserialize_with = "null_as_default")]
    pub color: [u8; 3],
    /// Keys this mirror does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Firmware reports unset RFID fields as `null`
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Slot {
    /// Unloaded slot at `index`
    pub fn empty(index: u8) -> Self {
        Self {
            index,
            status: SlotState::Empty,
            sku: String::new(),
            material: String::new(),
            color: [0, 0, 0],
            extra: Map::new(),
        }
    }

    /// Filament loaded and ready to feed
    pub fn is_ready(&self) -> bool {
        self.status == SlotState::Ready
    }
}

/// Local mirror of the device status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Overall state
    pub status: DeviceState,
    /// Dryer sub-state
    pub dryer: DryerStatus,
    /// Chamber temperature, degrees Celsius
    pub temp: f64,
    /// Nonzero while RFID reading is on
    pub enable_rfid: i64,
    /// Dryer fan speed
    pub fan_speed: f64,
    /// Assist counter, steady once filament reaches the toolhead
    pub feed_assist_count: i64,
    /// Seconds of continuous assist
    pub cont_assist_time: f64,
    /// Slots in hub order
    pub slots: Vec<Slot>,
    /// Keys this mirror does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::with_slots(4)
    }
}

impl DeviceStatus {
    /// Disconnected status with `count` empty slots
    pub fn with_slots(count: u8) -> Self {
        Self {
            status: DeviceState::Disconnected,
            dryer: DryerStatus::default(),
            temp: 0.0,
            enable_rfid: 1,
            fan_speed: 7000.0,
            feed_assist_count: 0,
            cont_assist_time: 0.0,
            slots: (0..count).map(Slot::empty).collect(),
            extra: Map::new(),
        }
    }

    /// Shallow-merge a `result` object; a key that fails to parse leaves the
    /// previous value in place
    pub fn merge(&mut self, result: &Map<String, Value>) {
        for (key, value) in result {
            if let Err(e) = self.merge_key(key, value) {
                warn!(key = %key, "ignoring malformed status field: {e}");
            }
        }
    }

    fn merge_key(&mut self, key: &str, value: &Value) -> Result<(), serde_json::Error> {
        match key {
            "status" => self.status = DeviceState::deserialize(value)?,
            "dryer" => self.dryer = DryerStatus::deserialize(value)?,
            "temp" => self.temp = f64::deserialize(value)?,
            "enable_rfid" => self.enable_rfid = i64::deserialize(value)?,
            "fan_speed" => self.fan_speed = f64::deserialize(value)?,
            "feed_assist_count" => self.feed_assist_count = i64::deserialize(value)?,
            "cont_assist_time" => self.cont_assist_time = f64::deserialize(value)?,
            "slots" => self.merge_slots(value)?,
            _ => {
                self.extra.insert(key.to_string(), value.clone());
            }
        }
        Ok(())
    }

    /// Replace the slot table entry by entry; an entry that does not parse
    /// still updates its readiness when it carries a `status` string
    fn merge_slots(&mut self, value: &Value) -> Result<(), serde_json::Error> {
        let entries = Vec::<Value>::deserialize(value)?;
        let mut slots = Vec::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            let index = u8::try_from(position).unwrap_or(u8::MAX);
            let slot = match Slot::deserialize(entry) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(slot = index, "malformed slot entry: {e}");
                    let mut slot = self
                        .slots
                        .get(position)
                        .cloned()
                        .unwrap_or_else(|| Slot::empty(index));
                    slot.index = index;
                    if let Some(state) = entry.get("status").and_then(Value::as_str) {
                        slot.status = SlotState::from(state.to_string());
                    }
                    slot
                }
            };
            slots.push(slot);
        }
        self.slots = slots;
        Ok(())
    }

    /// Slot at `index`, if the device reported that many
    pub fn slot(&self, index: u8) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    /// Whether slot `index` exists and reports `ready`
    pub fn is_slot_ready(&self, index: u8) -> bool {
        self.slot(index).is_some_and(Slot::is_ready)
    }

    /// Device reports `ready`
    pub fn is_ready(&self) -> bool {
        self.status == DeviceState::Ready
    }
}
