//! Device registry abstraction.
//!
//! The registry is the single source of truth for what devices exist, how
//! they nest and what their properties are. State machines query it right
//! before acting and never keep the answers across events.
//!
//! Lookups return `Option`; `None` means "unknown" and callers treat it as
//! false or absent.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::event::Hotplug;

/// Opaque identifier of a device node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Property keys understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Prop {
    BlockDevice,
    StorageDevice,
    Parent,
    IsMounted,
    MountPoint,
    IsPartition,
    PartitionNumber,
    FsType,
    Label,
    Product,
    StorageBus,
    SlotName,
    ButtonState,
    UsbMode,
}

impl Prop {
    /// Dotted key name, as shown in diagnostics and `slotd scan`.
    pub fn key(&self) -> &'static str {
        match self {
            Prop::BlockDevice => "block.device",
            Prop::StorageDevice => "block.storage_device",
            Prop::Parent => "info.parent",
            Prop::IsMounted => "volume.is_mounted",
            Prop::MountPoint => "volume.mount_point",
            Prop::IsPartition => "volume.is_partition",
            Prop::PartitionNumber => "volume.partition.number",
            Prop::FsType => "volume.fstype",
            Prop::Label => "volume.label",
            Prop::Product => "info.product",
            Prop::StorageBus => "storage.bus",
            Prop::SlotName => "mmc_host.slot_name",
            Prop::ButtonState => "button.state.value",
            Prop::UsbMode => "usb_device.mode",
        }
    }
}

/// What a device node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Capability {
    /// A card slot controller, carrying the cover switch.
    CardHost,
    /// A whole block device.
    Storage,
    /// A mountable filesystem.
    Volume,
    /// The USB controller reporting cable mode.
    UsbCable,
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropValue {
    Str(String),
    Bool(bool),
    Int(i64),
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::Str(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::Str(s)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Bool(b)
    }
}

impl From<i64> for PropValue {
    fn from(n: i64) -> Self {
        PropValue::Int(n)
    }
}

/// Read access to the device tree.
pub trait DeviceRegistry {
    fn string_property(&self, id: &DeviceId, prop: Prop) -> Option<String>;

    fn bool_property(&self, id: &DeviceId, prop: Prop) -> Option<bool>;

    fn int_property(&self, id: &DeviceId, prop: Prop) -> Option<i64>;

    /// Direct children of `parent`, in a stable order.
    fn children_of(&self, parent: &DeviceId) -> Vec<DeviceId>;

    fn has_capability(&self, id: &DeviceId, capability: Capability) -> bool;

    fn find_by_capability(&self, capability: Capability) -> Vec<DeviceId>;

    /// Asks for property change notifications on `id`.
    fn watch(&mut self, _id: &DeviceId) {}

    /// Collects changes since the last call.
    fn poll_changes(&mut self) -> Vec<Hotplug> {
        Vec::new()
    }

    /// Parent node, from [`Prop::Parent`].
    fn parent_of(&self, id: &DeviceId) -> Option<DeviceId> {
        self.string_property(id, Prop::Parent).map(DeviceId::new)
    }
}

/// One device node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub capabilities: Vec<Capability>,
    pub properties: BTreeMap<Prop, PropValue>,
}

impl DeviceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_prop(mut self, prop: Prop, value: impl Into<PropValue>) -> Self {
        self.properties.insert(prop, value.into());
        self
    }

    pub fn with_parent(self, parent: &DeviceId) -> Self {
        self.with_prop(Prop::Parent, parent.as_str())
    }

    pub fn prop(&self, prop: Prop) -> Option<&PropValue> {
        self.properties.get(&prop)
    }
}

/// In-memory registry.
///
/// Clones share the same device table, so a handle kept outside the
/// coordinator sees and makes the same changes.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    devices: Rc<RefCell<BTreeMap<DeviceId, DeviceRecord>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<DeviceId>, record: DeviceRecord) {
        self.devices.borrow_mut().insert(id.into(), record);
    }

    pub fn remove(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.borrow_mut().remove(id)
    }

    pub fn set(&self, id: &DeviceId, prop: Prop, value: impl Into<PropValue>) {
        if let Some(record) = self.devices.borrow_mut().get_mut(id) {
            record.properties.insert(prop, value.into());
        }
    }

    pub fn unset(&self, id: &DeviceId, prop: Prop) {
        if let Some(record) = self.devices.borrow_mut().get_mut(id) {
            record.properties.remove(&prop);
        }
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.borrow().contains_key(id)
    }

    pub fn record(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.borrow().get(id).cloned()
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> BTreeMap<DeviceId, DeviceRecord> {
        self.devices.borrow().clone()
    }

    fn lookup<T>(
        &self,
        id: &DeviceId,
        prop: Prop,
        f: impl FnOnce(&PropValue) -> Option<T>,
    ) -> Option<T> {
        self.devices
            .borrow()
            .get(id)
            .and_then(|r| r.prop(prop))
            .and_then(f)
    }
}

impl From<BTreeMap<DeviceId, DeviceRecord>> for MemoryRegistry {
    fn from(devices: BTreeMap<DeviceId, DeviceRecord>) -> Self {
        Self {
            devices: Rc::new(RefCell::new(devices)),
        }
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn string_property(&self, id: &DeviceId, prop: Prop) -> Option<String> {
        self.lookup(id, prop, |v| match v {
            PropValue::Str(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn bool_property(&self, id: &DeviceId, prop: Prop) -> Option<bool> {
        self.lookup(id, prop, |v| match v {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    fn int_property(&self, id: &DeviceId, prop: Prop) -> Option<i64> {
        self.lookup(id, prop, |v| match v {
            PropValue::Int(n) => Some(*n),
            _ => None,
        })
    }

    fn children_of(&self, parent: &DeviceId) -> Vec<DeviceId> {
        self.devices
            .borrow()
            .iter()
            .filter(|(_, r)| {
                matches!(r.prop(Prop::Parent), Some(PropValue::Str(p)) if p == parent.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn has_capability(&self, id: &DeviceId, capability: Capability) -> bool {
        self.devices
            .borrow()
            .get(id)
            .is_some_and(|r| r.capabilities.contains(&capability))
    }

    fn find_by_capability(&self, capability: Capability) -> Vec<DeviceId> {
        self.devices
            .borrow()
            .iter()
            .filter(|(_, r)| r.capabilities.contains(&capability))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
