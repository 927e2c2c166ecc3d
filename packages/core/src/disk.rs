//! Device registry backed by `lsblk` and sysfs.
//!
//! Every scan builds a full snapshot of the nodes the daemon cares about:
//! one host node per configured card slot (carrying the cover switch), the
//! card and USB disks found by `lsblk`, their partitions, and the USB cable
//! node. [`DeviceRegistry::poll_changes`] rescans and reports the
//! difference to the previous snapshot as [`Hotplug`] notifications.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{CardConfig, Config};
use crate::error::{Error, IoResultExt, Result};
use crate::event::Hotplug;
use crate::registry::{
    Capability, DeviceId, DeviceRecord, DeviceRegistry, MemoryRegistry, Prop, PropValue,
};

/// Id of the USB cable node.
pub const CABLE_ID: &str = "usb:cable";

/// Properties whose changes are reported for watched nodes.
const WATCHED_PROPS: [Prop; 3] = [Prop::ButtonState, Prop::UsbMode, Prop::IsMounted];

pub type Snapshot = BTreeMap<DeviceId, DeviceRecord>;

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Clone, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

impl LsblkDevice {
    fn dev_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    fn is_disk(&self) -> bool {
        self.device_type.as_deref() == Some("disk")
    }

    fn product(&self) -> Option<String> {
        [&self.model, &self.vendor]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Runs `lsblk --json` and parses the device tree.
fn list_block_devices() -> Result<Vec<LsblkDevice>> {
    let output = Command::new("lsblk")
        .args([
            "--json",
            "--output",
            "NAME,PATH,PKNAME,LABEL,FSTYPE,MOUNTPOINT,TYPE,TRAN,MODEL,VENDOR",
        ])
        .output()
        .command_context("lsblk")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(Error::CommandExit {
            command: "lsblk".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

fn parse_lsblk(json: &str) -> Result<Vec<LsblkDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;
    Ok(parsed.blockdevices)
}

/// Reads a cover switch attribute. `open` or `0` means open; an unreadable
/// switch counts as closed.
fn cover_closed(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(text) => !matches!(text.trim(), "open" | "0"),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cover switch unreadable");
            true
        }
    }
}

fn host_id(card: &CardConfig) -> DeviceId {
    DeviceId::new(format!("host:{}", card.slot.name()))
}

/// Trailing number of a partition's kernel name.
fn partition_number(name: &str) -> Option<i64> {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    name[stem.len()..].parse().ok()
}

/// What a snapshot is built from, besides `lsblk`.
#[derive(Debug, Clone)]
pub struct ScanSources {
    pub cards: Vec<CardConfig>,
    pub usb_mode_file: Option<PathBuf>,
}

impl ScanSources {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cards: config.cards.clone(),
            usb_mode_file: config.daemon.usb_mode_file.clone(),
        }
    }
}

fn build_snapshot(devices: &[LsblkDevice], sources: &ScanSources) -> Snapshot {
    let mut snapshot = Snapshot::new();

    for card in &sources.cards {
        let closed = card.cover_switch.as_deref().is_none_or(cover_closed);
        snapshot.insert(
            host_id(card),
            DeviceRecord::new()
                .with_capability(Capability::CardHost)
                .with_prop(Prop::SlotName, format!("slot:{}", card.slot.name()))
                .with_prop(Prop::ButtonState, closed),
        );
    }

    if let Some(mode_file) = &sources.usb_mode_file {
        match fs::read_to_string(mode_file) {
            Ok(mode) => {
                snapshot.insert(
                    DeviceId::new(CABLE_ID),
                    DeviceRecord::new()
                        .with_capability(Capability::UsbCable)
                        .with_prop(Prop::UsbMode, mode.trim()),
                );
            }
            Err(e) => debug!(path = %mode_file.display(), error = %e, "no USB mode attribute"),
        }
    }

    for disk in devices.iter().filter(|d| d.is_disk()) {
        let path = disk.dev_path();
        let card = sources
            .cards
            .iter()
            .find(|c| c.device.as_deref() == Some(path.as_str()));
        let usb = disk.tran.as_deref() == Some("usb");
        if card.is_none() && !usb {
            continue;
        }

        let id = DeviceId::new(path.clone());
        let mut record = DeviceRecord::new()
            .with_capability(Capability::Storage)
            .with_prop(Prop::BlockDevice, path.clone());
        if let Some(card) = card {
            record = record.with_parent(&host_id(card));
        }
        if let Some(tran) = &disk.tran {
            record = record.with_prop(Prop::StorageBus, tran.clone());
        }
        if let Some(product) = disk.product() {
            record = record.with_prop(Prop::Product, product);
        }
        snapshot.insert(id.clone(), record);

        let partitions: Vec<&LsblkDevice> = disk
            .children
            .iter()
            .flatten()
            .filter(|c| c.device_type.as_deref() == Some("part"))
            .collect();
        if partitions.is_empty() {
            // A filesystem straight on the disk.
            if disk.fstype.is_some() {
                snapshot.insert(
                    DeviceId::new(format!("{path}:volume")),
                    volume_record(disk, &id, &path, false),
                );
            }
            continue;
        }
        for part in partitions {
            let part_path = part.dev_path();
            let mut record = volume_record(part, &id, &part_path, true);
            if let Some(number) = partition_number(&part.name) {
                record = record.with_prop(Prop::PartitionNumber, number);
            }
            snapshot.insert(DeviceId::new(part_path), record);
        }
    }

    snapshot
}

fn volume_record(dev: &LsblkDevice, storage: &DeviceId, path: &str, partition: bool) -> DeviceRecord {
    let mut record = DeviceRecord::new()
        .with_capability(Capability::Volume)
        .with_parent(storage)
        .with_prop(Prop::BlockDevice, path)
        .with_prop(Prop::StorageDevice, storage.as_str())
        .with_prop(Prop::IsPartition, partition)
        .with_prop(Prop::IsMounted, dev.mountpoint.is_some());
    if let Some(fstype) = &dev.fstype {
        record = record.with_prop(Prop::FsType, fstype.clone());
    }
    if let Some(label) = &dev.label {
        record = record.with_prop(Prop::Label, label.clone());
    }
    if let Some(mp) = &dev.mountpoint {
        record = record.with_prop(Prop::MountPoint, mp.clone());
    }
    record
}

/// Number of parent links above `id`.
fn depth(snapshot: &Snapshot, id: &DeviceId) -> usize {
    let mut depth = 0;
    let mut current = id.clone();
    while let Some(PropValue::Str(parent)) = snapshot.get(&current).and_then(|r| r.prop(Prop::Parent)) {
        depth += 1;
        // Snapshots are trees; the bound guards against a malformed one.
        if depth > snapshot.len() {
            break;
        }
        current = DeviceId::new(parent.clone());
    }
    depth
}

/// Changes between two snapshots: removals children-first, additions
/// parents-first, then property changes of watched nodes.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot, watched: &BTreeSet<DeviceId>) -> Vec<Hotplug> {
    let mut removed: Vec<&DeviceId> = old.keys().filter(|id| !new.contains_key(*id)).collect();
    removed.sort_by_key(|id| std::cmp::Reverse(depth(old, id)));

    let mut added: Vec<&DeviceId> = new.keys().filter(|id| !old.contains_key(*id)).collect();
    added.sort_by_key(|id| depth(new, id));

    let mut changes: Vec<Hotplug> = removed
        .into_iter()
        .map(|id| Hotplug::DeviceRemoved(id.clone()))
        .chain(added.into_iter().map(|id| Hotplug::DeviceAdded(id.clone())))
        .collect();

    for (id, before) in old {
        let Some(after) = new.get(id) else {
            continue;
        };
        if !watched.contains(id) {
            continue;
        }
        for prop in WATCHED_PROPS {
            if before.prop(prop) != after.prop(prop) {
                changes.push(Hotplug::PropertyModified {
                    id: id.clone(),
                    prop,
                });
            }
        }
    }
    changes
}

/// Registry of the running system.
pub struct SysfsRegistry {
    sources: ScanSources,
    snapshot: Snapshot,
    view: MemoryRegistry,
    watched: BTreeSet<DeviceId>,
}

impl SysfsRegistry {
    /// Scans once; fails if `lsblk` cannot be run or parsed.
    pub fn scan(config: &Config) -> Result<Self> {
        let sources = ScanSources::from_config(config);
        let snapshot = build_snapshot(&list_block_devices()?, &sources);
        Ok(Self::from_snapshot(sources, snapshot))
    }

    fn from_snapshot(sources: ScanSources, snapshot: Snapshot) -> Self {
        Self {
            sources,
            view: MemoryRegistry::from(snapshot.clone()),
            snapshot,
            watched: BTreeSet::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn replace(&mut self, snapshot: Snapshot) -> Vec<Hotplug> {
        let changes = diff_snapshots(&self.snapshot, &snapshot, &self.watched);
        self.watched.retain(|id| snapshot.contains_key(id));
        self.view = MemoryRegistry::from(snapshot.clone());
        self.snapshot = snapshot;
        changes
    }
}

impl DeviceRegistry for SysfsRegistry {
    fn string_property(&self, id: &DeviceId, prop: Prop) -> Option<String> {
        self.view.string_property(id, prop)
    }

    fn bool_property(&self, id: &DeviceId, prop: Prop) -> Option<bool> {
        self.view.bool_property(id, prop)
    }

    fn int_property(&self, id: &DeviceId, prop: Prop) -> Option<i64> {
        self.view.int_property(id, prop)
    }

    fn children_of(&self, parent: &DeviceId) -> Vec<DeviceId> {
        self.view.children_of(parent)
    }

    fn has_capability(&self, id: &DeviceId, capability: Capability) -> bool {
        self.view.has_capability(id, capability)
    }

    fn find_by_capability(&self, capability: Capability) -> Vec<DeviceId> {
        self.view.find_by_capability(capability)
    }

    fn watch(&mut self, id: &DeviceId) {
        self.watched.insert(id.clone());
    }

    fn poll_changes(&mut self) -> Vec<Hotplug> {
        match list_block_devices() {
            Ok(devices) => {
                let snapshot = build_snapshot(&devices, &self.sources);
                self.replace(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "device scan failed");
                Vec::new()
            }
        }
    }
}
