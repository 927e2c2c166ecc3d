//! Volumes and the per-storage volume list.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::mount::Helpers;
use crate::registry::{DeviceId, DeviceRegistry, Prop};

/// A mountable filesystem under a card or USB storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: DeviceId,
    /// Device node, e.g. `/dev/mmcblk0p1`.
    pub device: String,
    /// Where the daemon mounts (or mounted) the volume.
    pub mount_point: Option<PathBuf>,
    /// Partition number, 1 for unpartitioned media.
    pub number: u32,
    pub corrupt: bool,
    pub fstype: Option<String>,
    pub label: Option<String>,
}

impl Volume {
    /// Reads a volume node. Returns `None` when it has no device node.
    pub fn from_registry(registry: &dyn DeviceRegistry, id: &DeviceId) -> Option<Self> {
        let device = registry.string_property(id, Prop::BlockDevice)?;
        let number = if registry.bool_property(id, Prop::IsPartition) == Some(true) {
            registry
                .int_property(id, Prop::PartitionNumber)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(1)
        } else {
            1
        };
        let mount_point = registry
            .string_property(id, Prop::MountPoint)
            .filter(|mp| !mp.is_empty())
            .map(PathBuf::from);

        Some(Self {
            id: id.clone(),
            device,
            mount_point,
            number,
            corrupt: false,
            fstype: registry.string_property(id, Prop::FsType),
            label: registry.string_property(id, Prop::Label),
        })
    }

    /// Whether the registry currently reports the volume mounted.
    pub fn is_mounted(&self, registry: &dyn DeviceRegistry) -> bool {
        registry.bool_property(&self.id, Prop::IsMounted) == Some(true)
    }
}

/// Volumes of one storage.
///
/// Removed volumes leave an empty slot behind; new ones reuse the first
/// empty slot. Iteration skips empty slots.
#[derive(Debug, Clone, Default)]
pub struct VolumeList {
    slots: Vec<Option<Volume>>,
}

impl VolumeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the volume node `id`, unless it is already listed or has no
    /// device node.
    pub fn add(&mut self, registry: &dyn DeviceRegistry, id: &DeviceId) -> Option<&mut Volume> {
        if let Some(index) = self.position(id) {
            debug!(volume = %id, "volume already listed");
            return self.slots[index].as_mut();
        }
        let Some(volume) = Volume::from_registry(registry, id) else {
            info!(volume = %id, "volume has no device node, ignoring");
            return None;
        };
        Some(self.insert(volume))
    }

    pub fn insert(&mut self, volume: Volume) -> &mut Volume {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index].insert(volume)
    }

    /// Tombstones the volume and returns it.
    pub fn remove(&mut self, id: &DeviceId) -> Option<Volume> {
        let index = self.position(id)?;
        self.slots[index].take()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Volume> {
        self.iter().find(|v| &v.id == id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Volume> {
        self.iter_mut().find(|v| &v.id == id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.position(id).is_some()
    }

    pub fn by_number(&self, number: u32) -> Option<&Volume> {
        self.iter().find(|v| v.number == number)
    }

    pub fn by_number_mut(&mut self, number: u32) -> Option<&mut Volume> {
        self.iter_mut().find(|v| v.number == number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Volume> {
        self.slots.iter_mut().flatten()
    }

    /// Number of live volumes.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots, empty ones included.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn position(&self, id: &DeviceId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|v| &v.id == id))
    }

    /// Unmounts every volume; true only if all of them ended up unmounted.
    /// A successful unmount forgets the volume's mount point.
    ///
    /// The registry's mounted flag can lag behind, so a volume it reports
    /// unmounted is still unmounted when a mount point is known, and counts
    /// as done either way.
    pub fn unmount_all(
        &mut self,
        registry: &dyn DeviceRegistry,
        helpers: &Helpers,
        lazy: bool,
    ) -> bool {
        let mut all = true;
        for volume in self.iter_mut() {
            let reported = volume.is_mounted(registry);
            let Some(mp) = &volume.mount_point else {
                if reported {
                    debug!(volume = %volume.id, "mounted without a known mount point");
                }
                continue;
            };
            if !reported {
                debug!(volume = %volume.id, "not reported mounted, unmounting anyway");
            }
            if helpers.unmount(mp, lazy) {
                volume.mount_point = None;
            } else if reported {
                all = false;
            }
        }
        all
    }
}

/// Mount point for a USB host volume: `<root>/<device basename>`.
pub fn usb_mount_point(root: &Path, device: &str) -> PathBuf {
    let name = Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.replace('/', "_"));
    root.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::HelperPaths;
    use crate::registry::{Capability, DeviceRecord, MemoryRegistry};
    use crate::testing::FakeRunner;

    fn volume_record(device: &str, number: i64) -> DeviceRecord {
        DeviceRecord::new()
            .with_capability(Capability::Volume)
            .with_prop(Prop::BlockDevice, device)
            .with_prop(Prop::IsPartition, true)
            .with_prop(Prop::PartitionNumber, number)
    }

    #[test]
    fn test_from_registry() {
        let registry = MemoryRegistry::new();
        registry.insert("p2", volume_record("/dev/mmcblk0p2", 2));
        registry.insert(
            "whole",
            DeviceRecord::new()
                .with_prop(Prop::BlockDevice, "/dev/sda")
                .with_prop(Prop::MountPoint, ""),
        );
        registry.insert("bare", DeviceRecord::new());

        let p2 = Volume::from_registry(&registry, &"p2".into()).unwrap();
        assert_eq!(p2.number, 2);
        assert_eq!(p2.device, "/dev/mmcblk0p2");

        let whole = Volume::from_registry(&registry, &"whole".into()).unwrap();
        assert_eq!(whole.number, 1);
        assert_eq!(whole.mount_point, None);

        assert!(Volume::from_registry(&registry, &"bare".into()).is_none());
    }

    #[test]
    fn test_tombstones_are_reused() {
        let registry = MemoryRegistry::new();
        registry.insert("a", volume_record("/dev/sda1", 1));
        registry.insert("b", volume_record("/dev/sda2", 2));
        registry.insert("c", volume_record("/dev/sda3", 3));

        let mut list = VolumeList::new();
        list.add(&registry, &"a".into());
        list.add(&registry, &"b".into());
        list.add(&registry, &"a".into());
        assert_eq!(list.len(), 2);

        assert!(list.remove(&"a".into()).is_some());
        assert_eq!(list.len(), 1);
        assert_eq!(list.capacity(), 2);
        assert!(!list.contains(&"a".into()));

        list.add(&registry, &"c".into());
        assert_eq!(list.capacity(), 2);
        let ids: Vec<_> = list.iter().map(|v| v.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(list.by_number(3).map(|v| v.device.as_str()), Some("/dev/sda3"));
    }

    #[test]
    fn test_unmount_all_empty_list() {
        let registry = MemoryRegistry::new();
        let paths = HelperPaths::default();
        let runner = FakeRunner::new();
        let helpers = Helpers::new(&paths, &runner);

        let mut list = VolumeList::new();
        assert!(list.unmount_all(&registry, &helpers, true));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_unmount_all_is_idempotent() {
        let registry = MemoryRegistry::new();
        registry.insert(
            "a",
            volume_record("/dev/sda1", 1).with_prop(Prop::IsMounted, true),
        );
        let paths = HelperPaths::default();
        let runner = FakeRunner::new();
        let helpers = Helpers::new(&paths, &runner);

        let mut list = VolumeList::new();
        list.add(&registry, &"a".into()).unwrap().mount_point = Some("/media/usb/sda1".into());

        assert!(list.unmount_all(&registry, &helpers, false));
        assert!(list.by_number(1).unwrap().mount_point.is_none());
        registry.set(&"a".into(), Prop::IsMounted, false);
        assert!(list.unmount_all(&registry, &helpers, false));
        // The forgotten mount point is not unmounted again.
        assert_eq!(runner.count(&paths.unmount), 1);
    }

    #[test]
    fn test_unmount_all_reports_busy_volume() {
        let registry = MemoryRegistry::new();
        registry.insert(
            "a",
            volume_record("/dev/sda1", 1).with_prop(Prop::IsMounted, true),
        );
        registry.insert("b", volume_record("/dev/sda2", 2));
        let paths = HelperPaths::default();
        let runner = FakeRunner::new();
        runner.set_exit(&paths.unmount, 1);
        let helpers = Helpers::new(&paths, &runner);

        let mut list = VolumeList::new();
        list.add(&registry, &"a".into()).unwrap().mount_point = Some("/media/a".into());
        list.add(&registry, &"b".into()).unwrap().mount_point = Some("/media/b".into());

        // "b" is not reported mounted: its failing unmount does not count.
        assert!(!list.unmount_all(&registry, &helpers, true));
        registry.set(&"a".into(), Prop::IsMounted, false);
        assert!(list.unmount_all(&registry, &helpers, true));
        assert_eq!(runner.count(&paths.unmount), 4);
        assert!(list.iter().all(|v| v.mount_point.is_some()));
    }

    #[test]
    fn test_usb_mount_point() {
        assert_eq!(
            usb_mount_point(Path::new("/media/usb"), "/dev/sdb1"),
            PathBuf::from("/media/usb/sdb1")
        );
    }
}
