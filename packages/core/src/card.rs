//! Memory card state machine.
//!
//! One [`Card`] per slot. A card sits in one of three states and reacts to
//! [`CardEvent`]s by mounting, unmounting, sharing over USB or talking to
//! the user. Events a state does not handle are logged and dropped; request
//! events are additionally answered with
//! [`RequestError::ImproperState`].
//!
//! ```text
//!   COVER_OPEN ──Closed──▶ COVER_CLOSED ──Opened, unmount ok──▶ COVER_OPEN
//!        ▲                     │
//!        │               Opened, busy
//!        │                     ▼
//!        └──unmount ok── UNMOUNT_PENDING ──Closed──▶ COVER_CLOSED
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::config::CardConfig;
use crate::context::Env;
use crate::dialog::{DialogId, Notice, Severity};
use crate::error::RequestError;
use crate::event::TimerEvent;
use crate::fat;
use crate::mount::{CheckOutcome, MountOutcome};
use crate::registry::{Capability, DeviceId, DeviceRegistry, Prop};
use crate::slot::Slot;
use crate::status::StatusKey;
use crate::timer::TimerId;
use crate::volume::VolumeList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// Not discovered yet.
    Invalid,
    CoverOpen,
    CoverClosed,
    /// Cover open but volumes still busy; retried on a timer.
    UnmountPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    Closed,
    Opened,
    /// USB mass storage wants the card.
    Plugged,
    /// USB mass storage ended.
    Detached,
    Rename { device: String },
    Format { device: String },
    Repair { device: String },
    Check { device: String },
    UnmountTimeout,
    VolumeAdded(DeviceId),
    VolumeRemoved(DeviceId),
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    EnableSwap,
    DisableSwap { close_apps: bool },
    /// First setup once the desktop is up.
    InitCard,
}

impl CardEvent {
    /// Events that come from a control request and expect an answer.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            CardEvent::Rename { .. }
                | CardEvent::Format { .. }
                | CardEvent::Repair { .. }
                | CardEvent::Check { .. }
                | CardEvent::EnableSwap
                | CardEvent::DisableSwap { .. }
        )
    }

    fn needs_device(&self) -> bool {
        matches!(
            self,
            CardEvent::Rename { .. }
                | CardEvent::Format { .. }
                | CardEvent::Repair { .. }
                | CardEvent::Check { .. }
        )
    }
}

/// One card slot and whatever card is in it.
#[derive(Debug)]
pub struct Card {
    slot: Slot,
    /// Slot controller node; also carries the cover switch.
    host: DeviceId,
    storage: Option<DeviceId>,
    storage_parent: Option<DeviceId>,
    whole_device: Option<String>,
    state: CardState,
    pub(crate) volumes: VolumeList,

    present: bool,
    cover_open: bool,
    corrupted: bool,
    used_over_usb: bool,
    pub(crate) swapping: bool,
    /// Suppresses the availability banner of the mount following a format.
    skip_banner: bool,

    desired_label: String,
    preferred_volume: u32,
    control_partitions: bool,
    mount_point: PathBuf,
    pub(crate) swap_location: Option<PathBuf>,
    label_file: PathBuf,
    display_name: String,

    pub(crate) unmount_timer: Option<TimerId>,
    pub(crate) mount_check_timer: Option<TimerId>,
    pub(crate) dialog: Option<DialogId>,
    pub(crate) swap_dialog: Option<DialogId>,
    pub(crate) swap_response: Option<String>,
}

impl Card {
    pub fn new(host: DeviceId, config: &CardConfig) -> Self {
        Self {
            slot: config.slot,
            host,
            storage: None,
            storage_parent: None,
            whole_device: None,
            state: CardState::Invalid,
            volumes: VolumeList::new(),
            present: false,
            cover_open: false,
            corrupted: false,
            used_over_usb: false,
            swapping: false,
            skip_banner: false,
            desired_label: String::new(),
            preferred_volume: config.preferred_volume.max(1),
            control_partitions: config.control_partitions,
            mount_point: config.mount_point(),
            swap_location: config.swap_location.clone(),
            label_file: config.label_file(),
            display_name: config.slot.keys().default_label.to_string(),
            unmount_timer: None,
            mount_check_timer: None,
            dialog: None,
            swap_dialog: None,
            swap_response: None,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn host(&self) -> &DeviceId {
        &self.host
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn storage(&self) -> Option<&DeviceId> {
        self.storage.as_ref()
    }

    pub fn storage_parent(&self) -> Option<&DeviceId> {
        self.storage_parent.as_ref()
    }

    pub fn whole_device(&self) -> Option<&str> {
        self.whole_device.as_deref()
    }

    pub fn volumes(&self) -> &VolumeList {
        &self.volumes
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_cover_open(&self) -> bool {
        self.cover_open
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn is_used_over_usb(&self) -> bool {
        self.used_over_usb
    }

    pub fn is_swapping(&self) -> bool {
        self.swapping
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn dialog(&self) -> Option<DialogId> {
        self.dialog
    }

    pub fn swap_dialog(&self) -> Option<DialogId> {
        self.swap_dialog
    }

    pub fn unmount_timer(&self) -> Option<TimerId> {
        self.unmount_timer
    }

    /// Sets the label used by the next rename or format.
    pub fn set_desired_label(&mut self, label: &str) {
        self.desired_label = label.to_string();
    }

    /// Reads the slot from the registry and picks the initial state from
    /// the cover switch. An unreadable switch counts as closed.
    pub fn init(&mut self, env: &mut Env) {
        if self.discover_storage(env.registry) {
            self.init_volumes(env);
        }
        let open = env.registry.bool_property(&self.host, Prop::ButtonState) == Some(false);
        self.state = if open {
            CardState::CoverOpen
        } else {
            CardState::CoverClosed
        };
        self.set_cover_open(env, open);
        info!(card = %self.slot, state = ?self.state, whole_device = ?self.whole_device, "card initialised");
    }

    /// Dispatches one event according to the current state.
    pub fn handle(&mut self, event: CardEvent, env: &mut Env) -> Result<(), RequestError> {
        debug!(card = %self.slot, state = ?self.state, ?event, "card event");
        if event.needs_device() && self.whole_device.is_none() {
            warn!(card = %self.slot, ?event, "card device unknown, dropping event");
            return Err(RequestError::BadDeviceName);
        }
        match self.state {
            CardState::Invalid => self.unhandled(&event),
            CardState::CoverOpen => self.in_cover_open(event, env),
            CardState::CoverClosed => self.in_cover_closed(event, env),
            CardState::UnmountPending => self.in_unmount_pending(event, env),
        }
    }

    fn in_cover_open(&mut self, event: CardEvent, env: &mut Env) -> Result<(), RequestError> {
        match event {
            CardEvent::Closed => {
                self.set_cover_open(env, false);
                if env.usb.sharing_allowed() {
                    self.usb_share(env, true);
                } else if self.init_volumes(env) > 0 {
                    self.update_label(env);
                    if self.mount_volumes(env) {
                        env.dialogs.show_banner(&Notice::CardAvailable);
                    }
                }
                self.transition(CardState::CoverClosed, env);
            }
            CardEvent::VolumeRemoved(id) => self.discard_volume(&id, env),
            CardEvent::VolumeAdded(_) => self.skip_banner = false,
            CardEvent::DeviceAdded(_) => self.set_present(env, true),
            CardEvent::DeviceRemoved(_) => self.set_present(env, false),
            // The cover is open, the card must not be used.
            CardEvent::InitCard => self.set_present(env, false),
            other => return self.unhandled(&other),
        }
        Ok(())
    }

    fn in_cover_closed(&mut self, event: CardEvent, env: &mut Env) -> Result<(), RequestError> {
        match event {
            CardEvent::Opened => {
                self.set_cover_open(env, true);
                if self.used_over_usb {
                    self.unshare(env);
                    self.transition(CardState::CoverOpen, env);
                    return Ok(());
                }
                self.swap_off(env, true);
                if self.volumes.unmount_all(env.registry, &env.helpers, true) {
                    self.transition(CardState::CoverOpen, env);
                } else {
                    self.open_in_use_dialog(env);
                    self.arm_unmount_recheck(env);
                    self.transition(CardState::UnmountPending, env);
                }
            }
            CardEvent::Plugged => return self.plug(env),
            CardEvent::Detached => {
                if self.used_over_usb {
                    self.unshare(env);
                    self.init_volumes(env);
                    self.update_label(env);
                    self.mount_volumes(env);
                }
            }
            CardEvent::Rename { device } => return self.rename(&device, env),
            CardEvent::Format { device } => return self.format(&device, env),
            CardEvent::Repair { device } => return self.repair(&device, env),
            CardEvent::Check { device } => return self.check(&device, env),
            CardEvent::VolumeAdded(_) => {
                if !self.used_over_usb && !env.usb.mass_storage {
                    self.update_label(env);
                    if self.mount_volumes(env) && !self.skip_banner {
                        env.dialogs.show_banner(&Notice::CardAvailable);
                    }
                }
                self.skip_banner = false;
            }
            CardEvent::VolumeRemoved(id) => {
                if !self.used_over_usb {
                    self.discard_volume(&id, env);
                }
            }
            CardEvent::DeviceAdded(_) => {
                self.set_present(env, true);
                if env.usb.sharing_allowed() {
                    self.usb_share(env, true);
                }
            }
            CardEvent::DeviceRemoved(_) => {
                self.set_present(env, false);
                if self.used_over_usb {
                    self.unshare(env);
                } else {
                    self.volumes.unmount_all(env.registry, &env.helpers, true);
                }
            }
            CardEvent::EnableSwap => {
                return if self.swap_on(env) {
                    Ok(())
                } else {
                    Err(RequestError::Failure)
                };
            }
            CardEvent::DisableSwap { close_apps } => return self.disable_swap(close_apps, env),
            CardEvent::InitCard => {
                if self.whole_device.is_none() {
                    self.set_present(env, false);
                    return Ok(());
                }
                self.set_present(env, true);
                if env.usb.sharing_allowed() {
                    self.usb_share(env, false);
                } else {
                    self.update_label(env);
                    self.mount_volumes(env);
                }
            }
            other => return self.unhandled(&other),
        }
        Ok(())
    }

    fn in_unmount_pending(&mut self, event: CardEvent, env: &mut Env) -> Result<(), RequestError> {
        match event {
            CardEvent::Closed => {
                self.set_cover_open(env, false);
                self.transition(CardState::CoverClosed, env);
                if env.usb.sharing_allowed() {
                    self.usb_share(env, true);
                } else {
                    self.init_volumes(env);
                    self.mount_volumes(env);
                }
            }
            CardEvent::UnmountTimeout => {
                // Fired timers are already out of the queue.
                self.unmount_timer = None;
                self.swap_off(env, true);
                if self.volumes.unmount_all(env.registry, &env.helpers, true) {
                    self.transition(CardState::CoverOpen, env);
                } else {
                    self.open_in_use_dialog(env);
                    self.arm_unmount_recheck(env);
                }
            }
            CardEvent::VolumeRemoved(id) => {
                self.discard_volume(&id, env);
                if self.volumes.unmount_all(env.registry, &env.helpers, true) {
                    self.transition(CardState::CoverOpen, env);
                }
            }
            other => return self.unhandled(&other),
        }
        Ok(())
    }

    fn unhandled(&self, event: &CardEvent) -> Result<(), RequestError> {
        if event.is_request() {
            warn!(card = %self.slot, state = ?self.state, ?event, "improper state");
            Err(RequestError::ImproperState)
        } else {
            debug!(card = %self.slot, state = ?self.state, ?event, "event ignored in this state");
            Ok(())
        }
    }

    /// Moves to `to`. Leaving UNMOUNT_PENDING drops its retry timer and
    /// dialogs first.
    fn transition(&mut self, to: CardState, env: &mut Env) {
        if self.state == CardState::UnmountPending && to != CardState::UnmountPending {
            env.cancel(&mut self.unmount_timer);
            self.close_dialogs(env);
        }
        if self.state != to {
            info!(card = %self.slot, from = ?self.state, ?to, "card state change");
        }
        self.state = to;
    }

    fn arm_unmount_recheck(&mut self, env: &mut Env) {
        env.cancel(&mut self.unmount_timer);
        let after = env.timing.unmount_recheck();
        self.unmount_timer = Some(env.schedule(after, TimerEvent::UnmountRecheck(self.slot)));
    }

    fn open_in_use_dialog(&mut self, env: &mut Env) {
        if self.dialog.is_none() && self.swap_dialog.is_none() {
            self.dialog = env.dialogs.open_dialog(Severity::Warning, &Notice::CardInUse);
        }
    }

    fn close_dialogs(&mut self, env: &mut Env) {
        if let Some(id) = self.dialog.take() {
            env.dialogs.close_dialog(id);
        }
        self.close_swap_dialog(env);
    }

    pub(crate) fn close_swap_dialog(&mut self, env: &mut Env) {
        if let Some(id) = self.swap_dialog.take() {
            env.dialogs.close_dialog(id);
        }
    }

    /// Forgets a dialog the user closed. Returns true if it was ours.
    pub fn dialog_closed(&mut self, id: DialogId) -> bool {
        if self.dialog == Some(id) {
            self.dialog = None;
            true
        } else if self.swap_dialog == Some(id) {
            self.swap_dialog = None;
            true
        } else {
            false
        }
    }

    /// Records the user's answer to the swap dialog. Returns true if the
    /// dialog was ours.
    pub fn action_invoked(&mut self, id: DialogId, action: &str) -> bool {
        if self.swap_dialog == Some(id) {
            info!(card = %self.slot, action, "swap dialog answered");
            self.swap_response = Some(action.to_string());
            true
        } else {
            false
        }
    }

    /// Readies the card for USB sharing. Fails when it cannot be unmounted.
    fn plug(&mut self, env: &mut Env) -> Result<(), RequestError> {
        if !env.usb.sharing_allowed() || self.used_over_usb {
            return Ok(());
        }
        self.swap_off(env, false);
        if !self.volumes.unmount_all(env.registry, &env.helpers, true) {
            info!(card = %self.slot, "card in use, cannot share it");
            return Err(RequestError::InUse);
        }
        self.usb_share(env, true);
        Ok(())
    }

    pub(crate) fn usb_share(&mut self, env: &mut Env, show: bool) -> bool {
        let Some(device) = self.whole_device.clone() else {
            debug!(card = %self.slot, "whole device unknown, not sharing");
            return false;
        };
        if self.storage.is_none() {
            debug!(card = %self.slot, "storage not ready yet");
            return false;
        }
        if !env.helpers.load_usb_driver(&[&device]) {
            error!(card = %self.slot, device, "failed to share card over USB");
            return false;
        }
        info!(card = %self.slot, device, "card shared over USB");
        if show {
            env.dialogs.show_banner(&Notice::ConnectedViaUsb);
        }
        self.set_used_over_usb(env, true);
        true
    }

    pub(crate) fn unshare(&mut self, env: &mut Env) {
        let Some(device) = self.whole_device.clone() else {
            debug!(card = %self.slot, "whole device unknown, nothing to unshare");
            return;
        };
        if env.helpers.unload_usb_driver(&[&device]) {
            self.set_used_over_usb(env, false);
        } else {
            // Nothing else to try; the card stays marked as shared.
            error!(card = %self.slot, device, "failed to stop sharing card over USB");
        }
    }

    /// Attaches the storage node and reads its device path.
    pub(crate) fn attach_storage(
        &mut self,
        registry: &dyn DeviceRegistry,
        storage: &DeviceId,
        parent: Option<&DeviceId>,
    ) {
        self.whole_device = registry.string_property(storage, Prop::BlockDevice);
        self.storage = Some(storage.clone());
        self.storage_parent = parent.cloned();
    }

    pub(crate) fn detach_storage(&mut self) {
        self.storage = None;
        self.storage_parent = None;
        self.whole_device = None;
    }

    /// Looks for a storage node up to two levels below the host.
    fn discover_storage(&mut self, registry: &dyn DeviceRegistry) -> bool {
        for child in registry.children_of(&self.host) {
            if registry.has_capability(&child, Capability::Storage) {
                self.attach_storage(registry, &child, None);
                return true;
            }
            for grandchild in registry.children_of(&child) {
                if registry.has_capability(&grandchild, Capability::Storage) {
                    self.attach_storage(registry, &grandchild, Some(&child));
                    return true;
                }
            }
        }
        false
    }

    /// Reads the volumes under the storage node. No volume at all means an
    /// unformatted card, which is reported as corrupted.
    pub(crate) fn init_volumes(&mut self, env: &mut Env) -> usize {
        let storage = match &self.storage {
            Some(storage) => storage.clone(),
            None => {
                if !self.discover_storage(env.registry) {
                    return 0;
                }
                match &self.storage {
                    Some(storage) => storage.clone(),
                    None => return 0,
                }
            }
        };
        self.whole_device = env.registry.string_property(&storage, Prop::BlockDevice);

        for id in env.registry.children_of(&storage) {
            if env.registry.has_capability(&id, Capability::Volume) {
                self.volumes.add(env.registry, &id);
            }
        }
        let count = self.volumes.len();
        debug!(card = %self.slot, count, "volumes found");
        if count == 0 {
            self.set_corrupted(env, true);
        }
        count
    }

    /// Partition number an operation on `device` targets.
    pub fn resolve_volume_number(&self, device: &str) -> u32 {
        let mut number = self.preferred_volume;
        if !self.control_partitions {
            if let Some(n) = self.partition_suffix(device) {
                number = n;
            }
        }
        if self.volumes.by_number(number).is_none() {
            // Not yet partitioned media only has a volume 1.
            number = 1;
        }
        number
    }

    fn partition_suffix(&self, device: &str) -> Option<u32> {
        let whole = self.whole_device.as_deref()?;
        let rest = device.strip_prefix(whole)?;
        let digits = rest.strip_prefix('p').unwrap_or(rest);
        if digits.is_empty() {
            return None;
        }
        digits.parse().ok()
    }

    /// Mounts the target volume. True if it ended up mounted.
    pub(crate) fn mount_volumes(&mut self, env: &mut Env) -> bool {
        let number = if self.volumes.by_number(self.preferred_volume).is_some() {
            self.preferred_volume
        } else {
            1
        };
        let mount_point = self.mount_point.clone();
        let Some(volume) = self.volumes.by_number_mut(number).filter(|v| !v.corrupt) else {
            debug!(card = %self.slot, number, "no mountable volume");
            return false;
        };

        let mounted = if volume.mount_point.is_some() && volume.is_mounted(env.registry) {
            debug!(card = %self.slot, device = volume.device, "already mounted");
            true
        } else {
            match env.helpers.mount(&volume.device, &mount_point) {
                MountOutcome::Mounted => {
                    volume.mount_point = Some(mount_point);
                    self.swap_on(env);
                    self.set_corrupted(env, false);
                    true
                }
                MountOutcome::ReadOnly => {
                    volume.mount_point = Some(mount_point);
                    self.set_corrupted(env, true);
                    env.dialogs.show_banner(&Notice::CardReadOnly);
                    true
                }
                MountOutcome::Failed(_) => {
                    volume.corrupt = true;
                    self.set_swapping(env, false);
                    self.set_corrupted(env, true);
                    env.dialogs.show_banner(&Notice::CardCorrupted(self.slot));
                    false
                }
            }
        };
        self.set_used_over_usb(env, false);
        mounted
    }

    /// Unmounts and forgets a removed volume.
    fn discard_volume(&mut self, id: &DeviceId, env: &mut Env) {
        let Some(volume) = self.volumes.remove(id) else {
            debug!(card = %self.slot, volume = %id, "volume not listed");
            return;
        };
        if let Some(mp) = &volume.mount_point {
            if !env.helpers.unmount(mp, true) {
                info!(card = %self.slot, volume = %id, "could not unmount removed volume");
            }
        }
    }

    /// Re-reads the volume label of the first partition.
    pub(crate) fn update_label(&mut self, env: &mut Env) {
        let Some(device) = self.volumes.by_number(1).map(|v| v.device.clone()) else {
            error!(card = %self.slot, "first partition not found");
            if let Err(e) = fs::write(&self.label_file, "") {
                warn!(path = %self.label_file.display(), error = %e, "could not empty label file");
            }
            self.set_localised_label();
            return;
        };

        env.helpers.probe_label(&device, &self.label_file);
        match fs::read_to_string(&self.label_file) {
            Ok(label) => {
                let label = label.trim_end_matches(['\n', '\0']);
                if label.is_empty() || label.starts_with(' ') {
                    self.set_localised_label();
                } else {
                    self.display_name = label.to_string();
                }
            }
            Err(e) => {
                error!(path = %self.label_file.display(), error = %e, "could not read label file");
                self.set_localised_label();
            }
        }
    }

    fn set_localised_label(&mut self) {
        self.display_name = self.slot.keys().default_label.to_string();
    }

    fn rename(&mut self, device: &str, env: &mut Env) -> Result<(), RequestError> {
        fat::validate_label(&self.desired_label)?;
        let number = self.resolve_volume_number(device);
        let Some(target) = self.volumes.by_number(number).map(|v| v.device.clone()) else {
            error!(card = %self.slot, number, "no volume to rename");
            return Err(RequestError::Failure);
        };

        if !self.volumes.unmount_all(env.registry, &env.helpers, false) {
            debug!(card = %self.slot, "unmount failed, not renaming");
            env.dialogs.show_note(&Notice::RenameInUse);
            return Err(RequestError::InUse);
        }
        if !env.helpers.rename(&target, &self.desired_label) {
            // Still worth trying to mount the card again.
            env.dialogs.show_banner(&Notice::CardCorrupted(self.slot));
        }
        self.update_label(env);
        if !self.mount_volumes(env) {
            error!(card = %self.slot, "could not mount after rename");
        }
        Ok(())
    }

    fn format(&mut self, device: &str, env: &mut Env) -> Result<(), RequestError> {
        fat::validate_label(&self.desired_label)?;
        info!(card = %self.slot, label = self.desired_label, "formatting");

        if !self.volumes.unmount_all(env.registry, &env.helpers, false) {
            info!(card = %self.slot, "card in use, not formatting");
            env.dialogs.show_note(&Notice::FormatInUse);
            self.mount_volumes(env);
            return Err(RequestError::InUse);
        }

        let target = if self.control_partitions {
            let whole = self.whole_device.clone().ok_or(RequestError::BadDeviceName)?;
            self.volumes.clear();
            whole
        } else {
            let number = self.resolve_volume_number(device);
            match self.volumes.by_number(number) {
                Some(volume) => volume.device.clone(),
                None => {
                    // Unformatted card: the whole device gets a filesystem.
                    self.volumes.clear();
                    self.whole_device.clone().ok_or(RequestError::BadDeviceName)?
                }
            }
        };

        if !env.helpers.format(&target, &self.desired_label) {
            info!(card = %self.slot, target, "format failed");
            return Err(RequestError::Failure);
        }
        self.skip_banner = true;
        for volume in self.volumes.iter_mut() {
            volume.corrupt = false;
        }
        self.mount_volumes(env);
        env.dialogs.show_banner(&Notice::FormattingComplete);
        Ok(())
    }

    /// Finds the volume a repair or check works on, refusing volumes that
    /// are mounted.
    fn check_target(&self, device: &str, env: &mut Env) -> Result<(DeviceId, String), RequestError> {
        let number = self.resolve_volume_number(device);
        let Some(volume) = self.volumes.by_number(number) else {
            error!(card = %self.slot, number, "no volume to check");
            env.dialogs.show_note(&Notice::UnableToRepair);
            return Err(RequestError::Failure);
        };
        if volume.is_mounted(env.registry) {
            info!(card = %self.slot, device = volume.device, "volume is mounted, not checking");
            return Err(RequestError::InUse);
        }
        Ok((volume.id.clone(), volume.device.clone()))
    }

    fn repair(&mut self, device: &str, env: &mut Env) -> Result<(), RequestError> {
        let (id, target) = self.check_target(device, env)?;
        match env.helpers.check(&target, true) {
            CheckOutcome::Clean => {}
            CheckOutcome::Damaged(code) => {
                error!(card = %self.slot, code, "checker could not repair the filesystem");
                env.dialogs.show_note(&Notice::UnableToRepair);
                return Err(RequestError::Failure);
            }
            CheckOutcome::ToolFailed(status) => {
                error!(card = %self.slot, ?status, "check helper failed");
                env.dialogs.show_note(&Notice::UnableToRepair);
                return Err(RequestError::Failure);
            }
        }

        if let Some(volume) = self.volumes.get_mut(&id) {
            volume.corrupt = false;
        }
        self.set_corrupted(env, false);
        self.init_volumes(env);
        if self.mount_volumes(env) {
            env.dialogs.show_note(&Notice::Repaired);
            Ok(())
        } else {
            env.dialogs.show_note(&Notice::UnableToRepair);
            Err(RequestError::Failure)
        }
    }

    fn check(&mut self, device: &str, env: &mut Env) -> Result<(), RequestError> {
        let (_, target) = self.check_target(device, env)?;
        match env.helpers.check(&target, false) {
            CheckOutcome::Clean => Ok(()),
            _ => Err(RequestError::Failure),
        }
    }

    /// Runs after a storage appeared; a card that still has no volume is
    /// unformatted.
    pub(crate) fn mount_check(&mut self, env: &mut Env, desktop_started: bool) {
        self.mount_check_timer = None;
        if !self.volumes.is_empty() {
            debug!(card = %self.slot, "volumes found, nothing to do");
            return;
        }
        self.set_corrupted(env, true);
        self.update_label(env);
        if desktop_started {
            env.dialogs.show_banner(&Notice::CardCorrupted(self.slot));
        }
    }

    pub(crate) fn set_present(&mut self, env: &mut Env, value: bool) {
        self.present = value;
        env.status.publish_flag(StatusKey::Present(self.slot), value);
    }

    fn set_cover_open(&mut self, env: &mut Env, value: bool) {
        self.cover_open = value;
        env.status.publish_flag(StatusKey::CoverOpen(self.slot), value);
    }

    pub(crate) fn set_corrupted(&mut self, env: &mut Env, value: bool) {
        self.corrupted = value;
        env.status.publish_flag(StatusKey::Corrupted(self.slot), value);
    }

    fn set_used_over_usb(&mut self, env: &mut Env, value: bool) {
        self.used_over_usb = value;
        env.status.publish_flag(StatusKey::UsedOverUsb(self.slot), value);
    }

    pub(crate) fn set_swapping(&mut self, env: &mut Env, value: bool) {
        self.swapping = value;
        env.status.publish_flag(StatusKey::Swapping(self.slot), value);
    }
}

/// The card slots, internal first.
#[derive(Debug, Default)]
pub struct Cards {
    cards: Vec<Card>,
}

impl Cards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a card, replacing any card already in the same slot.
    pub fn insert(&mut self, card: Card) {
        self.cards.retain(|c| c.slot != card.slot);
        self.cards.push(card);
        self.cards.sort_by_key(|c| Slot::ALL.iter().position(|s| *s == c.slot));
    }

    pub fn get(&self, slot: Slot) -> Option<&Card> {
        self.cards.iter().find(|c| c.slot == slot)
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut Card> {
        self.cards.iter_mut().find(|c| c.slot == slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Card> {
        self.cards.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Card whose whole device is a prefix of `device`.
    pub fn slot_for_device(&self, device: &str) -> Option<Slot> {
        self.cards
            .iter()
            .find(|c| c.whole_device.as_deref().is_some_and(|w| device.starts_with(w)))
            .map(|c| c.slot)
    }

    pub fn any_present(&self) -> bool {
        self.cards.iter().any(|c| c.whole_device.is_some())
    }

    /// Offers every card to USB mass storage. Returns how many cards are
    /// shared afterwards and the display names of the ones that were busy.
    pub fn plug_all(&mut self, env: &mut Env) -> (usize, Vec<String>) {
        let mut busy = Vec::new();
        for card in self.cards.iter_mut().filter(|c| c.whole_device.is_some()) {
            if card.handle(CardEvent::Plugged, env).is_err() {
                busy.push(card.display_name.clone());
            }
        }
        let shared = self.cards.iter().filter(|c| c.used_over_usb).count();
        (shared, busy)
    }

    /// Ends USB sharing on every card.
    pub fn detach_all(&mut self, env: &mut Env) {
        for card in self.cards.iter_mut() {
            // Detach is never refused.
            let _ = card.handle(CardEvent::Detached, env);
        }
    }
}
