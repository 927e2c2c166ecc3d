//! USB mode state machine.
//!
//! Tracks what the USB port is doing. In host mode the device mounts USB
//! storages plugged into it; in peripheral mode the user picks between
//! sharing the cards as mass storage, PC suite, or plain charging.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::card::Cards;
use crate::context::Env;
use crate::dialog::{DialogId, Notice, Severity};
use crate::error::RequestError;
use crate::event::{Reply, TimerEvent};
use crate::mount::MountOutcome;
use crate::registry::{DeviceId, DeviceRegistry, Prop};
use crate::status::StatusKey;
use crate::timer::TimerId;
use crate::volume::{VolumeList, usb_mount_point};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbState {
    /// Cable state not read yet.
    Invalid,
    CableDetached,
    Host,
    /// Cable in, waiting for the user to pick a mode.
    PeripheralWait,
    MassStorage,
    Pcsuite,
    PcsuiteMassStorage,
    Charging,
    /// Unmounting USB volumes, retrying while they are busy.
    Ejecting,
    Ejected,
}

impl UsbState {
    /// Whether cards are, or are about to be, shared over USB.
    pub fn is_mass_storage(&self) -> bool {
        matches!(self, UsbState::MassStorage | UsbState::PcsuiteMassStorage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEvent {
    CableDetached,
    EnterHostMode,
    EnterPeripheralWaitMode,
    EnterMassStorageMode,
    EnterPcsuiteMode,
    EnterChargingMode,
    Eject,
    EjectCancelled,
}

/// Mode string published for desktop components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMode {
    Idle,
    Host,
    Peripheral,
}

impl UsbMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsbMode::Idle => "idle",
            UsbMode::Host => "host",
            UsbMode::Peripheral => "peripheral",
        }
    }
}

/// Maps the controller's raw mode string to an event.
pub fn map_usb_mode(raw: &str) -> UsbEvent {
    match raw.trim() {
        "b_peripheral" | "a_peripheral" => UsbEvent::EnterPeripheralWaitMode,
        "a_host" | "b_host" => UsbEvent::EnterHostMode,
        _ => UsbEvent::CableDetached,
    }
}

/// A USB storage plugged into the device while in host mode.
#[derive(Debug)]
pub struct UsbStorage {
    pub id: DeviceId,
    pub whole_device: Option<String>,
    pub volumes: VolumeList,
}

/// The one USB port.
#[derive(Debug)]
pub struct UsbContext {
    state: UsbState,
    eject_dialog: Option<DialogId>,
    retry_timer: Option<TimerId>,
    retries_left: u32,
    mount_timer: Option<TimerId>,
    device_name: Option<String>,
    default_name: String,
    media_root: PathBuf,
    storages: Vec<UsbStorage>,
}

impl UsbContext {
    pub fn new(media_root: PathBuf, default_name: &str) -> Self {
        Self {
            state: UsbState::Invalid,
            eject_dialog: None,
            retry_timer: None,
            retries_left: 0,
            mount_timer: None,
            device_name: None,
            default_name: default_name.to_string(),
            media_root,
            storages: Vec::new(),
        }
    }

    pub fn state(&self) -> UsbState {
        self.state
    }

    pub fn retry_timer(&self) -> Option<TimerId> {
        self.retry_timer
    }

    pub fn mount_timer(&self) -> Option<TimerId> {
        self.mount_timer
    }

    pub fn eject_dialog(&self) -> Option<DialogId> {
        self.eject_dialog
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn storages(&self) -> &[UsbStorage] {
        &self.storages
    }

    fn set_state(&mut self, to: UsbState) {
        if self.state != to {
            info!(from = ?self.state, ?to, "USB state change");
        }
        self.state = to;
    }

    fn publish_mode(&self, env: &mut Env, mode: UsbMode) {
        env.status.publish_text(StatusKey::UsbMode, mode.as_str());
    }

    fn publish_cable(&self, env: &mut Env, attached: bool) {
        env.status.publish_flag(StatusKey::UsbCableAttached, attached);
    }

    fn name_or_default(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| self.default_name.clone())
    }

    fn clear_device_name(&mut self, env: &mut Env) {
        self.device_name = None;
        env.status.publish_text(StatusKey::UsbDeviceName, &self.default_name);
    }

    /// Dispatches one event. Events that make no sense in the current state
    /// are answered with [`RequestError::ImproperState`].
    pub fn handle(&mut self, event: UsbEvent, cards: &mut Cards, env: &mut Env) -> Reply {
        debug!(state = ?self.state, ?event, "USB event");
        match event {
            UsbEvent::CableDetached => {
                self.cable_detached(cards, env);
                Ok(())
            }
            UsbEvent::EnterHostMode => {
                self.publish_mode(env, UsbMode::Host);
                self.publish_cable(env, true);
                if matches!(self.state, UsbState::CableDetached | UsbState::Invalid) {
                    let after = env.timing.usb_mount_timeout();
                    self.arm_mount_timer(env, after);
                    // Storages already known get mounted right away.
                    self.mount_usb_volumes(env);
                    self.set_state(UsbState::Host);
                    Ok(())
                } else {
                    self.improper(event)
                }
            }
            UsbEvent::EnterPeripheralWaitMode => {
                self.clear_device_name(env);
                self.publish_mode(env, UsbMode::Peripheral);
                self.publish_cable(env, true);
                if matches!(
                    self.state,
                    UsbState::CableDetached | UsbState::PeripheralWait | UsbState::Invalid
                ) {
                    self.set_state(UsbState::PeripheralWait);
                    Ok(())
                } else {
                    self.improper(event)
                }
            }
            UsbEvent::EnterMassStorageMode => self.enter_mass_storage(cards, env),
            UsbEvent::EnterPcsuiteMode => {
                let to = match self.state {
                    UsbState::PeripheralWait | UsbState::Charging | UsbState::CableDetached => {
                        UsbState::Pcsuite
                    }
                    UsbState::MassStorage => UsbState::PcsuiteMassStorage,
                    _ => return self.improper(event),
                };
                if !env.helpers.enable_pcsuite() {
                    error!("could not enable PC suite mode");
                }
                self.set_state(to);
                Ok(())
            }
            UsbEvent::EnterChargingMode => {
                if self.state == UsbState::PeripheralWait {
                    self.set_state(UsbState::Charging);
                    Ok(())
                } else {
                    self.improper(event)
                }
            }
            UsbEvent::Eject => match self.state {
                UsbState::Host => {
                    env.cancel(&mut self.mount_timer);
                    self.try_eject(env);
                    Ok(())
                }
                UsbState::Ejecting => {
                    if self.retry_timer.is_none() {
                        self.try_eject(env);
                    } else {
                        debug!("eject already retrying");
                    }
                    Ok(())
                }
                _ => self.improper(event),
            },
            UsbEvent::EjectCancelled => {
                if self.state != UsbState::Ejecting {
                    return self.improper(event);
                }
                self.dismantle_eject(env);
                if !self.mount_usb_volumes(env) {
                    warn!("could not mount every USB volume again");
                }
                self.set_state(UsbState::Host);
                Ok(())
            }
        }
    }

    fn improper(&self, event: UsbEvent) -> Reply {
        warn!(state = ?self.state, ?event, "improper USB state");
        Err(RequestError::ImproperState)
    }

    fn cable_detached(&mut self, cards: &mut Cards, env: &mut Env) {
        self.publish_mode(env, UsbMode::Idle);
        self.publish_cable(env, false);
        match self.state {
            UsbState::Host => {
                env.cancel(&mut self.mount_timer);
                self.unmount_usb_volumes(env);
            }
            UsbState::MassStorage | UsbState::PcsuiteMassStorage | UsbState::PeripheralWait => {
                let was_sharing = self.state.is_mass_storage();
                if self.state == UsbState::PcsuiteMassStorage && !env.helpers.disable_pcsuite() {
                    error!("could not disable PC suite mode");
                }
                env.usb.mass_storage = false;
                cards.detach_all(env);
                if was_sharing && cards.any_present() {
                    env.dialogs.show_banner(&Notice::UsbDisconnected);
                }
            }
            UsbState::Pcsuite => {
                if !env.helpers.disable_pcsuite() {
                    error!("could not disable PC suite mode");
                }
            }
            UsbState::Ejecting => {
                self.dismantle_eject(env);
                self.unmount_usb_volumes(env);
            }
            UsbState::Ejected | UsbState::Charging => {}
            UsbState::CableDetached | UsbState::Invalid => {
                debug!("cable already detached");
            }
        }
        self.set_state(UsbState::CableDetached);
    }

    fn enter_mass_storage(&mut self, cards: &mut Cards, env: &mut Env) -> Reply {
        let to = match self.state {
            UsbState::PeripheralWait | UsbState::Charging => UsbState::MassStorage,
            UsbState::Pcsuite => UsbState::PcsuiteMassStorage,
            UsbState::MassStorage | UsbState::PcsuiteMassStorage => {
                debug!("already in mass storage mode");
                return Ok(());
            }
            _ => return self.improper(UsbEvent::EnterMassStorageMode),
        };
        if !cards.any_present() {
            debug!("no cards inserted");
            env.dialogs.show_note(&Notice::NoCardInserted);
            return Err(RequestError::Failure);
        }
        if env.usb.locked {
            info!("device locked, cards are shared once it is unlocked");
            self.set_state(to);
            return Ok(());
        }

        let previous = env.usb;
        env.usb.mass_storage = true;
        let (shared, busy) = cards.plug_all(env);
        if !busy.is_empty() {
            env.dialogs.show_note(&Notice::UsbShareFailed(busy));
        }
        if shared == 0 {
            info!("no card could be shared, staying in {:?}", self.state);
            env.usb = previous;
            return Err(RequestError::Failure);
        }
        self.set_state(to);
        Ok(())
    }

    /// Shares the cards that were held back while the device was locked.
    pub fn device_unlocked(&mut self, cards: &mut Cards, env: &mut Env) {
        if !self.state.is_mass_storage() {
            return;
        }
        env.usb.mass_storage = true;
        env.usb.locked = false;
        let (_, busy) = cards.plug_all(env);
        if !busy.is_empty() {
            env.dialogs.show_note(&Notice::UsbShareFailed(busy));
        }
    }

    fn try_eject(&mut self, env: &mut Env) {
        let name = self.name_or_default();
        if self.eject_dialog.is_none() {
            self.eject_dialog =
                env.dialogs.open_dialog(Severity::Progress, &Notice::UsbEjecting(name.clone()));
        }
        if self.unmount_usb_volumes(env) {
            if let Some(id) = self.eject_dialog.take() {
                env.dialogs.close_dialog(id);
            }
            env.dialogs.show_banner(&Notice::UsbEjected(name));
            self.publish_mode(env, UsbMode::Idle);
            self.set_state(UsbState::Ejected);
        } else {
            self.retries_left = env.timing.eject_retries;
            self.arm_eject_retry(env);
            self.set_state(UsbState::Ejecting);
        }
    }

    fn arm_eject_retry(&mut self, env: &mut Env) {
        env.cancel(&mut self.retry_timer);
        let after = env.timing.eject_retry();
        self.retry_timer = Some(env.schedule(after, TimerEvent::EjectRetry));
    }

    fn dismantle_eject(&mut self, env: &mut Env) {
        env.cancel(&mut self.retry_timer);
        self.retries_left = 0;
        if let Some(id) = self.eject_dialog.take() {
            env.dialogs.close_dialog(id);
        }
    }

    /// Fired by the retry timer while ejecting.
    pub fn eject_retry(&mut self, env: &mut Env) {
        self.retry_timer = None;
        if self.state != UsbState::Ejecting {
            debug!(state = ?self.state, "stale eject retry");
            return;
        }
        if self.unmount_usb_volumes(env) {
            debug!("all USB volumes unmounted");
            self.dismantle_eject(env);
            self.publish_mode(env, UsbMode::Idle);
            self.set_state(UsbState::Ejected);
            return;
        }
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left == 0 {
            info!("USB volumes still busy, giving up");
            self.dismantle_eject(env);
            let name = self.name_or_default();
            env.dialogs
                .open_dialog(Severity::Notice, &Notice::UsbCannotEject(name));
        } else {
            debug!(retries_left = self.retries_left, "USB volumes still busy");
            self.arm_eject_retry(env);
        }
    }

    fn arm_mount_timer(&mut self, env: &mut Env, after: Duration) {
        env.cancel(&mut self.mount_timer);
        self.mount_timer = Some(env.schedule(after, TimerEvent::UsbMountCheck));
    }

    /// Fired by the mount timer in host mode.
    pub fn mount_check(&mut self, env: &mut Env, desktop_started: bool) {
        self.mount_timer = None;
        let mounted = self
            .storages
            .iter()
            .flat_map(|s| s.volumes.iter())
            .any(|v| v.mount_point.is_some());
        if desktop_started && !mounted {
            env.dialogs.show_note(&Notice::NoFileSystem);
        }
    }

    pub fn owns_dialog(&self, id: DialogId) -> bool {
        self.eject_dialog == Some(id)
    }

    /// Forgets the eject dialog once it is closed.
    pub fn dialog_closed(&mut self, id: DialogId) -> bool {
        if self.eject_dialog == Some(id) {
            self.eject_dialog = None;
            true
        } else {
            false
        }
    }

    pub fn is_storage(&self, id: &DeviceId) -> bool {
        self.storages.iter().any(|s| &s.id == id)
    }

    pub fn has_volume(&self, id: &DeviceId) -> bool {
        self.storages.iter().any(|s| s.volumes.contains(id))
    }

    pub fn add_storage(&mut self, id: &DeviceId, env: &mut Env) {
        if self.is_storage(id) {
            return;
        }
        debug!(storage = %id, "USB storage added");
        self.storages.push(UsbStorage {
            id: id.clone(),
            whole_device: env.registry.string_property(id, Prop::BlockDevice),
            volumes: VolumeList::new(),
        });
        if self.device_name.is_none() {
            let name = product_name(env.registry, id);
            env.status
                .publish_text(StatusKey::UsbDeviceName, name.as_deref().unwrap_or(&self.default_name));
            self.device_name = name;
        }
        if self.state == UsbState::Host {
            // More volumes may follow.
            let after = env.timing.usb_storage_settle();
            self.arm_mount_timer(env, after);
        }
    }

    pub fn remove_storage(&mut self, id: &DeviceId, env: &mut Env) {
        let before = self.storages.len();
        self.storages.retain(|s| &s.id != id);
        if self.storages.len() != before {
            debug!(storage = %id, "USB storage removed");
        }
        if self.storages.is_empty() && self.device_name.is_some() {
            self.clear_device_name(env);
        }
    }

    /// Adds a volume under one of the tracked storages and mounts it in
    /// host mode.
    pub fn add_volume(&mut self, storage: &DeviceId, id: &DeviceId, env: &mut Env) {
        let host = self.state == UsbState::Host;
        let root = self.media_root.clone();
        let Some(entry) = self.storages.iter_mut().find(|s| &s.id == storage) else {
            debug!(volume = %id, "volume of an unknown storage");
            return;
        };
        let Some(volume) = entry.volumes.add(env.registry, id) else {
            return;
        };
        if !host {
            return;
        }
        let target = usb_mount_point(&root, &volume.device);
        debug!(device = volume.device, mount_point = %target.display(), "mounting USB volume");
        match env.helpers.mount(&volume.device, &target) {
            MountOutcome::Mounted | MountOutcome::ReadOnly => volume.mount_point = Some(target),
            MountOutcome::Failed(_) => volume.corrupt = true,
        }
        let after = env.timing.usb_volume_settle();
        self.arm_mount_timer(env, after);
    }

    pub fn remove_volume(&mut self, id: &DeviceId, env: &mut Env) {
        let host = self.state == UsbState::Host;
        for storage in self.storages.iter_mut() {
            if let Some(volume) = storage.volumes.remove(id) {
                if host {
                    if let Some(mp) = &volume.mount_point {
                        if !env.helpers.unmount(mp, true) {
                            warn!(volume = %id, "could not unmount removed USB volume");
                        }
                    }
                }
                return;
            }
        }
    }

    /// Mounts every known USB volume. True if at least one is mounted, or
    /// there is nothing to mount.
    pub fn mount_usb_volumes(&mut self, env: &mut Env) -> bool {
        let mut count = 0;
        let mut any = false;
        for storage in self.storages.iter_mut() {
            for volume in storage.volumes.iter_mut() {
                count += 1;
                let target = usb_mount_point(&self.media_root, &volume.device);
                match env.helpers.mount(&volume.device, &target) {
                    MountOutcome::Mounted | MountOutcome::ReadOnly => {
                        volume.mount_point = Some(target);
                        any = true;
                    }
                    MountOutcome::Failed(_) => volume.corrupt = true,
                }
            }
        }
        count == 0 || any
    }

    /// Unmounts every USB volume; true if all of them are unmounted.
    pub fn unmount_usb_volumes(&mut self, env: &mut Env) -> bool {
        let mut all = true;
        for storage in self.storages.iter_mut() {
            if !storage.volumes.unmount_all(env.registry, &env.helpers, true) {
                warn!(storage = %storage.id, "could not unmount every volume");
                all = false;
            }
        }
        all
    }
}

/// Product name of the nearest ancestor that reports one.
fn product_name(registry: &dyn DeviceRegistry, id: &DeviceId) -> Option<String> {
    let mut current = Some(id.clone());
    // Device trees are shallow; the bound guards against parent cycles.
    for _ in 0..16 {
        let node = current?;
        if let Some(name) = registry.string_property(&node, Prop::Product) {
            if !name.trim().is_empty() {
                return Some(name.trim().to_string());
            }
        }
        current = registry.parent_of(&node);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{Card, CardState};
    use crate::registry::{Capability, DeviceRecord};
    use crate::slot::Slot;
    use crate::testing::Harness;

    fn usb_context(h: &Harness) -> UsbContext {
        UsbContext::new(h.dir.path().join("usb"), "USB storage")
    }

    /// A USB stick with one volume reported mounted.
    fn plug_stick(h: &mut Harness, usb: &mut UsbContext) -> DeviceId {
        h.registry.insert(
            "usbdev",
            DeviceRecord::new().with_prop(Prop::Product, "Kingston DataTraveler"),
        );
        h.registry.insert(
            "sda",
            DeviceRecord::new()
                .with_capability(Capability::Storage)
                .with_parent(&"usbdev".into())
                .with_prop(Prop::StorageBus, "usb")
                .with_prop(Prop::BlockDevice, "/dev/sda"),
        );
        h.registry.insert(
            "sda1",
            DeviceRecord::new()
                .with_capability(Capability::Volume)
                .with_parent(&"sda".into())
                .with_prop(Prop::BlockDevice, "/dev/sda1")
                .with_prop(Prop::IsPartition, true)
                .with_prop(Prop::PartitionNumber, 1i64),
        );
        let mut env = h.env();
        usb.add_storage(&"sda".into(), &mut env);
        usb.add_volume(&"sda".into(), &"sda1".into(), &mut env);
        drop(env);
        h.registry.set(&"sda1".into(), Prop::IsMounted, true);
        DeviceId::new("sda1")
    }

    fn enter_host(h: &mut Harness, usb: &mut UsbContext, cards: &mut Cards) {
        let mut env = h.env();
        usb.handle(UsbEvent::CableDetached, cards, &mut env).unwrap();
        usb.handle(UsbEvent::EnterHostMode, cards, &mut env).unwrap();
    }

    #[test]
    fn test_map_usb_mode() {
        assert_eq!(map_usb_mode("b_peripheral\n"), UsbEvent::EnterPeripheralWaitMode);
        assert_eq!(map_usb_mode("a_host"), UsbEvent::EnterHostMode);
        assert_eq!(map_usb_mode("b_idle"), UsbEvent::CableDetached);
        assert_eq!(map_usb_mode(""), UsbEvent::CableDetached);
    }

    #[test]
    fn test_host_mode_mounts_and_names_device() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        enter_host(&mut h, &mut usb, &mut cards);
        assert_eq!(usb.state(), UsbState::Host);
        assert_eq!(h.status.text(StatusKey::UsbMode).as_deref(), Some("host"));
        assert_eq!(h.status.flag(StatusKey::UsbCableAttached), Some(true));

        plug_stick(&mut h, &mut usb);
        assert_eq!(usb.device_name(), Some("Kingston DataTraveler"));
        assert_eq!(
            h.status.text(StatusKey::UsbDeviceName).as_deref(),
            Some("Kingston DataTraveler")
        );
        let mount = h.runner.calls().into_iter().find(|c| c.program == h.paths.mount).unwrap();
        let target = h.dir.path().join("usb").join("sda1");
        assert_eq!(mount.args, vec!["/dev/sda1".to_string(), target.display().to_string()]);
    }

    #[test]
    fn test_mount_check_without_volumes() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        enter_host(&mut h, &mut usb, &mut cards);

        let fired = h.advance(Duration::from_secs(15));
        assert_eq!(fired, vec![TimerEvent::UsbMountCheck]);
        let mut env = h.env();
        usb.mount_check(&mut env, true);
        assert_eq!(h.dialogs.notes(), vec![Notice::NoFileSystem]);
        assert!(usb.mount_timer().is_none());
    }

    #[test]
    fn test_eject_succeeds_at_once() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        enter_host(&mut h, &mut usb, &mut cards);
        plug_stick(&mut h, &mut usb);

        let mut env = h.env();
        usb.handle(UsbEvent::Eject, &mut cards, &mut env).unwrap();
        assert_eq!(usb.state(), UsbState::Ejected);
        assert!(usb.mount_timer().is_none());
        assert!(h.dialogs.open_notices().is_empty());
        assert_eq!(
            h.dialogs.banners(),
            vec![Notice::UsbEjected("Kingston DataTraveler".into())]
        );
        assert_eq!(h.status.text(StatusKey::UsbMode).as_deref(), Some("idle"));
    }

    #[test]
    fn test_eject_gives_up_after_ten_retries() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        enter_host(&mut h, &mut usb, &mut cards);
        plug_stick(&mut h, &mut usb);
        h.runner.set_exit(&h.paths.unmount, 1);

        {
            let mut env = h.env();
            usb.handle(UsbEvent::Eject, &mut cards, &mut env).unwrap();
        }
        assert_eq!(usb.state(), UsbState::Ejecting);
        h.runner.clear();

        let mut retries = 0;
        loop {
            let fired = h.advance(Duration::from_secs(1));
            if fired.is_empty() {
                break;
            }
            for event in fired {
                assert_eq!(event, TimerEvent::EjectRetry);
                retries += 1;
                let mut env = h.env();
                usb.eject_retry(&mut env);
            }
        }
        assert_eq!(retries, 10);
        assert_eq!(h.runner.count(&h.paths.unmount), 10);
        assert!(usb.retry_timer().is_none());
        assert!(h.timers.is_empty());
        assert_eq!(usb.state(), UsbState::Ejecting);
        assert_eq!(
            h.dialogs.open_notices(),
            vec![Notice::UsbCannotEject("Kingston DataTraveler".into())]
        );

        // A new request starts over.
        let mut env = h.env();
        usb.handle(UsbEvent::Eject, &mut cards, &mut env).unwrap();
        assert!(usb.retry_timer().is_some());
    }

    #[test]
    fn test_cancel_eject_leaves_no_timer() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        enter_host(&mut h, &mut usb, &mut cards);
        plug_stick(&mut h, &mut usb);
        h.runner.set_exit(&h.paths.unmount, 1);

        {
            let mut env = h.env();
            usb.handle(UsbEvent::Eject, &mut cards, &mut env).unwrap();
        }
        for event in h.advance(Duration::from_secs(1)) {
            assert_eq!(event, TimerEvent::EjectRetry);
            let mut env = h.env();
            usb.eject_retry(&mut env);
        }
        {
            let mut env = h.env();
            usb.handle(UsbEvent::EjectCancelled, &mut cards, &mut env).unwrap();
        }
        assert_eq!(usb.state(), UsbState::Host);
        assert!(usb.retry_timer().is_none());
        assert!(usb.eject_dialog().is_none());
        assert!(h.dialogs.open_notices().is_empty());

        h.runner.clear();
        assert!(h.advance(Duration::from_secs(30)).is_empty());
        assert_eq!(h.runner.count(&h.paths.unmount), 0);
    }

    #[test]
    fn test_eject_improper_outside_host() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        let mut env = h.env();
        usb.handle(UsbEvent::CableDetached, &mut cards, &mut env).unwrap();
        assert_eq!(
            usb.handle(UsbEvent::Eject, &mut cards, &mut env),
            Err(RequestError::ImproperState)
        );
        assert_eq!(
            usb.handle(UsbEvent::EjectCancelled, &mut cards, &mut env),
            Err(RequestError::ImproperState)
        );
    }

    fn peripheral_with_card(h: &mut Harness) -> (UsbContext, Cards) {
        let host = h.add_card(Slot::External, "mmcblk1", 1);
        let card: Card = h.card(Slot::External, &host);
        let mut cards = Cards::new();
        cards.insert(card);
        let mut usb = usb_context(h);
        let mut env = h.env();
        usb.handle(UsbEvent::EnterPeripheralWaitMode, &mut cards, &mut env).unwrap();
        (usb, cards)
    }

    #[test]
    fn test_mass_storage_shares_once() {
        let mut h = Harness::new();
        let (mut usb, mut cards) = peripheral_with_card(&mut h);

        {
            let mut env = h.env();
            usb.handle(UsbEvent::EnterMassStorageMode, &mut cards, &mut env).unwrap();
            usb.handle(UsbEvent::EnterMassStorageMode, &mut cards, &mut env).unwrap();
        }
        assert_eq!(usb.state(), UsbState::MassStorage);
        assert_eq!(h.runner.count(&h.paths.usb_storage_enable), 1);
        assert!(cards.get(Slot::External).unwrap().is_used_over_usb());
        assert_eq!(h.dialogs.banners(), vec![Notice::ConnectedViaUsb]);

        {
            let mut env = h.env();
            usb.handle(UsbEvent::CableDetached, &mut cards, &mut env).unwrap();
        }
        assert_eq!(usb.state(), UsbState::CableDetached);
        assert_eq!(h.runner.count(&h.paths.usb_storage_disable), 1);
        assert!(!cards.get(Slot::External).unwrap().is_used_over_usb());
        assert!(h.dialogs.banners().contains(&Notice::UsbDisconnected));
    }

    #[test]
    fn test_mass_storage_rolls_back_when_card_busy() {
        let mut h = Harness::new();
        let (mut usb, mut cards) = peripheral_with_card(&mut h);
        {
            let mut env = h.env();
            let card = cards.get_mut(Slot::External).unwrap();
            card.handle(crate::card::CardEvent::InitCard, &mut env).unwrap();
        }
        h.registry.set(&"mmcblk1p1".into(), Prop::IsMounted, true);
        h.runner.set_exit(&h.paths.unmount, 1);

        let mut env = h.env();
        assert_eq!(
            usb.handle(UsbEvent::EnterMassStorageMode, &mut cards, &mut env),
            Err(RequestError::Failure)
        );
        drop(env);
        assert_eq!(usb.state(), UsbState::PeripheralWait);
        assert_eq!(
            h.dialogs.notes(),
            vec![Notice::UsbShareFailed(vec!["sfil_li_memorycard_removable".into()])]
        );
        assert_eq!(cards.get(Slot::External).unwrap().state(), CardState::CoverClosed);
    }

    #[test]
    fn test_mass_storage_without_cards() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        let mut env = h.env();
        usb.handle(UsbEvent::EnterPeripheralWaitMode, &mut cards, &mut env).unwrap();
        assert_eq!(
            usb.handle(UsbEvent::EnterMassStorageMode, &mut cards, &mut env),
            Err(RequestError::Failure)
        );
        drop(env);
        assert_eq!(h.dialogs.notes(), vec![Notice::NoCardInserted]);
        assert_eq!(usb.state(), UsbState::PeripheralWait);
    }

    #[test]
    fn test_locked_device_defers_sharing() {
        let mut h = Harness::new();
        h.usb.locked = true;
        let (mut usb, mut cards) = peripheral_with_card(&mut h);
        {
            let mut env = h.env();
            usb.handle(UsbEvent::EnterMassStorageMode, &mut cards, &mut env).unwrap();
        }
        assert_eq!(usb.state(), UsbState::MassStorage);
        assert_eq!(h.runner.count(&h.paths.usb_storage_enable), 0);

        let mut env = h.env();
        usb.device_unlocked(&mut cards, &mut env);
        drop(env);
        assert_eq!(h.runner.count(&h.paths.usb_storage_enable), 1);
    }

    #[test]
    fn test_pcsuite_and_charging() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        let mut env = h.env();
        usb.handle(UsbEvent::EnterPeripheralWaitMode, &mut cards, &mut env).unwrap();
        usb.handle(UsbEvent::EnterChargingMode, &mut cards, &mut env).unwrap();
        assert_eq!(usb.state(), UsbState::Charging);
        assert_eq!(
            usb.handle(UsbEvent::EnterChargingMode, &mut cards, &mut env),
            Err(RequestError::ImproperState)
        );
        usb.handle(UsbEvent::EnterPcsuiteMode, &mut cards, &mut env).unwrap();
        assert_eq!(usb.state(), UsbState::Pcsuite);
        usb.handle(UsbEvent::CableDetached, &mut cards, &mut env).unwrap();
        drop(env);
        assert_eq!(h.runner.count(&h.paths.pcsuite_enable), 1);
        assert_eq!(h.runner.count(&h.paths.pcsuite_disable), 1);
    }

    #[test]
    fn test_storage_removal_clears_name() {
        let mut h = Harness::new();
        let mut usb = usb_context(&h);
        let mut cards = Cards::new();
        enter_host(&mut h, &mut usb, &mut cards);
        let volume = plug_stick(&mut h, &mut usb);

        let mut env = h.env();
        usb.remove_volume(&volume, &mut env);
        usb.remove_storage(&"sda".into(), &mut env);
        drop(env);
        assert!(usb.device_name().is_none());
        assert!(usb.storages().is_empty());
        assert_eq!(h.runner.count(&h.paths.unmount), 1);
        assert_eq!(
            h.status.text(StatusKey::UsbDeviceName).as_deref(),
            Some("USB storage")
        );
    }
}
