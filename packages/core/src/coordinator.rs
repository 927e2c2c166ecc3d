//! Event dispatcher.
//!
//! The [`Coordinator`] owns both card state machines, the USB context, the
//! timer queue and every collaborator. Each [`Input`] is routed to the state
//! machine it concerns; fired timers come back through
//! [`Coordinator::fire_due_timers`]. Nothing here blocks except the helper
//! programs run by the state machines.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::card::{Card, CardEvent, Cards};
use crate::config::{Config, Timing};
use crate::context::{Env, UsbView};
use crate::dialog::{DialogGateway, DialogId};
use crate::error::RequestError;
use crate::event::{Hotplug, Input, Reply, Request, TimerEvent};
use crate::executor::CommandRunner;
use crate::fat;
use crate::mount::Helpers;
use crate::registry::{Capability, DeviceId, DeviceRegistry, Prop};
use crate::slot::Slot;
use crate::status::StatusSink;
use crate::swap::SwapControl;
use crate::timer::{Clock, TimerId, TimerQueue};
use crate::usb::{UsbContext, UsbEvent, UsbState, map_usb_mode};

/// Value the registry reports for a USB-attached storage bus.
const USB_BUS: &str = "usb";

/// The collaborators the daemon talks to.
pub struct Services {
    pub registry: Box<dyn DeviceRegistry>,
    pub runner: Box<dyn CommandRunner>,
    pub dialogs: Box<dyn DialogGateway>,
    pub status: Box<dyn StatusSink>,
    pub swap: Box<dyn SwapControl>,
    pub clock: Box<dyn Clock>,
}

/// Everything an [`Env`] borrows, kept apart from the state machines so
/// both can be borrowed at once.
struct Runtime {
    services: Services,
    config: Config,
    timers: TimerQueue<TimerEvent>,
}

impl Runtime {
    fn env(&mut self, usb: UsbView) -> Env<'_> {
        let services = &mut self.services;
        Env {
            registry: services.registry.as_ref(),
            helpers: Helpers::new(&self.config.helpers, services.runner.as_ref()),
            dialogs: services.dialogs.as_mut(),
            status: services.status.as_mut(),
            swap: services.swap.as_mut(),
            clock: services.clock.as_ref(),
            timers: &mut self.timers,
            timing: &self.config.timing,
            usb,
        }
    }

    fn timing(&self) -> &Timing {
        &self.config.timing
    }

    fn now(&self) -> Duration {
        self.services.clock.now()
    }
}

pub struct Coordinator {
    rt: Runtime,
    cards: Cards,
    usb: UsbContext,
    /// USB cable node, once seen.
    cable: Option<DeviceId>,
    locked: bool,
    /// Set once the first card setup ran; notices wait for it.
    desktop_started: bool,
    poll_timer: Option<TimerId>,
}

impl Coordinator {
    pub fn new(config: &Config, services: Services) -> Self {
        let usb = UsbContext::new(
            config.daemon.usb_media_root.clone(),
            &config.daemon.default_usb_device_name,
        );
        Self {
            rt: Runtime {
                services,
                config: config.clone(),
                timers: TimerQueue::new(),
            },
            cards: Cards::new(),
            usb,
            cable: None,
            locked: false,
            desktop_started: false,
            poll_timer: None,
        }
    }

    fn view(&self) -> UsbView {
        UsbView {
            mass_storage: self.usb.state().is_mass_storage(),
            locked: self.locked,
        }
    }

    /// Discovers the card slots and the USB cable, then schedules the first
    /// card setup and registry polling.
    pub fn start(&mut self) {
        let hosts = self
            .rt
            .services
            .registry
            .find_by_capability(Capability::CardHost);
        for host in hosts {
            let name = self.rt.services.registry.string_property(&host, Prop::SlotName);
            let Some(slot) = name.as_deref().and_then(Slot::from_name) else {
                warn!(host = %host, ?name, "card host with unknown slot name");
                continue;
            };
            self.rt.services.registry.watch(&host);
            let config = self.rt.config.card_or_default(slot);
            let mut card = Card::new(host, &config);
            let view = self.view();
            card.init(&mut self.rt.env(view));
            self.cards.insert(card);
        }
        info!(cards = self.cards.len(), "card slots discovered");

        let cable = self
            .rt
            .services
            .registry
            .find_by_capability(Capability::UsbCable)
            .into_iter()
            .next();
        match cable {
            Some(cable) => {
                self.rt.services.registry.watch(&cable);
                self.cable = Some(cable);
                self.cable_mode_changed();
            }
            None => {
                debug!("no USB cable node");
                self.usb_event(UsbEvent::CableDetached);
            }
        }
        self.usb_devices_present();

        let timing = self.rt.timing();
        let (delay, poll) = (timing.startup_delay(), timing.poll_interval());
        let now = self.rt.now();
        self.rt.timers.schedule_at(now + delay, TimerEvent::InitCards);
        if let Some(interval) = poll {
            self.poll_timer = Some(self.rt.timers.schedule_at(now + interval, TimerEvent::Poll));
        }
    }

    /// Registers the USB storages and volumes already attached at startup.
    /// Later ones arrive as hotplug events.
    fn usb_devices_present(&mut self) {
        let registry = self.rt.services.registry.as_ref();
        let storages: Vec<DeviceId> = registry
            .find_by_capability(Capability::Storage)
            .into_iter()
            .filter(|id| registry.string_property(id, Prop::StorageBus).as_deref() == Some(USB_BUS))
            .collect();
        if storages.is_empty() {
            return;
        }
        let volumes: Vec<DeviceId> = registry
            .find_by_capability(Capability::Volume)
            .into_iter()
            .filter(|id| registry.parent_of(id).is_some_and(|parent| storages.contains(&parent)))
            .collect();
        info!(storages = storages.len(), volumes = volumes.len(), "USB storage present at startup");
        for id in storages {
            self.device_added(id);
        }
        for id in volumes {
            self.volume_added(id);
        }
    }

    /// Handles one input. Requests get a reply; everything else gets `None`.
    pub fn handle(&mut self, input: Input) -> Option<Reply> {
        match input {
            Input::Hotplug(hotplug) => {
                self.hotplug(hotplug);
                None
            }
            Input::Request(request) => Some(self.request(request)),
            Input::NotificationClosed(id) => {
                self.notification_closed(id);
                None
            }
            Input::ActionInvoked { dialog, action } => {
                self.action_invoked(dialog, &action);
                None
            }
            Input::DeviceLock { locked } => {
                self.device_lock(locked);
                None
            }
        }
    }

    /// Answers one control request.
    pub fn request(&mut self, request: Request) -> Reply {
        debug!(?request, "request");
        let reply = match request {
            Request::Rename { device, label } => {
                self.card_request(&device, Some(&label), CardEvent::Rename { device: device.clone() })
            }
            Request::Format { device, label } => {
                self.card_request(&device, Some(&label), CardEvent::Format { device: device.clone() })
            }
            Request::Repair { device } => {
                self.card_request(&device, None, CardEvent::Repair { device: device.clone() })
            }
            Request::Check { device } => {
                self.card_request(&device, None, CardEvent::Check { device: device.clone() })
            }
            Request::EnableSwap { slot } => self.card_event(slot, CardEvent::EnableSwap),
            Request::DisableSwap { slot, close_apps } => {
                self.card_event(slot, CardEvent::DisableSwap { close_apps })
            }
            Request::UsbEject => self.usb_event(UsbEvent::Eject),
            Request::UsbCancelEject => self.usb_event(UsbEvent::EjectCancelled),
            Request::EnablePcsuite => self.usb_event(UsbEvent::EnterPcsuiteMode),
            Request::EnableMassStorage => self.usb_event(UsbEvent::EnterMassStorageMode),
            Request::EnableCharging => self.usb_event(UsbEvent::EnterChargingMode),
        };
        match &reply {
            Ok(()) => info!("request succeeded"),
            Err(e) => warn!(error = e.code(), "request failed"),
        }
        reply
    }

    fn card_request(&mut self, device: &str, label: Option<&str>, event: CardEvent) -> Reply {
        let Some(slot) = self.cards.slot_for_device(device) else {
            warn!(device, "no card for device");
            return Err(RequestError::BadDeviceName);
        };
        if let (Some(label), Some(card)) = (label, self.cards.get_mut(slot)) {
            if label.is_empty() {
                card.set_desired_label(&fat::blank_label());
            } else {
                card.set_desired_label(label);
            }
        }
        self.card_event(slot, event)
    }

    fn card_event(&mut self, slot: Slot, event: CardEvent) -> Reply {
        let view = self.view();
        let Some(card) = self.cards.get_mut(slot) else {
            warn!(card = %slot, ?event, "no such card slot");
            return Err(RequestError::BadDeviceName);
        };
        card.handle(event, &mut self.rt.env(view))
    }

    fn usb_event(&mut self, event: UsbEvent) -> Reply {
        let view = self.view();
        self.usb.handle(event, &mut self.cards, &mut self.rt.env(view))
    }

    fn hotplug(&mut self, hotplug: Hotplug) {
        debug!(?hotplug, "hotplug");
        match hotplug {
            Hotplug::DeviceAdded(id) => self.device_added(id),
            Hotplug::DeviceRemoved(id) => self.device_removed(id),
            Hotplug::PropertyModified { id, prop } => self.property_modified(id, prop),
        }
    }

    fn device_added(&mut self, id: DeviceId) {
        let registry = self.rt.services.registry.as_ref();
        if registry.has_capability(&id, Capability::Storage) {
            if registry.string_property(&id, Prop::StorageBus).as_deref() == Some(USB_BUS) {
                let view = self.view();
                self.usb.add_storage(&id, &mut self.rt.env(view));
            } else {
                self.card_storage_added(id);
            }
        } else if registry.has_capability(&id, Capability::Volume) {
            self.volume_added(id);
        } else if registry.has_capability(&id, Capability::UsbCable) {
            self.rt.services.registry.watch(&id);
            self.cable = Some(id);
            self.cable_mode_changed();
        } else if registry.has_capability(&id, Capability::CardHost) {
            debug!(host = %id, "card host appeared after start, ignoring");
        }
    }

    /// A storage whose parent or grandparent is a card host belongs to
    /// that card.
    fn card_storage_added(&mut self, id: DeviceId) {
        let registry = self.rt.services.registry.as_ref();
        let Some(parent) = registry.parent_of(&id) else {
            debug!(storage = %id, "storage without parent");
            return;
        };
        let grandparent = registry.parent_of(&parent);
        let found = self.cards.iter().find_map(|c| {
            if c.host() == &parent {
                Some((c.slot(), None))
            } else if grandparent.as_ref() == Some(c.host()) {
                Some((c.slot(), Some(parent.clone())))
            } else {
                None
            }
        });
        let Some((slot, storage_parent)) = found else {
            debug!(storage = %id, "storage of no card slot");
            return;
        };

        let view = self.view();
        let Some(card) = self.cards.get_mut(slot) else {
            return;
        };
        let mut env = self.rt.env(view);
        card.attach_storage(env.registry, &id, storage_parent.as_ref());
        env.cancel(&mut card.mount_check_timer);
        let after = env.timing.card_mount_check();
        card.mount_check_timer = Some(env.schedule(after, TimerEvent::CardMountCheck(slot)));
        info!(card = %slot, storage = %id, "card storage added");
        if let Err(e) = card.handle(CardEvent::DeviceAdded(id), &mut env) {
            warn!(card = %slot, error = e.code(), "card could not take the new storage");
        }
    }

    fn volume_added(&mut self, id: DeviceId) {
        let registry = self.rt.services.registry.as_ref();
        let Some(storage) = registry
            .parent_of(&id)
            .or_else(|| registry.string_property(&id, Prop::StorageDevice).map(DeviceId::new))
        else {
            debug!(volume = %id, "volume without storage");
            return;
        };
        self.rt.services.registry.watch(&id);

        let view = self.view();
        if self.usb.is_storage(&storage) {
            self.usb.add_volume(&storage, &id, &mut self.rt.env(view));
            return;
        }
        let Some(card) = self
            .cards
            .iter_mut()
            .find(|c| c.storage() == Some(&storage))
        else {
            debug!(volume = %id, storage = %storage, "volume of an unknown storage");
            return;
        };
        let mut env = self.rt.env(view);
        env.cancel(&mut card.mount_check_timer);
        card.volumes.add(env.registry, &id);
        let slot = card.slot();
        info!(card = %slot, volume = %id, "card volume added");
        if let Err(e) = card.handle(CardEvent::VolumeAdded(id), &mut env) {
            warn!(card = %slot, error = e.code(), "card could not take the new volume");
        }
    }

    fn device_removed(&mut self, id: DeviceId) {
        let view = self.view();
        if self.usb.is_storage(&id) {
            self.usb.remove_storage(&id, &mut self.rt.env(view));
            return;
        }
        if self.usb.has_volume(&id) {
            self.usb.remove_volume(&id, &mut self.rt.env(view));
            return;
        }
        if self.cable.as_ref() == Some(&id) {
            self.cable = None;
            self.usb_event(UsbEvent::CableDetached);
            return;
        }

        if let Some(card) = self.cards.iter_mut().find(|c| c.storage() == Some(&id)) {
            let mut env = self.rt.env(view);
            env.cancel(&mut card.mount_check_timer);
            let slot = card.slot();
            info!(card = %slot, storage = %id, "card storage removed");
            if let Err(e) = card.handle(CardEvent::DeviceRemoved(id), &mut env) {
                warn!(card = %slot, error = e.code(), "card storage removal failed");
            }
            card.detach_storage();
            return;
        }

        if let Some(card) = self.cards.iter_mut().find(|c| c.volumes().contains(&id)) {
            let slot = card.slot();
            info!(card = %slot, volume = %id, "card volume removed");
            if let Err(e) = card.handle(CardEvent::VolumeRemoved(id), &mut self.rt.env(view)) {
                warn!(card = %slot, error = e.code(), "card volume removal failed");
            }
            return;
        }
        debug!(device = %id, "removed device was not tracked");
    }

    fn property_modified(&mut self, id: DeviceId, prop: Prop) {
        match prop {
            Prop::ButtonState => {
                let Some(slot) = self.cards.iter().find(|c| c.host() == &id).map(Card::slot) else {
                    debug!(device = %id, "button of an unknown device");
                    return;
                };
                let open = self.rt.services.registry.bool_property(&id, Prop::ButtonState)
                    == Some(false);
                let event = if open {
                    CardEvent::Opened
                } else {
                    CardEvent::Closed
                };
                info!(card = %slot, open, "cover switch");
                if let Err(e) = self.card_event(slot, event) {
                    warn!(card = %slot, error = e.code(), "cover event failed");
                }
            }
            Prop::UsbMode if self.cable.as_ref() == Some(&id) => self.cable_mode_changed(),
            Prop::IsMounted => {
                // Mount state is always read from the registry when needed.
                debug!(device = %id, "mount state changed");
            }
            other => debug!(device = %id, prop = other.key(), "property change ignored"),
        }
    }

    fn cable_mode_changed(&mut self) {
        if self.rt.config.daemon.ignore_cable {
            debug!("ignoring USB cable");
            return;
        }
        let Some(cable) = &self.cable else {
            return;
        };
        let raw = self
            .rt
            .services
            .registry
            .string_property(cable, Prop::UsbMode)
            .unwrap_or_default();
        let event = map_usb_mode(&raw);
        info!(mode = raw, ?event, "USB cable mode");
        if let Err(e) = self.usb_event(event) {
            debug!(error = e.code(), "cable event not applicable");
        }
    }

    fn notification_closed(&mut self, id: DialogId) {
        if self.usb.dialog_closed(id) {
            return;
        }
        if !self.cards.iter_mut().any(|c| c.dialog_closed(id)) {
            debug!(dialog = id.0, "closed dialog is not ours");
        }
    }

    fn action_invoked(&mut self, dialog: DialogId, action: &str) {
        if self.usb.owns_dialog(dialog) {
            info!(action, "eject dialog answered, cancelling eject");
            if let Err(e) = self.usb_event(UsbEvent::EjectCancelled) {
                debug!(error = e.code(), "eject no longer running");
            }
            return;
        }
        if !self.cards.iter_mut().any(|c| c.action_invoked(dialog, action)) {
            debug!(dialog = dialog.0, action, "action on an unknown dialog");
        }
    }

    fn device_lock(&mut self, locked: bool) {
        info!(locked, "device lock");
        self.locked = locked;
        if !locked {
            let view = self.view();
            self.usb.device_unlocked(&mut self.cards, &mut self.rt.env(view));
        }
    }

    /// Deadline of the next timer, on the clock's time line.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.rt.timers.next_deadline()
    }

    pub fn now(&self) -> Duration {
        self.rt.now()
    }

    /// Runs every timer that is due.
    pub fn fire_due_timers(&mut self) {
        let now = self.rt.now();
        while let Some((_, event)) = self.rt.timers.pop_due(now) {
            self.timer(event);
        }
    }

    fn timer(&mut self, event: TimerEvent) {
        debug!(?event, "timer fired");
        let view = self.view();
        match event {
            TimerEvent::UnmountRecheck(slot) => {
                if let Err(e) = self.card_event(slot, CardEvent::UnmountTimeout) {
                    warn!(card = %slot, error = e.code(), "unmount recheck failed");
                }
            }
            TimerEvent::CardMountCheck(slot) => {
                if let Some(card) = self.cards.get_mut(slot) {
                    card.mount_check(&mut self.rt.env(view), self.desktop_started);
                }
            }
            TimerEvent::EjectRetry => self.usb.eject_retry(&mut self.rt.env(view)),
            TimerEvent::UsbMountCheck => {
                self.usb.mount_check(&mut self.rt.env(view), self.desktop_started)
            }
            TimerEvent::InitCards => {
                self.desktop_started = true;
                let mut env = self.rt.env(view);
                for card in self.cards.iter_mut() {
                    if let Err(e) = card.handle(CardEvent::InitCard, &mut env) {
                        warn!(card = %card.slot(), error = e.code(), "card setup failed");
                    }
                }
            }
            TimerEvent::Poll => {
                self.poll_timer = None;
                for change in self.rt.services.registry.poll_changes() {
                    self.hotplug(change);
                }
                if let Some(interval) = self.rt.timing().poll_interval() {
                    let at = self.rt.now() + interval;
                    self.poll_timer = Some(self.rt.timers.schedule_at(at, TimerEvent::Poll));
                }
            }
        }
    }

    /// Leaves the cards and USB storages safe to pull: sharing ends, swap
    /// goes off and every volume is lazily unmounted.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        let view = self.view();
        let mut env = self.rt.env(view);
        for card in self.cards.iter_mut() {
            if card.is_used_over_usb() {
                card.unshare(&mut env);
            }
            card.swap_off_nocheck(&mut env);
            card.close_swap_dialog(&mut env);
            if !card.volumes.unmount_all(env.registry, &env.helpers, true) {
                warn!(card = %card.slot(), "card volumes still busy at shutdown");
            }
        }
        if !self.usb.unmount_usb_volumes(&mut env) {
            warn!("USB volumes still busy at shutdown");
        }
    }

    pub fn card(&self, slot: Slot) -> Option<&Card> {
        self.cards.get(slot)
    }

    pub fn cards(&self) -> &Cards {
        &self.cards
    }

    pub fn usb(&self) -> &UsbContext {
        &self.usb
    }

    pub fn usb_state(&self) -> UsbState {
        self.usb.state()
    }
}
