//! Typed inputs consumed by the [`Coordinator`](crate::coordinator::Coordinator).
//!
//! Every external callback (registry change, control request, dialog
//! callback, timer expiry) is translated into one [`Input`] and handed to a
//! single dispatch function.

use crate::dialog::DialogId;
use crate::error::RequestError;
use crate::registry::{DeviceId, Prop};
use crate::slot::Slot;

/// Device tree change reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hotplug {
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    PropertyModified { id: DeviceId, prop: Prop },
}

/// Deferred work scheduled on the timer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Retry unmounting a card whose cover was opened while in use.
    UnmountRecheck(Slot),
    /// Check whether a freshly inserted card produced any volume.
    CardMountCheck(Slot),
    /// Retry unmounting USB host volumes during eject.
    EjectRetry,
    /// Check whether anything got mounted after entering host mode.
    UsbMountCheck,
    /// First card setup once the desktop is up.
    InitCards,
    /// Rescan the device registry.
    Poll,
}

/// Control request. Each one is answered with exactly one [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Rename { device: String, label: String },
    Format { device: String, label: String },
    Repair { device: String },
    Check { device: String },
    EnableSwap { slot: Slot },
    DisableSwap { slot: Slot, close_apps: bool },
    UsbEject,
    UsbCancelEject,
    EnablePcsuite,
    EnableMassStorage,
    EnableCharging,
}

pub type Reply = Result<(), RequestError>;

/// Anything the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Hotplug(Hotplug),
    Request(Request),
    NotificationClosed(DialogId),
    ActionInvoked { dialog: DialogId, action: String },
    DeviceLock { locked: bool },
}
