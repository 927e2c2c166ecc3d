//! Collaborators handed to the state machines for one event.

use std::time::Duration;

use crate::config::Timing;
use crate::dialog::DialogGateway;
use crate::event::TimerEvent;
use crate::mount::Helpers;
use crate::registry::DeviceRegistry;
use crate::status::StatusSink;
use crate::swap::SwapControl;
use crate::timer::{Clock, TimerId, TimerQueue};

/// What a card may know about the USB side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbView {
    /// USB is in a mass-storage state.
    pub mass_storage: bool,
    /// The device lock is engaged.
    pub locked: bool,
}

impl UsbView {
    pub fn sharing_allowed(&self) -> bool {
        self.mass_storage && !self.locked
    }
}

/// Borrowed collaborators, rebuilt by the coordinator for every input.
pub struct Env<'a> {
    pub registry: &'a dyn DeviceRegistry,
    pub helpers: Helpers<'a>,
    pub dialogs: &'a mut dyn DialogGateway,
    pub status: &'a mut dyn StatusSink,
    pub swap: &'a mut dyn SwapControl,
    pub clock: &'a dyn Clock,
    pub timers: &'a mut TimerQueue<TimerEvent>,
    pub timing: &'a Timing,
    pub usb: UsbView,
}

impl Env<'_> {
    pub fn schedule(&mut self, after: Duration, event: TimerEvent) -> TimerId {
        self.timers.schedule_at(self.clock.now() + after, event)
    }

    /// Cancels the timer in `slot`, if any.
    pub fn cancel(&mut self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            self.timers.cancel(id);
        }
    }
}
