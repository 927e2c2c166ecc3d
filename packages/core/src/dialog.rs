//! User-facing notices.
//!
//! The daemon never renders anything itself. It asks a [`DialogGateway`] to
//! open, close or flash notices identified by message ids; the gateway
//! reports user reactions back as
//! [`Input::NotificationClosed`](crate::event::Input::NotificationClosed) and
//! [`Input::ActionInvoked`](crate::event::Input::ActionInvoked).

use serde::{Deserialize, Serialize};

use crate::slot::Slot;

/// Handle of an open dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialogId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Notice,
    Progress,
}

/// Everything the daemon can tell the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Cover opened while files on the card are open.
    CardInUse,
    /// Cover opened while the card holds active swap.
    SwapCardInUse,
    CardAvailable,
    CardCorrupted(Slot),
    CardReadOnly,
    FormattingComplete,
    ConnectedViaUsb,
    UsbDisconnected,
    NoCardInserted,
    /// Cards that could not be unmounted for USB sharing, by display name.
    UsbShareFailed(Vec<String>),
    SwapFileCorrupted,
    RenameInUse,
    FormatInUse,
    UnableToRepair,
    Repaired,
    UsbEjecting(String),
    UsbEjected(String),
    UsbCannotEject(String),
    NoFileSystem,
}

impl Notice {
    /// Message id to be localized by the desktop.
    pub fn message_id(&self) -> &'static str {
        match self {
            Notice::CardInUse => "card_ni_card_in_use_warning",
            Notice::SwapCardInUse => "card_no_mmc_cover_open_mmc_swap",
            Notice::CardAvailable => "card_ib_memory_card_available",
            Notice::CardCorrupted(slot) => slot.keys().corrupted_notice,
            Notice::CardReadOnly => "mmc_ib_mmc_is_readonly",
            Notice::FormattingComplete => "card_ib_formatting_complete",
            Notice::ConnectedViaUsb => "card_connected_via_usb",
            Notice::UsbDisconnected => "card_ib_usb_disconnected",
            Notice::NoCardInserted => "card_ni_usb_no_memory_card_inserted",
            Notice::UsbShareFailed(cards) if cards.len() > 1 => "card_ni_usb_failed_cards_in_use",
            Notice::UsbShareFailed(_) => "card_ni_usb_failed_card_in_use",
            Notice::SwapFileCorrupted => "memr_ni_swap_file_corrupted",
            Notice::RenameInUse => "sfil_ni_mmc_rename_mmc_in_use",
            Notice::FormatInUse => "sfil_ni_mmc_format_mmc_in_use",
            Notice::UnableToRepair => "card_unable_to_repair_memory_card",
            Notice::Repaired => "card_memory_card_repaired",
            Notice::UsbEjecting(_) => "stab_me_usb_ejecting",
            Notice::UsbEjected(_) => "stab_me_usb_ejected",
            Notice::UsbCannotEject(_) => "stab_me_usb_cannot_eject",
            Notice::NoFileSystem => "stab_me_usb_no_file_system_available",
        }
    }

    /// Label of the action button, for dialogs that have one.
    pub fn button(&self) -> Option<&'static str> {
        match self {
            Notice::SwapCardInUse => Some("card_bd_mmc_cover_open_mmc_swap_ok"),
            Notice::UsbCannotEject(_) => Some("stab_me_usb_cannot_eject_ok"),
            _ => None,
        }
    }

    /// Values substituted into the localized message.
    pub fn params(&self) -> Vec<String> {
        match self {
            Notice::UsbShareFailed(cards) => cards.clone(),
            Notice::UsbEjecting(device)
            | Notice::UsbEjected(device)
            | Notice::UsbCannotEject(device) => vec![device.clone()],
            _ => Vec::new(),
        }
    }
}

/// Desktop side of the daemon.
pub trait DialogGateway {
    /// Opens a dialog that stays until closed by either side.
    fn open_dialog(&mut self, severity: Severity, notice: &Notice) -> Option<DialogId>;

    fn close_dialog(&mut self, id: DialogId);

    /// Short-lived information banner.
    fn show_banner(&mut self, notice: &Notice);

    /// Note the user has to acknowledge; the daemon keeps no handle to it.
    fn show_note(&mut self, notice: &Notice);

    /// Asks running applications to exit so that memory can be reclaimed.
    fn broadcast_exit(&mut self) -> bool;
}
