//! Card slots and their published key names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A physical card bay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    External,
    Internal,
}

/// Names under which a slot's state is published.
#[derive(Debug)]
pub struct SlotKeys {
    pub name: &'static str,
    pub present: &'static str,
    pub corrupted: &'static str,
    pub used_over_usb: &'static str,
    pub cover_open: &'static str,
    pub swapping: &'static str,
    /// Localized name shown when the card has no usable label.
    pub default_label: &'static str,
    /// Corrupted-card notice id.
    pub corrupted_notice: &'static str,
}

const EXTERNAL: SlotKeys = SlotKeys {
    name: "external",
    present: "mmc-device-present",
    corrupted: "mmc-corrupted",
    used_over_usb: "mmc-used-over-usb",
    cover_open: "mmc-cover-open",
    swapping: "mmc-swapping",
    default_label: "sfil_li_memorycard_removable",
    corrupted_notice: "card_ia_corrupted",
};

const INTERNAL: SlotKeys = SlotKeys {
    name: "internal",
    present: "internal-mmc-device-present",
    corrupted: "internal-mmc-corrupted",
    used_over_usb: "internal-mmc-used-over-usb",
    cover_open: "internal-mmc-cover-open",
    swapping: "internal-mmc-swapping",
    default_label: "sfil_li_memorycard_internal",
    corrupted_notice: "card_ib_unknown_format_device",
};

impl Slot {
    /// Internal first: that is the order cards are offered over USB.
    pub const ALL: [Slot; 2] = [Slot::Internal, Slot::External];

    pub fn keys(&self) -> &'static SlotKeys {
        match self {
            Slot::External => &EXTERNAL,
            Slot::Internal => &INTERNAL,
        }
    }

    pub fn name(&self) -> &'static str {
        self.keys().name
    }

    pub fn is_internal(&self) -> bool {
        *self == Slot::Internal
    }

    /// Parses a slot name reported by a card host node, with or without
    /// the `slot:` prefix.
    pub fn from_name(name: &str) -> Option<Slot> {
        let name = name.strip_prefix("slot:").unwrap_or(name);
        Slot::ALL.into_iter().find(|slot| slot.name() == name)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(Slot::from_name("internal"), Some(Slot::Internal));
        assert_eq!(Slot::from_name("external"), Some(Slot::External));
        assert_eq!(Slot::from_name("slot:internal"), Some(Slot::Internal));
        assert_eq!(Slot::from_name("sd"), None);
    }

    #[test]
    fn test_keys_are_distinct() {
        let int = Slot::Internal.keys();
        let ext = Slot::External.keys();
        assert_ne!(int.present, ext.present);
        assert_ne!(int.cover_open, ext.cover_open);
        assert_ne!(int.default_label, ext.default_label);
    }
}
