//! Published state.
//!
//! The daemon only writes these values; desktop components read them. A
//! [`StatusBoard`] keeps the latest value of every key and can mirror each
//! one into a file under a state directory (`1`/`0` for flags, plain text
//! otherwise).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{IoResultExt, Result};
use crate::slot::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusKey {
    Present(Slot),
    Corrupted(Slot),
    UsedOverUsb(Slot),
    CoverOpen(Slot),
    Swapping(Slot),
    UsbCableAttached,
    UsbMode,
    UsbDeviceName,
}

impl StatusKey {
    pub fn name(&self) -> &'static str {
        match self {
            StatusKey::Present(slot) => slot.keys().present,
            StatusKey::Corrupted(slot) => slot.keys().corrupted,
            StatusKey::UsedOverUsb(slot) => slot.keys().used_over_usb,
            StatusKey::CoverOpen(slot) => slot.keys().cover_open,
            StatusKey::Swapping(slot) => slot.keys().swapping,
            StatusKey::UsbCableAttached => "usb-cable-attached",
            StatusKey::UsbMode => "usb-mode",
            StatusKey::UsbDeviceName => "usb-device-name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusValue {
    Flag(bool),
    Text(String),
}

impl StatusValue {
    fn render(&self) -> String {
        match self {
            StatusValue::Flag(true) => "1\n".to_string(),
            StatusValue::Flag(false) => "0\n".to_string(),
            StatusValue::Text(text) => format!("{text}\n"),
        }
    }
}

/// Receives published state.
pub trait StatusSink {
    fn publish(&mut self, key: StatusKey, value: StatusValue);

    fn publish_flag(&mut self, key: StatusKey, value: bool) {
        self.publish(key, StatusValue::Flag(value));
    }

    fn publish_text(&mut self, key: StatusKey, value: &str) {
        self.publish(key, StatusValue::Text(value.to_string()));
    }
}

/// Latest published values, optionally mirrored to files.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    values: Rc<RefCell<BTreeMap<StatusKey, StatusValue>>>,
    dir: Option<PathBuf>,
}

impl StatusBoard {
    /// Board that keeps values in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Board that also writes one file per key into `dir`.
    pub fn with_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).state_write_context(dir)?;
        Ok(Self {
            values: Rc::default(),
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn get(&self, key: StatusKey) -> Option<StatusValue> {
        self.values.borrow().get(&key).cloned()
    }

    pub fn flag(&self, key: StatusKey) -> Option<bool> {
        match self.get(key) {
            Some(StatusValue::Flag(b)) => Some(b),
            _ => None,
        }
    }

    pub fn text(&self, key: StatusKey) -> Option<String> {
        match self.get(key) {
            Some(StatusValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    fn write_file(&self, key: StatusKey, value: &StatusValue) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(key.name());
        fs::write(&path, value.render()).state_write_context(&path)
    }
}

impl StatusSink for StatusBoard {
    fn publish(&mut self, key: StatusKey, value: StatusValue) {
        debug!(key = key.name(), ?value, "publishing");
        if let Err(e) = self.write_file(key, &value) {
            warn!(error = %e, "could not mirror published state");
        }
        self.values.borrow_mut().insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_board() {
        let mut board = StatusBoard::in_memory();
        let reader = board.clone();
        board.publish_flag(StatusKey::Present(Slot::Internal), true);
        board.publish_text(StatusKey::UsbMode, "host");

        assert_eq!(reader.flag(StatusKey::Present(Slot::Internal)), Some(true));
        assert_eq!(reader.text(StatusKey::UsbMode), Some("host".to_string()));
        assert_eq!(reader.flag(StatusKey::Present(Slot::External)), None);
    }

    #[test]
    fn test_board_mirrors_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut board = StatusBoard::with_dir(dir.path()).unwrap();
        board.publish_flag(StatusKey::CoverOpen(Slot::External), true);
        board.publish_text(StatusKey::UsbDeviceName, "Kingston");

        let cover = fs::read_to_string(dir.path().join("mmc-cover-open")).unwrap();
        assert_eq!(cover, "1\n");
        let name = fs::read_to_string(dir.path().join("usb-device-name")).unwrap();
        assert_eq!(name, "Kingston\n");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(
            StatusKey::UsedOverUsb(Slot::Internal).name(),
            "internal-mmc-used-over-usb"
        );
        assert_eq!(StatusKey::UsbCableAttached.name(), "usb-cable-attached");
    }
}
