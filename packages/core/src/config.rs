//! Daemon configuration.
//!
//! Loaded from TOML. Every section and field has a default, so an empty
//! file (or no file at all) gives a working setup for a two-slot device.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{info, warn};

use crate::error::{ConfigParseSnafu, IoResultExt, Result};
use crate::mount::HelperPaths;
use crate::slot::Slot;

/// System-wide config location.
pub const SYSTEM_CONFIG: &str = "/etc/slotd/slotd.toml";

/// Setting this variable to any non-empty value makes the daemon ignore the
/// USB cable.
pub const IGNORE_CABLE_ENV: &str = "SLOTD_IGNORE_CABLE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub timing: Timing,
    pub helpers: HelperPaths,
    #[serde(rename = "card")]
    pub cards: Vec<CardConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            timing: Timing::default(),
            helpers: HelperPaths::default(),
            cards: vec![
                CardConfig {
                    device: Some("/dev/mmcblk0".to_string()),
                    ..CardConfig::new(Slot::Internal)
                },
                CardConfig {
                    device: Some("/dev/mmcblk1".to_string()),
                    ..CardConfig::new(Slot::External)
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory receiving one file per published value.
    pub state_dir: PathBuf,
    /// Ignore USB cable mode changes entirely.
    pub ignore_cable: bool,
    /// sysfs attribute holding the USB controller mode (`b_peripheral`, ...).
    pub usb_mode_file: Option<PathBuf>,
    /// Parent directory of USB host mount points.
    pub usb_media_root: PathBuf,
    /// Name published when an attached USB device does not report one.
    pub default_usb_device_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/run/slotd"),
            ignore_cable: false,
            usb_mode_file: Some(PathBuf::from("/sys/devices/platform/musb-hdrc/mode")),
            usb_media_root: PathBuf::from("/media/usb"),
            default_usb_device_name: "USB storage".to_string(),
        }
    }
}

/// Delays and retry limits, in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub unmount_recheck_ms: u64,
    pub eject_retry_ms: u64,
    pub eject_retries: u32,
    /// How long to wait for memory after asking applications to exit.
    pub ram_wait_secs: u32,
    pub usb_mount_timeout_ms: u64,
    pub usb_volume_settle_ms: u64,
    pub usb_storage_settle_ms: u64,
    pub card_mount_check_ms: u64,
    /// Delay before the first card setup after start.
    pub startup_delay_ms: u64,
    /// Registry rescan interval; 0 disables polling.
    pub poll_interval_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            unmount_recheck_ms: 1000,
            eject_retry_ms: 1000,
            eject_retries: 10,
            ram_wait_secs: 20,
            usb_mount_timeout_ms: 15_000,
            usb_volume_settle_ms: 1000,
            usb_storage_settle_ms: 5000,
            card_mount_check_ms: 5000,
            startup_delay_ms: 5000,
            poll_interval_ms: 1000,
        }
    }
}

impl Timing {
    pub fn unmount_recheck(&self) -> Duration {
        Duration::from_millis(self.unmount_recheck_ms)
    }

    pub fn eject_retry(&self) -> Duration {
        Duration::from_millis(self.eject_retry_ms)
    }

    pub fn usb_mount_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_mount_timeout_ms)
    }

    pub fn usb_volume_settle(&self) -> Duration {
        Duration::from_millis(self.usb_volume_settle_ms)
    }

    pub fn usb_storage_settle(&self) -> Duration {
        Duration::from_millis(self.usb_storage_settle_ms)
    }

    pub fn card_mount_check(&self) -> Duration {
        Duration::from_millis(self.card_mount_check_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

/// One card slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardConfig {
    pub slot: Slot,
    /// Whole-device node of the card, e.g. `/dev/mmcblk1`.
    #[serde(default)]
    pub device: Option<String>,
    /// sysfs attribute of the cover switch.
    #[serde(default)]
    pub cover_switch: Option<PathBuf>,
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    /// Directory holding the swap file; no swap on this card when unset.
    #[serde(default)]
    pub swap_location: Option<PathBuf>,
    #[serde(default)]
    pub label_file: Option<PathBuf>,
    /// Partition that operations target by default.
    #[serde(default = "default_preferred_volume")]
    pub preferred_volume: u32,
    /// Whether the card is managed as a whole device rather than one
    /// FAT partition.
    #[serde(default)]
    pub control_partitions: bool,
}

fn default_preferred_volume() -> u32 {
    1
}

impl CardConfig {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            device: None,
            cover_switch: None,
            mount_point: None,
            swap_location: None,
            label_file: None,
            preferred_volume: default_preferred_volume(),
            control_partitions: false,
        }
    }

    pub fn mount_point(&self) -> PathBuf {
        self.mount_point.clone().unwrap_or_else(|| match self.slot {
            Slot::External => PathBuf::from("/media/mmc1"),
            Slot::Internal => PathBuf::from("/media/mmc2"),
        })
    }

    pub fn label_file(&self) -> PathBuf {
        self.label_file.clone().unwrap_or_else(|| match self.slot {
            Slot::External => PathBuf::from("/tmp/.mmc-volume-label"),
            Slot::Internal => PathBuf::from("/tmp/.internal-mmc-volume-label"),
        })
    }
}

impl Config {
    /// Parses a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).config_read_context(path)?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).context(ConfigParseSnafu { path })
    }

    /// Loads the explicit path if given, otherwise the first existing
    /// standard location, otherwise the defaults. Environment overrides are
    /// applied last.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::candidates().into_iter().find(|p| p.is_file()) {
                Some(path) => {
                    info!(path = %path.display(), "loading config");
                    Self::load(&path)?
                }
                None => {
                    info!("no config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env();
        Ok(config)
    }

    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(SYSTEM_CONFIG)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("slotd").join("slotd.toml"));
        }
        paths
    }

    fn apply_env(&mut self) {
        if std::env::var_os(IGNORE_CABLE_ENV).is_some_and(|v| !v.is_empty()) {
            warn!("{IGNORE_CABLE_ENV} is set, ignoring the USB cable");
            self.daemon.ignore_cable = true;
        }
    }

    pub fn card(&self, slot: Slot) -> Option<&CardConfig> {
        self.cards.iter().find(|c| c.slot == slot)
    }

    /// Settings for `slot`, falling back to defaults for an unlisted slot.
    pub fn card_or_default(&self, slot: Slot) -> CardConfig {
        self.card(slot)
            .cloned()
            .unwrap_or_else(|| CardConfig::new(slot))
    }
}
