//! Helper program invocations.
//!
//! Mounting, unmounting, USB gadget switching, renaming, formatting and
//! filesystem checks are all done by external helpers. This module knows
//! their argument conventions and exit codes and turns them into typed
//! outcomes; it never decides what to do next.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::executor::{CommandRunner, RunStatus};

/// Exit code of the mount helper for "mounted, but read-only".
const MOUNTED_READ_ONLY: i32 = 2;

/// The check helper reports checker exit codes shifted by this much.
const CHECKER_CODE_OFFSET: i32 = 2;

/// Locations of the helper programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperPaths {
    /// `mount <device> <mount point>`
    pub mount: PathBuf,
    /// `unmount [-l] <mount point>`
    pub unmount: PathBuf,
    /// `pre-unmount <mount point>`, tells applications to let go of files.
    pub pre_unmount: PathBuf,
    /// `rename <partition device> <label>`
    pub rename: PathBuf,
    /// `format <device> <label>`
    pub format: PathBuf,
    /// `check <device> [-q]`
    pub check: PathBuf,
    /// `update-label <partition device> <label file>`
    pub update_label: PathBuf,
    /// `usb-storage-enable <device>...`
    pub usb_storage_enable: PathBuf,
    /// `usb-storage-disable <device>...`
    pub usb_storage_disable: PathBuf,
    pub pcsuite_enable: PathBuf,
    pub pcsuite_disable: PathBuf,
}

impl Default for HelperPaths {
    fn default() -> Self {
        let dir = Path::new("/usr/libexec/slotd");
        Self {
            mount: dir.join("mount-card"),
            unmount: dir.join("unmount-card"),
            pre_unmount: dir.join("pre-unmount"),
            rename: dir.join("rename-card"),
            format: dir.join("format-card"),
            check: dir.join("check-card"),
            update_label: dir.join("update-label"),
            usb_storage_enable: dir.join("usb-storage-enable"),
            usb_storage_disable: dir.join("usb-storage-disable"),
            pcsuite_enable: dir.join("pcsuite-enable"),
            pcsuite_disable: dir.join("pcsuite-disable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    /// Mounted read-only because the filesystem needs repair.
    ReadOnly,
    Failed(RunStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Clean,
    /// The checker found problems; carries the checker's own exit code.
    Damaged(i32),
    /// The helper itself failed, or could not be run.
    ToolFailed(RunStatus),
}

impl CheckOutcome {
    fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Exited(0) => CheckOutcome::Clean,
            RunStatus::Exited(code) if code > CHECKER_CODE_OFFSET => {
                CheckOutcome::Damaged(code - CHECKER_CODE_OFFSET)
            }
            other => CheckOutcome::ToolFailed(other),
        }
    }
}

/// Helper programs bound to a runner.
#[derive(Clone, Copy)]
pub struct Helpers<'a> {
    paths: &'a HelperPaths,
    runner: &'a dyn CommandRunner,
}

impl<'a> Helpers<'a> {
    pub fn new(paths: &'a HelperPaths, runner: &'a dyn CommandRunner) -> Self {
        Self { paths, runner }
    }

    /// Mounts a device, creating the mount point if needed.
    pub fn mount(&self, device: &str, mount_point: &Path) -> MountOutcome {
        create_mount_point(mount_point);
        let mp = mount_point.to_string_lossy();
        match self.runner.run(&self.paths.mount, &[device, &mp]) {
            RunStatus::Exited(0) => {
                info!(device, mount_point = %mp, "mounted");
                MountOutcome::Mounted
            }
            RunStatus::Exited(MOUNTED_READ_ONLY) => {
                warn!(device, mount_point = %mp, "mounted read-only");
                MountOutcome::ReadOnly
            }
            status => {
                error!(device, mount_point = %mp, ?status, "mount failed");
                MountOutcome::Failed(status)
            }
        }
    }

    /// Announces the unmount to applications, then unmounts.
    pub fn unmount(&self, mount_point: &Path, lazy: bool) -> bool {
        let mp = mount_point.to_string_lossy();
        let notified = self.runner.run(&self.paths.pre_unmount, &[&mp]);
        if !notified.success() {
            debug!(mount_point = %mp, ?notified, "pre-unmount notifier failed");
        }

        let status = if lazy {
            self.runner.run(&self.paths.unmount, &["-l", &mp])
        } else {
            self.runner.run(&self.paths.unmount, &[&mp])
        };
        if status.success() {
            info!(mount_point = %mp, lazy, "unmounted");
            true
        } else {
            info!(mount_point = %mp, lazy, ?status, "unmount failed");
            false
        }
    }

    /// Exposes the devices over USB mass storage.
    pub fn load_usb_driver(&self, devices: &[&str]) -> bool {
        self.checked("usb-storage-enable", &self.paths.usb_storage_enable, devices)
    }

    pub fn unload_usb_driver(&self, devices: &[&str]) -> bool {
        self.checked("usb-storage-disable", &self.paths.usb_storage_disable, devices)
    }

    pub fn enable_pcsuite(&self) -> bool {
        self.checked("pcsuite-enable", &self.paths.pcsuite_enable, &[])
    }

    pub fn disable_pcsuite(&self) -> bool {
        self.checked("pcsuite-disable", &self.paths.pcsuite_disable, &[])
    }

    pub fn rename(&self, device: &str, label: &str) -> bool {
        self.checked("rename", &self.paths.rename, &[device, label])
    }

    pub fn format(&self, device: &str, label: &str) -> bool {
        self.checked("format", &self.paths.format, &[device, label])
    }

    /// Runs the filesystem checker; `repair` allows it to write.
    pub fn check(&self, device: &str, repair: bool) -> CheckOutcome {
        let status = if repair {
            self.runner.run(&self.paths.check, &[device])
        } else {
            self.runner.run(&self.paths.check, &[device, "-q"])
        };
        let outcome = CheckOutcome::from_status(status);
        info!(device, repair, ?outcome, "filesystem check finished");
        outcome
    }

    /// Writes the label of `device` into `label_file`.
    pub fn probe_label(&self, device: &str, label_file: &Path) -> bool {
        let file = label_file.to_string_lossy();
        self.checked("update-label", &self.paths.update_label, &[device, &file])
    }

    fn checked(&self, what: &str, program: &Path, args: &[&str]) -> bool {
        let status = self.runner.run(program, args);
        if !status.success() {
            error!(helper = what, ?args, ?status, "helper failed");
        }
        status.success()
    }
}

/// Creates a mount point directory if it doesn't exist.
fn create_mount_point(path: &Path) {
    if path.exists() {
        return;
    }
    if let Err(e) = fs::create_dir_all(path) {
        // The helper may still manage, e.g. when it runs with more privileges.
        warn!(path = %path.display(), error = %e, "could not create mount point");
    }
}
