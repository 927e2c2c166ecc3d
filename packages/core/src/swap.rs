//! Swap on memory cards.
//!
//! A card with a swap location carries a swap file named `.swap` there.
//! Swap is turned on after a successful mount and has to be turned off
//! before the card can be unmounted, which is only safe when the pages in
//! it fit back into RAM.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::card::Card;
use crate::context::Env;
use crate::dialog::{Notice, Severity};
use crate::error::{RequestError, Result, SwapOffSnafu, SwapOnSnafu, SwapPathSnafu};

/// Name of the swap file inside a card's swap location.
pub const SWAP_FILE_NAME: &str = ".swap";

/// Full path of the swap file under `location`.
pub fn swap_file(location: &Path) -> PathBuf {
    location.join(SWAP_FILE_NAME)
}

/// Kernel side of swapping.
pub trait SwapControl {
    /// Whether `file` is an active swap area.
    fn is_enabled(&self, file: &Path) -> bool;

    /// Whether `file` can be switched off without running out of memory.
    fn can_switch_off(&self, file: &Path) -> bool;

    fn switch_on(&mut self, file: &Path) -> Result<()>;

    fn switch_off(&mut self, file: &Path) -> Result<()>;
}

/// One line of `/proc/swaps`, sizes in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapUsage {
    pub size: u64,
    pub used: u64,
}

/// The `/proc/meminfo` fields the safety check needs, in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_free: u64,
}

impl MemInfo {
    pub fn parse(text: &str) -> Self {
        let mut info = MemInfo::default();
        for line in text.lines() {
            let mut words = line.split_whitespace();
            let (Some(key), Some(value)) = (words.next(), words.next()) else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "MemTotal:" => info.total = value,
                "MemFree:" => info.free = value,
                "Buffers:" => info.buffers = value,
                "Cached:" => info.cached = value,
                "SwapFree:" => info.swap_free = value,
                _ => {}
            }
        }
        info
    }
}

/// Finds `file` in the contents of `/proc/swaps`.
pub fn parse_swaps(text: &str, file: &Path) -> Option<SwapUsage> {
    let wanted = file.to_string_lossy();
    text.lines().skip(1).find_map(|line| {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() < 4 || words[0] != wanted {
            return None;
        }
        Some(SwapUsage {
            size: words[2].parse().unwrap_or(0),
            used: words[3].parse().unwrap_or(0),
        })
    })
}

/// Low-memory thresholds of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowMemLimits {
    /// Percentage of RAM in use at which the kernel starts complaining.
    pub high_limit: u64,
    /// Pages kept spare for decay.
    pub decay_pages: u64,
    pub page_size: u64,
}

impl Default for LowMemLimits {
    fn default() -> Self {
        Self {
            high_limit: 97,
            decay_pages: 256,
            page_size: 4096,
        }
    }
}

/// Decides whether switching off a swap file with `usage` leaves enough
/// free memory. Unused swap can always go.
pub fn can_switch_off_from(usage: SwapUsage, mem: &MemInfo, limits: &LowMemLimits) -> bool {
    if usage.used == 0 {
        return true;
    }
    // Pages can also move to other swap areas.
    let other_free = mem.swap_free.saturating_sub(usage.size - usage.used.min(usage.size));
    // Keep a spare: the watchdog reboots the device when memory runs out.
    let mut needed = usage.used * 2;
    if other_free > needed {
        return true;
    }
    needed -= other_free;

    let available = mem.free + mem.buffers + mem.cached;
    if needed >= available {
        return false;
    }
    let after = (available - needed) << 10;
    let total = mem.total << 10;
    let reserve = (total * (100 - limits.high_limit.min(100)) + 50) / 100
        + limits.decay_pages * limits.page_size;
    after >= reserve
}

/// [`SwapControl`] backed by procfs and `swapon(2)`/`swapoff(2)`.
#[derive(Debug, Clone)]
pub struct SystemSwap {
    proc_root: PathBuf,
}

impl Default for SystemSwap {
    fn default() -> Self {
        Self::new(Path::new("/proc"))
    }
}

impl SystemSwap {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
        }
    }

    fn usage(&self, file: &Path) -> Option<SwapUsage> {
        let text = fs::read_to_string(self.proc_root.join("swaps")).ok()?;
        parse_swaps(&text, file)
    }

    fn read_number(&self, relative: &str, default: u64) -> u64 {
        fs::read_to_string(self.proc_root.join(relative))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default)
    }

    fn limits(&self) -> LowMemLimits {
        let defaults = LowMemLimits::default();
        LowMemLimits {
            high_limit: self.read_number("sys/vm/lowmem_notify_high", defaults.high_limit),
            decay_pages: self.read_number("sys/vm/lowmem_nr_decay_pages", defaults.decay_pages),
            page_size: defaults.page_size,
        }
    }
}

fn c_path(file: &Path) -> Result<CString> {
    CString::new(file.as_os_str().as_bytes())
        .ok()
        .context(SwapPathSnafu { path: file })
}

impl SwapControl for SystemSwap {
    fn is_enabled(&self, file: &Path) -> bool {
        self.usage(file).is_some()
    }

    fn can_switch_off(&self, file: &Path) -> bool {
        let Some(usage) = self.usage(file) else {
            return true;
        };
        let mem = match fs::read_to_string(self.proc_root.join("meminfo")) {
            Ok(text) => MemInfo::parse(&text),
            Err(e) => {
                warn!(error = %e, "could not read meminfo");
                return false;
            }
        };
        can_switch_off_from(usage, &mem, &self.limits())
    }

    fn switch_on(&mut self, file: &Path) -> Result<()> {
        let path = c_path(file)?;
        // SAFETY: `path` is a valid NUL-terminated string for the call.
        let ret = unsafe { nix::libc::swapon(path.as_ptr(), 0) };
        Errno::result(ret).context(SwapOnSnafu { path: file })?;
        Ok(())
    }

    fn switch_off(&mut self, file: &Path) -> Result<()> {
        let path = c_path(file)?;
        // SAFETY: as above.
        let ret = unsafe { nix::libc::swapoff(path.as_ptr()) };
        Errno::result(ret).context(SwapOffSnafu { path: file })?;
        Ok(())
    }
}

impl Card {
    fn swap_path(&self) -> Option<PathBuf> {
        self.swap_location.as_deref().map(swap_file)
    }

    /// Turns swap on. Already enabled swap counts as success.
    pub(crate) fn swap_on(&mut self, env: &mut Env) -> bool {
        let Some(file) = self.swap_path() else {
            return false;
        };
        if env.swap.is_enabled(&file) {
            debug!(card = %self.slot(), "swap already on");
            self.set_swapping(env, true);
            return true;
        }
        match env.swap.switch_on(&file) {
            Ok(()) => {
                info!(card = %self.slot(), file = %file.display(), "swap on");
                self.set_swapping(env, true);
                true
            }
            Err(e) => {
                warn!(card = %self.slot(), error = %e, "could not turn swap on");
                self.set_swapping(env, false);
                if e.is_corrupted_swap() {
                    env.dialogs.show_note(&Notice::SwapFileCorrupted);
                }
                false
            }
        }
    }

    /// Turns swap off when it is safe. With `dialog` set, an unsafe
    /// switch-off asks the user to close applications; the answer is acted
    /// on the next time this runs.
    pub(crate) fn swap_off(&mut self, env: &mut Env, dialog: bool) {
        let Some(file) = self.swap_path() else {
            return;
        };
        if !env.swap.is_enabled(&file) {
            debug!(card = %self.slot(), "swap not on");
            self.close_swap_dialog(env);
            self.set_swapping(env, false);
            return;
        }
        if let Some(response) = self.swap_response.take() {
            debug!(card = %self.slot(), response, "closing applications as asked");
            if env.dialogs.broadcast_exit() && !self.wait_for_memory(env, &file) {
                error!(card = %self.slot(), "not enough memory to turn swap off");
            }
        }
        if !dialog {
            self.close_swap_dialog(env);
        }

        if env.swap.can_switch_off(&file) {
            if let Err(e) = env.swap.switch_off(&file) {
                warn!(card = %self.slot(), error = %e, "could not turn swap off");
            }
            if !env.swap.is_enabled(&file) {
                self.close_swap_dialog(env);
                self.set_swapping(env, false);
            }
        } else if dialog && self.swap_dialog.is_none() {
            debug!(card = %self.slot(), "swap cannot be turned off safely, asking");
            self.swap_dialog = env.dialogs.open_dialog(Severity::Warning, &Notice::SwapCardInUse);
        }
    }

    /// Turns swap off without the memory check.
    pub(crate) fn swap_off_nocheck(&mut self, env: &mut Env) -> bool {
        let Some(file) = self.swap_path() else {
            return true;
        };
        if !env.swap.is_enabled(&file) {
            self.set_swapping(env, false);
            return true;
        }
        match env.swap.switch_off(&file) {
            Ok(()) => {
                info!(card = %self.slot(), "swap off");
                self.set_swapping(env, false);
                true
            }
            Err(e) => {
                warn!(card = %self.slot(), error = %e, "could not turn swap off");
                false
            }
        }
    }

    /// Polls once a second until the swap file can go, for at most the
    /// configured number of seconds.
    fn wait_for_memory(&self, env: &mut Env, file: &Path) -> bool {
        for _ in 0..env.timing.ram_wait_secs {
            env.clock.sleep(Duration::from_secs(1));
            if env.swap.can_switch_off(file) {
                return true;
            }
        }
        false
    }

    /// Answers a disable-swap request.
    pub(crate) fn disable_swap(
        &mut self,
        close_apps: bool,
        env: &mut Env,
    ) -> std::result::Result<(), RequestError> {
        if close_apps {
            if !env.dialogs.broadcast_exit() {
                warn!(card = %self.slot(), "could not ask applications to exit");
                return Err(RequestError::Failure);
            }
            if let Some(file) = self.swap_path() {
                if !self.wait_for_memory(env, &file) {
                    error!(
                        card = %self.slot(),
                        secs = env.timing.ram_wait_secs,
                        "not enough memory to turn swap off"
                    );
                    return Err(RequestError::NotEnoughRam);
                }
            }
        }
        if self.swap_off_nocheck(env) {
            Ok(())
        } else {
            Err(RequestError::Failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWAPS: &str = "\
Filename\t\t\t\tType\t\tSize\tUsed\tPriority
/dev/zram0                              partition\t262140\t1024\t100
/media/mmc2/.swap                       file\t\t32748\t20000\t-1
";

    #[test]
    fn test_parse_swaps() {
        let usage = parse_swaps(SWAPS, Path::new("/media/mmc2/.swap")).unwrap();
        assert_eq!(usage, SwapUsage { size: 32748, used: 20000 });
        assert!(parse_swaps(SWAPS, Path::new("/media/mmc1/.swap")).is_none());
        assert!(parse_swaps("Filename Type Size Used Priority\n", Path::new("/x")).is_none());
    }

    #[test]
    fn test_parse_meminfo() {
        let mem = MemInfo::parse(
            "MemTotal:        3903436 kB\nMemFree:          512000 kB\nBuffers:            1000 kB\n\
             Cached:            2000 kB\nSwapFree:         100000 kB\nbogus line\n",
        );
        assert_eq!(mem.total, 3903436);
        assert_eq!(mem.free, 512000);
        assert_eq!(mem.buffers, 1000);
        assert_eq!(mem.cached, 2000);
        assert_eq!(mem.swap_free, 100000);
    }

    #[test]
    fn test_unused_swap_can_go() {
        let usage = SwapUsage { size: 1000, used: 0 };
        assert!(can_switch_off_from(usage, &MemInfo::default(), &LowMemLimits::default()));
    }

    #[test]
    fn test_other_swap_absorbs_pages() {
        let usage = SwapUsage { size: 1000, used: 100 };
        let mem = MemInfo {
            swap_free: 900 + 500,
            ..MemInfo::default()
        };
        assert!(can_switch_off_from(usage, &mem, &LowMemLimits::default()));
    }

    #[test]
    fn test_memory_pressure() {
        let usage = SwapUsage { size: 100_000, used: 50_000 };
        let limits = LowMemLimits::default();
        let tight = MemInfo {
            total: 256_000,
            free: 60_000,
            swap_free: 50_000,
            ..MemInfo::default()
        };
        assert!(!can_switch_off_from(usage, &tight, &limits));

        let roomy = MemInfo {
            free: 200_000,
            ..tight
        };
        assert!(can_switch_off_from(usage, &roomy, &limits));
    }

    #[test]
    fn test_system_swap_reads_proc() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("swaps"), SWAPS).unwrap();
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 256000 kB\nMemFree: 200000 kB\nSwapFree: 12748 kB\n",
        )
        .unwrap();
        let swap = SystemSwap::new(dir.path());
        let file = Path::new("/media/mmc2/.swap");
        assert!(swap.is_enabled(file));
        assert!(swap.can_switch_off(file));
        assert!(!swap.is_enabled(Path::new("/media/mmc1/.swap")));
        // Not listed means nothing to switch off.
        assert!(swap.can_switch_off(Path::new("/media/mmc1/.swap")));
    }

    #[test]
    fn test_swap_file_name() {
        assert_eq!(
            swap_file(Path::new("/home/user/MyDocs")),
            PathBuf::from("/home/user/MyDocs/.swap")
        );
    }
}
