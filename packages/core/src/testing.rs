//! Test doubles shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use snafu::ResultExt;

use crate::card::{Card, CardEvent};
use crate::config::{CardConfig, Timing};
use crate::context::{Env, UsbView};
use crate::dialog::{DialogGateway, DialogId, Notice, Severity};
use crate::error::{Result, SwapOffSnafu, SwapOnSnafu};
use crate::event::{Reply, TimerEvent};
use crate::executor::{CommandRunner, RunStatus};
use crate::mount::{HelperPaths, Helpers};
use crate::registry::{Capability, DeviceId, DeviceRecord, MemoryRegistry, Prop};
use crate::slot::Slot;
use crate::status::StatusBoard;
use crate::swap::SwapControl;
use crate::timer::{Clock, TimerQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct RunnerState {
    calls: Vec<Call>,
    exits: HashMap<PathBuf, i32>,
    scripted: HashMap<PathBuf, VecDeque<RunStatus>>,
}

/// Records invocations and answers with configured exit codes (0 unless
/// told otherwise). Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeRunner {
    state: Rc<RefCell<RunnerState>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exit(&self, program: &Path, code: i32) {
        self.state.borrow_mut().exits.insert(program.to_path_buf(), code);
    }

    /// Queues a one-shot result for `program`, used before the fixed exit.
    pub fn push_status(&self, program: &Path, status: RunStatus) {
        self.state
            .borrow_mut()
            .scripted
            .entry(program.to_path_buf())
            .or_default()
            .push_back(status);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, program: &Path) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.program == program)
            .count()
    }

    pub fn clear(&self) {
        self.state.borrow_mut().calls.clear();
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &Path, args: &[&str]) -> RunStatus {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call {
            program: program.to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });
        if let Some(status) = state.scripted.get_mut(program).and_then(VecDeque::pop_front) {
            return status;
        }
        RunStatus::Exited(state.exits.get(program).copied().unwrap_or(0))
    }
}

#[derive(Debug, Default)]
pub struct DialogLog {
    next_id: u32,
    pub open: Vec<(DialogId, Severity, Notice)>,
    pub closed: Vec<DialogId>,
    pub banners: Vec<Notice>,
    pub notes: Vec<Notice>,
    pub exit_broadcasts: usize,
    pub refuse_exit: bool,
}

/// Dialog gateway that remembers everything. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingDialogs {
    log: Rc<RefCell<DialogLog>>,
}

impl RecordingDialogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices of the dialogs currently open.
    pub fn open_notices(&self) -> Vec<Notice> {
        self.log.borrow().open.iter().map(|(_, _, n)| n.clone()).collect()
    }

    pub fn open_ids(&self) -> Vec<DialogId> {
        self.log.borrow().open.iter().map(|(id, _, _)| *id).collect()
    }

    pub fn banners(&self) -> Vec<Notice> {
        self.log.borrow().banners.clone()
    }

    pub fn notes(&self) -> Vec<Notice> {
        self.log.borrow().notes.clone()
    }

    pub fn exit_broadcasts(&self) -> usize {
        self.log.borrow().exit_broadcasts
    }

    /// Makes later exit broadcasts fail.
    pub fn refuse_exit(&self) {
        self.log.borrow_mut().refuse_exit = true;
    }

    /// Simulates the user dismissing a dialog.
    pub fn dismiss(&self, id: DialogId) {
        self.log.borrow_mut().open.retain(|(open, _, _)| *open != id);
    }
}

impl DialogGateway for RecordingDialogs {
    fn open_dialog(&mut self, severity: Severity, notice: &Notice) -> Option<DialogId> {
        let mut log = self.log.borrow_mut();
        log.next_id += 1;
        let id = DialogId(log.next_id);
        log.open.push((id, severity, notice.clone()));
        Some(id)
    }

    fn close_dialog(&mut self, id: DialogId) {
        let mut log = self.log.borrow_mut();
        log.open.retain(|(open, _, _)| *open != id);
        log.closed.push(id);
    }

    fn show_banner(&mut self, notice: &Notice) {
        self.log.borrow_mut().banners.push(notice.clone());
    }

    fn show_note(&mut self, notice: &Notice) {
        self.log.borrow_mut().notes.push(notice.clone());
    }

    fn broadcast_exit(&mut self) -> bool {
        let mut log = self.log.borrow_mut();
        log.exit_broadcasts += 1;
        !log.refuse_exit
    }
}

/// Manually advanced clock; `sleep` advances it too.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Default)]
struct SwapState {
    enabled: BTreeSet<PathBuf>,
    /// `can_switch_off` answers false this many more times.
    blocked_checks: u32,
    refuse_on: Option<Errno>,
}

/// Swap backend keeping state in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeSwap {
    state: Rc<RefCell<SwapState>>,
}

impl FakeSwap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self, file: &Path) -> bool {
        self.state.borrow().enabled.contains(file)
    }

    pub fn block_checks(&self, times: u32) {
        self.state.borrow_mut().blocked_checks = times;
    }

    pub fn refuse_on(&self, errno: Errno) {
        self.state.borrow_mut().refuse_on = Some(errno);
    }
}

impl SwapControl for FakeSwap {
    fn is_enabled(&self, file: &Path) -> bool {
        self.is_on(file)
    }

    fn can_switch_off(&self, _file: &Path) -> bool {
        let mut state = self.state.borrow_mut();
        if state.blocked_checks > 0 {
            state.blocked_checks -= 1;
            false
        } else {
            true
        }
    }

    fn switch_on(&mut self, file: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.refuse_on {
            return Err(errno).context(SwapOnSnafu { path: file });
        }
        state.enabled.insert(file.to_path_buf());
        Ok(())
    }

    fn switch_off(&mut self, file: &Path) -> Result<()> {
        if !self.state.borrow_mut().enabled.remove(file) {
            return Err(Errno::EINVAL).context(SwapOffSnafu { path: file });
        }
        Ok(())
    }
}

/// Fakes for every collaborator a state machine needs.
pub struct Harness {
    /// Scratch space for mount points and label files.
    pub dir: tempfile::TempDir,
    pub registry: MemoryRegistry,
    pub paths: HelperPaths,
    pub runner: FakeRunner,
    pub dialogs: RecordingDialogs,
    pub status: StatusBoard,
    pub swap: FakeSwap,
    pub clock: FakeClock,
    pub timers: TimerQueue<TimerEvent>,
    pub timing: Timing,
    pub usb: UsbView,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temporary directory"),
            registry: MemoryRegistry::new(),
            paths: HelperPaths::default(),
            runner: FakeRunner::new(),
            dialogs: RecordingDialogs::new(),
            status: StatusBoard::in_memory(),
            swap: FakeSwap::new(),
            clock: FakeClock::new(),
            timers: TimerQueue::new(),
            timing: Timing::default(),
            usb: UsbView::default(),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(&mut self) -> Env<'_> {
        Env {
            registry: &self.registry,
            helpers: Helpers::new(&self.paths, &self.runner),
            dialogs: &mut self.dialogs,
            status: &mut self.status,
            swap: &mut self.swap,
            clock: &self.clock,
            timers: &mut self.timers,
            timing: &self.timing,
            usb: self.usb,
        }
    }

    pub fn dispatch(&mut self, card: &mut Card, event: CardEvent) -> Reply {
        let mut env = self.env();
        card.handle(event, &mut env)
    }

    /// Advances the clock and returns the timers that came due.
    pub fn advance(&mut self, by: Duration) -> Vec<TimerEvent> {
        self.clock.advance(by);
        let now = self.clock.now();
        let mut fired = Vec::new();
        while let Some((_, event)) = self.timers.pop_due(now) {
            fired.push(event);
        }
        fired
    }

    /// Adds a card slot with a storage and `volumes` FAT partitions, the
    /// cover closed. Returns the host id.
    pub fn add_card(&self, slot: Slot, disk: &str, volumes: u32) -> DeviceId {
        let host = DeviceId::new(format!("host:{disk}"));
        self.registry.insert(
            host.clone(),
            DeviceRecord::new()
                .with_capability(Capability::CardHost)
                .with_prop(Prop::SlotName, format!("slot:{}", slot.name()))
                .with_prop(Prop::ButtonState, true),
        );
        self.add_storage(&host, disk);
        for n in 1..=volumes {
            self.add_volume(disk, n);
        }
        host
    }

    pub fn add_storage(&self, host: &DeviceId, disk: &str) {
        self.registry.insert(
            disk,
            DeviceRecord::new()
                .with_capability(Capability::Storage)
                .with_parent(host)
                .with_prop(Prop::BlockDevice, format!("/dev/{disk}")),
        );
    }

    pub fn add_volume(&self, disk: &str, number: u32) -> DeviceId {
        let id = DeviceId::new(format!("{disk}p{number}"));
        self.registry.insert(
            id.clone(),
            DeviceRecord::new()
                .with_capability(Capability::Volume)
                .with_parent(&DeviceId::new(disk))
                .with_prop(Prop::BlockDevice, format!("/dev/{disk}p{number}"))
                .with_prop(Prop::StorageDevice, disk)
                .with_prop(Prop::IsPartition, true)
                .with_prop(Prop::PartitionNumber, i64::from(number))
                .with_prop(Prop::FsType, "vfat"),
        );
        id
    }

    /// A card initialised against the registry, with its mount point and
    /// label file in the scratch directory.
    pub fn card(&mut self, slot: Slot, host: &DeviceId) -> Card {
        let dir = self.dir.path();
        let config = CardConfig {
            mount_point: Some(dir.join(slot.name())),
            label_file: Some(dir.join(format!("{}.label", slot.name()))),
            ..CardConfig::new(slot)
        };
        let mut card = Card::new(host.clone(), &config);
        let mut env = self.env();
        card.init(&mut env);
        card
    }
}
