//! Command execution abstraction with privilege escalation support.
//!
//! Every helper program the daemon drives (mount scripts, the format and
//! check tools, the USB gadget scripts) goes through a [`CommandRunner`].
//! The runner waits synchronously and folds the process result into a
//! [`RunStatus`]; it never returns an error, since callers only need to
//! know which of the four outcomes happened.

use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Exit status of pkexec when the user dismissed the authentication dialog.
const PKEXEC_AUTH_CANCELLED: i32 = 126;

/// Result of running an external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The program ran and exited with this code.
    Exited(i32),
    /// The process could not be created.
    ForkFailed,
    /// The process was created but the program could not be executed.
    ExecFailed,
    /// The program was killed by a signal or otherwise did not exit normally.
    Abnormal,
}

impl RunStatus {
    /// True when the program exited with status 0.
    pub fn success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }

    /// Exit code, if the program exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            RunStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Runs an external program and waits for it to finish.
pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[&str]) -> RunStatus;
}

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    /// Wrapper program, if any.
    pub fn wrapper(&self) -> Option<&'static str> {
        match self {
            PrivilegeEscalation::None => None,
            PrivilegeEscalation::Pkexec => Some("pkexec"),
            PrivilegeEscalation::Sudo => Some("sudo"),
        }
    }
}

/// [`CommandRunner`] that spawns real processes.
///
/// The daemon normally runs as root and uses [`PrivilegeEscalation::None`].
/// When it is started from an unprivileged session the helpers can be
/// wrapped with `sudo` or `pkexec` instead.
///
/// # Example
///
/// ```
/// use slotd_core::executor::{PrivilegeEscalation, SystemRunner};
///
/// let runner = SystemRunner::default();
/// assert_eq!(runner.escalation(), PrivilegeEscalation::None);
///
/// let tty = SystemRunner::with_escalation(PrivilegeEscalation::Sudo);
/// assert_eq!(tty.escalation(), PrivilegeEscalation::Sudo);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    escalation: PrivilegeEscalation,
}

impl SystemRunner {
    /// Creates a runner with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Checks that the escalation wrapper can be found on `PATH`.
    pub fn ensure_available(&self) -> Result<()> {
        let Some(tool) = self.escalation.wrapper() else {
            return Ok(());
        };
        let found = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
            .unwrap_or(false);
        if found {
            Ok(())
        } else {
            Err(Error::EscalationToolNotFound {
                tool: tool.to_string(),
            })
        }
    }

    fn command(&self, program: &Path, args: &[&str]) -> Command {
        let mut command = match self.escalation.wrapper() {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.arg(program);
                command
            }
            None => Command::new(program),
        };
        command.args(args).stdin(Stdio::null());
        command
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[&str]) -> RunStatus {
        debug!(program = %program.display(), ?args, "running helper");

        let status = match self.command(program, args).status() {
            Ok(status) => status,
            Err(e) => {
                warn!(program = %program.display(), error = %e, "failed to start helper");
                return spawn_failure(e.kind());
            }
        };

        match status.code() {
            Some(PKEXEC_AUTH_CANCELLED) if self.escalation == PrivilegeEscalation::Pkexec => {
                warn!(program = %program.display(), "authentication cancelled by user");
                RunStatus::Exited(PKEXEC_AUTH_CANCELLED)
            }
            Some(code) => RunStatus::Exited(code),
            None => {
                warn!(program = %program.display(), "helper terminated abnormally");
                RunStatus::Abnormal
            }
        }
    }
}

/// Maps a spawn error to the fork/exec distinction.
fn spawn_failure(kind: ErrorKind) -> RunStatus {
    match kind {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => RunStatus::ExecFailed,
        _ => RunStatus::ForkFailed,
    }
}
