//! Daemon mode: runs the coordinator and serves the control protocol.
//!
//! ## Security Model
//!
//! 1. On startup, generates a random secret and sends it to the controller via handshake
//! 2. All requests must include a valid HMAC-SHA256 signature
//! 3. Request IDs must be strictly increasing (anti-replay)
//! 4. Uses PR_SET_PDEATHSIG to terminate when the parent dies
//!
//! Stdin is read on a separate thread. The main thread owns the coordinator
//! and sleeps until the next line arrives or the next timer is due.

use std::error::Error as StdError;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;

use slotd_core::disk::SysfsRegistry;
use slotd_core::executor::{PrivilegeEscalation, SystemRunner};
use slotd_core::protocol::{
    Action, DaemonHandshake, DaemonRequest, DaemonResponse, encode_line, generate_secret,
};
use slotd_core::status::StatusBoard;
use slotd_core::swap::SystemSwap;
use slotd_core::timer::SystemClock;
use slotd_core::{Config, Coordinator, Services};
use tracing::{debug, error, info, warn};

use crate::gateway::LineGateway;

/// Outcome of authenticating one input line.
#[derive(Debug)]
enum Checked {
    Accepted(DaemonRequest),
    Rejected(DaemonResponse),
    Unparsable,
}

/// Per-connection authentication state.
struct Session {
    secret: Vec<u8>,
    last_id: u64,
}

impl Session {
    fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            last_id: 0,
        }
    }

    fn check(&mut self, line: &str) -> Checked {
        let request: DaemonRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                // Can't respond without an ID
                warn!(error = %e, "failed to parse request");
                return Checked::Unparsable;
            }
        };

        if request.id <= self.last_id {
            return Checked::Rejected(DaemonResponse::failed(
                request.id,
                format!("replayed request: id {} <= last id {}", request.id, self.last_id),
            ));
        }

        if !request.verify(&self.secret) {
            return Checked::Rejected(DaemonResponse::failed(
                request.id,
                "HMAC authentication failed",
            ));
        }

        self.last_id = request.id;
        Checked::Accepted(request)
    }
}

fn write_line(out: &mut impl Write, line: &str) -> io::Result<()> {
    writeln!(out, "{line}")?;
    out.flush()
}

fn write_response(out: &mut impl Write, response: &DaemonResponse) -> io::Result<()> {
    match encode_line(response) {
        Ok(line) => write_line(out, &line),
        Err(e) => {
            error!(error = %e, id = response.id, "failed to encode response");
            Ok(())
        }
    }
}

/// Forwards stdin lines to the main thread. The channel closes with stdin.
fn spawn_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

fn build_coordinator(config: &Config, escalation: PrivilegeEscalation) -> Result<Coordinator, Box<dyn StdError>> {
    let runner = SystemRunner::with_escalation(escalation);
    runner.ensure_available()?;
    let services = Services {
        registry: Box::new(SysfsRegistry::scan(config)?),
        runner: Box::new(runner),
        dialogs: Box::new(LineGateway::new(io::stdout())),
        status: Box::new(StatusBoard::with_dir(&config.daemon.state_dir)?),
        swap: Box::new(SystemSwap::default()),
        clock: Box::new(SystemClock::new()),
    };
    Ok(Coordinator::new(config, services))
}

/// Runs the daemon until `shutdown` or end of input.
pub fn run_daemon(
    config_path: Option<&Path>,
    escalation: PrivilegeEscalation,
) -> Result<(), Box<dyn StdError>> {
    // Set up parent death signal to prevent orphan processes.
    // When parent dies, this process receives SIGTERM.
    #[cfg(target_os = "linux")]
    {
        use nix::libc;
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        }
    }

    let config = Config::locate(config_path)?;
    let mut coordinator = build_coordinator(&config, escalation)?;

    let secret = generate_secret();
    let handshake = DaemonHandshake {
        secret: hex::encode(secret),
    };
    let mut stdout = io::stdout();
    write_line(&mut stdout, &encode_line(&handshake)?)?;

    coordinator.start();
    info!("daemon started");

    let lines = spawn_reader();
    let mut session = Session::new(&secret);

    loop {
        coordinator.fire_due_timers();

        let received = match coordinator.next_deadline() {
            Some(deadline) => lines.recv_timeout(deadline.saturating_sub(coordinator.now())),
            None => lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        let line = match received {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("input closed");
                break;
            }
        };

        let request = match session.check(&line) {
            Checked::Accepted(request) => request,
            Checked::Rejected(response) => {
                warn!(id = response.id, error = ?response.error, "request rejected");
                write_response(&mut stdout, &response)?;
                continue;
            }
            Checked::Unparsable => continue,
        };

        debug!(id = request.id, cmd = ?request.cmd, "request");
        let response = match request.cmd.into_action() {
            Ok(Action::Shutdown) => {
                write_response(&mut stdout, &DaemonResponse::ok(request.id))?;
                break;
            }
            Ok(Action::Dispatch(input)) => {
                DaemonResponse::from_reply(request.id, coordinator.handle(input))
            }
            Err(e) => DaemonResponse::failed(request.id, e.code()),
        };
        write_response(&mut stdout, &response)?;
    }

    coordinator.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use slotd_core::protocol::DaemonCommand;

    use super::*;

    fn line(secret: &[u8], id: u64, cmd: DaemonCommand) -> String {
        encode_line(&DaemonRequest::signed(secret, id, cmd).unwrap()).unwrap()
    }

    #[test]
    fn test_session_accepts_increasing_ids() {
        let secret = generate_secret();
        let mut session = Session::new(&secret);
        assert!(matches!(
            session.check(&line(&secret, 1, DaemonCommand::UsbEject)),
            Checked::Accepted(_)
        ));
        assert!(matches!(
            session.check(&line(&secret, 5, DaemonCommand::EnableCharging)),
            Checked::Accepted(_)
        ));
    }

    #[test]
    fn test_session_rejects_replay() {
        let secret = generate_secret();
        let mut session = Session::new(&secret);
        let first = line(&secret, 2, DaemonCommand::UsbEject);
        assert!(matches!(session.check(&first), Checked::Accepted(_)));
        match session.check(&first) {
            Checked::Rejected(response) => {
                assert_eq!(response.id, 2);
                assert!(!response.success);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_session_rejects_bad_signature() {
        let secret = generate_secret();
        let other = generate_secret();
        let mut session = Session::new(&secret);
        assert!(matches!(
            session.check(&line(&other, 1, DaemonCommand::Shutdown)),
            Checked::Rejected(_)
        ));
        // A rejected request does not consume its id.
        assert!(matches!(
            session.check(&line(&secret, 1, DaemonCommand::Shutdown)),
            Checked::Accepted(_)
        ));
        assert!(matches!(session.check("not json"), Checked::Unparsable));
    }

    #[test]
    fn test_write_response_line() {
        let mut out = Vec::new();
        write_response(&mut out, &DaemonResponse::ok(9)).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\"id\":9,\"success\":true}\n");
    }
}
