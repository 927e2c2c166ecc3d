//! Control protocol spoken by `slotd daemon` over stdin/stdout.
//!
//! Messages are JSON lines. The daemon opens the session with a
//! [`DaemonHandshake`], then answers every [`DaemonRequest`] with exactly
//! one [`DaemonResponse`]. Dialog traffic flows the other way as
//! [`DaemonNotification`]s.
//!
//! ## Security Model
//!
//! The protocol uses HMAC-SHA256 signing to prevent unauthorized command injection:
//! 1. Daemon generates a random 32-byte secret on startup and sends it to the controller
//! 2. Each request includes an HMAC signature: `HMAC-SHA256(secret, id || cmd_json)`
//! 3. Daemon verifies signature and rejects requests with invalid signatures
//! 4. Request IDs must be strictly increasing to prevent replay attacks

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::ResultExt;

use crate::dialog::{DialogId, Notice, Severity};
use crate::error::{ProtocolEncodeSnafu, RequestError, Result};
use crate::event::{Input, Reply, Request};
use crate::slot::Slot;

type HmacSha256 = Hmac<Sha256>;

/// Secret length in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Generates a random secret for HMAC signing.
pub fn generate_secret() -> [u8; SECRET_LENGTH] {
    let mut rng = rand::rng();
    let mut secret = [0u8; SECRET_LENGTH];
    rng.fill(&mut secret);
    secret
}

/// Computes the hex HMAC-SHA256 of a request. `None` only if the key is
/// rejected, which HMAC never does.
pub fn compute_hmac(secret: &[u8], id: u64, payload: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(&id.to_le_bytes());
    mac.update(payload.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies HMAC-SHA256 signature for a request.
pub fn verify_hmac(secret: &[u8], id: u64, payload: &str, signature: &str) -> bool {
    compute_hmac(secret, id, payload).is_some_and(|expected| constant_time_eq(&expected, signature))
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Serializes one protocol line, without the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).context(ProtocolEncodeSnafu)
}

/// First message of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonHandshake {
    /// Hex-encoded secret for HMAC signing.
    pub secret: String,
}

/// Request sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    /// Request ID (must be strictly increasing).
    pub id: u64,
    /// HMAC-SHA256 signature of (id || cmd_json).
    pub hmac: String,
    #[serde(flatten)]
    pub cmd: DaemonCommand,
}

impl DaemonRequest {
    /// Builds a request signed with `secret`.
    pub fn signed(secret: &[u8], id: u64, cmd: DaemonCommand) -> Result<Self> {
        let payload = encode_line(&cmd)?;
        Ok(Self {
            id,
            hmac: compute_hmac(secret, id, &payload).unwrap_or_default(),
            cmd,
        })
    }

    /// Checks the signature against the canonical encoding of `cmd`.
    pub fn verify(&self, secret: &[u8]) -> bool {
        match encode_line(&self.cmd) {
            Ok(payload) => verify_hmac(secret, self.id, &payload, &self.hmac),
            Err(_) => false,
        }
    }
}

/// Commands understood by the daemon.
///
/// Arguments are optional on the wire so that a missing one can be
/// answered with `no_argument` instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonCommand {
    Rename {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Format {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Repair {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
    },
    Check {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
    },
    /// `slot` is `internal` or `external`, optionally prefixed `slot:`.
    EnableSwap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<String>,
    },
    DisableSwap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<String>,
        #[serde(default)]
        close_apps: bool,
    },
    UsbEject,
    UsbCancelEject,
    EnablePcsuite,
    EnableMassStorage,
    EnableCharging,
    /// The user dismissed a dialog.
    NotificationClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dialog: Option<DialogId>,
    },
    /// The user pressed a dialog button.
    ActionInvoked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dialog: Option<DialogId>,
        #[serde(default)]
        action: String,
    },
    DeviceLock {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked: Option<bool>,
    },
    /// Unmount everything and exit.
    Shutdown,
}

/// What the daemon loop does with a decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Dispatch(Input),
    Shutdown,
}

fn required<T>(value: Option<T>) -> std::result::Result<T, RequestError> {
    value.ok_or(RequestError::NoArgument)
}

fn slot_arg(slot: Option<String>) -> std::result::Result<Slot, RequestError> {
    Slot::from_name(&required(slot)?).ok_or(RequestError::BadDeviceName)
}

impl DaemonCommand {
    /// Converts to a coordinator input, checking arguments.
    pub fn into_action(self) -> std::result::Result<Action, RequestError> {
        let request = match self {
            DaemonCommand::Rename { device, label } => Request::Rename {
                device: required(device)?,
                label: required(label)?,
            },
            DaemonCommand::Format { device, label } => Request::Format {
                device: required(device)?,
                label: required(label)?,
            },
            DaemonCommand::Repair { device } => Request::Repair {
                device: required(device)?,
            },
            DaemonCommand::Check { device } => Request::Check {
                device: required(device)?,
            },
            DaemonCommand::EnableSwap { slot } => Request::EnableSwap {
                slot: slot_arg(slot)?,
            },
            DaemonCommand::DisableSwap { slot, close_apps } => Request::DisableSwap {
                slot: slot_arg(slot)?,
                close_apps,
            },
            DaemonCommand::UsbEject => Request::UsbEject,
            DaemonCommand::UsbCancelEject => Request::UsbCancelEject,
            DaemonCommand::EnablePcsuite => Request::EnablePcsuite,
            DaemonCommand::EnableMassStorage => Request::EnableMassStorage,
            DaemonCommand::EnableCharging => Request::EnableCharging,
            DaemonCommand::NotificationClosed { dialog } => {
                return Ok(Action::Dispatch(Input::NotificationClosed(required(dialog)?)));
            }
            DaemonCommand::ActionInvoked { dialog, action } => {
                return Ok(Action::Dispatch(Input::ActionInvoked {
                    dialog: required(dialog)?,
                    action,
                }));
            }
            DaemonCommand::DeviceLock { locked } => {
                return Ok(Action::Dispatch(Input::DeviceLock {
                    locked: required(locked)?,
                }));
            }
            DaemonCommand::Shutdown => return Ok(Action::Shutdown),
        };
        Ok(Action::Dispatch(Input::Request(request)))
    }
}

/// Response from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    pub success: bool,
    /// Error code (`in_use`, `no_argument`, ...) or a rejection message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
        }
    }

    /// Response for a dispatched input. Inputs that are not requests have
    /// no reply and always succeed.
    pub fn from_reply(id: u64, reply: Option<Reply>) -> Self {
        match reply {
            Some(Err(e)) => Self::failed(id, e.code()),
            Some(Ok(())) | None => Self::ok(id),
        }
    }
}

/// What a notice looks like on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeBody {
    /// Message id, localized by the receiver.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

impl From<&Notice> for NoticeBody {
    fn from(notice: &Notice) -> Self {
        Self {
            message: notice.message_id().to_string(),
            button: notice.button().map(str::to_string),
            params: notice.params(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    OpenDialog {
        dialog: DialogId,
        severity: Severity,
        #[serde(flatten)]
        body: NoticeBody,
    },
    CloseDialog {
        dialog: DialogId,
    },
    Banner {
        #[serde(flatten)]
        body: NoticeBody,
    },
    Note {
        #[serde(flatten)]
        body: NoticeBody,
    },
    BroadcastExit,
}

/// Outbound line: `{"notify": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonNotification {
    pub notify: Notification,
}

impl From<Notification> for DaemonNotification {
    fn from(notify: Notification) -> Self {
        Self { notify }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sign_and_verify() {
        let secret = generate_secret();
        let id = 1u64;
        let payload = r#"{"cmd":"repair","device":"/dev/mmcblk1"}"#;

        let signature = compute_hmac(&secret, id, payload).unwrap();
        assert!(verify_hmac(&secret, id, payload, &signature));

        // Wrong secret should fail
        let wrong_secret = generate_secret();
        assert!(!verify_hmac(&wrong_secret, id, payload, &signature));

        // Wrong id should fail
        assert!(!verify_hmac(&secret, 2, payload, &signature));

        // Wrong payload should fail
        assert!(!verify_hmac(&secret, id, "wrong", &signature));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn test_signed_request_line() {
        let secret = generate_secret();
        let cmd = DaemonCommand::Format {
            device: Some("/dev/mmcblk1".to_string()),
            label: Some("PHOTOS".to_string()),
        };
        let request = DaemonRequest::signed(&secret, 7, cmd.clone()).unwrap();
        let line = encode_line(&request).unwrap();

        let parsed: DaemonRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.cmd, cmd);
        assert!(parsed.verify(&secret));

        let tampered = DaemonRequest {
            cmd: DaemonCommand::Format {
                device: Some("/dev/mmcblk0".to_string()),
                label: Some("PHOTOS".to_string()),
            },
            ..parsed
        };
        assert!(!tampered.verify(&secret));
    }

    #[test]
    fn test_parse_commands() {
        let request: DaemonRequest =
            serde_json::from_str(r#"{"id":3,"hmac":"00","cmd":"disable_swap","slot":"internal"}"#)
                .unwrap();
        assert_eq!(
            request.cmd.into_action(),
            Ok(Action::Dispatch(Input::Request(Request::DisableSwap {
                slot: Slot::Internal,
                close_apps: false,
            })))
        );

        let lock: DaemonCommand = serde_json::from_str(r#"{"cmd":"device_lock","locked":true}"#).unwrap();
        assert_eq!(
            lock.into_action(),
            Ok(Action::Dispatch(Input::DeviceLock { locked: true }))
        );

        let closed: DaemonCommand =
            serde_json::from_str(r#"{"cmd":"notification_closed","dialog":4}"#).unwrap();
        assert_eq!(
            closed.into_action(),
            Ok(Action::Dispatch(Input::NotificationClosed(DialogId(4))))
        );

        let shutdown: DaemonCommand = serde_json::from_str(r#"{"cmd":"shutdown"}"#).unwrap();
        assert_eq!(shutdown.into_action(), Ok(Action::Shutdown));
    }

    #[test]
    fn test_missing_and_bad_arguments() {
        let rename: DaemonCommand =
            serde_json::from_str(r#"{"cmd":"rename","device":"/dev/mmcblk0"}"#).unwrap();
        assert_eq!(rename.into_action(), Err(RequestError::NoArgument));

        let check: DaemonCommand = serde_json::from_str(r#"{"cmd":"check"}"#).unwrap();
        assert_eq!(check.into_action(), Err(RequestError::NoArgument));

        let swap: DaemonCommand =
            serde_json::from_str(r#"{"cmd":"enable_swap","slot":"sd"}"#).unwrap();
        assert_eq!(swap.into_action(), Err(RequestError::BadDeviceName));

        let prefixed: DaemonCommand =
            serde_json::from_str(r#"{"cmd":"enable_swap","slot":"slot:external"}"#).unwrap();
        assert_eq!(
            prefixed.into_action(),
            Ok(Action::Dispatch(Input::Request(Request::EnableSwap {
                slot: Slot::External
            })))
        );
    }

    #[test]
    fn test_response_from_reply() {
        assert_eq!(DaemonResponse::from_reply(1, None), DaemonResponse::ok(1));
        assert_eq!(DaemonResponse::from_reply(2, Some(Ok(()))), DaemonResponse::ok(2));
        let failed = DaemonResponse::from_reply(3, Some(Err(RequestError::InUse)));
        assert_eq!(
            encode_line(&failed).unwrap(),
            r#"{"id":3,"success":false,"error":"in_use"}"#
        );
    }

    #[test]
    fn test_notification_shape() {
        let notice = Notice::UsbCannotEject("Cruzer".to_string());
        let line = encode_line(&DaemonNotification::from(Notification::OpenDialog {
            dialog: DialogId(2),
            severity: Severity::Warning,
            body: NoticeBody::from(&notice),
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["notify"]["kind"], "open_dialog");
        assert_eq!(value["notify"]["dialog"], 2);
        assert_eq!(value["notify"]["severity"], "warning");
        assert_eq!(value["notify"]["message"], "stab_me_usb_cannot_eject");
        assert_eq!(value["notify"]["button"], "stab_me_usb_cannot_eject_ok");
        assert_eq!(value["notify"]["params"][0], "Cruzer");

        let exit = encode_line(&DaemonNotification::from(Notification::BroadcastExit)).unwrap();
        assert_eq!(exit, r#"{"notify":{"kind":"broadcast_exit"}}"#);
    }
}
