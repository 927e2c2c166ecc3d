//! Dialog gateway that writes notifications as protocol lines.

use std::io::Write;

use slotd_core::dialog::{DialogGateway, DialogId, Notice, Severity};
use slotd_core::protocol::{DaemonNotification, NoticeBody, Notification, encode_line};
use tracing::{debug, error};

/// Sends every dialog request to the controller on the other end of the
/// protocol stream. Dialog ids are allocated here.
pub struct LineGateway<W: Write> {
    out: W,
    next_id: u32,
}

impl<W: Write> LineGateway<W> {
    pub fn new(out: W) -> Self {
        Self { out, next_id: 0 }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn send(&mut self, notification: Notification) -> bool {
        let line = match encode_line(&DaemonNotification::from(notification)) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to encode notification");
                return false;
            }
        };
        match writeln!(self.out, "{line}").and_then(|()| self.out.flush()) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to write notification");
                false
            }
        }
    }
}

impl<W: Write> DialogGateway for LineGateway<W> {
    fn open_dialog(&mut self, severity: Severity, notice: &Notice) -> Option<DialogId> {
        self.next_id += 1;
        let dialog = DialogId(self.next_id);
        debug!(dialog = dialog.0, message = notice.message_id(), "open dialog");
        self.send(Notification::OpenDialog {
            dialog,
            severity,
            body: NoticeBody::from(notice),
        })
        .then_some(dialog)
    }

    fn close_dialog(&mut self, dialog: DialogId) {
        self.send(Notification::CloseDialog { dialog });
    }

    fn show_banner(&mut self, notice: &Notice) {
        self.send(Notification::Banner {
            body: NoticeBody::from(notice),
        });
    }

    fn show_note(&mut self, notice: &Notice) {
        self.send(Notification::Note {
            body: NoticeBody::from(notice),
        });
    }

    fn broadcast_exit(&mut self) -> bool {
        self.send(Notification::BroadcastExit)
    }
}
