use crate::session::Epoch;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Informational; the operator only dismisses it.
    Notice,
    /// The server is waiting for the operator to confirm or decline.
    Confirmation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub serial: u64,
    pub kind: AlertKind,
    pub message: String,
    /// Connection epoch the alert was raised under.
    pub link: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertResponse {
    Dismissed,
    Accepted,
    Declined,
}

/// Serializes operator prompts: at most one is open, the rest wait in
/// arrival order.
#[derive(Debug, Default)]
pub struct AlertCoalescer {
    open: Option<Alert>,
    queue: VecDeque<Alert>,
    next_serial: u64,
}

impl AlertCoalescer {
    /// Shows the alert if nothing is open, otherwise queues it. Returns true
    /// when the alert was opened right away.
    pub fn push(&mut self, kind: AlertKind, message: impl Into<String>, link: Epoch) -> bool {
        self.next_serial += 1;
        let alert = Alert {
            serial: self.next_serial,
            kind,
            message: message.into(),
            link,
        };
        if self.open.is_none() {
            self.open = Some(alert);
            true
        } else {
            self.queue.push_back(alert);
            false
        }
    }

    pub fn current(&self) -> Option<&Alert> {
        self.open.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Closes the open alert and opens the oldest queued one, if any.
    pub fn dismiss(&mut self) -> Option<Alert> {
        let closed = self.open.take()?;
        self.open = self.queue.pop_front();
        Some(closed)
    }
}
