use crate::commands::{parse_command, Command, HELP};
use crate::config::ConfirmMode;
use crate::link::{LinkChannel, LinkEvent};
use fcc_core::wire::WireMsg;
use fcc_core::Port;
use fcc_sync::{
    AlertKind, AlertResponse, CallId, DeviceAction, GlobalAction, Session, Slot, SyncError,
};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Owns the session and feeds it every event the console sees.
pub struct Console<W> {
    session: Session,
    link: Option<LinkChannel>,
    confirm: ConfirmMode,
    out: W,
    announced: Option<u64>,
}

impl<W: Write> Console<W> {
    pub fn new(session: Session, confirm: ConfirmMode, out: W) -> Self {
        Self {
            session,
            link: None,
            confirm,
            out,
            announced: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn say(&mut self, line: impl Display) {
        let _ = writeln!(self.out, "{line}");
        let _ = self.out.flush();
    }

    fn is_current(&self, link: u64) -> bool {
        self.link.as_ref().map(LinkChannel::link) == Some(link)
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connecting { link, channel } => {
                self.link = Some(channel.clone());
                self.session.begin_connect(Box::new(channel));
                debug!(event = "console_connecting", link);
            }
            LinkEvent::Ready {
                link,
                server_id,
                motd,
            } => {
                if !self.is_current(link) {
                    return;
                }
                self.say(format_args!("connected to {server_id}"));
                if let Some(motd) = motd {
                    self.say(motd);
                }
                if let Err(err) = self.session.handshake_complete() {
                    self.fail(err);
                }
            }
            LinkEvent::Message { link, msg } => {
                if !self.is_current(link) {
                    debug!(event = "stale_link_frame", link, kind = msg.kind());
                    return;
                }
                self.on_message(msg);
            }
            LinkEvent::Disconnected { link, reason } => {
                if !self.is_current(link) {
                    return;
                }
                self.link = None;
                self.session.channel_lost();
                self.say(format_args!("disconnected: {reason}"));
            }
        }
    }

    fn on_message(&mut self, msg: WireMsg) {
        let result = match msg {
            WireMsg::Reply(reply) => self.session.handle_reply(CallId(reply.id), reply.result),
            WireMsg::Notify(notify) => self.session.handle_notification(&notify.name, &notify.args),
            WireMsg::Error(error) => Err(self.session.remote_error(&error.code, &error.message)),
            other => {
                debug!(event = "console_unexpected_frame", kind = other.kind());
                Ok(())
            }
        };
        if let Err(err) = result {
            // Protocol errors were already logged by the session.
            if err.is_channel_failure() {
                self.fail(err);
            }
        }
    }

    fn on_poll_timer(&mut self) {
        if let Err(err) = self.session.on_poll_timer(Instant::now()) {
            self.fail(err);
        }
    }

    /// A failed call or an error frame ends the connection; the link task
    /// reconnects on its own.
    fn fail(&mut self, err: SyncError) {
        if err.is_channel_failure() {
            warn!(event = "console_link_failure", error = %err);
            self.session.channel_lost();
            if let Some(link) = self.link.take() {
                link.close();
            }
        } else {
            warn!(event = "console_error", error = %err);
        }
    }

    /// Prints the open alert once. Notices close immediately; confirmations
    /// wait for the operator unless the console answers them itself.
    fn surface_alerts(&mut self) {
        loop {
            let Some(alert) = self.session.alert() else {
                return;
            };
            if self.announced == Some(alert.serial) {
                return;
            }
            let alert = alert.clone();
            self.announced = Some(alert.serial);
            let response = match (alert.kind, self.confirm) {
                (AlertKind::Notice, _) => {
                    self.say(format_args!("[notice] {}", alert.message));
                    AlertResponse::Dismissed
                }
                (AlertKind::Confirmation, ConfirmMode::Ask) => {
                    self.say(format_args!("[confirm] {} (yes/no)", alert.message));
                    return;
                }
                (AlertKind::Confirmation, ConfirmMode::Accept) => {
                    self.say(format_args!("[confirm] {} -> accepted", alert.message));
                    AlertResponse::Accepted
                }
                (AlertKind::Confirmation, ConfirmMode::Decline) => {
                    self.say(format_args!("[confirm] {} -> declined", alert.message));
                    AlertResponse::Declined
                }
            };
            if let Err(err) = self.session.answer_alert(response) {
                self.fail(err);
            }
        }
    }

    fn on_line(&mut self, line: &str) -> Flow {
        match parse_command(line) {
            Ok(Some(command)) => self.on_command(command),
            Ok(None) => Flow::Continue,
            Err(err) => {
                self.say(err);
                Flow::Continue
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Flow {
        let result = match command {
            Command::Quit => return Flow::Quit,
            Command::Help => {
                self.say(HELP);
                Ok(())
            }
            Command::Ports => {
                self.print_ports();
                Ok(())
            }
            Command::Status => {
                self.print_status();
                Ok(())
            }
            Command::Temps => self.print_temps(),
            Command::Select(text) => {
                let port = self.resolve_port(&text);
                self.session.select(&port)
            }
            Command::Home => self.perform(DeviceAction::HomeAll),
            Command::Pause(paused) => self.perform(DeviceAction::Pause(paused)),
            Command::SetTemp { slot, target } => {
                self.perform(DeviceAction::SetTarget { slot, target })
            }
            Command::Goto { axis, position } => self.perform(DeviceAction::Goto {
                positions: BTreeMap::from([(axis, position)]),
                extruder: None,
            }),
            Command::Detect(text) => self
                .target_port(text)
                .and_then(|port| self.session.perform_global(GlobalAction::Detect(port)))
                .map(drop),
            Command::Disable(text) => self
                .target_port(text)
                .and_then(|port| self.session.perform_global(GlobalAction::Disable(port)))
                .map(drop),
            Command::Answer(accept) => {
                let response = if accept {
                    AlertResponse::Accepted
                } else {
                    AlertResponse::Declined
                };
                match self.session.answer_alert(response) {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => {
                        self.say("nothing to answer");
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = result {
            self.say(format_args!("error: {err}"));
            self.fail(err);
        }
        Flow::Continue
    }

    /// Typed text names a known port when one matches; otherwise it is
    /// read as a number or a name.
    fn resolve_port(&self, text: &str) -> Port {
        match self.session.registry().find(text) {
            Some(port) => port.clone(),
            None => match text.parse::<Port>() {
                Ok(port) => port,
                Err(never) => match never {},
            },
        }
    }

    fn target_port(&self, text: Option<String>) -> Result<Port, SyncError> {
        match text {
            Some(text) => Ok(self.resolve_port(&text)),
            None => self.session.selected().cloned().ok_or_else(|| {
                SyncError::ActionUnavailable("no port selected".to_string())
            }),
        }
    }

    /// Device actions target the selected port; replies are not awaited.
    fn perform(&mut self, action: DeviceAction) -> Result<(), SyncError> {
        let port = self.target_port(None)?;
        self.session.perform(&port, action).map(drop)
    }

    fn print_ports(&mut self) {
        let selected = self.session.selected().cloned();
        let lines: Vec<String> = self
            .session
            .registry()
            .ports()
            .map(|port| {
                let slot = match self.session.registry().slot(port) {
                    Slot::Attached(device) => format!("attached  {}", device.fields().name),
                    Slot::Empty => "empty".to_string(),
                    Slot::Absent => "absent".to_string(),
                };
                let marker = if selected.as_ref() == Some(port) { "*" } else { " " };
                format!("{marker} {port}  {slot}")
            })
            .collect();
        if lines.is_empty() {
            self.say("no ports");
        }
        for line in lines {
            self.say(line);
        }
    }

    fn print_status(&mut self) {
        let mut line = format!("link {}", self.session.state().as_str());
        match (self.session.selected(), self.session.selected_device()) {
            (Some(port), Some(device)) => {
                let fields = device.fields();
                line.push_str(&format!(
                    "  port {port}  device '{}'  printing {}  paused {}",
                    fields.name,
                    device.printing(),
                    fields.paused
                ));
            }
            (Some(port), None) => line.push_str(&format!("  port {port}  no device")),
            (None, _) => line.push_str("  nothing selected"),
        }
        line.push_str(&format!(
            "  calls {}  prompts {}",
            self.session.pending_calls(),
            self.session.queued_alerts() + usize::from(self.session.alert().is_some())
        ));
        self.say(line);
    }

    fn print_temps(&mut self) -> Result<(), SyncError> {
        let Some(device) = self.session.selected_device() else {
            return Err(SyncError::ActionUnavailable(
                "no device on the selected port".to_string(),
            ));
        };
        let extruders = device
            .extruders()
            .iter()
            .enumerate()
            .map(|(index, extruder)| (format!("e{index}"), &extruder.temp));
        let temps = device
            .temps()
            .iter()
            .enumerate()
            .map(|(index, temp)| (format!("t{index}"), temp));
        let lines: Vec<String> = extruders
            .chain(temps)
            .map(|(slot, temp)| {
                format!(
                    "{slot}  {}  target {}",
                    reading(temp.current),
                    reading(temp.target)
                )
            })
            .collect();
        for line in lines {
            self.say(line);
        }
        Ok(())
    }

    fn log_status(&self) {
        info!(
            event = "console_status",
            link = self.session.state().as_str(),
            ports = self.session.registry().len(),
            selected = self.session.selected().map(|port| port.to_string()),
            pending = self.session.pending_calls(),
            polling = self.session.poll_deadline().is_some()
        );
    }
}

fn reading(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.1}"),
        None => "-".to_string(),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives the console until the operator quits or the link task goes away.
pub async fn run<W: Write>(
    mut console: Console<W>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut lines: mpsc::Receiver<String>,
    status_every: Duration,
) -> Console<W> {
    let mut status = tokio::time::interval(status_every);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let deadline = console.session.poll_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => console.on_link_event(event),
                None => {
                    info!(event = "console_link_gone");
                    break;
                }
            },
            _ = sleep_until_deadline(deadline) => console.on_poll_timer(),
            Some(line) = lines.recv() => {
                if console.on_line(&line) == Flow::Quit {
                    break;
                }
            }
            _ = status.tick() => console.log_status(),
        }
        console.surface_alerts();
    }
    console
}
