use crate::alerts::{Alert, AlertCoalescer, AlertKind, AlertResponse};
use crate::channel::{CallId, OutboundRequest, RemoteChannel, RequestBody};
use crate::device::{DeviceMirror, MirrorId};
use crate::error::SyncError;
use crate::poller::{PollScheduler, PollTicket};
use crate::registry::{Registry, Slot};
use crate::scripts::{ScriptHost, ScriptSandbox};
use fcc_core::{CallSpec, Port};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Monotonic tag of one connection or poll-selection period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub(crate) fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }
}

/// The device that calls without an explicit port reach on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContext {
    pub port: Port,
    pub mirror: MirrorId,
}

/// Server-wide settings mirrored from push notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSettings {
    pub autodetect: Option<bool>,
    pub blacklist: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub(crate) enum PendingReply {
    Context(ActiveContext),
    Poll(PollTicket),
    Caller {
        method: String,
        reply: Option<oneshot::Sender<Value>>,
    },
}

/// Mirrors every device behind one remote channel.
///
/// All state changes happen in reaction to an explicit event: the link
/// opening or closing, a push notification, a call reply, a poll timer
/// firing, or an operator action. Everything created under one connection
/// is discarded when that connection goes away.
pub struct Session {
    pub(crate) state: LinkState,
    pub(crate) link_epoch: Epoch,
    pub(crate) channel: Option<Box<dyn RemoteChannel>>,
    pub(crate) registry: Registry,
    pub(crate) selected: Option<Port>,
    pub(crate) active_context: Option<ActiveContext>,
    /// Context the server will be in once every sent call is processed.
    pub(crate) requested_context: Option<ActiveContext>,
    pub(crate) poller: PollScheduler,
    pub(crate) alerts: AlertCoalescer,
    pub(crate) scripts: ScriptHost,
    pub(crate) audio: Vec<String>,
    pub(crate) globals: GlobalSettings,
    pub(crate) pending: HashMap<CallId, PendingReply>,
    next_call: u64,
    next_mirror: u64,
}

impl Session {
    pub fn new(config: SessionConfig, sandbox: Box<dyn ScriptSandbox>) -> Self {
        Self {
            state: LinkState::Disconnected,
            link_epoch: Epoch::default(),
            channel: None,
            registry: Registry::default(),
            selected: None,
            active_context: None,
            requested_context: None,
            poller: PollScheduler::new(config.poll_interval),
            alerts: AlertCoalescer::default(),
            scripts: ScriptHost::new(sandbox),
            audio: Vec::new(),
            globals: GlobalSettings::default(),
            pending: HashMap::new(),
            next_call: 0,
            next_mirror: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn link_epoch(&self) -> Epoch {
        self.link_epoch
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn selected(&self) -> Option<&Port> {
        self.selected.as_ref()
    }

    pub fn selected_device(&self) -> Option<&DeviceMirror> {
        self.selected
            .as_ref()
            .and_then(|port| self.registry.device(port))
    }

    pub fn active_context(&self) -> Option<&ActiveContext> {
        self.active_context.as_ref()
    }

    pub fn audio_clips(&self) -> &[String] {
        &self.audio
    }

    pub fn globals(&self) -> &GlobalSettings {
        &self.globals
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.names().map(str::to_string).collect()
    }

    pub fn alert(&self) -> Option<&Alert> {
        self.alerts.current()
    }

    pub fn queued_alerts(&self) -> usize {
        self.alerts.queued()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    // Connection lifecycle.

    /// Starts a new connection attempt over `channel`. Whatever the previous
    /// connection left behind is torn down first.
    pub fn begin_connect(&mut self, channel: Box<dyn RemoteChannel>) {
        self.teardown();
        self.channel = Some(channel);
        self.state = LinkState::Connecting;
        info!(event = "link_connecting", link = self.link_epoch.0);
    }

    /// The server acknowledged the handshake: enable live updates.
    pub fn handshake_complete(&mut self) -> Result<(), SyncError> {
        if self.state != LinkState::Connecting {
            warn!(event = "unexpected_handshake", state = self.state.as_str());
            return Err(SyncError::NotConnected);
        }
        self.state = LinkState::Connected;
        info!(event = "link_connected", link = self.link_epoch.0);
        self.send(
            RequestBody::Call(CallSpec::new("set_monitor", vec![Value::Bool(true)])),
            PendingReply::Caller {
                method: "set_monitor".to_string(),
                reply: None,
            },
        )?;
        self.start_cycle()
    }

    /// The channel closed or failed. Every mirrored entity is discarded.
    pub fn channel_lost(&mut self) {
        if self.state == LinkState::Disconnected && self.channel.is_none() {
            return;
        }
        self.teardown();
        self.state = LinkState::Disconnected;
        info!(event = "link_lost", link = self.link_epoch.0);
    }

    /// The server answered with an error frame; treated as a channel failure.
    pub fn remote_error(&mut self, code: &str, message: &str) -> SyncError {
        warn!(event = "remote_error", code, message);
        self.channel_lost();
        SyncError::ChannelFailure(format!("{code}: {message}"))
    }

    fn teardown(&mut self) {
        self.channel = None;
        self.link_epoch = self.link_epoch.next();

        let ports: Vec<Port> = self.registry.ports().cloned().collect();
        let mut detached = 0usize;
        for port in &ports {
            if self.registry.detach(port).is_some() {
                detached += 1;
            }
            self.registry.remove_port(port);
        }
        if !ports.is_empty() {
            debug!(event = "registry_cleared", ports = ports.len(), devices = detached);
        }

        self.selected = None;
        self.active_context = None;
        self.requested_context = None;
        self.poller.reset();
        self.pending.clear();
        self.scripts.clear();
        self.audio.clear();
        self.globals = GlobalSettings::default();
    }

    // Replies.

    pub fn handle_reply(&mut self, id: CallId, result: Value) -> Result<(), SyncError> {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(event = "reply_unmatched", id = id.0);
            return Ok(());
        };
        match pending {
            PendingReply::Context(target) => {
                let current = self.registry.device(&target.port).map(DeviceMirror::id);
                if current == Some(target.mirror) {
                    debug!(event = "context_switched", port = %target.port);
                    self.active_context = Some(target);
                }
                Ok(())
            }
            PendingReply::Caller { method, reply } => {
                debug!(event = "reply_received", id = id.0, method = %method);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                Ok(())
            }
            PendingReply::Poll(ticket) => self.poll_reply(id, ticket, result),
        }
    }

    // Selection and calls.

    /// Makes `port` the selected port. Polling starts once a device is
    /// attached there.
    pub fn select(&mut self, port: &Port) -> Result<(), SyncError> {
        if !self.registry.contains(port) {
            return Err(SyncError::UnknownPort(port.clone()));
        }
        if self.selected.as_ref() == Some(port) {
            return Ok(());
        }
        info!(event = "port_selected", port = %port);
        self.selected = Some(port.clone());
        self.poller.invalidate();
        self.start_cycle()
    }

    pub(crate) fn clear_selection(&mut self) {
        if let Some(port) = self.selected.take() {
            debug!(event = "selection_cleared", port = %port);
            self.poller.invalidate();
        }
    }

    pub fn device_call(
        &mut self,
        port: &Port,
        call: CallSpec,
    ) -> Result<oneshot::Receiver<Value>, SyncError> {
        self.device_request(port, RequestBody::Call(call))
    }

    pub fn device_multicall(
        &mut self,
        port: &Port,
        calls: Vec<CallSpec>,
    ) -> Result<oneshot::Receiver<Value>, SyncError> {
        self.device_request(port, RequestBody::Multicall(calls))
    }

    pub fn global_call(&mut self, call: CallSpec) -> Result<oneshot::Receiver<Value>, SyncError> {
        self.require_connected()?;
        self.request(RequestBody::Call(call))
    }

    pub(crate) fn device_request(
        &mut self,
        port: &Port,
        body: RequestBody,
    ) -> Result<oneshot::Receiver<Value>, SyncError> {
        self.require_connected()?;
        let mirror = self.attached_mirror(port)?;
        self.ensure_context(port, mirror)?;
        self.request(body)
    }

    pub(crate) fn attached_mirror(&self, port: &Port) -> Result<MirrorId, SyncError> {
        match self.registry.slot(port) {
            Slot::Absent => Err(SyncError::UnknownPort(port.clone())),
            Slot::Empty => Err(SyncError::NoDevice(port.clone())),
            Slot::Attached(device) => Ok(device.id()),
        }
    }

    pub(crate) fn require_connected(&self) -> Result<(), SyncError> {
        if self.state == LinkState::Connected && self.channel.is_some() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    fn request(&mut self, body: RequestBody) -> Result<oneshot::Receiver<Value>, SyncError> {
        let (reply, receiver) = oneshot::channel();
        let method = body.method().to_string();
        self.send(
            body,
            PendingReply::Caller {
                method,
                reply: Some(reply),
            },
        )?;
        Ok(receiver)
    }

    /// Points the server at `port`'s device unless the calls already sent
    /// leave it there. The active context itself moves when the switch is
    /// acknowledged.
    pub(crate) fn ensure_context(&mut self, port: &Port, mirror: MirrorId) -> Result<(), SyncError> {
        let target = ActiveContext {
            port: port.clone(),
            mirror,
        };
        if self.requested_context.as_ref() == Some(&target) {
            return Ok(());
        }
        self.send(
            RequestBody::Call(CallSpec::new(
                "set_printer",
                vec![Value::Null, port.to_value()],
            )),
            PendingReply::Context(target.clone()),
        )?;
        self.requested_context = Some(target);
        Ok(())
    }

    /// Forgets any context pointing at a mirror that no longer exists.
    pub(crate) fn forget_mirror(&mut self, mirror: MirrorId) {
        if self.active_context.as_ref().map(|c| c.mirror) == Some(mirror) {
            self.active_context = None;
        }
        if self.requested_context.as_ref().map(|c| c.mirror) == Some(mirror) {
            self.requested_context = None;
        }
    }

    pub(crate) fn next_mirror_id(&mut self) -> MirrorId {
        self.next_mirror += 1;
        MirrorId(self.next_mirror)
    }

    pub(crate) fn send(
        &mut self,
        body: RequestBody,
        pending: PendingReply,
    ) -> Result<CallId, SyncError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(SyncError::NotConnected);
        };
        self.next_call += 1;
        let id = CallId(self.next_call);
        let method = body.method().to_string();
        match channel.send(OutboundRequest { id, body }) {
            Ok(()) => {
                debug!(event = "call_sent", id = id.0, method = %method);
                self.pending.insert(id, pending);
                Ok(id)
            }
            Err(err) => {
                warn!(event = "call_send_failed", method = %method, error = %err);
                self.channel_lost();
                Err(SyncError::ChannelFailure(err.to_string()))
            }
        }
    }

    // Alerts.

    pub(crate) fn raise(&mut self, kind: AlertKind, message: String) {
        let opened = self.alerts.push(kind, message, self.link_epoch);
        debug!(event = "alert_raised", opened, queued = self.alerts.queued());
    }

    /// Closes the open alert with the operator's answer. Answering a
    /// confirmation from an earlier connection sends nothing.
    pub fn answer_alert(&mut self, response: AlertResponse) -> Result<Option<Alert>, SyncError> {
        let Some(alert) = self.alerts.dismiss() else {
            return Ok(None);
        };
        if alert.kind != AlertKind::Confirmation || response == AlertResponse::Dismissed {
            return Ok(Some(alert));
        }
        if alert.link != self.link_epoch || self.require_connected().is_err() {
            debug!(event = "stale_confirmation", serial = alert.serial);
            return Ok(Some(alert));
        }
        let confirm = CallSpec::new("confirm", Vec::new());
        let body = match response {
            AlertResponse::Declined => RequestBody::Multicall(vec![
                CallSpec::new("pause", vec![Value::Bool(true)]),
                confirm,
            ]),
            _ => RequestBody::Call(confirm),
        };
        self.send(
            body,
            PendingReply::Caller {
                method: "confirm".to_string(),
                reply: None,
            },
        )?;
        Ok(Some(alert))
    }
}
