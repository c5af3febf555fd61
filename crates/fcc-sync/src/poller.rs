//! Sequential temperature polling for the selected device.
//!
//! One cycle walks the device's monitor queue from the start, issuing at
//! most one read at a time and skipping sensors whose guard is false. When
//! the queue is exhausted a single timer is armed for the next cycle.
//! Every selection change, attach or detach of the selected device, and
//! reconnect moves the poll epoch forward; replies tagged with an older
//! epoch are dropped without touching the mirror.

use crate::channel::{CallId, RequestBody};
use crate::device::MirrorId;
use crate::error::{ProtocolError, SyncError};
use crate::model::TempSlot;
use crate::session::{Epoch, LinkState, PendingReply, Session};
use fcc_core::Port;
use fcc_core::ValueError;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PollTicket {
    pub(crate) epoch: Epoch,
    pub(crate) port: Port,
    pub(crate) mirror: MirrorId,
    pub(crate) index: usize,
    pub(crate) slot: TempSlot,
}

#[derive(Debug, Clone, Copy)]
struct PollTimer {
    epoch: Epoch,
    deadline: Instant,
}

#[derive(Debug, Clone)]
enum CycleState {
    /// A read from an earlier epoch is still outstanding for this port.
    Deferred,
    Awaiting { index: usize, call: CallId },
}

#[derive(Debug, Clone)]
struct Cycle {
    port: Port,
    mirror: MirrorId,
    state: CycleState,
}

#[derive(Debug)]
pub(crate) struct PollScheduler {
    epoch: Epoch,
    interval: Duration,
    cycle: Option<Cycle>,
    timer: Option<PollTimer>,
    /// Outstanding poll read per port, whatever epoch it was issued under.
    in_flight: HashMap<Port, CallId>,
}

impl PollScheduler {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            epoch: Epoch::default(),
            interval,
            cycle: None,
            timer: None,
            in_flight: HashMap::new(),
        }
    }

    /// Abandons the running cycle and any armed timer.
    pub(crate) fn invalidate(&mut self) {
        self.epoch = self.epoch.next();
        self.cycle = None;
        self.timer = None;
    }

    /// Like `invalidate`, for a channel that is gone along with its calls.
    pub(crate) fn reset(&mut self) {
        self.invalidate();
        self.in_flight.clear();
    }

    fn arm(&mut self) {
        let deadline = Instant::now() + self.interval;
        if self.timer.is_some() {
            debug!(event = "poll_timer_rearmed", epoch = self.epoch.0);
        }
        self.timer = Some(PollTimer {
            epoch: self.epoch,
            deadline,
        });
    }
}

impl Session {
    pub fn poll_epoch(&self) -> Epoch {
        self.poller.epoch
    }

    /// When the next poll cycle is due, if one is scheduled.
    pub fn poll_deadline(&self) -> Option<Instant> {
        self.poller
            .timer
            .filter(|timer| timer.epoch == self.poller.epoch)
            .map(|timer| timer.deadline)
    }

    /// Number of poll reads outstanding for `port` (0 or 1).
    pub fn polls_in_flight(&self, port: &Port) -> usize {
        usize::from(self.poller.in_flight.contains_key(port))
    }

    /// Starts the next cycle if the armed timer for the current epoch is due.
    pub fn on_poll_timer(&mut self, now: Instant) -> Result<(), SyncError> {
        match self.poller.timer {
            Some(timer) if timer.epoch == self.poller.epoch && now >= timer.deadline => {
                self.poller.timer = None;
                self.start_cycle()
            }
            _ => Ok(()),
        }
    }

    /// Begins a cycle for the selected device. Does nothing without a live
    /// connection or an attached, selected device.
    pub(crate) fn start_cycle(&mut self) -> Result<(), SyncError> {
        if self.state != LinkState::Connected || self.channel.is_none() {
            return Ok(());
        }
        let Some(port) = self.selected.clone() else {
            return Ok(());
        };
        let Some(mirror) = self.registry.device(&port).map(|device| device.id()) else {
            return Ok(());
        };
        if self.poller.cycle.is_some() {
            return Ok(());
        }
        self.poller.timer = None;
        self.ensure_context(&port, mirror)?;

        if self.poller.in_flight.contains_key(&port) {
            debug!(event = "poll_cycle_deferred", port = %port);
            self.poller.cycle = Some(Cycle {
                port,
                mirror,
                state: CycleState::Deferred,
            });
            return Ok(());
        }
        debug!(event = "poll_cycle_started", port = %port, epoch = self.poller.epoch.0);
        self.walk(port, mirror, 0)
    }

    /// Issues the read for the first guarded entry at or after `from`, or
    /// arms the timer when none is left.
    fn walk(&mut self, port: Port, mirror: MirrorId, from: usize) -> Result<(), SyncError> {
        let next = self.registry.device(&port).and_then(|device| {
            device
                .next_monitored(from)
                .map(|index| (index, device.monitor_queue()[index].clone()))
        });
        let Some((index, entry)) = next else {
            self.poller.cycle = None;
            self.poller.arm();
            debug!(event = "poll_cycle_complete", port = %port, epoch = self.poller.epoch.0);
            return Ok(());
        };

        self.ensure_context(&port, mirror)?;
        let ticket = PollTicket {
            epoch: self.poller.epoch,
            port: port.clone(),
            mirror,
            index,
            slot: entry.slot,
        };
        let call = self.send(RequestBody::Call(entry.call), PendingReply::Poll(ticket))?;
        self.poller.in_flight.insert(port.clone(), call);
        self.poller.cycle = Some(Cycle {
            port,
            mirror,
            state: CycleState::Awaiting { index, call },
        });
        Ok(())
    }

    pub(crate) fn poll_reply(
        &mut self,
        id: CallId,
        ticket: PollTicket,
        result: Value,
    ) -> Result<(), SyncError> {
        if self.poller.in_flight.get(&ticket.port) == Some(&id) {
            self.poller.in_flight.remove(&ticket.port);
        }

        if ticket.epoch != self.poller.epoch {
            debug!(
                event = "stale_poll_reply",
                port = %ticket.port,
                issued = ticket.epoch.0,
                current = self.poller.epoch.0
            );
            return self.resume_deferred(&ticket.port);
        }

        let awaited = matches!(
            &self.poller.cycle,
            Some(Cycle { state: CycleState::Awaiting { call, .. }, .. }) if *call == id
        );
        if !awaited {
            return Ok(());
        }

        let reading = match &result {
            Value::Null => Ok(None),
            value => value.as_f64().map(Some).ok_or_else(|| ProtocolError::BadReply {
                method: ticket.slot.read_method(),
                source: ValueError::Kind {
                    index: 0,
                    expected: "temperature",
                    found: value.clone(),
                },
            }),
        };
        match reading {
            Ok(reading) => {
                if let Some(device) = self.registry.device_mut(&ticket.port) {
                    if device.id() == ticket.mirror {
                        device.record_reading(ticket.slot, reading);
                    }
                }
            }
            Err(err) => warn!(event = "poll_reply_rejected", slot = %ticket.slot, error = %err),
        }
        self.walk(ticket.port, ticket.mirror, ticket.index + 1)
    }

    fn resume_deferred(&mut self, port: &Port) -> Result<(), SyncError> {
        let resumable = match &self.poller.cycle {
            Some(cycle) => {
                matches!(cycle.state, CycleState::Deferred)
                    && &cycle.port == port
                    && !self.poller.in_flight.contains_key(port)
            }
            None => false,
        };
        if !resumable {
            return Ok(());
        }
        let Some(cycle) = self.poller.cycle.take() else {
            return Ok(());
        };
        debug!(event = "poll_cycle_resumed", port = %port);
        self.walk(cycle.port, cycle.mirror, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{OutboundRequest, RecordingChannel};
    use crate::model::fixtures::*;
    use crate::scripts::PayloadSandbox;
    use crate::session::SessionConfig;
    use serde_json::json;

    fn session() -> (Session, RecordingChannel) {
        let mut session = Session::new(SessionConfig::default(), Box::<PayloadSandbox>::default());
        let recorder = RecordingChannel::new();
        session.begin_connect(Box::new(recorder.clone()));
        session.handshake_complete().expect("handshake");
        recorder.take();
        (session, recorder)
    }

    fn attach(session: &mut Session, port: &str, extruders: usize, temps: usize) {
        session
            .handle_notification("new_port", &[json!(port)])
            .expect("new_port");
        session
            .handle_notification(
                "new_printer",
                &[
                    json!(port),
                    json!([8, 1, extruders, temps, 0, 0, 0, 0, 0]),
                ],
            )
            .expect("new_printer");
    }

    fn answer(session: &mut Session, request: &OutboundRequest, value: Value) {
        session.handle_reply(request.id, value).expect("reply");
    }

    #[test]
    fn cycle_walks_queue_then_arms_one_timer() {
        let (mut session, recorder) = session();
        attach(&mut session, "P1", 1, 2);
        session
            .handle_notification("temp_update", &[json!("P1"), json!(0), json!(temp_values(0x100))])
            .expect("temp_update");

        let sent = recorder.take();
        assert_eq!(
            sent.iter().map(|r| r.body.method()).collect::<Vec<_>>(),
            vec!["set_printer", "readtemp_extruder"]
        );
        assert!(session.poll_deadline().is_none());
        answer(&mut session, &sent[0], Value::Null);
        answer(&mut session, &sent[1], json!(210.5));

        // temp 0 has an invalid thermistor, so the next read is temp 1.
        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].body,
            RequestBody::Call(fcc_core::CallSpec::new("readtemp_temp", vec![json!(1)]))
        );
        answer(&mut session, &sent[0], json!(22.0));

        assert!(recorder.take().is_empty());
        let deadline = session.poll_deadline().expect("armed");
        let device = session.selected_device().expect("device");
        assert_eq!(device.extruders()[0].temp.current, Some(210.5));
        assert_eq!(device.temps()[1].current, Some(22.0));

        // An early tick is ignored; the due tick restarts from index 0.
        session
            .on_poll_timer(deadline - Duration::from_millis(1))
            .expect("early");
        assert!(recorder.sent().is_empty());
        session.on_poll_timer(deadline).expect("due");
        assert_eq!(recorder.methods(), vec!["readtemp_extruder"]);
        assert!(session.poll_deadline().is_none());
    }

    #[test]
    fn stale_reply_is_dropped_and_blocks_a_second_read() {
        let (mut session, recorder) = session();
        attach(&mut session, "P1", 1, 0);
        attach(&mut session, "P2", 1, 0);
        let first = recorder.take();
        let read = first.last().expect("read").clone();
        assert_eq!(session.polls_in_flight(&Port::from("P1")), 1);

        // Flip away and back while the P1 read is outstanding.
        session.select(&Port::from("P2")).expect("select");
        session.select(&Port::from("P1")).expect("select");
        let reads: Vec<_> = recorder
            .take()
            .into_iter()
            .filter(|r| r.body.method() == "readtemp_extruder")
            .collect();
        assert_eq!(reads.len(), 1, "only P2 is read while P1 is still busy");
        assert_eq!(session.polls_in_flight(&Port::from("P1")), 1);

        answer(&mut session, &read, json!(99.0));
        let device = session.registry().device(&Port::from("P1")).expect("P1");
        assert_eq!(device.extruders()[0].temp.current, None);
        // The deferred cycle now starts over from the top.
        assert_eq!(recorder.methods(), vec!["readtemp_extruder"]);
        assert_eq!(session.polls_in_flight(&Port::from("P1")), 1);
    }

    #[test]
    fn non_numeric_reading_is_logged_and_skipped() {
        let (mut session, recorder) = session();
        attach(&mut session, "P1", 2, 0);
        let sent = recorder.take();
        answer(&mut session, &sent[1], json!("hot"));
        let next = recorder.take();
        assert_eq!(next.len(), 1);
        assert_eq!(
            next[0].body,
            RequestBody::Call(fcc_core::CallSpec::new("readtemp_extruder", vec![json!(1)]))
        );
        assert_eq!(
            session.selected_device().expect("device").extruders()[0].temp.current,
            None
        );
    }
}
