use crate::alerts::AlertKind;
use crate::device::DeviceMirror;
use crate::error::{ProtocolError, SyncError};
use crate::notify::Notification;
use crate::registry::Slot;
use crate::session::Session;
use fcc_core::Port;
use serde_json::Value;
use tracing::{debug, info, warn};

const DEFAULT_CONFIRM_MESSAGE: &str = "Please confirm to continue.";

impl Session {
    /// Applies one push notification by wire name. Unknown names are
    /// ignored; malformed ones are logged and dropped with the mirror left
    /// unchanged.
    pub fn handle_notification(&mut self, name: &str, args: &[Value]) -> Result<(), SyncError> {
        match Notification::parse(name, args) {
            Ok(Some(notification)) => self.apply(notification),
            Ok(None) => {
                debug!(event = "notification_ignored", name);
                Ok(())
            }
            Err(err) => {
                warn!(event = "notification_rejected", name, error = %err);
                Err(err.into())
            }
        }
    }

    pub fn apply(&mut self, notification: Notification) -> Result<(), SyncError> {
        let name = notification.name();
        let result = self.apply_inner(notification);
        if let Err(SyncError::Protocol(err)) = &result {
            warn!(event = "notification_rejected", name, error = %err);
        }
        result
    }

    fn apply_inner(&mut self, notification: Notification) -> Result<(), SyncError> {
        let name = notification.name();
        match notification {
            Notification::PortAppeared(port) => {
                if !self.registry.insert_port(port.clone()) {
                    debug!(event = "port_already_present", port = %port);
                    return Ok(());
                }
                info!(event = "port_appeared", port = %port);
                if self.selected.is_none() {
                    self.select(&port)?;
                }
                Ok(())
            }
            Notification::PortRemoved(port) => {
                if !self.registry.contains(&port) {
                    return Err(unknown_port(name, port));
                }
                if self.registry.device(&port).is_some() {
                    self.detach_device(&port);
                }
                self.registry.remove_port(&port);
                info!(event = "port_removed", port = %port);
                if self.selected.as_ref() == Some(&port) {
                    self.clear_selection();
                }
                Ok(())
            }
            Notification::DeviceAttached { port, constants } => {
                if !self.registry.contains(&port) {
                    return Err(unknown_port(name, port));
                }
                let mirror = DeviceMirror::new(self.next_mirror_id(), constants);
                let id = mirror.id();
                if let Ok(Some(previous)) = self.registry.attach(&port, mirror) {
                    warn!(event = "device_replaced", port = %port, previous = previous.id().0);
                    self.forget_mirror(previous.id());
                }
                info!(
                    event = "device_attached",
                    port = %port,
                    mirror = id.0,
                    axes = constants.max_axes,
                    extruders = constants.max_extruders,
                    temps = constants.max_temps,
                    gpios = constants.max_gpios
                );
                if self.selected.as_ref() == Some(&port) {
                    self.poller.invalidate();
                    self.start_cycle()?;
                }
                Ok(())
            }
            Notification::DeviceDetached(port) => {
                match self.registry.slot(&port) {
                    Slot::Absent => return Err(unknown_port(name, port)),
                    Slot::Empty => {
                        return Err(ProtocolError::NoDevice {
                            notification: name,
                            port,
                        }
                        .into())
                    }
                    Slot::Attached(_) => {}
                }
                self.detach_device(&port);
                if self.selected.as_ref() == Some(&port) {
                    self.clear_selection();
                }
                Ok(())
            }
            Notification::FieldsUpdated { port, values } => {
                let device = self.device_for(name, &port)?;
                device
                    .update_fields(&values)
                    .map_err(|source| ProtocolError::Malformed {
                        notification: name,
                        source,
                    })?;
                Ok(())
            }
            Notification::EntityUpdated {
                port,
                group,
                index,
                values,
            } => {
                let device = self.device_for(name, &port)?;
                let applied = device.update_entity(group, index, &values).map_err(|source| {
                    ProtocolError::Malformed {
                        notification: name,
                        source,
                    }
                })?;
                if !applied {
                    return Err(ProtocolError::IndexOutOfRange {
                        notification: name,
                        group: group.as_str(),
                        index,
                        len: device.group_len(group),
                    }
                    .into());
                }
                Ok(())
            }
            Notification::PrintingChanged { port, printing } => {
                self.device_for(name, &port)?.set_printing(printing);
                info!(event = "printing_changed", port = %port, printing);
                Ok(())
            }
            Notification::AudioListChanged(clips) => {
                debug!(event = "audio_list_changed", clips = clips.len());
                self.audio = clips;
                Ok(())
            }
            Notification::ScriptAdded {
                name: script,
                code,
                data,
            } => {
                self.scripts.add(&script, &code, &data);
                Ok(())
            }
            Notification::ScriptRemoved(script) => {
                if !self.scripts.remove(&script) {
                    return Err(unknown_script(name, script));
                }
                Ok(())
            }
            Notification::ScriptData { name: script, data } => {
                if !self.scripts.update(&script, &data) {
                    return Err(unknown_script(name, script));
                }
                Ok(())
            }
            Notification::ConfirmationRequested { message } => {
                let message = message.unwrap_or_else(|| DEFAULT_CONFIRM_MESSAGE.to_string());
                self.raise(AlertKind::Confirmation, message);
                Ok(())
            }
            Notification::DeviceReset(port) => {
                let message = format!("{} has reset unexpectedly.", self.describe(&port));
                self.raise(AlertKind::Notice, message);
                Ok(())
            }
            Notification::DeviceStalled(port) => {
                let message = format!("{} stalled on our command.", self.describe(&port));
                self.raise(AlertKind::Notice, message);
                Ok(())
            }
            Notification::AutodetectChanged(enabled) => {
                self.globals.autodetect = Some(enabled);
                Ok(())
            }
            Notification::BlacklistChanged(pattern) => {
                self.globals.blacklist = Some(pattern);
                Ok(())
            }
        }
    }

    fn device_for(
        &mut self,
        notification: &'static str,
        port: &Port,
    ) -> Result<&mut DeviceMirror, SyncError> {
        if !self.registry.contains(port) {
            return Err(unknown_port(notification, port.clone()));
        }
        self.registry.device_mut(port).ok_or_else(|| {
            ProtocolError::NoDevice {
                notification,
                port: port.clone(),
            }
            .into()
        })
    }

    fn detach_device(&mut self, port: &Port) {
        if let Some(device) = self.registry.detach(port) {
            info!(event = "device_detached", port = %port, mirror = device.id().0);
            self.forget_mirror(device.id());
        }
    }

    fn describe(&self, port: &Port) -> String {
        match self.registry.device(port) {
            Some(device) if !device.fields().name.is_empty() => {
                format!("Device {} ({port})", device.fields().name)
            }
            _ => format!("Device on port {port}"),
        }
    }
}

fn unknown_port(notification: &'static str, port: Port) -> SyncError {
    ProtocolError::UnknownPort { notification, port }.into()
}

fn unknown_script(notification: &'static str, name: String) -> SyncError {
    ProtocolError::UnknownScript { notification, name }.into()
}

#[cfg(test)]
mod tests {
    use crate::alerts::AlertKind;
    use crate::channel::RecordingChannel;
    use crate::device::EntityGroup;
    use crate::error::{ProtocolError, SyncError};
    use crate::model::fixtures::*;
    use crate::scripts::PayloadSandbox;
    use crate::session::{Session, SessionConfig};
    use fcc_core::Port;
    use serde_json::{json, Value};

    fn session() -> (Session, RecordingChannel) {
        let mut session = Session::new(SessionConfig::default(), Box::<PayloadSandbox>::default());
        let recorder = RecordingChannel::new();
        session.begin_connect(Box::new(recorder.clone()));
        session.handshake_complete().expect("handshake");
        recorder.take();
        (session, recorder)
    }

    fn constants() -> Value {
        json!([8, 3, 2, 4, 2, 8, 32, 54, 70])
    }

    #[test]
    fn first_port_is_selected_automatically() {
        let (mut session, recorder) = session();
        session.handle_notification("new_port", &[json!("P1")]).expect("P1");
        session.handle_notification("new_port", &[json!("P2")]).expect("P2");
        assert_eq!(session.selected(), Some(&Port::from("P1")));
        assert!(recorder.sent().is_empty());

        session.handle_notification("new_port", &[json!("P1")]).expect("repeat");
        assert_eq!(session.registry().len(), 2);
    }

    #[test]
    fn fields_update_enables_axes() {
        let (mut session, _recorder) = session();
        session.handle_notification("new_port", &[json!("P1")]).expect("port");
        session
            .handle_notification("new_printer", &[json!("P1"), constants()])
            .expect("attach");
        let device = session.registry().device(&Port::from("P1")).expect("device");
        assert_eq!(device.axes().len(), 3);
        assert!(!device.is_enabled(EntityGroup::Axis, 0));

        session
            .handle_notification(
                "variables_update",
                &[json!("P1"), Value::Array(device_field_values("bench", [2, 1, 1, 0]))],
            )
            .expect("fields");
        let device = session.registry().device(&Port::from("P1")).expect("device");
        assert!(device.is_enabled(EntityGroup::Axis, 0));
        assert!(device.is_enabled(EntityGroup::Axis, 1));
        assert!(!device.is_enabled(EntityGroup::Axis, 2));
        assert_eq!(device.fields().name, "bench");
    }

    #[test]
    fn bad_updates_leave_the_mirror_alone() {
        let (mut session, _recorder) = session();
        session.handle_notification("new_port", &[json!("P1")]).expect("port");
        session
            .handle_notification("axis_update", &[json!("P1"), json!(0), json!(axis_values())])
            .unwrap_err();
        session
            .handle_notification("new_printer", &[json!("P1"), constants()])
            .expect("attach");

        let err = session
            .handle_notification("axis_update", &[json!("P1"), json!(3), json!(axis_values())])
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::IndexOutOfRange {
                group: "axis",
                index: 3,
                len: 3,
                ..
            })
        ));

        let mut short = axis_values();
        short.pop();
        let err = session
            .handle_notification("axis_update", &[json!("P1"), json!(0), json!(short)])
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ProtocolError::Malformed { .. })));

        let device = session.registry().device(&Port::from("P1")).expect("device");
        assert_eq!(device.axes()[0], Default::default());
        assert!(!err.is_channel_failure());
    }

    #[test]
    fn unknown_notifications_are_ignored() {
        let (mut session, _recorder) = session();
        session
            .handle_notification("queue_progress", &[json!(1), json!(2)])
            .expect("ignored");
    }

    #[test]
    fn detach_clears_selection_and_context() {
        let (mut session, recorder) = session();
        session.handle_notification("new_port", &[json!("P1")]).expect("port");
        session
            .handle_notification("new_printer", &[json!("P1"), constants()])
            .expect("attach");
        let switch = recorder.sent()[0].clone();
        session.handle_reply(switch.id, Value::Null).expect("switch");
        assert!(session.active_context().is_some());

        session.handle_notification("del_printer", &[json!("P1")]).expect("detach");
        assert!(session.selected().is_none());
        assert!(session.active_context().is_none());
        assert!(session.poll_deadline().is_none());
        assert!(session.registry().contains(&Port::from("P1")));

        let err = session
            .handle_notification("del_printer", &[json!("P1")])
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ProtocolError::NoDevice { .. })));
    }

    #[test]
    fn reattach_replaces_the_mirror() {
        let (mut session, _recorder) = session();
        session.handle_notification("new_port", &[json!(4)]).expect("port");
        session
            .handle_notification("new_printer", &[json!(4), constants()])
            .expect("attach");
        let first = session.registry().device(&Port::Number(4)).expect("first").id();
        session
            .handle_notification("new_printer", &[json!(4), constants()])
            .expect("reattach");
        let second = session.registry().device(&Port::Number(4)).expect("second").id();
        assert_ne!(first, second);
        assert_eq!(session.registry().devices().count(), 1);
    }

    #[test]
    fn port_removal_detaches_and_deselects() {
        let (mut session, _recorder) = session();
        session.handle_notification("new_port", &[json!("P1")]).expect("port");
        session
            .handle_notification("new_printer", &[json!("P1"), constants()])
            .expect("attach");
        session.handle_notification("del_port", &[json!("P1")]).expect("remove");
        assert!(session.registry().is_empty());
        assert!(session.selected().is_none());
        assert!(session
            .handle_notification("new_printer", &[json!("P1"), constants()])
            .is_err());
    }

    #[test]
    fn confirmations_and_resets_become_alerts() {
        let (mut session, _recorder) = session();
        session.handle_notification("new_port", &[json!("P1")]).expect("port");
        session
            .handle_notification("new_printer", &[json!("P1"), constants()])
            .expect("attach");
        session
            .handle_notification(
                "variables_update",
                &[json!("P1"), Value::Array(device_field_values("bench", [1, 1, 1, 0]))],
            )
            .expect("fields");

        session.handle_notification("confirm", &[Value::Null]).expect("confirm");
        session.handle_notification("reset", &[json!("P1")]).expect("reset");
        session.handle_notification("stall", &[json!("P9")]).expect("stall");

        let alert = session.alert().expect("open");
        assert_eq!(alert.kind, AlertKind::Confirmation);
        assert_eq!(alert.message, "Please confirm to continue.");
        assert_eq!(session.queued_alerts(), 2);
    }

    #[test]
    fn globals_audio_and_scripts_are_mirrored() {
        let (mut session, _recorder) = session();
        session.handle_notification("autodetect", &[json!(true)]).expect("autodetect");
        session.handle_notification("blacklist", &[json!("/dev/ttyS.*")]).expect("blacklist");
        session
            .handle_notification("new_audio", &[json!(["beep", "tune"])])
            .expect("audio");
        session
            .handle_notification("new_script", &[json!("bed"), json!("function(){}"), json!("{}")])
            .expect("script");
        session
            .handle_notification("new_script", &[json!("bad"), json!("function(){}"), json!("{")])
            .expect("failed load is not an error");

        assert_eq!(session.globals().autodetect, Some(true));
        assert_eq!(session.globals().blacklist.as_deref(), Some("/dev/ttyS.*"));
        assert_eq!(session.audio_clips(), ["beep", "tune"]);
        assert_eq!(session.scripts(), vec!["bed"]);

        assert!(session
            .handle_notification("new_data", &[json!("bad"), json!("{}")])
            .is_err());
        session
            .handle_notification("new_data", &[json!("bed"), json!("not json")])
            .expect("data");
        assert!(session.scripts().is_empty());
        assert!(session
            .handle_notification("del_script", &[json!("bed")])
            .is_err());
    }
}
