//! Operator-originated remote calls.
//!
//! Device actions target one port and go through the active-context switch;
//! global actions address the server itself. Replies come back on the
//! returned receiver, never through the notification dispatcher.

use crate::channel::RequestBody;
use crate::device::{DeviceMirror, EntityGroup};
use crate::error::SyncError;
use crate::model::{Mirrored, TempSlot};
use crate::registry::Slot;
use crate::session::Session;
use fcc_core::values::nullable_f64;
use fcc_core::{CallSpec, Port};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::info;

/// Object prefix of indexed setter methods (`<object>_set_<part>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Axis,
    AxisMotor,
    Extruder,
    ExtruderMotor,
    ExtruderTemp,
    Temp,
    Gpio,
}

impl EntityKind {
    pub fn object(self) -> &'static str {
        match self {
            EntityKind::Axis => "axis",
            EntityKind::AxisMotor => "axis_motor",
            EntityKind::Extruder => "extruder",
            EntityKind::ExtruderMotor => "extruder_motor",
            EntityKind::ExtruderTemp => "extruder_temp",
            EntityKind::Temp => "temp",
            EntityKind::Gpio => "gpio",
        }
    }

    pub fn group(self) -> EntityGroup {
        match self {
            EntityKind::Axis | EntityKind::AxisMotor => EntityGroup::Axis,
            EntityKind::Extruder | EntityKind::ExtruderMotor | EntityKind::ExtruderTemp => {
                EntityGroup::Extruder
            }
            EntityKind::Temp => EntityGroup::Temp,
            EntityKind::Gpio => EntityGroup::Gpio,
        }
    }

    fn setup_fields(self, device: &DeviceMirror, index: usize) -> Option<Vec<(&'static str, Value)>> {
        let fields = match self {
            EntityKind::Axis => device.axes().get(index)?.setup_fields(),
            EntityKind::AxisMotor => device.axes().get(index)?.motor.setup_fields(),
            EntityKind::Extruder => device.extruders().get(index)?.setup_fields(),
            EntityKind::ExtruderMotor => device.extruders().get(index)?.motor.setup_fields(),
            EntityKind::ExtruderTemp => device.extruders().get(index)?.temp.setup_fields(),
            EntityKind::Temp => device.temps().get(index)?.setup_fields(),
            EntityKind::Gpio => device.gpios().get(index)?.setup_fields(),
        };
        Some(fields)
    }
}

pub fn set_device_field(part: &str, value: Value) -> CallSpec {
    CallSpec::new(format!("set_{part}"), vec![value])
}

pub fn set_entity_field(kind: EntityKind, index: usize, part: &str, value: Value) -> CallSpec {
    CallSpec::new(
        format!("{}_set_{part}", kind.object()),
        vec![Value::from(index), value],
    )
}

/// Motor-bearing entities that can be run or put to sleep directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorOwner {
    Axis(usize),
    Extruder(usize),
}

impl MotorOwner {
    fn parts(self) -> (&'static str, usize) {
        match self {
            MotorOwner::Axis(index) => ("axis", index),
            MotorOwner::Extruder(index) => ("extruder", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    SetField {
        part: String,
        value: Value,
    },
    SetEntityField {
        kind: EntityKind,
        index: usize,
        part: String,
        value: Value,
    },
    /// Pushes every mirrored configuration field of the device (`None`) or
    /// of one sub-entity in a single multicall.
    Setup(Option<(EntityKind, usize)>),
    SetTarget {
        slot: TempSlot,
        target: Option<f64>,
    },
    /// Runs a motor continuously; `None` stops it.
    Run {
        motor: MotorOwner,
        speed: Option<f64>,
    },
    Sleep {
        motor: MotorOwner,
        sleep: bool,
    },
    Goto {
        positions: BTreeMap<usize, f64>,
        extruder: Option<f64>,
    },
    CurrentPosition {
        axis: usize,
    },
    Pause(bool),
    HomeAll,
    SleepAll,
    LoadAll,
    SaveAll,
}

impl DeviceAction {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceAction::SetField { .. } => "set_field",
            DeviceAction::SetEntityField { .. } => "set_entity_field",
            DeviceAction::Setup(_) => "setup",
            DeviceAction::SetTarget { .. } => "settemp",
            DeviceAction::Run { .. } => "run",
            DeviceAction::Sleep { .. } => "sleep",
            DeviceAction::Goto { .. } => "goto",
            DeviceAction::CurrentPosition { .. } => "axis_get_current_pos",
            DeviceAction::Pause(_) => "pause",
            DeviceAction::HomeAll => "home_all",
            DeviceAction::SleepAll => "sleep_all",
            DeviceAction::LoadAll => "load_all",
            DeviceAction::SaveAll => "save_all",
        }
    }

    /// Builds the request; `Setup` reads the values to push from `device`.
    pub fn into_request(self, device: &DeviceMirror) -> Result<RequestBody, SyncError> {
        let call = match self {
            DeviceAction::SetField { part, value } => set_device_field(&part, value),
            DeviceAction::SetEntityField {
                kind,
                index,
                part,
                value,
            } => set_entity_field(kind, index, &part, value),
            DeviceAction::Setup(target) => return setup_request(device, target),
            DeviceAction::SetTarget { slot, target } => slot.set_target_call(target),
            DeviceAction::Run { motor, speed } => {
                let (object, index) = motor.parts();
                CallSpec::new(
                    format!("run_{object}"),
                    vec![Value::from(index), nullable_f64(speed)],
                )
            }
            DeviceAction::Sleep { motor, sleep } => {
                let (object, index) = motor.parts();
                CallSpec::new(
                    format!("sleep_{object}"),
                    vec![Value::from(index), Value::Bool(sleep)],
                )
            }
            DeviceAction::Goto {
                positions,
                extruder,
            } => {
                let args = if positions.is_empty() {
                    Vec::new()
                } else {
                    let targets: Map<String, Value> = positions
                        .into_iter()
                        .map(|(axis, position)| (axis.to_string(), Value::from(position)))
                        .collect();
                    vec![Value::Object(targets)]
                };
                let call = CallSpec::new("goto", args);
                match extruder {
                    Some(distance) => call.with_kwarg("e", Value::from(distance)),
                    None => call,
                }
            }
            DeviceAction::CurrentPosition { axis } => {
                CallSpec::new("axis_get_current_pos", vec![Value::from(axis)])
            }
            DeviceAction::Pause(paused) => CallSpec::new("pause", vec![Value::Bool(paused)]),
            DeviceAction::HomeAll => CallSpec::new("home_all", Vec::new()),
            DeviceAction::SleepAll => CallSpec::new("sleep_all", Vec::new()),
            DeviceAction::LoadAll => CallSpec::new("load_all", Vec::new()),
            DeviceAction::SaveAll => CallSpec::new("save_all", Vec::new()),
        };
        Ok(RequestBody::Call(call))
    }
}

fn setup_request(
    device: &DeviceMirror,
    target: Option<(EntityKind, usize)>,
) -> Result<RequestBody, SyncError> {
    let calls = match target {
        None => device
            .fields()
            .setup_fields()
            .into_iter()
            .map(|(part, value)| set_device_field(part, value))
            .collect(),
        Some((kind, index)) => kind
            .setup_fields(device, index)
            .ok_or_else(|| {
                SyncError::ActionUnavailable(format!(
                    "{} {index} is outside the device's {} slots",
                    kind.object(),
                    device.group_len(kind.group())
                ))
            })?
            .into_iter()
            .map(|(part, value)| set_entity_field(kind, index, part, value))
            .collect(),
    };
    Ok(RequestBody::Multicall(calls))
}

/// Calls addressed to the server rather than a device.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalAction {
    /// Probe a port for a device; only valid while none is attached.
    Detect(Port),
    /// Release the device on a port; only valid while one is attached.
    Disable(Port),
    SetAutodetect(bool),
    SetBlacklist(String),
    RemoveScript(String),
    SetScriptData { name: String, data: Value },
    /// Named call the console does not interpret (`audio_load`, `upload`).
    Opaque(CallSpec),
}

impl GlobalAction {
    pub fn into_call(self) -> CallSpec {
        match self {
            GlobalAction::Detect(port) => CallSpec::new("detect", vec![port.to_value()]),
            GlobalAction::Disable(port) => CallSpec::new("disable", vec![port.to_value()]),
            GlobalAction::SetAutodetect(enabled) => {
                set_device_field("autodetect", Value::Bool(enabled))
            }
            GlobalAction::SetBlacklist(pattern) => {
                set_device_field("blacklist", Value::from(pattern))
            }
            GlobalAction::RemoveScript(name) => CallSpec::new("del_script", vec![Value::from(name)]),
            GlobalAction::SetScriptData { name, data } => CallSpec::new(
                "set_data",
                vec![Value::from(name), Value::from(data.to_string())],
            ),
            GlobalAction::Opaque(call) => call,
        }
    }
}

impl Session {
    pub fn perform(
        &mut self,
        port: &Port,
        action: DeviceAction,
    ) -> Result<oneshot::Receiver<Value>, SyncError> {
        self.require_connected()?;
        self.attached_mirror(port)?;
        let name = action.name();
        let body = match self.registry.device(port) {
            Some(device) => action.into_request(device)?,
            None => return Err(SyncError::NoDevice(port.clone())),
        };
        info!(event = "device_action", port = %port, action = name);
        self.device_request(port, body)
    }

    pub fn perform_global(
        &mut self,
        action: GlobalAction,
    ) -> Result<oneshot::Receiver<Value>, SyncError> {
        self.require_connected()?;
        match &action {
            GlobalAction::Detect(port) => match self.registry.slot(port) {
                Slot::Absent => return Err(SyncError::UnknownPort(port.clone())),
                Slot::Attached(_) => {
                    return Err(SyncError::ActionUnavailable(format!(
                        "detect: a device is already attached on {port}"
                    )))
                }
                Slot::Empty => {}
            },
            GlobalAction::Disable(port) => {
                self.attached_mirror(port)?;
            }
            _ => {}
        }
        let call = action.into_call();
        info!(event = "global_action", method = %call.method);
        self.global_call(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use crate::model::fixtures::*;
    use crate::scripts::PayloadSandbox;
    use crate::session::SessionConfig;
    use serde_json::json;

    fn device() -> DeviceMirror {
        let values = [8, 2, 1, 1, 1, 0, 0, 0, 0].map(|v| json!(v));
        let constants = crate::model::DeviceConstants::from_values(&values).expect("constants");
        let mut device = DeviceMirror::new(crate::device::MirrorId(1), constants);
        device
            .update_entity(EntityGroup::Temp, 0, &temp_values(1))
            .expect("temp");
        device
    }

    fn call(body: RequestBody) -> CallSpec {
        match body {
            RequestBody::Call(call) => call,
            other => panic!("expected a single call, got {other:?}"),
        }
    }

    #[test]
    fn setters_follow_the_object_part_convention() {
        let setter = set_entity_field(EntityKind::ExtruderTemp, 1, "R0", json!(100000.0));
        assert_eq!(setter.method, "extruder_temp_set_R0");
        assert_eq!(setter.args, vec![json!(1), json!(100000.0)]);
        assert_eq!(set_device_field("feedrate", json!(1.0)).method, "set_feedrate");
    }

    #[test]
    fn motion_actions() {
        let device = device();
        let run = call(
            DeviceAction::Run {
                motor: MotorOwner::Axis(0),
                speed: None,
            }
            .into_request(&device)
            .expect("run"),
        );
        assert_eq!(run.method, "run_axis");
        assert_eq!(run.args, vec![json!(0), Value::Null]);

        let goto = call(
            DeviceAction::Goto {
                positions: BTreeMap::from([(2, 10.5)]),
                extruder: None,
            }
            .into_request(&device)
            .expect("goto"),
        );
        assert_eq!(goto.args, vec![json!({"2": 10.5})]);

        let extrude = call(
            DeviceAction::Goto {
                positions: BTreeMap::new(),
                extruder: Some(-10.0),
            }
            .into_request(&device)
            .expect("goto"),
        );
        assert!(extrude.args.is_empty());
        assert_eq!(extrude.kwargs.get("e"), Some(&json!(-10.0)));
    }

    #[test]
    fn setup_pushes_every_configuration_field() {
        let device = device();
        let body = DeviceAction::Setup(Some((EntityKind::Temp, 0)))
            .into_request(&device)
            .expect("setup");
        let RequestBody::Multicall(calls) = body else {
            panic!("setup is a multicall");
        };
        assert_eq!(calls.len(), 12);
        assert_eq!(calls[0].method, "temp_set_power_pin");
        assert_eq!(calls[1].args, vec![json!(0), json!(1)]);

        let err = DeviceAction::Setup(Some((EntityKind::Gpio, 4)))
            .into_request(&device)
            .unwrap_err();
        assert!(matches!(err, SyncError::ActionUnavailable(_)));
    }

    #[test]
    fn script_data_is_sent_as_json_text() {
        let call = GlobalAction::SetScriptData {
            name: "bed".to_string(),
            data: json!({"z": 1}),
        }
        .into_call();
        assert_eq!(call.args, vec![json!("bed"), json!("{\"z\":1}")]);
    }

    #[test]
    fn detect_and_disable_depend_on_attachment() {
        let mut session = Session::new(SessionConfig::default(), Box::<PayloadSandbox>::default());
        let recorder = RecordingChannel::new();
        session.begin_connect(Box::new(recorder.clone()));
        session.handshake_complete().expect("handshake");
        session.handle_notification("new_port", &[json!("P1")]).expect("port");

        assert!(matches!(
            session.perform_global(GlobalAction::Disable(Port::from("P1"))),
            Err(SyncError::NoDevice(_))
        ));
        session
            .perform_global(GlobalAction::Detect(Port::from("P1")))
            .expect("detect");
        assert_eq!(recorder.methods().last().map(String::as_str), Some("detect"));

        session
            .handle_notification(
                "new_printer",
                &[json!("P1"), json!([8, 1, 0, 0, 0, 0, 0, 0, 0])],
            )
            .expect("attach");
        assert!(matches!(
            session.perform_global(GlobalAction::Detect(Port::from("P1"))),
            Err(SyncError::ActionUnavailable(_))
        ));
        session
            .perform_global(GlobalAction::Disable(Port::from("P1")))
            .expect("disable");
    }

    #[test]
    fn settings_and_opaque_calls_go_out_as_given() {
        let mut session = Session::new(SessionConfig::default(), Box::<PayloadSandbox>::default());
        let recorder = RecordingChannel::new();
        session.begin_connect(Box::new(recorder.clone()));
        session.handshake_complete().expect("handshake");
        recorder.take();

        for action in [
            GlobalAction::SetAutodetect(true),
            GlobalAction::SetBlacklist("ttyS.*".to_string()),
            GlobalAction::Opaque(CallSpec::new("audio_play", vec![json!("beep")])),
        ] {
            session.perform_global(action).expect("global action");
        }
        let bodies: Vec<RequestBody> = recorder.take().into_iter().map(|r| r.body).collect();
        assert_eq!(
            bodies,
            vec![
                RequestBody::Call(CallSpec::new("set_autodetect", vec![json!(true)])),
                RequestBody::Call(CallSpec::new("set_blacklist", vec![json!("ttyS.*")])),
                RequestBody::Call(CallSpec::new("audio_play", vec![json!("beep")])),
            ]
        );
    }
}
