//! Push notifications from the server, parsed into a closed set of kinds.

use crate::device::EntityGroup;
use crate::error::ProtocolError;
use crate::model::DeviceConstants;
use fcc_core::{Port, Positional, ValueError};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PortAppeared(Port),
    PortRemoved(Port),
    DeviceAttached {
        port: Port,
        constants: DeviceConstants,
    },
    DeviceDetached(Port),
    FieldsUpdated {
        port: Port,
        values: Vec<Value>,
    },
    EntityUpdated {
        port: Port,
        group: EntityGroup,
        index: usize,
        values: Vec<Value>,
    },
    PrintingChanged {
        port: Port,
        printing: bool,
    },
    AudioListChanged(Vec<String>),
    ScriptAdded {
        name: String,
        code: String,
        data: String,
    },
    ScriptRemoved(String),
    ScriptData {
        name: String,
        data: String,
    },
    ConfirmationRequested {
        message: Option<String>,
    },
    DeviceReset(Port),
    DeviceStalled(Port),
    AutodetectChanged(bool),
    BlacklistChanged(String),
}

const KNOWN: &[&str] = &[
    "new_port",
    "del_port",
    "new_printer",
    "del_printer",
    "variables_update",
    "axis_update",
    "extruder_update",
    "temp_update",
    "gpio_update",
    "printing",
    "new_audio",
    "new_script",
    "del_script",
    "new_data",
    "confirm",
    "reset",
    "stall",
    "autodetect",
    "blacklist",
];

impl Notification {
    /// Parses one notification. Unknown names yield `Ok(None)`.
    pub fn parse(name: &str, args: &[Value]) -> Result<Option<Self>, ProtocolError> {
        let Some(notification) = KNOWN.iter().copied().find(|known| *known == name) else {
            return Ok(None);
        };
        Self::parse_known(notification, args).map_err(|source| ProtocolError::Malformed {
            notification,
            source,
        })
    }

    fn parse_known(name: &'static str, args: &[Value]) -> Result<Option<Self>, ValueError> {
        let parsed = match name {
            "new_port" => Notification::PortAppeared(port_only(args)?),
            "del_port" => Notification::PortRemoved(port_only(args)?),
            "new_printer" => {
                let view = Positional::exact(args, 2)?;
                Notification::DeviceAttached {
                    port: port_at(&view, 0)?,
                    constants: DeviceConstants::from_values(view.array(1)?)?,
                }
            }
            "del_printer" => Notification::DeviceDetached(port_only(args)?),
            "variables_update" => {
                let view = Positional::exact(args, 2)?;
                Notification::FieldsUpdated {
                    port: port_at(&view, 0)?,
                    values: view.array(1)?.to_vec(),
                }
            }
            "axis_update" => entity_update(EntityGroup::Axis, args)?,
            "extruder_update" => entity_update(EntityGroup::Extruder, args)?,
            "temp_update" => entity_update(EntityGroup::Temp, args)?,
            "gpio_update" => entity_update(EntityGroup::Gpio, args)?,
            "printing" => {
                let view = Positional::exact(args, 2)?;
                Notification::PrintingChanged {
                    port: port_at(&view, 0)?,
                    printing: view.bool(1)?,
                }
            }
            "new_audio" => {
                let view = Positional::exact(args, 1)?;
                let clips = view.array(0)?;
                let names = Positional::exact(clips, clips.len())?;
                Notification::AudioListChanged(
                    (0..names.len())
                        .map(|index| names.str(index).map(str::to_string))
                        .collect::<Result<_, _>>()?,
                )
            }
            "new_script" => {
                let view = Positional::exact(args, 3)?;
                Notification::ScriptAdded {
                    name: view.str(0)?.to_string(),
                    code: view.str(1)?.to_string(),
                    data: view.str(2)?.to_string(),
                }
            }
            "del_script" => {
                let view = Positional::exact(args, 1)?;
                Notification::ScriptRemoved(view.str(0)?.to_string())
            }
            "new_data" => {
                let view = Positional::exact(args, 2)?;
                Notification::ScriptData {
                    name: view.str(0)?.to_string(),
                    data: view.str(1)?.to_string(),
                }
            }
            "confirm" => {
                let message = match args.first() {
                    None | Some(Value::Null) => None,
                    Some(_) => Some(Positional::exact(&args[..1], 1)?.str(0)?.to_string()),
                };
                Notification::ConfirmationRequested {
                    message: message.filter(|text| !text.is_empty()),
                }
            }
            "reset" => Notification::DeviceReset(port_only(args)?),
            "stall" => Notification::DeviceStalled(port_only(args)?),
            "autodetect" => {
                Notification::AutodetectChanged(Positional::exact(args, 1)?.bool(0)?)
            }
            "blacklist" => {
                Notification::BlacklistChanged(Positional::exact(args, 1)?.str(0)?.to_string())
            }
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// Wire name of this notification.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::PortAppeared(_) => "new_port",
            Notification::PortRemoved(_) => "del_port",
            Notification::DeviceAttached { .. } => "new_printer",
            Notification::DeviceDetached(_) => "del_printer",
            Notification::FieldsUpdated { .. } => "variables_update",
            Notification::EntityUpdated { group, .. } => match group {
                EntityGroup::Axis => "axis_update",
                EntityGroup::Extruder => "extruder_update",
                EntityGroup::Temp => "temp_update",
                EntityGroup::Gpio => "gpio_update",
            },
            Notification::PrintingChanged { .. } => "printing",
            Notification::AudioListChanged(_) => "new_audio",
            Notification::ScriptAdded { .. } => "new_script",
            Notification::ScriptRemoved(_) => "del_script",
            Notification::ScriptData { .. } => "new_data",
            Notification::ConfirmationRequested { .. } => "confirm",
            Notification::DeviceReset(_) => "reset",
            Notification::DeviceStalled(_) => "stall",
            Notification::AutodetectChanged(_) => "autodetect",
            Notification::BlacklistChanged(_) => "blacklist",
        }
    }
}

fn port_at(view: &Positional<'_>, index: usize) -> Result<Port, ValueError> {
    Port::from_value(view.value(index)).map_err(|err| match err {
        ValueError::Kind {
            expected, found, ..
        } => ValueError::Kind {
            index,
            expected,
            found,
        },
        other => other,
    })
}

fn port_only(args: &[Value]) -> Result<Port, ValueError> {
    port_at(&Positional::exact(args, 1)?, 0)
}

fn entity_update(group: EntityGroup, args: &[Value]) -> Result<Notification, ValueError> {
    let view = Positional::exact(args, 3)?;
    Ok(Notification::EntityUpdated {
        port: port_at(&view, 0)?,
        group,
        index: view.usize(1)?,
        values: view.array(2)?.to_vec(),
    })
}
