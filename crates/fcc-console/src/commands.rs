use fcc_sync::TempSlot;
use thiserror::Error;

pub const HELP: &str = "\
commands:
  ports                     list known ports
  select <port>             make <port> the selected port
  status                    link and device summary
  temps                     polled temperatures of the selected device
  home                      home all axes
  pause on|off              pause or resume the selected device
  settemp <slot> <value>    set a heater target (slot e<N> or t<N>, value off to disable)
  goto <axis> <pos>         move one axis
  detect [port]             ask the server to probe a port
  disable [port]            release the device on a port
  yes | no                  answer the open prompt
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Ports,
    Select(String),
    Status,
    Temps,
    Home,
    Pause(bool),
    SetTemp { slot: TempSlot, target: Option<f64> },
    Goto { axis: usize, position: f64 },
    Detect(Option<String>),
    Disable(Option<String>),
    Answer(bool),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CommandError(String);

fn usage(text: &str) -> CommandError {
    CommandError(format!("usage: {text}"))
}

/// Parses one operator line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, rest)) = words.split_first() else {
        return Ok(None);
    };
    let command = match (head.to_ascii_lowercase().as_str(), rest) {
        ("help" | "?", []) => Command::Help,
        ("ports", []) => Command::Ports,
        ("select", [port]) => Command::Select(port.to_string()),
        ("select", _) => return Err(usage("select <port>")),
        ("status", []) => Command::Status,
        ("temps", []) => Command::Temps,
        ("home", []) => Command::Home,
        ("pause", [state]) => match state.to_ascii_lowercase().as_str() {
            "on" => Command::Pause(true),
            "off" => Command::Pause(false),
            _ => return Err(usage("pause on|off")),
        },
        ("pause", _) => return Err(usage("pause on|off")),
        ("settemp", [slot, value]) => Command::SetTemp {
            slot: parse_slot(slot)?,
            target: parse_target(value)?,
        },
        ("settemp", _) => return Err(usage("settemp <slot> <value>")),
        ("goto", [axis, position]) => Command::Goto {
            axis: axis
                .parse()
                .map_err(|_| CommandError(format!("'{axis}' is not an axis index")))?,
            position: parse_number(position)?,
        },
        ("goto", _) => return Err(usage("goto <axis> <pos>")),
        ("detect", []) => Command::Detect(None),
        ("detect", [port]) => Command::Detect(Some(port.to_string())),
        ("disable", []) => Command::Disable(None),
        ("disable", [port]) => Command::Disable(Some(port.to_string())),
        ("yes" | "y", []) => Command::Answer(true),
        ("no" | "n", []) => Command::Answer(false),
        ("quit" | "exit", []) => Command::Quit,
        (other, _) => {
            return Err(CommandError(format!(
                "unknown command '{other}' (try help)"
            )))
        }
    };
    Ok(Some(command))
}

fn parse_slot(raw: &str) -> Result<TempSlot, CommandError> {
    let invalid = || CommandError(format!("'{raw}' is not a sensor (use e<N> or t<N>)"));
    let mut chars = raw.chars();
    let kind = chars.next().map(|c| c.to_ascii_lowercase());
    let index: usize = chars.as_str().parse().map_err(|_| invalid())?;
    match kind {
        Some('e') => Ok(TempSlot::Extruder(index)),
        Some('t') => Ok(TempSlot::Standalone(index)),
        _ => Err(invalid()),
    }
}

fn parse_target(raw: &str) -> Result<Option<f64>, CommandError> {
    if raw.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    parse_number(raw).map(Some)
}

fn parse_number(raw: &str) -> Result<f64, CommandError> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CommandError(format!("'{raw}' is not a number")))
}
