use crate::values::ValueError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Server-assigned identifier of a device attachment slot.
///
/// The server picks either a string (a device path) or an integer; the
/// original JSON form is preserved so it can be echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(i64),
    Name(String),
}

impl Port {
    pub fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::String(name) => Ok(Port::Name(name.clone())),
            Value::Number(number) => number.as_i64().map(Port::Number).ok_or_else(|| {
                ValueError::Kind {
                    index: 0,
                    expected: "port",
                    found: value.clone(),
                }
            }),
            other => Err(ValueError::Kind {
                index: 0,
                expected: "port",
                found: other.clone(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Port::Number(number) => Value::from(*number),
            Port::Name(name) => Value::from(name.as_str()),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Number(number) => write!(f, "{number}"),
            Port::Name(name) => f.write_str(name),
        }
    }
}

impl FromStr for Port {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Ok(match trimmed.parse::<i64>() {
            Ok(number) => Port::Number(number),
            Err(_) => Port::Name(trimmed.to_string()),
        })
    }
}

impl From<&str> for Port {
    fn from(raw: &str) -> Self {
        Port::Name(raw.to_string())
    }
}

impl From<i64> for Port {
    fn from(number: i64) -> Self {
        Port::Number(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_the_wire_form() {
        let named = Port::from_value(&json!("/dev/ttyUSB0")).expect("name");
        assert_eq!(named, Port::Name("/dev/ttyUSB0".to_string()));
        assert_eq!(named.to_value(), json!("/dev/ttyUSB0"));

        let numbered = Port::from_value(&json!(3)).expect("number");
        assert_eq!(numbered, Port::Number(3));
        assert_eq!(numbered.to_value(), json!(3));
        assert_eq!(serde_json::to_value(&numbered).expect("ser"), json!(3));
    }

    #[test]
    fn rejects_non_identifiers() {
        assert!(Port::from_value(&json!(null)).is_err());
        assert!(Port::from_value(&json!(1.5)).is_err());
        assert!(Port::from_value(&json!([1])).is_err());
    }

    #[test]
    fn parses_operator_input() {
        assert_eq!("12".parse::<Port>(), Ok(Port::Number(12)));
        assert_eq!(" P1 ".parse::<Port>(), Ok(Port::Name("P1".to_string())));
        assert_eq!(Port::from("P1").to_string(), "P1");
    }
}
