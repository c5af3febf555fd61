//! Mirrored configuration entities and their positional wire layouts.

use fcc_core::values::nullable_f64;
use fcc_core::{Positional, ValueError};
use serde_json::Value;
use std::fmt;

/// Pin setting as the firmware encodes it: low byte is the pin number,
/// 0x100 marks the pin invalid (unused) and 0x200 inverts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pin {
    pub number: u8,
    pub invalid: bool,
    pub inverted: bool,
}

impl Pin {
    const INVALID: u64 = 0x100;
    const INVERTED: u64 = 0x200;

    pub fn from_raw(raw: u64) -> Self {
        Self {
            number: (raw & 0xff) as u8,
            invalid: raw & Self::INVALID != 0,
            inverted: raw & Self::INVERTED != 0,
        }
    }

    pub fn to_raw(self) -> u64 {
        let mut raw = u64::from(self.number);
        if self.invalid {
            raw |= Self::INVALID;
        }
        if self.inverted {
            raw |= Self::INVERTED;
        }
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrinterType {
    #[default]
    Cartesian,
    Delta,
}

impl PrinterType {
    fn from_index(view: &Positional<'_>, index: usize) -> Result<Self, ValueError> {
        match view.u64(index)? {
            0 => Ok(PrinterType::Cartesian),
            1 => Ok(PrinterType::Delta),
            _ => Err(ValueError::Kind {
                index,
                expected: "printer type 0 or 1",
                found: view.value(index).clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpioState {
    #[default]
    Disconnected,
    Input,
    Low,
    High,
}

impl GpioState {
    fn from_index(view: &Positional<'_>, index: usize) -> Result<Self, ValueError> {
        match view.u64(index)? {
            0 => Ok(GpioState::Disconnected),
            1 => Ok(GpioState::Input),
            2 => Ok(GpioState::Low),
            3 => Ok(GpioState::High),
            _ => Err(ValueError::Kind {
                index,
                expected: "gpio state 0..=3",
                found: view.value(index).clone(),
            }),
        }
    }

    pub fn as_index(self) -> u64 {
        match self {
            GpioState::Disconnected => 0,
            GpioState::Input => 1,
            GpioState::Low => 2,
            GpioState::High => 3,
        }
    }
}

/// An entity whose fields are pushed by the server as one positional list.
pub trait Mirrored: Sized {
    const ARITY: usize;

    fn from_values(values: &[Value]) -> Result<Self, ValueError>;

    /// Apply remote-origin values. Parsing completes before anything is
    /// assigned, so a malformed list leaves the entity untouched.
    fn update(&mut self, values: &[Value]) -> Result<(), ValueError> {
        *self = Self::from_values(values)?;
        Ok(())
    }

    /// `(part, raw value)` for every configuration field, in setup order.
    fn setup_fields(&self) -> Vec<(&'static str, Value)>;
}

/// Immutable per-device limits captured once at attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceConstants {
    pub name_len: usize,
    pub max_axes: usize,
    pub max_extruders: usize,
    pub max_temps: usize,
    pub max_gpios: usize,
    pub audio_fragments: usize,
    pub audio_fragment_size: usize,
    pub num_digital_pins: usize,
    pub num_pins: usize,
}

impl DeviceConstants {
    pub const ARITY: usize = 9;
    /// Firmware keeps every limit in a single byte.
    pub const MAX_COUNT: u64 = u8::MAX as u64;

    pub fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            name_len: view.count(0, Self::MAX_COUNT)?,
            max_axes: view.count(1, Self::MAX_COUNT)?,
            max_extruders: view.count(2, Self::MAX_COUNT)?,
            max_temps: view.count(3, Self::MAX_COUNT)?,
            max_gpios: view.count(4, Self::MAX_COUNT)?,
            audio_fragments: view.count(5, Self::MAX_COUNT)?,
            audio_fragment_size: view.usize(6)?,
            num_digital_pins: view.usize(7)?,
            num_pins: view.usize(8)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceFields {
    pub name: String,
    pub num_axes: usize,
    pub num_extruders: usize,
    pub num_temps: usize,
    pub num_gpios: usize,
    pub printer_type: PrinterType,
    pub led_pin: Pin,
    pub room_t: f64,
    pub motor_limit: f64,
    pub temp_limit: f64,
    pub feedrate: f64,
    pub paused: bool,
}

impl Mirrored for DeviceFields {
    const ARITY: usize = 12;

    fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            name: view.str(0)?.to_string(),
            num_axes: view.usize(1)?,
            num_extruders: view.usize(2)?,
            num_temps: view.usize(3)?,
            num_gpios: view.usize(4)?,
            printer_type: PrinterType::from_index(&view, 5)?,
            led_pin: Pin::from_raw(view.u64(6)?),
            room_t: view.f64(7)?,
            motor_limit: view.f64(8)?,
            temp_limit: view.f64(9)?,
            feedrate: view.f64(10)?,
            paused: view.bool(11)?,
        })
    }

    fn setup_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", Value::from(self.name.as_str())),
            ("num_axes", Value::from(self.num_axes)),
            ("num_extruders", Value::from(self.num_extruders)),
            ("num_temps", Value::from(self.num_temps)),
            ("num_gpios", Value::from(self.num_gpios)),
            (
                "printer_type",
                Value::from(match self.printer_type {
                    PrinterType::Cartesian => 0,
                    PrinterType::Delta => 1,
                }),
            ),
            ("led_pin", Value::from(self.led_pin.to_raw())),
            ("room_T", Value::from(self.room_t)),
            ("motor_limit", Value::from(self.motor_limit)),
            ("temp_limit", Value::from(self.temp_limit)),
            ("feedrate", Value::from(self.feedrate)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Motor {
    pub step_pin: Pin,
    pub dir_pin: Pin,
    pub enable_pin: Pin,
    pub steps_per_mm: f64,
    pub max_v_pos: f64,
    pub max_v_neg: f64,
    pub max_a: f64,
    /// Continuous run speed; the sign is the direction, `None` is stopped.
    pub run: Option<f64>,
    pub sleep: bool,
}

impl Mirrored for Motor {
    const ARITY: usize = 9;

    fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            step_pin: Pin::from_raw(view.u64(0)?),
            dir_pin: Pin::from_raw(view.u64(1)?),
            enable_pin: Pin::from_raw(view.u64(2)?),
            steps_per_mm: view.f64(3)?,
            max_v_pos: view.f64(4)?,
            max_v_neg: view.f64(5)?,
            max_a: view.f64(6)?,
            run: view.opt_f64(7)?,
            sleep: view.bool(8)?,
        })
    }

    fn setup_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("step_pin", Value::from(self.step_pin.to_raw())),
            ("dir_pin", Value::from(self.dir_pin.to_raw())),
            ("enable_pin", Value::from(self.enable_pin.to_raw())),
            ("steps_per_mm", Value::from(self.steps_per_mm)),
            ("max_v_pos", Value::from(self.max_v_pos)),
            ("max_v_neg", Value::from(self.max_v_neg)),
            ("max_a", Value::from(self.max_a)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Axis {
    pub motor: Motor,
    pub limit_min_pin: Pin,
    pub limit_max_pin: Pin,
    pub sense_pin: Pin,
    pub limit_min_pos: f64,
    pub limit_max_pos: f64,
    pub delta_length: f64,
    pub delta_radius: f64,
    pub offset: f64,
}

impl Mirrored for Axis {
    const ARITY: usize = 9;

    fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            motor: Motor::from_values(view.array(0)?)?,
            limit_min_pin: Pin::from_raw(view.u64(1)?),
            limit_max_pin: Pin::from_raw(view.u64(2)?),
            sense_pin: Pin::from_raw(view.u64(3)?),
            limit_min_pos: view.f64(4)?,
            limit_max_pos: view.f64(5)?,
            delta_length: view.f64(6)?,
            delta_radius: view.f64(7)?,
            offset: view.f64(8)?,
        })
    }

    fn setup_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("limit_min_pin", Value::from(self.limit_min_pin.to_raw())),
            ("limit_max_pin", Value::from(self.limit_max_pin.to_raw())),
            ("sense_pin", Value::from(self.sense_pin.to_raw())),
            ("limit_min_pos", Value::from(self.limit_min_pos)),
            ("limit_max_pos", Value::from(self.limit_max_pos)),
            ("delta_length", Value::from(self.delta_length)),
            ("delta_radius", Value::from(self.delta_radius)),
            ("offset", Value::from(self.offset)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Temp {
    pub power_pin: Pin,
    pub thermistor_pin: Pin,
    pub r0: f64,
    pub r1: f64,
    pub rc: f64,
    pub tc: f64,
    pub beta: f64,
    pub core_c: f64,
    pub shell_c: f64,
    pub transfer: f64,
    pub radiation: f64,
    pub power: f64,
    /// Heater target; `None` when the heater is off.
    pub target: Option<f64>,
    /// Last polled reading. Only the poll cycle writes this.
    pub current: Option<f64>,
}

impl Temp {
    /// Sensors with an invalid thermistor pin are never polled.
    pub fn is_monitored(&self) -> bool {
        !self.thermistor_pin.invalid
    }
}

impl Mirrored for Temp {
    const ARITY: usize = 13;

    fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            power_pin: Pin::from_raw(view.u64(0)?),
            thermistor_pin: Pin::from_raw(view.u64(1)?),
            r0: view.f64(2)?,
            r1: view.f64(3)?,
            rc: view.f64(4)?,
            tc: view.f64(5)?,
            beta: view.f64(6)?,
            core_c: view.f64(7)?,
            shell_c: view.f64(8)?,
            transfer: view.f64(9)?,
            radiation: view.f64(10)?,
            power: view.f64(11)?,
            target: view.opt_f64(12)?,
            current: None,
        })
    }

    fn update(&mut self, values: &[Value]) -> Result<(), ValueError> {
        let current = self.current;
        *self = Self::from_values(values)?;
        self.current = current;
        Ok(())
    }

    fn setup_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("power_pin", Value::from(self.power_pin.to_raw())),
            ("thermistor_pin", Value::from(self.thermistor_pin.to_raw())),
            ("R0", Value::from(self.r0)),
            ("R1", Value::from(self.r1)),
            ("Rc", Value::from(self.rc)),
            ("Tc", Value::from(self.tc)),
            ("beta", Value::from(self.beta)),
            ("core_C", Value::from(self.core_c)),
            ("shell_C", Value::from(self.shell_c)),
            ("transfer", Value::from(self.transfer)),
            ("radiation", Value::from(self.radiation)),
            ("power", Value::from(self.power)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extruder {
    pub motor: Motor,
    pub temp: Temp,
    pub filament_heat: f64,
    pub nozzle_size: f64,
    pub filament_size: f64,
}

impl Mirrored for Extruder {
    const ARITY: usize = 5;

    fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            motor: Motor::from_values(view.array(0)?)?,
            temp: Temp::from_values(view.array(1)?)?,
            filament_heat: view.f64(2)?,
            nozzle_size: view.f64(3)?,
            filament_size: view.f64(4)?,
        })
    }

    fn update(&mut self, values: &[Value]) -> Result<(), ValueError> {
        let current = self.temp.current;
        *self = Self::from_values(values)?;
        self.temp.current = current;
        Ok(())
    }

    fn setup_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("filament_heat", Value::from(self.filament_heat)),
            ("nozzle_size", Value::from(self.nozzle_size)),
            ("filament_size", Value::from(self.filament_size)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Gpio {
    pub pin: Pin,
    pub state: GpioState,
    /// Temp or extruder slot that drives this output, if any.
    pub master: Option<u64>,
    pub value: f64,
}

impl Mirrored for Gpio {
    const ARITY: usize = 4;

    fn from_values(values: &[Value]) -> Result<Self, ValueError> {
        let view = Positional::exact(values, Self::ARITY)?;
        Ok(Self {
            pin: Pin::from_raw(view.u64(0)?),
            state: GpioState::from_index(&view, 1)?,
            master: view.opt_u64(2)?,
            value: view.f64(3)?,
        })
    }

    fn setup_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("pin", Value::from(self.pin.to_raw())),
            ("state", Value::from(self.state.as_index())),
            ("master", self.master.map_or(Value::Null, Value::from)),
            ("value", Value::from(self.value)),
        ]
    }
}

/// Addresses one temperature sensor of a device: either the sensor built
/// into an extruder or a standalone temp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TempSlot {
    Extruder(usize),
    Standalone(usize),
}

impl TempSlot {
    pub fn index(self) -> usize {
        match self {
            TempSlot::Extruder(index) | TempSlot::Standalone(index) => index,
        }
    }

    /// Suffix of the per-sensor remote methods (`readtemp_*`, `settemp_*`).
    pub fn method_suffix(self) -> &'static str {
        match self {
            TempSlot::Extruder(_) => "extruder",
            TempSlot::Standalone(_) => "temp",
        }
    }

    pub fn read_method(self) -> String {
        format!("readtemp_{}", self.method_suffix())
    }

    pub fn set_target_call(self, target: Option<f64>) -> fcc_core::CallSpec {
        fcc_core::CallSpec::new(
            format!("settemp_{}", self.method_suffix()),
            vec![Value::from(self.index()), nullable_f64(target)],
        )
    }
}

impl fmt::Display for TempSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TempSlot::Extruder(index) => write!(f, "e{index}"),
            TempSlot::Standalone(index) => write!(f, "t{index}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn motor_values() -> Value {
        json!([2, 5, 0x108, 80.0, 200.0, 200.0, 1000.0, null, false])
    }

    pub fn temp_values(thermistor_pin: u64) -> Vec<Value> {
        vec![
            json!(10),
            json!(thermistor_pin),
            json!(100000.0),
            json!(4700.0),
            json!(0.0),
            json!(25.0),
            json!(3950.0),
            json!(0.0),
            json!(0.0),
            json!(0.0),
            json!(0.0),
            json!(40.0),
            json!(null),
        ]
    }

    pub fn axis_values() -> Vec<Value> {
        vec![
            motor_values(),
            json!(3),
            json!(0x100),
            json!(0x100),
            json!(0.0),
            json!(200.0),
            json!(0.0),
            json!(0.0),
            json!(0.0),
        ]
    }

    pub fn extruder_values(thermistor_pin: u64) -> Vec<Value> {
        vec![
            motor_values(),
            Value::Array(temp_values(thermistor_pin)),
            json!(0.0),
            json!(0.4),
            json!(1.75),
        ]
    }

    pub fn gpio_values() -> Vec<Value> {
        vec![json!(13), json!(2), json!(null), json!(0.5)]
    }

    pub fn device_field_values(name: &str, counts: [usize; 4]) -> Vec<Value> {
        vec![
            json!(name),
            json!(counts[0]),
            json!(counts[1]),
            json!(counts[2]),
            json!(counts[3]),
            json!(0),
            json!(0x100),
            json!(20.0),
            json!(30000.0),
            json!(60000.0),
            json!(1.0),
            json!(false),
        ]
    }
}
