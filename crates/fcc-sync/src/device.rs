use crate::model::{
    Axis, DeviceConstants, DeviceFields, Extruder, Gpio, Mirrored, Temp, TempSlot,
};
use fcc_core::{CallSpec, ValueError};
use serde_json::Value;
use tracing::warn;

/// Identity of one mirror instance. A device that detaches and re-attaches
/// on the same port gets a fresh id, so anything keyed on the old instance
/// (the active remote context, in-flight polls) stops matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirrorId(pub u64);

/// One guarded poll: read `slot` with `call` while the sensor is monitored.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEntry {
    pub slot: TempSlot,
    pub call: CallSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityGroup {
    Axis,
    Extruder,
    Temp,
    Gpio,
}

impl EntityGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityGroup::Axis => "axis",
            EntityGroup::Extruder => "extruder",
            EntityGroup::Temp => "temp",
            EntityGroup::Gpio => "gpio",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMirror {
    id: MirrorId,
    constants: DeviceConstants,
    fields: DeviceFields,
    axes: Vec<Axis>,
    extruders: Vec<Extruder>,
    temps: Vec<Temp>,
    gpios: Vec<Gpio>,
    printing: bool,
    monitor_queue: Vec<MonitorEntry>,
}

impl DeviceMirror {
    pub fn new(id: MirrorId, constants: DeviceConstants) -> Self {
        let monitor_queue = (0..constants.max_extruders)
            .map(TempSlot::Extruder)
            .chain((0..constants.max_temps).map(TempSlot::Standalone))
            .map(|slot| MonitorEntry {
                slot,
                call: CallSpec::new(slot.read_method(), vec![Value::from(slot.index())]),
            })
            .collect();
        Self {
            id,
            constants,
            fields: DeviceFields::default(),
            axes: vec![Axis::default(); constants.max_axes],
            extruders: vec![Extruder::default(); constants.max_extruders],
            temps: vec![Temp::default(); constants.max_temps],
            gpios: vec![Gpio::default(); constants.max_gpios],
            printing: false,
            monitor_queue,
        }
    }

    pub fn id(&self) -> MirrorId {
        self.id
    }

    pub fn constants(&self) -> &DeviceConstants {
        &self.constants
    }

    pub fn fields(&self) -> &DeviceFields {
        &self.fields
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn extruders(&self) -> &[Extruder] {
        &self.extruders
    }

    pub fn temps(&self) -> &[Temp] {
        &self.temps
    }

    pub fn gpios(&self) -> &[Gpio] {
        &self.gpios
    }

    pub fn printing(&self) -> bool {
        self.printing
    }

    pub fn monitor_queue(&self) -> &[MonitorEntry] {
        &self.monitor_queue
    }

    pub fn active_count(&self, group: EntityGroup) -> usize {
        match group {
            EntityGroup::Axis => self.fields.num_axes,
            EntityGroup::Extruder => self.fields.num_extruders,
            EntityGroup::Temp => self.fields.num_temps,
            EntityGroup::Gpio => self.fields.num_gpios,
        }
    }

    pub fn group_len(&self, group: EntityGroup) -> usize {
        match group {
            EntityGroup::Axis => self.axes.len(),
            EntityGroup::Extruder => self.extruders.len(),
            EntityGroup::Temp => self.temps.len(),
            EntityGroup::Gpio => self.gpios.len(),
        }
    }

    /// Entities past the active count stay mirrored but inert.
    pub fn is_enabled(&self, group: EntityGroup, index: usize) -> bool {
        index < self.group_len(group) && index < self.active_count(group)
    }

    pub fn temp(&self, slot: TempSlot) -> Option<&Temp> {
        match slot {
            TempSlot::Extruder(index) => self.extruders.get(index).map(|e| &e.temp),
            TempSlot::Standalone(index) => self.temps.get(index),
        }
    }

    fn temp_mut(&mut self, slot: TempSlot) -> Option<&mut Temp> {
        match slot {
            TempSlot::Extruder(index) => self.extruders.get_mut(index).map(|e| &mut e.temp),
            TempSlot::Standalone(index) => self.temps.get_mut(index),
        }
    }

    pub fn monitor_guard(&self, index: usize) -> bool {
        self.monitor_queue
            .get(index)
            .and_then(|entry| self.temp(entry.slot))
            .map(Temp::is_monitored)
            .unwrap_or(false)
    }

    /// Index of the first entry at or after `from` whose guard holds.
    pub fn next_monitored(&self, from: usize) -> Option<usize> {
        (from..self.monitor_queue.len()).find(|index| self.monitor_guard(*index))
    }

    /// `None` records a reading the device reported as not-a-number.
    pub(crate) fn record_reading(&mut self, slot: TempSlot, reading: Option<f64>) {
        if let Some(temp) = self.temp_mut(slot) {
            temp.current = reading;
        }
    }

    pub(crate) fn update_fields(&mut self, values: &[Value]) -> Result<(), ValueError> {
        let fields = DeviceFields::from_values(values)?;
        if fields.name.len() > self.constants.name_len {
            warn!(
                event = "device_name_too_long",
                name = %fields.name,
                limit = self.constants.name_len
            );
        }
        self.fields = fields;
        Ok(())
    }

    /// Applies a positional update to one sub-entity. `Ok(false)` means the
    /// index is outside the fixed-length array.
    pub(crate) fn update_entity(
        &mut self,
        group: EntityGroup,
        index: usize,
        values: &[Value],
    ) -> Result<bool, ValueError> {
        let applied = match group {
            EntityGroup::Axis => self.axes.get_mut(index).map(|axis| axis.update(values)),
            EntityGroup::Extruder => self.extruders.get_mut(index).map(|e| e.update(values)),
            EntityGroup::Temp => self.temps.get_mut(index).map(|temp| temp.update(values)),
            EntityGroup::Gpio => self.gpios.get_mut(index).map(|gpio| gpio.update(values)),
        };
        match applied {
            Some(result) => result.map(|()| true),
            None => Ok(false),
        }
    }

    pub(crate) fn set_printing(&mut self, printing: bool) {
        self.printing = printing;
    }
}
