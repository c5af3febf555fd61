use crate::device::DeviceMirror;
use fcc_core::Port;
use std::collections::BTreeMap;

/// What the registry knows about one port.
#[derive(Debug, Clone, Copy)]
pub enum Slot<'a> {
    Absent,
    Empty,
    Attached(&'a DeviceMirror),
}

impl Slot<'_> {
    pub fn is_present(&self) -> bool {
        !matches!(self, Slot::Absent)
    }
}

/// Ports announced by the server and the device mirror attached to each.
/// Only push notifications (and full teardown) change its membership.
#[derive(Debug, Default)]
pub struct Registry {
    ports: BTreeMap<Port, Option<DeviceMirror>>,
}

impl Registry {
    pub fn slot(&self, port: &Port) -> Slot<'_> {
        match self.ports.get(port) {
            None => Slot::Absent,
            Some(None) => Slot::Empty,
            Some(Some(device)) => Slot::Attached(device),
        }
    }

    pub fn contains(&self, port: &Port) -> bool {
        self.ports.contains_key(port)
    }

    pub fn device(&self, port: &Port) -> Option<&DeviceMirror> {
        self.ports.get(port).and_then(Option::as_ref)
    }

    pub(crate) fn device_mut(&mut self, port: &Port) -> Option<&mut DeviceMirror> {
        self.ports.get_mut(port).and_then(Option::as_mut)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.keys()
    }

    /// Finds the known port an operator typed. A name spelled exactly like
    /// the text wins over a number with the same digits.
    pub fn find(&self, text: &str) -> Option<&Port> {
        let text = text.trim();
        self.ports
            .get_key_value(&Port::Name(text.to_string()))
            .map(|(port, _)| port)
            .or_else(|| self.ports.keys().find(|port| port.to_string() == text))
    }

    pub fn devices(&self) -> impl Iterator<Item = (&Port, &DeviceMirror)> {
        self.ports
            .iter()
            .filter_map(|(port, device)| device.as_ref().map(|device| (port, device)))
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Returns false when the port was already present.
    pub(crate) fn insert_port(&mut self, port: Port) -> bool {
        if self.ports.contains_key(&port) {
            return false;
        }
        self.ports.insert(port, None);
        true
    }

    /// Removes the port, handing back any device that was still attached.
    pub(crate) fn remove_port(&mut self, port: &Port) -> Option<Option<DeviceMirror>> {
        self.ports.remove(port)
    }

    /// Stores `device` under a present port, returning the mirror it
    /// replaced. `Err` hands the device back when the port is unknown.
    pub(crate) fn attach(
        &mut self,
        port: &Port,
        device: DeviceMirror,
    ) -> Result<Option<DeviceMirror>, DeviceMirror> {
        match self.ports.get_mut(port) {
            Some(entry) => Ok(entry.replace(device)),
            None => Err(device),
        }
    }

    pub(crate) fn detach(&mut self, port: &Port) -> Option<DeviceMirror> {
        self.ports.get_mut(port).and_then(Option::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MirrorId;
    use crate::model::DeviceConstants;

    fn mirror(id: u64) -> DeviceMirror {
        DeviceMirror::new(MirrorId(id), DeviceConstants::default())
    }

    #[test]
    fn find_matches_the_announced_form() {
        let mut registry = Registry::default();
        registry.insert_port(Port::Number(3));
        registry.insert_port(Port::from("/dev/ttyACM0"));
        assert_eq!(registry.find("3"), Some(&Port::Number(3)));
        assert_eq!(registry.find("/dev/ttyACM0"), Some(&Port::from("/dev/ttyACM0")));
        assert_eq!(registry.find("4"), None);

        registry.insert_port(Port::from("3"));
        assert_eq!(registry.find("3"), Some(&Port::from("3")));
    }

    #[test]
    fn slot_tracks_the_three_states() {
        let mut registry = Registry::default();
        let port = Port::from("P1");
        assert!(matches!(registry.slot(&port), Slot::Absent));

        assert!(registry.insert_port(port.clone()));
        assert!(!registry.insert_port(port.clone()));
        assert!(matches!(registry.slot(&port), Slot::Empty));

        assert!(matches!(registry.attach(&port, mirror(1)), Ok(None)));
        assert!(matches!(registry.slot(&port), Slot::Attached(d) if d.id() == MirrorId(1)));

        let replaced = registry.attach(&port, mirror(2)).expect("present");
        assert_eq!(replaced.map(|d| d.id()), Some(MirrorId(1)));
        assert_eq!(registry.devices().count(), 1);

        assert_eq!(registry.detach(&port).map(|d| d.id()), Some(MirrorId(2)));
        assert!(registry.detach(&port).is_none());
        assert!(registry.slot(&port).is_present());

        assert!(registry.remove_port(&port).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn attach_to_unknown_port_is_refused() {
        let mut registry = Registry::default();
        let refused = registry.attach(&Port::from("P9"), mirror(4));
        assert!(matches!(refused, Err(device) if device.id() == MirrorId(4)));
        assert_eq!(registry.len(), 0);
    }
}
