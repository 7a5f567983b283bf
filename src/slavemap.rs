//! Per-slave address maps for the served-memory side
//!
//! When this side owns the device memory (acting as the slave) instead of
//! polling a remote one, points register into address buckets keyed by
//! (slave, object kind, address). A local write to a registered address
//! updates the raw buffer once and notifies every other point aliasing
//! that address, so e.g. a bit-flag point and a whole-word point over the
//! same register stay in step without a second device exchange.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PointLinkError, Result};
use crate::events::{Direction, EngineEvent};
use crate::interface::{Interface, PointHandle};
use crate::point::ObjectKind;

/// Address-keyed registry of points served from local memory
pub struct SlaveMap {
    interface: Interface,
    buckets: Mutex<HashMap<(u8, ObjectKind), HashMap<u16, Vec<PointHandle>>>>,
}

impl SlaveMap {
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register a bound point under every address its value occupies
    pub fn register(&self, handle: PointHandle) -> Result<()> {
        let point = self
            .interface
            .get(handle)
            .ok_or(PointLinkError::PointGone)?;
        let address = point.address();
        let length = point.value_length();
        let mut buckets = self.buckets.lock();
        let area = buckets.entry((address.slave, address.kind)).or_default();
        for offset in 0..length {
            let slot = area.entry(address.address + offset).or_default();
            if !slot.contains(&handle) {
                slot.push(handle);
            }
        }
        Ok(())
    }

    /// Drop a point from every bucket it occupies
    pub fn unregister(&self, handle: PointHandle) {
        let mut buckets = self.buckets.lock();
        for area in buckets.values_mut() {
            for slot in area.values_mut() {
                slot.retain(|h| *h != handle);
            }
            area.retain(|_, slot| !slot.is_empty());
        }
        buckets.retain(|_, area| !area.is_empty());
    }

    /// Points currently registered at one address
    pub fn aliases(&self, slave: u8, kind: ObjectKind, address: u16) -> Vec<PointHandle> {
        let buckets = self.buckets.lock();
        buckets
            .get(&(slave, kind))
            .and_then(|area| area.get(&address))
            .cloned()
            .unwrap_or_default()
    }

    /// Write raw words into the served memory and refresh every aliasing
    /// point except `origin`
    ///
    /// The origin already knows the value it wrote; notifying it back
    /// would echo. All other points covering any written address decode
    /// the fresh contents from memory.
    pub fn write_local(
        &self,
        slave: u8,
        kind: ObjectKind,
        start: u16,
        words: &[u16],
        origin: Option<PointHandle>,
    ) {
        self.interface
            .memory()
            .write_range(slave, kind, start, words);

        let affected: Vec<PointHandle> = {
            let buckets = self.buckets.lock();
            let Some(area) = buckets.get(&(slave, kind)) else {
                return;
            };
            let mut seen = Vec::new();
            for offset in 0..words.len() as u16 {
                if let Some(slot) = area.get(&(start + offset)) {
                    for handle in slot {
                        if Some(*handle) != origin && !seen.contains(handle) {
                            seen.push(*handle);
                        }
                    }
                }
            }
            seen
        };

        for handle in affected {
            let Some(point) = self.interface.get(handle) else {
                continue;
            };
            match point.receive_from_memory(self.interface.memory()) {
                Ok(value) => {
                    self.interface
                        .emit(EngineEvent::ValueReceived { handle, value });
                },
                Err(error) => {
                    self.interface.emit(EngineEvent::PointError {
                        handle,
                        direction: Direction::Receiving,
                        error,
                    });
                },
            }
        }
    }

    /// Re-address a registered point
    ///
    /// The point leaves its old bucket before the address takes effect and
    /// only then re-enters, so it is never aliased under both addresses.
    pub fn rebind_address(&self, handle: PointHandle, new_address: u16) -> Result<()> {
        let point = self
            .interface
            .get(handle)
            .ok_or(PointLinkError::PointGone)?;
        let old = point.address().address;
        self.unregister(handle);
        point.set_address(new_address);
        self.interface.mark_topology_changed();
        self.register(handle)?;
        debug!(point = %point.name(), old, new = new_address, "Point re-addressed");
        Ok(())
    }

    /// Drop handles whose points have been unbound since registration
    pub fn vacuum(&self) {
        let mut buckets = self.buckets.lock();
        for area in buckets.values_mut() {
            for slot in area.values_mut() {
                slot.retain(|h| self.interface.get(*h).is_some());
            }
            area.retain(|_, slot| !slot.is_empty());
        }
        buckets.retain(|_, area| !area.is_empty());
    }

    /// Number of distinct (slave, kind, address) buckets in use
    pub fn bucket_count(&self) -> usize {
        let buckets = self.buckets.lock();
        buckets.values().map(|area| area.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::codec::DataFormat;
    use crate::handler::Mode;
    use crate::point::{Point, PointAddress, PointConfig};
    use crate::value::Value;

    fn word_point(name: &str, address: u16, format: DataFormat) -> Arc<Point> {
        Point::new(
            PointConfig::new(
                name,
                PointAddress {
                    slave: 1,
                    kind: ObjectKind::WordWritable,
                    address,
                },
                format,
            ),
            Mode::TwoWay,
        )
        .unwrap()
    }

    #[test]
    fn test_write_notifies_aliases_but_not_origin() {
        let interface = Interface::new();
        let word = word_point("word", 10, DataFormat::UInt16);
        let flag = word_point("flag", 10, DataFormat::Bool { bit: 5 });
        let word_handle = interface.bind(Arc::clone(&word));
        let flag_handle = interface.bind(Arc::clone(&flag));

        let map = SlaveMap::new(interface);
        map.register(word_handle).unwrap();
        map.register(flag_handle).unwrap();

        map.write_local(1, ObjectKind::WordWritable, 10, &[1 << 5], Some(word_handle));

        assert_eq!(flag.handler().value(), Some(Value::Bool(true)));
        // The origin is not echoed back to.
        assert!(word.handler().value().is_none());
    }

    #[test]
    fn test_multi_register_point_registered_under_each_address() {
        let interface = Interface::new();
        let point = word_point("f", 100, DataFormat::Float32);
        let handle = interface.bind(point);

        let map = SlaveMap::new(interface);
        map.register(handle).unwrap();

        assert_eq!(map.aliases(1, ObjectKind::WordWritable, 100), vec![handle]);
        assert_eq!(map.aliases(1, ObjectKind::WordWritable, 101), vec![handle]);
        assert!(map.aliases(1, ObjectKind::WordWritable, 102).is_empty());
    }

    #[test]
    fn test_rebind_leaves_exactly_one_bucket() {
        let interface = Interface::new();
        let point = word_point("p", 10, DataFormat::UInt16);
        let handle = interface.bind(Arc::clone(&point));
        interface.take_topology_changed();

        let map = SlaveMap::new(interface.clone());
        map.register(handle).unwrap();

        map.rebind_address(handle, 20).unwrap();

        assert!(map.aliases(1, ObjectKind::WordWritable, 10).is_empty());
        assert_eq!(map.aliases(1, ObjectKind::WordWritable, 20), vec![handle]);
        assert_eq!(map.bucket_count(), 1);
        assert_eq!(point.address().address, 20);
        assert!(interface.take_topology_changed());
    }

    #[test]
    fn test_vacuum_drops_unbound_points() {
        let interface = Interface::new();
        let handle = interface.bind(word_point("p", 10, DataFormat::UInt16));

        let map = SlaveMap::new(interface.clone());
        map.register(handle).unwrap();
        assert_eq!(map.bucket_count(), 1);

        interface.unbind(handle);
        map.vacuum();
        assert_eq!(map.bucket_count(), 0);
    }

    #[test]
    fn test_register_stale_handle_rejected() {
        let interface = Interface::new();
        let handle = interface.bind(word_point("p", 10, DataFormat::UInt16));
        interface.unbind(handle);

        let map = SlaveMap::new(interface);
        assert!(matches!(
            map.register(handle),
            Err(PointLinkError::PointGone)
        ));
    }
}
