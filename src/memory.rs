//! Shared device-memory window
//!
//! A sparse, address-keyed register cache per (slave, object kind),
//! representing the most recently read raw contents. Merged read responses
//! extend it, point codecs read it, and local slave writes mutate it
//! immediately before fan-out. All access goes through range operations
//! under one lock; raw buffers are never exposed outside the lock scope.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PointLinkError, Result};
use crate::point::ObjectKind;

type AreaKey = (u8, ObjectKind);

/// Per-slave register cache, cheap to clone and share
///
/// Bit objects store one entry per bit address (0 or 1); word objects store
/// one entry per register address.
#[derive(Debug, Clone, Default)]
pub struct DeviceMemory {
    areas: Arc<RwLock<HashMap<AreaKey, BTreeMap<u16, u16>>>>,
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `values` starting at `start`, extending the window
    pub fn write_range(&self, slave: u8, kind: ObjectKind, start: u16, values: &[u16]) {
        let mut areas = self.areas.write();
        let area = areas.entry((slave, kind)).or_default();
        for (i, &v) in values.iter().enumerate() {
            area.insert(start.wrapping_add(i as u16), v);
        }
    }

    /// Read `count` consecutive units starting at `start`
    ///
    /// Any uncovered address makes the whole read an
    /// [`PointLinkError::InsufficientData`] error; a decode on missing data
    /// must surface as a point-level error, not a partial value.
    pub fn read_range(&self, slave: u8, kind: ObjectKind, start: u16, count: u16) -> Result<Vec<u16>> {
        let areas = self.areas.read();
        let area = areas.get(&(slave, kind)).ok_or_else(|| {
            PointLinkError::InsufficientData(format!(
                "No cached window for slave {slave} {kind:?}"
            ))
        })?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let addr = start.wrapping_add(i);
            match area.get(&addr) {
                Some(&v) => out.push(v),
                None => {
                    return Err(PointLinkError::InsufficientData(format!(
                        "Address {addr} not covered for slave {slave} {kind:?}"
                    )))
                },
            }
        }
        Ok(out)
    }

    /// Single-unit read shorthand
    pub fn read_word(&self, slave: u8, kind: ObjectKind, address: u16) -> Result<u16> {
        Ok(self.read_range(slave, kind, address, 1)?[0])
    }

    /// Drop every cached area (e.g. after reconnect)
    pub fn clear(&self) {
        self.areas.write().clear();
    }
}
