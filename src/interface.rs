//! Point collections
//!
//! An interface owns a set of points in a generational arena. Handles are
//! weak back-references: a removed point bumps its slot's generation, so
//! stale handles resolve to nothing instead of pinning the point alive.
//! One lock guards the point set and the topology-changed flag; the poll
//! task rebuilds its merge plan under that same lock.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::client::ProtocolClient;
use crate::error::{PointLinkError, Result};
use crate::events::{Direction, EngineEvent};
use crate::memory::DeviceMemory;
use crate::point::Point;
use crate::value::Value;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Stable, generation-checked reference to a point inside an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Back-reference from a point to its owning interface
#[derive(Clone)]
pub(crate) struct OwnerRef {
    pub(crate) shared: Weak<Shared>,
    pub(crate) handle: PointHandle,
}

struct Slot {
    generation: u32,
    point: Option<Arc<Point>>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    topology_changed: bool,
}

pub(crate) struct Shared {
    registry: Mutex<Registry>,
    memory: DeviceMemory,
    events: broadcast::Sender<EngineEvent>,
}

impl Shared {
    /// Remove a handle's point; bumping the generation invalidates every
    /// outstanding copy of the handle
    fn remove(&self, handle: PointHandle) -> Option<Arc<Point>> {
        let point = {
            let mut registry = self.registry.lock();
            let slot = registry.slots.get_mut(handle.index as usize)?;
            if slot.generation != handle.generation {
                return None;
            }
            let point = slot.point.take()?;
            slot.generation = slot.generation.wrapping_add(1);
            registry.free.push(handle.index);
            registry.topology_changed = true;
            point
        };
        point.set_owner(None);
        Some(point)
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // Nobody subscribed is fine.
        let _ = self.events.send(event);
    }
}

/// A collection of points polled and written as one unit
#[derive(Clone)]
pub struct Interface {
    shared: Arc<Shared>,
}

impl Default for Interface {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                memory: DeviceMemory::new(),
                events,
            }),
        }
    }

    /// Shared device-memory window of this interface
    pub fn memory(&self) -> &DeviceMemory {
        &self.shared.memory
    }

    /// Subscribe to engine events (point errors, received values, cycle
    /// completions)
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.shared.emit(event);
    }

    /// Bind a point to this interface
    ///
    /// A point bound to another interface is detached from it first; a
    /// point already bound here keeps its handle.
    pub fn bind(&self, point: Arc<Point>) -> PointHandle {
        if let Some(owner) = point.owner() {
            if let Some(previous) = owner.shared.upgrade() {
                if Arc::ptr_eq(&previous, &self.shared) {
                    return owner.handle;
                }
                debug!(point = %point.name(), "Detaching point from previous interface");
                previous.remove(owner.handle);
            }
        }

        let handle = {
            let mut registry = self.shared.registry.lock();
            let handle = match registry.free.pop() {
                Some(index) => {
                    let slot = &mut registry.slots[index as usize];
                    slot.point = Some(Arc::clone(&point));
                    PointHandle {
                        index,
                        generation: slot.generation,
                    }
                },
                None => {
                    let index = registry.slots.len() as u32;
                    registry.slots.push(Slot {
                        generation: 0,
                        point: Some(Arc::clone(&point)),
                    });
                    PointHandle {
                        index,
                        generation: 0,
                    }
                },
            };
            registry.topology_changed = true;
            handle
        };
        point.set_owner(Some(OwnerRef {
            shared: Arc::downgrade(&self.shared),
            handle,
        }));
        handle
    }

    /// Bind a batch of points, returning the handles in order
    pub fn bind_all(&self, points: impl IntoIterator<Item = Arc<Point>>) -> Vec<PointHandle> {
        points.into_iter().map(|p| self.bind(p)).collect()
    }

    /// Unbind a point, returning it if the handle was live
    pub fn unbind(&self, handle: PointHandle) -> Option<Arc<Point>> {
        self.shared.remove(handle)
    }

    /// Unbind every point
    pub fn unbind_all(&self) {
        let handles: Vec<PointHandle> = self
            .points()
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        for handle in handles {
            self.shared.remove(handle);
        }
    }

    /// Resolve a handle; stale handles return `None`
    pub fn get(&self, handle: PointHandle) -> Option<Arc<Point>> {
        let registry = self.shared.registry.lock();
        let slot = registry.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.point.clone()
    }

    /// Snapshot of all live points
    pub fn points(&self) -> Vec<(PointHandle, Arc<Point>)> {
        let registry = self.shared.registry.lock();
        registry
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.point.as_ref().map(|point| {
                    (
                        PointHandle {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        Arc::clone(point),
                    )
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        let registry = self.shared.registry.lock();
        registry.slots.iter().filter(|s| s.point.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag the point topology as changed (address or window edits)
    pub fn mark_topology_changed(&self) {
        self.shared.registry.lock().topology_changed = true;
    }

    /// Consume the topology-changed flag
    pub(crate) fn take_topology_changed(&self) -> bool {
        let mut registry = self.shared.registry.lock();
        std::mem::take(&mut registry.topology_changed)
    }

    /// Send a value through a bound point, surfacing failures as Sending
    /// point errors
    pub async fn send_value(
        &self,
        handle: PointHandle,
        client: &Arc<dyn ProtocolClient>,
        value: &Value,
    ) -> Result<()> {
        let point = self.get(handle).ok_or(PointLinkError::PointGone)?;
        match point.send(client, &self.shared.memory, value).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.emit(EngineEvent::PointError {
                    handle,
                    direction: Direction::Sending,
                    error: error.clone(),
                });
                Err(error)
            },
        }
    }

    /// Outbound binding path: the host reports a member change
    pub async fn push_binding(
        &self,
        handle: PointHandle,
        client: &Arc<dyn ProtocolClient>,
        value: &Value,
    ) -> Result<()> {
        let point = self.get(handle).ok_or(PointLinkError::PointGone)?;
        match point
            .push_from_target(client, &self.shared.memory, value)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) => {
                self.emit(EngineEvent::PointError {
                    handle,
                    direction: Direction::Sending,
                    error: error.clone(),
                });
                Err(error)
            },
        }
    }

    /// Resend a point's cached value (`SendLocalValue`)
    pub async fn resend_local(
        &self,
        handle: PointHandle,
        client: &Arc<dyn ProtocolClient>,
    ) -> Result<()> {
        let point = self.get(handle).ok_or(PointLinkError::PointGone)?;
        point.resend_local(client, &self.shared.memory).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataFormat;
    use crate::handler::Mode;
    use crate::point::{ObjectKind, PointAddress, PointConfig};

    fn make_point(address: u16) -> Arc<Point> {
        Point::new(
            PointConfig::new(
                format!("p{address}"),
                PointAddress {
                    slave: 1,
                    kind: ObjectKind::WordReadOnly,
                    address,
                },
                DataFormat::UInt16,
            ),
            Mode::TwoWay,
        )
        .unwrap()
    }

    #[test]
    fn test_bind_and_resolve() {
        let interface = Interface::new();
        let point = make_point(10);
        let handle = interface.bind(Arc::clone(&point));
        assert!(Arc::ptr_eq(&interface.get(handle).unwrap(), &point));
        assert_eq!(interface.len(), 1);
    }

    #[test]
    fn test_stale_handle_after_unbind() {
        let interface = Interface::new();
        let handle = interface.bind(make_point(10));
        assert!(interface.unbind(handle).is_some());
        assert!(interface.get(handle).is_none());
        assert!(interface.unbind(handle).is_none());
    }

    #[test]
    fn test_slot_reuse_invalidates_old_handle() {
        let interface = Interface::new();
        let old = interface.bind(make_point(10));
        interface.unbind(old);
        let new = interface.bind(make_point(20));
        assert_eq!(old.index, new.index);
        assert!(interface.get(old).is_none());
        assert!(interface.get(new).is_some());
    }

    #[test]
    fn test_rebind_moves_point_between_interfaces() {
        let first = Interface::new();
        let second = Interface::new();
        let point = make_point(10);

        let first_handle = first.bind(Arc::clone(&point));
        assert_eq!(first.len(), 1);

        let second_handle = second.bind(Arc::clone(&point));
        assert_eq!(first.len(), 0, "point must leave the first interface");
        assert_eq!(second.len(), 1);
        assert!(first.get(first_handle).is_none());
        assert!(second.get(second_handle).is_some());
    }

    #[test]
    fn test_bind_twice_same_interface_keeps_handle() {
        let interface = Interface::new();
        let point = make_point(10);
        let first = interface.bind(Arc::clone(&point));
        let second = interface.bind(point);
        assert_eq!(first, second);
        assert_eq!(interface.len(), 1);
    }

    #[test]
    fn test_topology_flag_on_mutation() {
        let interface = Interface::new();
        assert!(!interface.take_topology_changed());
        let handle = interface.bind(make_point(10));
        assert!(interface.take_topology_changed());
        assert!(!interface.take_topology_changed());
        interface.unbind(handle);
        assert!(interface.take_topology_changed());
    }

    #[test]
    fn test_unbind_all() {
        let interface = Interface::new();
        interface.bind_all([make_point(1), make_point(2), make_point(3)]);
        assert_eq!(interface.len(), 3);
        interface.unbind_all();
        assert!(interface.is_empty());
    }
}
