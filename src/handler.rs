//! Handlers and bindings
//!
//! A handler caches the last known value and timestamp for one point. A
//! binding additionally mirrors that value into an external target through
//! an explicit two-phase API: `propose` stages an outbound change, and the
//! send outcome decides between `commit` and `revert`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Data-flow mode of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    TwoWay,
    SendOnly,
    ReceiveOnly,
}

impl Mode {
    pub fn can_send(&self) -> bool {
        matches!(self, Mode::TwoWay | Mode::SendOnly)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, Mode::TwoWay | Mode::ReceiveOnly)
    }
}

#[derive(Debug, Default)]
struct HandlerState {
    value: Option<Value>,
    timestamp: Option<DateTime<Utc>>,
}

/// Cached last known value and timestamp for one point
///
/// The timestamp stays `None` until the first successful receive or send;
/// `resend_local` uses that to refuse I/O with nothing cached.
#[derive(Debug)]
pub struct Handler {
    mode: Mode,
    state: Mutex<HandlerState>,
}

impl Handler {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Last known value, if any
    pub fn value(&self) -> Option<Value> {
        self.state.lock().value.clone()
    }

    /// Timestamp of the last successful receive or send
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.state.lock().timestamp
    }

    /// Record a successfully received value
    pub fn store_received(&self, value: Value) {
        let mut state = self.state.lock();
        state.value = Some(value);
        state.timestamp = Some(Utc::now());
    }

    /// Record a successfully sent value
    pub fn store_sent(&self, value: Value) {
        // Same cache; the distinction only matters to the caller.
        self.store_received(value);
    }
}

/// External mirror target of a binding
///
/// `propose` stages a member change and reports whether the change should
/// go ahead; the binding then calls `commit` after a successful send or
/// `revert` to restore the pre-propose member value. `apply` writes an
/// inbound value directly (the binding suppresses its own outbound
/// mirroring around the call to avoid an echo loop).
pub trait BindingTarget: Send + Sync {
    fn propose(&self, value: &Value) -> bool;
    fn commit(&self);
    fn revert(&self);
    fn apply(&self, value: &Value);
    fn current(&self) -> Value;
}

/// A handler specialization that mirrors values into a [`BindingTarget`]
pub struct Binding {
    target: Arc<dyn BindingTarget>,
    rollback_on_error: bool,
    suppressed: AtomicBool,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("rollback_on_error", &self.rollback_on_error)
            .finish()
    }
}

impl Binding {
    pub fn new(target: Arc<dyn BindingTarget>, rollback_on_error: bool) -> Self {
        Self {
            target,
            rollback_on_error,
            suppressed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Arc<dyn BindingTarget> {
        &self.target
    }

    pub fn rollback_on_error(&self) -> bool {
        self.rollback_on_error
    }

    /// Whether outbound mirroring is currently suppressed (inbound apply in
    /// progress)
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire)
    }

    /// Write an inbound value into the target with the echo-loop guard held
    pub fn apply_inbound(&self, value: &Value) {
        self.suppressed.store(true, Ordering::Release);
        self.target.apply(value);
        self.suppressed.store(false, Ordering::Release);
    }
}

/// Simple in-memory binding target, usable as-is for plain mirrored fields
///
/// Hosts with richer member semantics (setters, notifications) implement
/// [`BindingTarget`] themselves.
#[derive(Debug)]
pub struct CellTarget {
    state: Mutex<CellState>,
}

#[derive(Debug)]
struct CellState {
    current: Value,
    staged: Option<Value>,
}

impl CellTarget {
    pub fn new(initial: Value) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                current: initial,
                staged: None,
            }),
        })
    }

    /// Current member value
    pub fn get(&self) -> Value {
        self.state.lock().current.clone()
    }
}

impl BindingTarget for CellTarget {
    fn propose(&self, value: &Value) -> bool {
        let mut state = self.state.lock();
        state.staged = Some(state.current.clone());
        state.current = value.clone();
        true
    }

    fn commit(&self) {
        self.state.lock().staged = None;
    }

    fn revert(&self) {
        let mut state = self.state.lock();
        if let Some(previous) = state.staged.take() {
            state.current = previous;
        }
    }

    fn apply(&self, value: &Value) {
        self.state.lock().current = value.clone();
    }

    fn current(&self) -> Value {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_permissions() {
        assert!(Mode::TwoWay.can_send() && Mode::TwoWay.can_receive());
        assert!(Mode::SendOnly.can_send() && !Mode::SendOnly.can_receive());
        assert!(!Mode::ReceiveOnly.can_send() && Mode::ReceiveOnly.can_receive());
    }

    #[test]
    fn test_handler_timestamp_starts_none() {
        let handler = Handler::new(Mode::TwoWay);
        assert!(handler.value().is_none());
        assert!(handler.timestamp().is_none());

        handler.store_received(Value::Int(5));
        assert_eq!(handler.value(), Some(Value::Int(5)));
        assert!(handler.timestamp().is_some());
    }

    #[test]
    fn test_cell_target_two_phase_commit() {
        let cell = CellTarget::new(Value::Int(1));
        assert!(cell.propose(&Value::Int(2)));
        assert_eq!(cell.get(), Value::Int(2));
        cell.commit();
        assert_eq!(cell.get(), Value::Int(2));
    }

    #[test]
    fn test_cell_target_two_phase_revert() {
        let cell = CellTarget::new(Value::Int(1));
        assert!(cell.propose(&Value::Int(2)));
        cell.revert();
        assert_eq!(cell.get(), Value::Int(1));
    }

    #[test]
    fn test_binding_inbound_apply_sets_suppression() {
        struct Probe {
            applied: Mutex<Option<Value>>,
        }
        impl BindingTarget for Probe {
            fn propose(&self, _: &Value) -> bool {
                true
            }
            fn commit(&self) {}
            fn revert(&self) {}
            fn apply(&self, value: &Value) {
                *self.applied.lock() = Some(value.clone());
            }
            fn current(&self) -> Value {
                Value::Bool(false)
            }
        }

        let probe = Arc::new(Probe {
            applied: Mutex::new(None),
        });
        let binding = Binding::new(probe.clone(), true);
        assert!(!binding.is_suppressed());
        binding.apply_inbound(&Value::Float(1.5));
        assert_eq!(*probe.applied.lock(), Some(Value::Float(1.5)));
        assert!(!binding.is_suppressed());
    }
}
