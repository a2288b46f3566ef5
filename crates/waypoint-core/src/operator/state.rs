//! Type-erased operator states with checked downcasts

use crate::error::{Error, Result};
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

/// Mutable accumulator of one (waypoint, query) pair.
///
/// Owned by exactly one worker or by the engine's state map at a time. The
/// type tag is checked on every downcast.
pub struct OperatorState {
    type_name: &'static str,
    inner: Box<dyn Any + Send + Sync>,
}

impl OperatorState {
    /// Wrap a typed state
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            inner: Box::new(state),
        }
    }

    /// Name of the wrapped type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Take the typed state back out
    pub fn downcast<T: Any>(self) -> Result<Box<T>> {
        let actual = self.type_name;
        self.inner
            .downcast::<T>()
            .map_err(|_| Error::state_type(type_name::<T>(), actual))
    }

    /// Borrow the typed state
    pub fn downcast_ref<T: Any>(&self) -> Result<&T> {
        self.inner
            .downcast_ref::<T>()
            .ok_or_else(|| Error::state_type(type_name::<T>(), self.type_name))
    }

    /// Mutably borrow the typed state
    pub fn downcast_mut<T: Any>(&mut self) -> Result<&mut T> {
        let actual = self.type_name;
        self.inner
            .downcast_mut::<T>()
            .ok_or_else(|| Error::state_type(type_name::<T>(), actual))
    }
}

impl fmt::Debug for OperatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorState<{}>", self.type_name)
    }
}

/// Read-only state shared by every worker processing a query
#[derive(Clone)]
pub struct ConstantState {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ConstantState {
    /// Wrap a typed constant
    pub fn new<T: Any + Send + Sync>(constant: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            inner: Arc::new(constant),
        }
    }

    /// Name of the wrapped type
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the typed constant
    pub fn get<T: Any>(&self) -> Result<&T> {
        self.inner
            .downcast_ref::<T>()
            .ok_or_else(|| Error::state_type(type_name::<T>(), self.type_name))
    }

    /// Copy, modify and re-wrap the constant. Holders of the old handle keep
    /// seeing the old value.
    pub fn update<T: Any + Clone + Send + Sync>(&mut self, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut value = self.get::<T>()?.clone();
        f(&mut value);
        *self = ConstantState::new(value);
        Ok(())
    }
}

impl fmt::Debug for ConstantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConstantState<{}>", self.type_name)
    }
}

/// Constants handed down by upstream waypoints for one query, in the order the
/// plan lists the constant inputs
#[derive(Debug, Clone, Default)]
pub struct ConstantInputs {
    states: Vec<ConstantState>,
}

impl ConstantInputs {
    /// Inputs in plan order
    pub fn new(states: Vec<ConstantState>) -> Self {
        Self { states }
    }

    /// Number of inputs
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True when the waypoint has no constant inputs
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Typed input at `index`
    pub fn get<T: Any>(&self, index: usize) -> Result<&T> {
        self.states
            .get(index)
            .ok_or_else(|| {
                Error::internal(format!(
                    "constant input {index} requested, {} available",
                    self.states.len()
                ))
            })?
            .get::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_checks_type() {
        let state = OperatorState::new(5u64);
        assert_eq!(*state.downcast_ref::<u64>().unwrap(), 5);
        let err = state.downcast::<String>().unwrap_err();
        match err {
            Error::StateType { expected, actual } => {
                assert!(expected.contains("String"));
                assert_eq!(actual, "u64");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_constant_update_leaves_old_handle() {
        let mut constant = ConstantState::new(1u32);
        let old = constant.clone();
        constant.update::<u32>(|v| *v += 1).unwrap();
        assert_eq!(*constant.get::<u32>().unwrap(), 2);
        assert_eq!(*old.get::<u32>().unwrap(), 1);
    }

    #[test]
    fn test_constant_inputs_index() {
        let inputs = ConstantInputs::new(vec![ConstantState::new(2.5f64)]);
        assert_eq!(*inputs.get::<f64>(0).unwrap(), 2.5);
        assert!(inputs.get::<f64>(1).is_err());
        assert!(inputs.get::<i64>(0).is_err());
    }
}
