//! Service state management.

use std::sync::Arc;

use crate::engine::FlowEngine;
use crate::store::FlowStore;

/// Shared service state.
///
/// Wraps the engine in an `Arc` so every handler and background task
/// shares the same lock table and form cache.
pub struct ServiceState<S: FlowStore + 'static> {
    /// The flow engine.
    pub engine: Arc<FlowEngine<S>>,
}

impl<S: FlowStore + 'static> ServiceState<S> {
    /// Create service state around an engine.
    pub fn new(engine: FlowEngine<S>) -> Self {
        Self { engine: Arc::new(engine) }
    }

    /// Create service state from an already shared engine.
    pub fn from_shared(engine: Arc<FlowEngine<S>>) -> Self {
        Self { engine }
    }
}

impl<S: FlowStore + 'static> Clone for ServiceState<S> {
    fn clone(&self) -> Self {
        Self { engine: Arc::clone(&self.engine) }
    }
}
