//! State shared between the polling loop and the rest of the application:
//! which parameters to poll, whether collection is on, and the latest
//! decoded values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::{IndexMap, IndexSet};
use log::info;

use crate::command::Parameter;

/// Value published when the engine ECU line was missing
pub const UNAVAILABLE: f64 = -1.0;

/// Receives every decoded value
pub trait ValueSink: Send + Sync {
    fn publish(&self, parameter: Parameter, value: f64);
}

/// Latest value per parameter, last writer wins
#[derive(Debug, Clone, Default)]
pub struct ValueStore {
    values: Arc<RwLock<IndexMap<Parameter, f64>>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, parameter: Parameter) -> Option<f64> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&parameter)
            .copied()
    }

    /// Copy of all values in first-published order
    pub fn snapshot(&self) -> IndexMap<Parameter, f64> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ValueSink for ValueStore {
    fn publish(&self, parameter: Parameter, value: f64) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(parameter, value);
    }
}

/// Ordered set of parameters to poll. Edits take effect at the next cycle.
#[derive(Debug, Clone, Default)]
pub struct MonitoredParameters {
    inner: Arc<RwLock<IndexSet<Parameter>>>,
}

impl MonitoredParameters {
    pub fn new<I: IntoIterator<Item = Parameter>>(parameters: I) -> Self {
        Self {
            inner: Arc::new(RwLock::new(parameters.into_iter().collect())),
        }
    }

    /// Add at the end; returns false if already monitored
    pub fn add(&self, parameter: Parameter) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(parameter)
    }

    pub fn remove(&self, parameter: Parameter) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(&parameter)
    }

    /// Replace the whole list
    pub fn set<I: IntoIterator<Item = Parameter>>(&self, parameters: I) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = parameters.into_iter().collect();
    }

    /// Current list, in order
    pub fn snapshot(&self) -> Vec<Parameter> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether data collection is active; cloned handles share the flag
#[derive(Debug, Clone, Default)]
pub struct CollectionFlag(Arc<AtomicBool>);

impl CollectionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            info!("Collection started");
        }
    }

    pub fn stop(&self) {
        if self.0.swap(false, Ordering::SeqCst) {
            info!("Collection stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
