use log::trace;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::error::{AgentError, Result};
use crate::metrics::MetricSet;

/// A private working copy of the shared metric set.
///
/// Remembers the state it was taken from so that checking it back in only
/// applies what the holder actually changed.
#[derive(Debug, Clone)]
pub struct Checkout {
    base: MetricSet,
    working: MetricSet,
}

impl Checkout {
    /// The state this checkout was taken from
    pub fn base(&self) -> &MetricSet {
        &self.base
    }
}

impl Deref for Checkout {
    type Target = MetricSet;

    fn deref(&self) -> &MetricSet {
        &self.working
    }
}

impl DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut MetricSet {
        &mut self.working
    }
}

/// The agent's single metric set, shared between its sampling and
/// publishing tasks.
///
/// The lock is only held to clone the set out or merge a working copy back,
/// never across sampling, serialization or network I/O.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    metrics: Mutex<MetricSet>,
}

impl SharedMetrics {
    /// Create an empty shared set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared set seeded with existing metrics
    pub fn with_metrics(metrics: MetricSet) -> Self {
        Self {
            metrics: Mutex::new(metrics),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MetricSet>> {
        self.metrics
            .lock()
            .map_err(|_| AgentError::Other("Lock poisoned".to_string()).into())
    }

    /// Take an immutable copy of the current state
    pub fn snapshot(&self) -> Result<MetricSet> {
        Ok(self.lock()?.clone())
    }

    /// Take a working copy to mutate outside the lock
    pub fn checkout(&self) -> Result<Checkout> {
        let base = self.lock()?.clone();
        Ok(Checkout {
            working: base.clone(),
            base,
        })
    }

    /// Merge a working copy back.
    ///
    /// Gauges that differ from the checkout's base overwrite the shared value;
    /// counters add their change relative to the base, so increments made by
    /// concurrent checkouts are all kept.
    pub fn checkin(&self, checkout: Checkout) -> Result<()> {
        let Checkout { base, working } = checkout;
        let mut shared = self.lock()?;
        let mut changed = 0usize;

        for (name, value) in working.gauges() {
            let unchanged = base
                .get_gauge(name)
                .is_some_and(|old| old.to_bits() == value.to_bits());
            if !unchanged {
                shared.set_gauge(name, value);
                changed += 1;
            }
        }

        for (name, value) in working.counters() {
            let delta = value.wrapping_sub(base.get_counter(name).unwrap_or(0));
            if delta != 0 || shared.get_counter(name).is_none() {
                shared.increment_counter(name, delta);
                changed += 1;
            }
        }

        trace!("Checked in {} changed metrics", changed);
        Ok(())
    }

    /// Run a closure against the shared set while holding the lock
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut MetricSet) -> R) -> Result<R> {
        let mut shared = self.lock()?;
        Ok(f(&mut shared))
    }
}
