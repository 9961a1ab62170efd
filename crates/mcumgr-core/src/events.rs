//! Event system for UI decoupling.
//!
//! Upgrade flows report through an [`UpgradeObserver`] so that a CLI, GUI
//! or test harness can follow along without the flows knowing about it.
//! Events are delivered synchronously on the thread running the flow; the
//! observer decides where to forward them.

use std::fmt;

use chrono::{DateTime, Utc};

/// Events emitted by an upgrade flow, generic over its state type.
#[derive(Debug, Clone, PartialEq)]
pub enum UpgradeEvent<S> {
    /// The flow entered a new state.
    StateChanged { from: Option<S>, to: S },
    /// Transfer progress within the current state.
    Progress {
        state: S,
        current: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },
    /// All steps finished.
    Completed { state: S },
    /// A step failed; the run is over.
    Failed { state: Option<S>, message: String },
    /// The run was canceled.
    Canceled { state: Option<S> },
}

/// Observer trait for receiving upgrade events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpgradeObserver<S>: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpgradeEvent<S>);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl<S> UpgradeObserver<S> for NullObserver {
    fn on_event(&self, _event: &UpgradeEvent<S>) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl<S: fmt::Display> UpgradeObserver<S> for TracingObserver {
    fn on_event(&self, event: &UpgradeEvent<S>) {
        match event {
            UpgradeEvent::StateChanged { from, to } => match from {
                Some(from) => tracing::info!(from = %from, to = %to, "State changed"),
                None => tracing::info!(to = %to, "State changed"),
            },
            UpgradeEvent::Progress {
                state,
                current,
                total,
                ..
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(state = %state, current, total, progress = %format!("{}%", pct), "Progress");
            }
            UpgradeEvent::Completed { state } => {
                tracing::info!(state = %state, "Upgrade complete");
            }
            UpgradeEvent::Failed { state, message } => match state {
                Some(state) => tracing::error!(state = %state, "Upgrade failed: {}", message),
                None => tracing::error!("Upgrade failed: {}", message),
            },
            UpgradeEvent::Canceled { state } => match state {
                Some(state) => tracing::warn!(state = %state, "Upgrade canceled"),
                None => tracing::warn!("Upgrade canceled"),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects every event.
    pub struct Collector<S>(pub Mutex<Vec<UpgradeEvent<S>>>);

    impl<S> Default for Collector<S> {
        fn default() -> Self {
            Self(Mutex::new(Vec::new()))
        }
    }

    impl<S: Clone> Collector<S> {
        pub fn events(&self) -> Vec<UpgradeEvent<S>> {
            self.0.lock().unwrap().clone()
        }

        /// States entered, in order.
        pub fn states(&self) -> Vec<S> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    UpgradeEvent::StateChanged { to, .. } => Some(to),
                    _ => None,
                })
                .collect()
        }
    }

    impl<S: Clone + Send> UpgradeObserver<S> for Collector<S> {
        fn on_event(&self, event: &UpgradeEvent<S>) {
            self.0.lock().unwrap().push(event.clone());
        }
    }
}
