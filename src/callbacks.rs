//! Host-supplied callbacks and their dispatch.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use crate::{Error, Experiment, ExperimentResult, FeatureResult};

/// Receives an event whenever a unit is bucketed into an experiment for the first time.
///
/// Implemented for any `Fn(&Experiment, &ExperimentResult)`.
pub trait TrackingCallback {
    #[allow(missing_docs)]
    fn on_track(&self, experiment: &Experiment, result: &ExperimentResult);
}

/// Receives every feature evaluation.
///
/// Implemented for any `Fn(&str, &FeatureResult)`.
pub trait FeatureUsageCallback {
    #[allow(missing_docs)]
    fn on_feature_usage(&self, feature_key: &str, result: &FeatureResult);
}

/// Subscriber notified of every [`GrowthBook::run`](crate::GrowthBook::run) call.
///
/// Implemented for any `Fn(&Experiment, &ExperimentResult)`.
pub trait ExperimentRunCallback {
    #[allow(missing_docs)]
    fn on_run(&self, experiment: &Experiment, result: &ExperimentResult);
}

/// Subscriber notified by [`FeaturesRepository`](crate::FeaturesRepository) on the refresh
/// thread.
///
/// Implemented for any `Fn(&str)`, in which case errors are ignored.
pub trait FeatureRefreshCallback {
    /// Called with the complete features JSON after each successful refresh.
    fn on_refresh(&self, features_json: &str);

    /// Called with the saved groups JSON after each successful refresh, right before
    /// [`FeatureRefreshCallback::on_refresh`]. `{}` if the payload carries no saved groups.
    fn on_saved_groups_refresh(&self, _saved_groups_json: &str) {}

    /// Called when a background refresh fails. The cached features stay in use.
    fn on_error(&self, _error: &Error) {}
}

pub(crate) struct NoopTrackingCallback;
impl TrackingCallback for NoopTrackingCallback {
    fn on_track(&self, _experiment: &Experiment, _result: &ExperimentResult) {}
}

pub(crate) struct NoopFeatureUsageCallback;
impl FeatureUsageCallback for NoopFeatureUsageCallback {
    fn on_feature_usage(&self, _feature_key: &str, _result: &FeatureResult) {}
}

impl<T: Fn(&Experiment, &ExperimentResult)> TrackingCallback for T {
    fn on_track(&self, experiment: &Experiment, result: &ExperimentResult) {
        self(experiment, result);
    }
}

impl<T: Fn(&str, &FeatureResult)> FeatureUsageCallback for T {
    fn on_feature_usage(&self, feature_key: &str, result: &FeatureResult) {
        self(feature_key, result);
    }
}

impl<T: Fn(&Experiment, &ExperimentResult)> ExperimentRunCallback for T {
    fn on_run(&self, experiment: &Experiment, result: &ExperimentResult) {
        self(experiment, result);
    }
}

impl<T: Fn(&str)> FeatureRefreshCallback for T {
    fn on_refresh(&self, features_json: &str) {
        self(features_json);
    }
}

/// A subscriber list that can be appended to, cleared and dispatched from concurrently.
///
/// Dispatch iterates over a snapshot taken under the read lock, so a subscriber may itself add or
/// clear subscribers without deadlocking.
pub(crate) struct Subscribers<T: ?Sized> {
    subscribers: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Subscribers<T> {
    pub fn new() -> Self {
        Subscribers {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, subscriber: Arc<T>) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Subscribers in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Remembers which assignments were already reported to the tracking callback.
#[derive(Default)]
pub(crate) struct ExperimentTracker {
    tracked: Mutex<HashSet<String>>,
}

impl ExperimentTracker {
    /// Returns `true` the first time it is called for an assignment.
    pub fn track(&self, experiment_key: &str, hash_attribute: &str, hash_value: &str) -> bool {
        let key = format!("{hash_attribute}\u{1f}{hash_value}\u{1f}{experiment_key}");
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
    }
}
