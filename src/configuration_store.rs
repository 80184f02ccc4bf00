//! A thread-safe in-memory storage for the currently active features, saved groups and attributes.
//! [`ConfigurationStore`] provides concurrent access for readers (feature evaluation) and writers
//! (host updates and repository refresh callbacks).
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::models::{Features, SavedGroups};

/// Features, saved groups and attributes seen by one evaluation.
///
/// A `Snapshot` is immutable. Updates build a new snapshot and swap it in whole.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    #[allow(missing_docs)]
    pub features: Arc<Features>,
    /// Groups referenced by `$inGroup` and `$notInGroup` conditions.
    pub saved_groups: Arc<SavedGroups>,
    #[allow(missing_docs)]
    pub attributes: Arc<Value>,
}

/// `ConfigurationStore` provides a thread-safe (`Sync`) storage for the evaluation snapshot.
#[derive(Default)]
pub(crate) struct ConfigurationStore {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ConfigurationStore {
    pub fn new(snapshot: Snapshot) -> Self {
        ConfigurationStore {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Get the currently-active snapshot.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        // Lock is only held to clone the Arc. A poisoned lock still holds a complete snapshot as
        // writers only ever assign a fully built one.
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace features, keeping everything else.
    pub fn set_features(&self, features: Features) {
        self.update(|current| Snapshot {
            features: Arc::new(features),
            ..current.clone()
        });
    }

    /// Replace saved groups, keeping everything else.
    pub fn set_saved_groups(&self, saved_groups: SavedGroups) {
        self.update(|current| Snapshot {
            saved_groups: Arc::new(saved_groups),
            ..current.clone()
        });
    }

    /// Replace attributes, keeping everything else.
    pub fn set_attributes(&self, attributes: Value) {
        self.update(|current| Snapshot {
            attributes: Arc::new(attributes),
            ..current.clone()
        });
    }

    fn update(&self, f: impl FnOnce(&Snapshot) -> Snapshot) {
        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = f(&slot);
        *slot = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use serde_json::json;

    use super::{ConfigurationStore, Snapshot};
    use crate::models::{Feature, TryParse};

    #[test]
    fn can_set_features_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new(Snapshot::default()));

        assert!(store.get_snapshot().features.is_empty());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_features(HashMap::from([(
                    "flag".to_owned(),
                    TryParse::Parsed(Feature::default()),
                )]))
            })
            .join();
        }

        assert!(store.get_snapshot().features.contains_key("flag"));
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let store = ConfigurationStore::new(Snapshot::default());
        store.set_attributes(json!({"id": "1"}));

        let before = store.get_snapshot();
        store.set_attributes(json!({"id": "2"}));
        store.set_features(HashMap::new());
        store.set_saved_groups(HashMap::from([("beta".to_owned(), json!(["2"]))]));

        assert_eq!(*before.attributes, json!({"id": "1"}));
        assert!(before.saved_groups.is_empty());
        let after = store.get_snapshot();
        assert_eq!(*after.attributes, json!({"id": "2"}));
        assert_eq!(after.saved_groups["beta"], json!(["2"]));
    }
}
