//! Persistence of experiment assignments across evaluations.
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

/// Assignments stored for one unit, identified by a hash attribute and its value.
///
/// `assignments` maps `<experiment key>__<bucket version>` to the assigned variation key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyAssignmentsDocument {
    #[allow(missing_docs)]
    pub attribute_name: String,
    #[allow(missing_docs)]
    pub attribute_value: String,
    #[allow(missing_docs)]
    pub assignments: HashMap<String, String>,
}

/// Storage for sticky assignments. Implement it to persist assignments in a database or cookie
/// store so that units keep their variation across processes.
///
/// Called synchronously during evaluation.
pub trait StickyBucketService: Send + Sync {
    /// Look up the document of one unit.
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Option<StickyAssignmentsDocument>;

    /// Insert or replace the document of `doc.attribute_name` and `doc.attribute_value`.
    fn save_assignments(&self, doc: StickyAssignmentsDocument);

    /// Documents for every `(attribute name, attribute value)` pair, keyed by
    /// `<attribute name>||<attribute value>`.
    fn get_all_assignments(
        &self,
        attributes: &HashMap<String, String>,
    ) -> HashMap<String, StickyAssignmentsDocument> {
        attributes
            .iter()
            .filter_map(|(name, value)| self.get_assignments(name, value))
            .map(|doc| (document_key(&doc.attribute_name, &doc.attribute_value), doc))
            .collect()
    }
}

/// A [`StickyBucketService`] keeping documents in process memory.
///
/// ```
/// # use std::sync::Arc;
/// # use growthbook::{ContextConfig, InMemoryStickyBucketService};
/// let client = ContextConfig::new()
///     .sticky_bucket_service(Arc::new(InMemoryStickyBucketService::new()))
///     .to_client()?;
/// # Ok::<(), growthbook::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStickyBucketService {
    documents: RwLock<HashMap<String, StickyAssignmentsDocument>>,
}

impl InMemoryStickyBucketService {
    /// Create an empty service.
    pub fn new() -> InMemoryStickyBucketService {
        InMemoryStickyBucketService::default()
    }
}

impl StickyBucketService for InMemoryStickyBucketService {
    fn get_assignments(
        &self,
        attribute_name: &str,
        attribute_value: &str,
    ) -> Option<StickyAssignmentsDocument> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document_key(attribute_name, attribute_value))
            .cloned()
    }

    fn save_assignments(&self, doc: StickyAssignmentsDocument) {
        let key = document_key(&doc.attribute_name, &doc.attribute_value);
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, doc);
    }
}

fn document_key(attribute_name: &str, attribute_value: &str) -> String {
    format!("{attribute_name}||{attribute_value}")
}

/// Key of an assignment inside [`StickyAssignmentsDocument::assignments`].
pub(crate) fn assignment_key(experiment_key: &str, bucket_version: u32) -> String {
    format!("{experiment_key}__{bucket_version}")
}

/// Outcome of looking up an experiment in the stored assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StickyVariation {
    /// No usable assignment. The unit is bucketed normally.
    None,
    /// A stored assignment maps to this variation index.
    Found(usize),
    /// The unit was assigned under a bucket version below the minimum.
    Blocked,
}

/// A unit's identity for sticky bucketing.
pub(crate) struct StickyUnit<'a> {
    pub hash_attribute: &'a str,
    pub hash_value: &'a str,
    /// Fallback attribute and value, when the experiment has one and the unit sets it.
    pub fallback: Option<(&'a str, &'a str)>,
}

/// Merged assignments of a unit. The hash attribute's document wins over the fallback's.
pub(crate) fn load_assignments(
    service: &dyn StickyBucketService,
    unit: &StickyUnit<'_>,
) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    if let Some((name, value)) = unit.fallback {
        if let Some(doc) = service.get_assignments(name, value) {
            merged.extend(doc.assignments);
        }
    }
    if !unit.hash_value.is_empty() {
        if let Some(doc) = service.get_assignments(unit.hash_attribute, unit.hash_value) {
            merged.extend(doc.assignments);
        }
    }
    merged
}

/// Resolve the stored variation of `experiment_key` among `variation_keys`.
pub(crate) fn sticky_variation(
    assignments: &HashMap<String, String>,
    experiment_key: &str,
    bucket_version: u32,
    min_bucket_version: u32,
    variation_keys: &[String],
) -> StickyVariation {
    if min_bucket_version > 0
        && (0..=min_bucket_version)
            .any(|version| assignments.contains_key(&assignment_key(experiment_key, version)))
    {
        return StickyVariation::Blocked;
    }

    assignments
        .get(&assignment_key(experiment_key, bucket_version))
        .and_then(|variation_key| variation_keys.iter().position(|key| key == variation_key))
        .map_or(StickyVariation::None, StickyVariation::Found)
}

/// Record `variation_key` for the unit. The document is only written when it changes.
pub(crate) fn save_assignment(
    service: &dyn StickyBucketService,
    attribute_name: &str,
    attribute_value: &str,
    assignment_key: String,
    variation_key: &str,
) {
    let mut doc = service
        .get_assignments(attribute_name, attribute_value)
        .unwrap_or_else(|| StickyAssignmentsDocument {
            attribute_name: attribute_name.to_owned(),
            attribute_value: attribute_value.to_owned(),
            assignments: HashMap::new(),
        });
    if doc.assignments.get(&assignment_key).map(String::as_str) == Some(variation_key) {
        return;
    }
    log::debug!(target: "growthbook", attribute = attribute_name, assignment = assignment_key.as_str(); "saving sticky bucket assignment");
    doc.assignments
        .insert(assignment_key, variation_key.to_owned());
    service.save_assignments(doc);
}
