//! Filters over watch streams that decide which changes trigger a reconcile.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use kube::{
    runtime::{reflector::ObjectRef, watcher},
    Resource, ResourceExt,
};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// Hashes an object's generation and labels, so that status-only updates are
/// filtered out.
pub(crate) fn generation_or_labels<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    obj.meta().generation.hash(&mut hasher);
    obj.labels().hash(&mut hasher);
    Some(hasher.finish())
}

/// Passes objects only when their resource version changes after they were
/// first observed. Initial listings and creations are dropped.
pub(crate) fn updates_only<K, S>(events: S) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    Fingerprints::new(|obj: &K| obj.resource_version(), false, false).filter(events)
}

/// Passes creations, deletions and changes to an object's generation, labels
/// or deletion timestamp.
pub(crate) fn spec_changes<K, S>(events: S) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    let fingerprint = |obj: &K| {
        let deleting = obj.meta().deletion_timestamp.is_some();
        (generation_or_labels(obj), deleting)
    };
    Fingerprints::new(fingerprint, true, true).filter(events)
}

/// Remembers a fingerprint for every object a watch currently holds.
///
/// Entries are evicted when the object is deleted or missing from a relist,
/// so the map is bounded by the size of the watched collection.
struct Fingerprints<K: Resource<DynamicType = ()>, V> {
    seen: HashMap<ObjectRef<K>, V>,
    fingerprint: fn(&K) -> V,
    creations: bool,
    deletions: bool,
}

// === impl Fingerprints ===

impl<K, V> Fingerprints<K, V>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    V: PartialEq,
{
    fn new(fingerprint: fn(&K) -> V, creations: bool, deletions: bool) -> Self {
        Self {
            seen: HashMap::default(),
            fingerprint,
            creations,
            deletions,
        }
    }

    fn filter<S>(mut self, events: S) -> impl Stream<Item = Result<K, watcher::Error>>
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        events.flat_map(move |event| {
            let passed = match event {
                Ok(watcher::Event::Applied(obj)) => self.applied(obj).into_iter().collect(),
                Ok(watcher::Event::Deleted(obj)) => self.deleted(obj).into_iter().collect(),
                Ok(watcher::Event::Restarted(objs)) => self.restarted(objs),
                Err(error) => return stream::iter(vec![Err(error)]),
            };
            stream::iter(passed.into_iter().map(Ok).collect::<Vec<_>>())
        })
    }

    fn applied(&mut self, obj: K) -> Option<K> {
        let key = ObjectRef::from_obj(&obj);
        let fingerprint = (self.fingerprint)(&obj);
        let changed = match self.seen.get(&key) {
            Some(previous) => *previous != fingerprint,
            None => self.creations,
        };
        self.seen.insert(key, fingerprint);
        changed.then_some(obj)
    }

    fn deleted(&mut self, obj: K) -> Option<K> {
        let known = self.seen.remove(&ObjectRef::from_obj(&obj)).is_some();
        (known && self.deletions).then_some(obj)
    }

    /// Objects that disappeared during a relist are forgotten without being
    /// passed on.
    fn restarted(&mut self, objs: Vec<K>) -> Vec<K> {
        let keys = objs.iter().map(ObjectRef::from_obj).collect::<HashSet<_>>();
        self.seen.retain(|key, _| keys.contains(key));
        objs.into_iter().filter_map(|obj| self.applied(obj)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use oke_gateway_controller_k8s_api::{ObjectMeta, Secret, Time};
    use pretty_assertions::assert_eq;

    fn secret(name: &str, version: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                generation: Some(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn collect<K>(passed: impl Stream<Item = Result<K, watcher::Error>>) -> Vec<K> {
        passed.map(|r| r.expect("no errors")).collect().await
    }

    fn versions(secrets: Vec<Secret>) -> Vec<Option<String>> {
        secrets.iter().map(|s| s.resource_version()).collect()
    }

    #[tokio::test]
    async fn drops_creations_and_resyncs() {
        let events = stream::iter(
            [
                watcher::Event::Restarted(vec![secret("a", "1"), secret("b", "2")]),
                watcher::Event::Applied(secret("a", "1")),
                watcher::Event::Applied(secret("a", "3")),
                watcher::Event::Restarted(vec![secret("a", "3"), secret("b", "2")]),
            ]
            .into_iter()
            .map(Ok),
        );
        let passed = collect(updates_only(events)).await;
        assert_eq!(versions(passed), vec![Some("3".to_string())]);
    }

    #[tokio::test]
    async fn recreated_objects_are_new() {
        let events = stream::iter(
            [
                watcher::Event::Applied(secret("a", "1")),
                watcher::Event::Deleted(secret("a", "2")),
                watcher::Event::Applied(secret("a", "5")),
                watcher::Event::Applied(secret("a", "6")),
            ]
            .into_iter()
            .map(Ok),
        );
        let passed = collect(updates_only(events)).await;
        assert_eq!(versions(passed), vec![Some("6".to_string())]);
    }

    #[test]
    fn forgets_deleted_objects() {
        let mut fingerprints =
            Fingerprints::new(|s: &Secret| s.resource_version(), false, false);
        assert!(fingerprints.applied(secret("a", "1")).is_none());
        assert!(fingerprints.applied(secret("b", "2")).is_none());
        assert_eq!(fingerprints.seen.len(), 2);

        assert!(fingerprints.deleted(secret("a", "3")).is_none());
        assert_eq!(fingerprints.seen.len(), 1);

        // A relist drops objects deleted while the watch was down.
        let passed = fingerprints.restarted(vec![secret("c", "4")]);
        assert!(passed.is_empty());
        assert_eq!(
            fingerprints.seen.keys().cloned().collect::<Vec<_>>(),
            vec![ObjectRef::new("c").within("ns-0")]
        );
    }

    #[tokio::test]
    async fn passes_spec_changes_and_deletions() {
        let mut gen2 = secret("a", "3");
        gen2.metadata.generation = Some(2);
        let mut deleting = secret("a", "4");
        deleting.metadata.generation = Some(2);
        deleting.metadata.deletion_timestamp = Some(Time(Default::default()));
        let events = stream::iter(
            [
                watcher::Event::Restarted(vec![secret("a", "1")]),
                watcher::Event::Applied(secret("a", "2")),
                watcher::Event::Applied(gen2),
                watcher::Event::Applied(deleting),
                watcher::Event::Deleted(secret("a", "5")),
                watcher::Event::Deleted(secret("b", "6")),
            ]
            .into_iter()
            .map(Ok),
        );
        let passed = collect(spec_changes(events)).await;
        assert_eq!(
            versions(passed),
            ["1", "3", "4", "5"]
                .map(|v| Some(v.to_string()))
                .to_vec()
        );
    }

    #[test]
    fn ignores_status_changes() {
        let a = secret("a", "1");
        let mut b = secret("a", "2");
        b.type_ = Some("kubernetes.io/tls".to_string());
        assert_eq!(generation_or_labels(&a), generation_or_labels(&b));

        b.metadata.labels = Some(btreemap! { "app".to_string() => "web".to_string() });
        assert_ne!(generation_or_labels(&a), generation_or_labels(&b));

        let mut c = secret("a", "3");
        c.metadata.generation = Some(2);
        assert_ne!(generation_or_labels(&a), generation_or_labels(&c));
    }
}
