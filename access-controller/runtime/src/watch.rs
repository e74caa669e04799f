use crate::{
    core::ResourceKey,
    k8s::Resource,
    processor::{Enqueue, Kind, ResourceChange},
};
use ahash::AHashMap;
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Feeds a watch stream into the processor queue, recording each resource in
/// a cache that handlers read from.
pub struct WatchSource<K> {
    kind: Kind,
    cache: Cache<K>,
    queue: Enqueue,
    synced: watch::Sender<bool>,
}

/// The last observed state of each resource of one kind.
#[derive(Debug)]
pub struct Cache<K> {
    items: Arc<RwLock<AHashMap<ResourceKey, K>>>,
    synced: watch::Receiver<bool>,
}

// === impl WatchSource ===

impl<K> WatchSource<K> {
    pub(crate) fn new(
        kind: Kind,
        cache: Cache<K>,
        queue: Enqueue,
        synced: watch::Sender<bool>,
    ) -> Self {
        Self {
            kind,
            cache,
            queue,
            synced,
        }
    }

    fn changed(&self, key: ResourceKey) {
        self.queue.add(ResourceChange::new(self.kind, key));
    }
}

impl<K> kubert::index::IndexNamespacedResource<K> for WatchSource<K>
where
    K: Resource,
{
    fn apply(&mut self, resource: K) {
        let Some(key) = ResourceKey::of(&resource) else {
            tracing::warn!(kind = %self.kind, "Ignoring resource without a name or namespace");
            return;
        };
        self.cache.items.write().insert(key.clone(), resource);
        self.changed(key);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ResourceKey::new(namespace, name);
        self.cache.items.write().remove(&key);
        self.changed(key);
    }

    fn reset(&mut self, resources: Vec<K>, removed: NamespacedRemoved) {
        let mut keys = Vec::with_capacity(resources.len());
        {
            let mut items = self.cache.items.write();
            for resource in resources {
                if let Some(key) = ResourceKey::of(&resource) {
                    items.insert(key.clone(), resource);
                    keys.push(key);
                }
            }
            for (namespace, names) in removed {
                for name in names {
                    let key = ResourceKey::new(&namespace, name);
                    items.remove(&key);
                    keys.push(key);
                }
            }
        }
        for key in keys {
            self.changed(key);
        }
        self.synced.send_replace(true);
    }
}

// === impl Cache ===

impl<K> Cache<K> {
    pub(crate) fn new(synced: watch::Receiver<bool>) -> Self {
        Self {
            items: Default::default(),
            synced,
        }
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }
}

impl<K: Clone> Cache<K> {
    pub fn get(&self, key: &ResourceKey) -> Option<K> {
        self.items.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.items.read().values().cloned().collect()
    }
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            synced: self.synced.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        k8s::{ObjectMeta, Secret},
        processor::{Metrics, Processor},
    };
    use kubert::index::IndexNamespacedResource;
    use maplit::{hashmap, hashset};
    use pretty_assertions::assert_eq;

    fn secret(ns: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn apply_and_delete_update_cache() {
        let mut processor = Processor::new(Metrics::default());
        let (source, cache) = processor.register::<Secret>(Kind::Secret);

        source.write().apply(secret("test", "a"));
        assert_eq!(
            cache.get(&ResourceKey::new("test", "a")),
            Some(secret("test", "a"))
        );
        assert!(!cache.has_synced());

        source.write().delete("test".to_string(), "a".to_string());
        assert_eq!(cache.get(&ResourceKey::new("test", "a")), None);
        assert!(cache.list().is_empty());
    }

    #[tokio::test]
    async fn reset_marks_synced() {
        let mut processor = Processor::new(Metrics::default());
        let (source, cache) = processor.register::<Secret>(Kind::Secret);
        source.write().apply(secret("test", "stale"));

        source.write().reset(
            vec![secret("test", "a"), secret("other", "b")],
            hashmap! { "test".to_string() => hashset! { "stale".to_string() } }
                .into_iter()
                .map(|(ns, names)| (ns, names.into_iter().collect()))
                .collect(),
        );
        assert!(cache.has_synced());
        let mut names = cache
            .list()
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        processor.wait_for_sync().await;
    }
}
