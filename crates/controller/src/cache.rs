//! Local indexed copy of the watched objects, keyed by `namespace/name`.

use kubecat_core::{resource_key, Event, EventType};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;

#[derive(Debug, Default)]
pub struct ObjectCache {
    live: FxHashMap<String, Json>,
    /// Last known state of deleted objects until their Delete is dispatched.
    tombstones: FxHashMap<String, Json>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.live.get(key)
    }

    /// Store the latest state; Create for unseen keys, Update otherwise. An
    /// object whose resourceVersion matches the cached copy queues nothing.
    pub fn apply(&mut self, obj: Json) -> Option<Event> {
        let key = resource_key(&obj)?;
        self.tombstones.remove(&key);
        let kind = match self.live.get(&key) {
            Some(cur) if same_version(cur, &obj) => {
                self.live.insert(key, obj);
                return None;
            }
            Some(_) => EventType::Update,
            None => EventType::Create,
        };
        self.live.insert(key.clone(), obj);
        Some(Event::new(key, kind))
    }

    /// Apply a full relist. Cached objects missing from it are removed and
    /// reported as Deletes.
    pub fn replace(&mut self, list: Vec<Json>) -> Vec<Event> {
        let listed: FxHashSet<String> = list.iter().filter_map(resource_key).collect();
        let gone: Vec<String> = self.live.keys().filter(|k| !listed.contains(*k)).cloned().collect();
        let mut events: Vec<Event> = gone.into_iter().filter_map(|k| self.evict(k)).collect();
        events.extend(list.into_iter().filter_map(|o| self.apply(o)));
        events
    }

    fn evict(&mut self, key: String) -> Option<Event> {
        let last = self.live.remove(&key)?;
        self.tombstones.insert(key.clone(), last);
        Some(Event::new(key, EventType::Delete))
    }

    pub fn remove(&mut self, obj: Json) -> Option<Event> {
        let key = resource_key(&obj)?;
        let last = self.live.remove(&key).unwrap_or(obj);
        self.tombstones.insert(key.clone(), last);
        Some(Event::new(key, EventType::Delete))
    }

    /// Current object for a queued event. Deletes consume their tombstone.
    pub fn resolve(&mut self, event: &Event) -> Option<Json> {
        match event.kind {
            EventType::Delete => self.tombstones.remove(&event.key),
            EventType::Create | EventType::Update => self.live.get(&event.key).cloned(),
        }
    }
}

fn resource_version(obj: &Json) -> Option<&str> {
    obj.get("metadata")?.get("resourceVersion")?.as_str().filter(|v| !v.is_empty())
}

fn same_version(a: &Json, b: &Json) -> bool {
    matches!((resource_version(a), resource_version(b)), (Some(x), Some(y)) if x == y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str, rv: &str) -> Json {
        serde_json::json!({ "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv } })
    }

    #[test]
    fn apply_reports_create_then_update() {
        let mut c = ObjectCache::new();
        assert_eq!(c.apply(obj("a", "1")).unwrap().kind, EventType::Create);
        assert_eq!(c.apply(obj("a", "2")).unwrap().kind, EventType::Update);
        assert_eq!(c.len(), 1);
        assert!(c.apply(serde_json::json!({ "metadata": {} })).is_none());
    }

    #[test]
    fn resolve_returns_latest_state() {
        let mut c = ObjectCache::new();
        let create = c.apply(obj("a", "1")).unwrap();
        c.apply(obj("a", "3"));
        assert_eq!(c.resolve(&create).unwrap()["metadata"]["resourceVersion"], "3");
    }

    #[test]
    fn deletes_keep_last_known_state_once() {
        let mut c = ObjectCache::new();
        let create = c.apply(obj("a", "5")).unwrap();
        let delete = c.remove(serde_json::json!({ "metadata": { "name": "a", "namespace": "ns" } })).unwrap();
        assert!(c.resolve(&create).is_none(), "deleted before processing");
        assert_eq!(c.resolve(&delete).unwrap()["metadata"]["resourceVersion"], "5");
        assert!(c.resolve(&delete).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn unchanged_resource_version_queues_nothing() {
        let mut c = ObjectCache::new();
        assert_eq!(c.apply(obj("a", "1")).unwrap().kind, EventType::Create);
        assert!(c.apply(obj("a", "1")).is_none());
        assert_eq!(c.apply(obj("a", "2")).unwrap().kind, EventType::Update);
        let unversioned = serde_json::json!({ "metadata": { "name": "b", "namespace": "ns" } });
        c.apply(unversioned.clone());
        assert_eq!(c.apply(unversioned).unwrap().kind, EventType::Update);
    }

    #[test]
    fn relist_evicts_objects_missing_from_it() {
        let mut c = ObjectCache::new();
        c.replace(vec![obj("a", "1"), obj("b", "1")]);
        let events = c.replace(vec![obj("a", "1")]);
        assert_eq!(events, vec![Event::new("ns/b", EventType::Delete)]);
        assert_eq!(c.keys(), vec!["ns/a".to_string()]);
        assert_eq!(c.resolve(&events[0]).unwrap()["metadata"]["name"], "b");
    }
}
