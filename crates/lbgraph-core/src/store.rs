// The store is the only state shared between every builder thread and the
// publishing layer. It maps model names to graphs, and is safe for concurrent
// reads and writes by key.
//
// # One graph per model
//
// Builders never make their own graph and swap it in. They ask the store for
// the model's graph with `get_or_create`, so every builder working on a model
// mutates the same `Arc` and is serialized by that graph's lock. A graph made
// by `get_or_create` stays pending, invisible to `get` and to publishers, until
// it's saved for the first time.
//
// Every read-modify-write of an entry happens under `writes`. Reads don't take
// it. Callers may hold a graph's lock while calling into the store, so the
// store never takes a graph lock while holding `writes`.
//
// # Tombstones
//
// Deleting a model doesn't remove its key. The entry is marked as a
// tombstone, so that a consumer can still tell the difference between a model
// that was never built and one that was built and then deleted. Tombstones
// stick around until something calls `reclaim_tombstones`, which is expected
// to happen once the publishing layer has finished deleting the model's
// objects.
//
// # The publish gate
//
// The cached checksum on a stored graph is only refreshed when the store
// decides the graph has changed, so comparing the cached checksum to a freshly
// computed one tells `save` whether anything changed since the last publish,
// whether or not the builder is holding the same graph the store is.

use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::graph::ObjectGraph;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Pending,
    Live,
    Tombstoned,
}

#[derive(Debug, Clone)]
struct StoreEntry {
    graph: Arc<ObjectGraph>,
    state: EntryState,
}

/// A concurrent map from model name to [ObjectGraph].
#[derive(Debug)]
pub struct GraphStore {
    graphs: SkipMap<String, StoreEntry>,
    writes: Mutex<()>,
    retry_count: u32,
}

impl GraphStore {
    /// Create an empty store. Graphs saved to the store get `retry_count`
    /// publish attempts.
    pub fn new(retry_count: u32) -> Self {
        Self {
            graphs: SkipMap::new(),
            writes: Mutex::new(()),
            retry_count,
        }
    }

    /// Get a live graph. Returns `None` for models that were never saved or
    /// that have been tombstoned.
    pub fn get(&self, name: &str) -> Option<Arc<ObjectGraph>> {
        let entry = self.graphs.get(name)?;
        let entry = entry.value();
        (entry.state == EntryState::Live).then(|| entry.graph.clone())
    }

    /// Get the graph builders share for a model, whatever state it's in.
    pub(crate) fn get_shared(&self, name: &str) -> Option<Arc<ObjectGraph>> {
        self.graphs.get(name).map(|e| e.value().graph.clone())
    }

    /// Get the graph builders share for a model, creating it with `create` if
    /// there isn't one yet.
    ///
    /// Concurrent callers asking for the same model always get the same graph.
    /// A tombstoned model hands back its graph and stays tombstoned until it's
    /// saved again.
    pub fn get_or_create(&self, name: &str, create: impl FnOnce() -> ObjectGraph) -> Arc<ObjectGraph> {
        if let Some(graph) = self.get_shared(name) {
            return graph;
        }

        let _writes = self.writes.lock().unwrap();
        if let Some(graph) = self.get_shared(name) {
            return graph;
        }
        let graph = Arc::new(create());
        self.graphs.insert(
            name.to_string(),
            StoreEntry {
                graph: graph.clone(),
                state: EntryState::Pending,
            },
        );
        tracing::trace!(model = name, "created model");
        graph
    }

    /// Returns `true` if a model has ever been saved and hasn't been
    /// reclaimed, including tombstoned models.
    pub fn contains(&self, name: &str) -> bool {
        self.graphs
            .get(name)
            .is_some_and(|e| e.value().state != EntryState::Pending)
    }

    pub fn is_tombstoned(&self, name: &str) -> bool {
        self.graphs
            .get(name)
            .is_some_and(|e| e.value().state == EntryState::Tombstoned)
    }

    /// Save a graph if it's changed since the last time it was saved.
    ///
    /// Returns `true` if the graph was stored and should be published. A
    /// graph is unchanged if a live graph is already stored under `name` and
    /// that graph's last published checksum matches `graph`'s current
    /// content. Saving over a tombstone always counts as a change.
    pub fn save(&self, name: &str, graph: Arc<ObjectGraph>) -> bool {
        let checksum = graph.compute_checksum();
        self.commit(name, &graph, checksum)
    }

    /// [save](Self::save) a graph whose current checksum is already known.
    /// Safe to call while holding the graph's lock.
    pub(crate) fn commit(&self, name: &str, graph: &Arc<ObjectGraph>, checksum: u32) -> bool {
        let _writes = self.writes.lock().unwrap();

        if let Some(entry) = self.graphs.get(name) {
            let prev = entry.value();
            if prev.state == EntryState::Live && prev.graph.checksum() == checksum {
                tracing::info!(model = name, checksum, "model unchanged");
                return false;
            }
        }

        graph.set_retry_count(self.retry_count);
        graph.set_checksum(checksum);
        self.graphs.insert(
            name.to_string(),
            StoreEntry {
                graph: graph.clone(),
                state: EntryState::Live,
            },
        );

        tracing::info!(model = name, checksum, "model changed");
        true
    }

    /// Tombstone a model, but only if `graph` is the live graph stored under
    /// `name`. Returns `true` if the model was tombstoned. Safe to call while
    /// holding the graph's lock.
    pub(crate) fn retire(&self, name: &str, graph: &Arc<ObjectGraph>) -> bool {
        let _writes = self.writes.lock().unwrap();

        let Some(entry) = self.graphs.get(name) else {
            return false;
        };
        let entry = entry.value();
        if entry.state != EntryState::Live || !Arc::ptr_eq(&entry.graph, graph) {
            return false;
        }

        self.graphs.insert(
            name.to_string(),
            StoreEntry {
                graph: graph.clone(),
                state: EntryState::Tombstoned,
            },
        );
        tracing::debug!(model = name, "tombstoned model");
        true
    }

    /// Mark a model as deleted.
    pub fn tombstone(&self, name: &str) {
        let _writes = self.writes.lock().unwrap();

        let graph = match self.graphs.get(name) {
            Some(entry) => entry.value().graph.clone(),
            None => Arc::new(ObjectGraph::new(name)),
        };
        self.graphs.insert(
            name.to_string(),
            StoreEntry {
                graph,
                state: EntryState::Tombstoned,
            },
        );
        tracing::debug!(model = name, "tombstoned model");
    }

    /// Remove a model entirely, tombstone or not.
    pub fn remove(&self, name: &str) {
        let _writes = self.writes.lock().unwrap();
        self.graphs.remove(name);
    }

    /// Remove every tombstoned model, returning the names of the models that
    /// were reclaimed.
    ///
    /// A model some builder is still holding on to stays until the next call,
    /// as do pending models nobody has saved.
    pub fn reclaim_tombstones(&self) -> Vec<String> {
        let _writes = self.writes.lock().unwrap();

        let mut reclaimed = Vec::new();
        for entry in self.graphs.iter() {
            let value = entry.value();
            if value.state == EntryState::Live || Arc::strong_count(&value.graph) > 1 {
                continue;
            }
            if value.state == EntryState::Tombstoned {
                reclaimed.push(entry.key().clone());
            }
            entry.remove();
        }
        reclaimed
    }

    /// The names of every model in the store, including tombstones.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.graphs
            .iter()
            .filter(|e| e.value().state != EntryState::Pending)
            .map(|e| e.key().clone())
    }

    /// Take a copy of a live graph to hand to a publisher. Returns `None` if the
    /// model doesn't exist or has been tombstoned.
    pub fn copy_for_publish(&self, name: &str) -> Option<ObjectGraph> {
        self.get(name).map(|g| g.get_copy())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nodes::{PoolNode, VirtualServiceNode};
    use lbgraph_api::Server;

    const MODEL: &str = "admin/c1--Shared-L7-0";

    fn graph(ip: &str) -> Arc<ObjectGraph> {
        let graph = ObjectGraph::new(MODEL);
        graph.update(|nodes| {
            let mut vs = VirtualServiceNode::new("c1--Shared-L7-0", "admin");
            let mut pool = PoolNode::new("pool", "admin");
            pool.servers.push(Server::new(ip, 80));
            vs.pools.push(pool);
            nodes.push(vs);
        });
        Arc::new(graph)
    }

    #[test]
    fn assert_store_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GraphStore>();
        assert_send_sync::<ObjectGraph>();
    }

    #[test]
    fn test_save_is_idempotent() {
        let store = GraphStore::new(10);
        let graph = graph("10.0.0.1");

        assert!(store.save(MODEL, graph.clone()));
        assert!(!store.save(MODEL, graph.clone()));
        assert!(!store.save(MODEL, graph));

        // an identical graph built from scratch is also unchanged
        assert!(!store.save(MODEL, self::graph("10.0.0.1")));
    }

    #[test]
    fn test_save_detects_in_place_mutation() {
        let store = GraphStore::new(10);
        assert!(store.save(MODEL, graph("10.0.0.1")));

        let live = store.get(MODEL).unwrap();
        live.update(|nodes| {
            let vs = nodes.virtual_service_mut().unwrap();
            vs.pools[0].servers[0].ip = "10.0.0.2".to_string();
        });
        assert!(store.save(MODEL, live.clone()));
        assert!(!store.save(MODEL, live));
    }

    #[test]
    fn test_save_resets_retries() {
        let store = GraphStore::new(3);
        let graph = graph("10.0.0.1");
        assert!(store.save(MODEL, graph.clone()));
        assert_eq!(graph.retry_count(), 3);

        let copy = store.copy_for_publish(MODEL).unwrap();
        assert_eq!(copy.retry_count(), 2);
        assert_eq!(graph.retry_count(), 2);

        // an unchanged save doesn't reset the counter
        assert!(!store.save(MODEL, graph.clone()));
        assert_eq!(graph.retry_count(), 2);

        graph.update(|nodes| nodes.virtual_service_mut().unwrap().pools.clear());
        assert!(store.save(MODEL, graph.clone()));
        assert_eq!(graph.retry_count(), 3);
    }

    #[test]
    fn test_tombstones() {
        let store = GraphStore::new(10);
        assert!(!store.contains(MODEL));

        store.save(MODEL, graph("10.0.0.1"));
        store.tombstone(MODEL);
        assert!(store.contains(MODEL));
        assert!(store.is_tombstoned(MODEL));
        assert!(store.get(MODEL).is_none());
        assert!(store.copy_for_publish(MODEL).is_none());

        // saving over a tombstone is always a change
        assert!(store.save(MODEL, graph("10.0.0.1")));
        assert!(!store.is_tombstoned(MODEL));

        store.tombstone(MODEL);
        store.save("admin/other", graph("10.0.0.1"));
        assert_eq!(store.reclaim_tombstones(), vec![MODEL.to_string()]);
        assert!(!store.contains(MODEL));
        assert_eq!(store.names().collect::<Vec<_>>(), vec!["admin/other"]);

        store.remove("admin/other");
        assert_eq!(store.names().count(), 0);
    }

    #[test]
    fn test_get_or_create() {
        let store = GraphStore::new(10);

        let created = store.get_or_create(MODEL, || ObjectGraph::new(MODEL));
        let again = store.get_or_create(MODEL, || panic!("graph already exists"));
        assert!(Arc::ptr_eq(&created, &again));

        // created graphs aren't visible until they're saved
        assert!(store.get(MODEL).is_none());
        assert!(!store.contains(MODEL));
        assert_eq!(store.names().count(), 0);

        created.update(|nodes| nodes.push(VirtualServiceNode::new("c1--Shared-L7-0", "admin")));
        assert!(store.save(MODEL, created.clone()));
        assert!(Arc::ptr_eq(&store.get(MODEL).unwrap(), &created));

        // a tombstoned model hands back the same graph
        store.tombstone(MODEL);
        let revived = store.get_or_create(MODEL, || panic!("graph already exists"));
        assert!(Arc::ptr_eq(&revived, &created));
        assert!(store.is_tombstoned(MODEL));
    }

    #[test]
    fn test_get_or_create_is_shared_between_threads() {
        let store = Arc::new(GraphStore::new(10));
        let barrier = Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.get_or_create(MODEL, || ObjectGraph::new(MODEL))
                })
            })
            .collect();

        let graphs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(graphs.iter().all(|g| Arc::ptr_eq(g, &graphs[0])));
    }

    #[test]
    fn test_retire() {
        let store = GraphStore::new(10);
        let live = graph("10.0.0.1");
        assert!(store.save(MODEL, live.clone()));

        // only the graph that's actually stored can be retired
        assert!(!store.retire(MODEL, &graph("10.0.0.1")));
        assert!(!store.is_tombstoned(MODEL));

        assert!(store.retire(MODEL, &live));
        assert!(store.is_tombstoned(MODEL));
        assert!(!store.retire(MODEL, &live));

        // pending graphs are never retired
        let pending = store.get_or_create("admin/other", || ObjectGraph::new("admin/other"));
        assert!(!store.retire("admin/other", &pending));
        assert!(!store.contains("admin/other"));
    }

    #[test]
    fn test_reclaim_skips_graphs_in_use() {
        let store = GraphStore::new(10);
        let held = graph("10.0.0.1");
        store.save(MODEL, held.clone());
        store.tombstone(MODEL);

        assert!(store.reclaim_tombstones().is_empty());
        assert!(store.is_tombstoned(MODEL));

        drop(held);
        assert_eq!(store.reclaim_tombstones(), vec![MODEL.to_string()]);
    }
}
