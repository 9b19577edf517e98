use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use serde::ser::SerializeStruct;

use crate::nodes::{rollup, Checksum, ModelNode, Named, NodeKind, VirtualServiceNode, VrfNode};

/// The root nodes of an [ObjectGraph].
///
/// Nodes are unique by kind and name. Pushing a node that already exists
/// replaces it in place.
#[derive(Clone, Debug, Default)]
pub struct GraphNodes(Vec<ModelNode>);

impl GraphNodes {
    pub fn push(&mut self, node: impl Into<ModelNode>) {
        let node = node.into();
        match self
            .0
            .iter_mut()
            .find(|n| n.kind() == node.kind() && n.name() == node.name())
        {
            Some(existing) => *existing = node,
            None => self.0.push(node),
        }
    }

    /// Remove a node by kind and name.
    pub fn remove(&mut self, kind: NodeKind, name: &str) -> Option<ModelNode> {
        let idx = self
            .0
            .iter()
            .position(|n| n.kind() == kind && n.name() == name)?;
        Some(self.0.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelNode> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn virtual_services(&self) -> impl Iterator<Item = &VirtualServiceNode> {
        self.0.iter().filter_map(ModelNode::as_virtual_service)
    }

    /// The first virtual service in the graph. Every L7 and passthrough model
    /// has exactly one root virtual service.
    pub fn virtual_service(&self) -> Option<&VirtualServiceNode> {
        self.virtual_services().next()
    }

    pub fn virtual_service_mut(&mut self) -> Option<&mut VirtualServiceNode> {
        self.0.iter_mut().find_map(ModelNode::as_virtual_service_mut)
    }

    pub fn vrf(&self) -> Option<&VrfNode> {
        self.0.iter().find_map(ModelNode::as_vrf)
    }

    pub fn vrf_mut(&mut self) -> Option<&mut VrfNode> {
        self.0.iter_mut().find_map(ModelNode::as_vrf_mut)
    }

    /// Drop every node.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// The checksum of the nodes as they are now.
    pub fn checksum(&self) -> u32 {
        rollup(&self.0)
    }
}

/// The load balancer configuration for a single model.
///
/// An `ObjectGraph` is the unit of locking and of publishing. All mutation
/// happens through [ObjectGraph::update] under the graph's write lock, and
/// consumers only ever see deep copies taken with [ObjectGraph::get_copy].
///
/// The graph's checksum is cached. It's only recomputed by
/// [ObjectGraph::calculate_checksum] or by the publish gate when it stores a
/// changed graph, so the cached value is always the checksum of the
/// last published version.
#[derive(Debug)]
pub struct ObjectGraph {
    name: String,
    is_vrf: bool,
    nodes: RwLock<GraphNodes>,
    checksum: AtomicU32,
    retry_count: AtomicU32,
}

impl ObjectGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_vrf: false,
            nodes: RwLock::new(GraphNodes::default()),
            checksum: AtomicU32::new(0),
            retry_count: AtomicU32::new(0),
        }
    }

    /// Create a graph that holds VRF static routes.
    pub fn new_vrf(name: impl Into<String>) -> Self {
        Self {
            is_vrf: true,
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_vrf(&self) -> bool {
        self.is_vrf
    }

    /// Mutate the graph under its write lock.
    pub fn update<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut GraphNodes) -> T,
    {
        let mut nodes = self.nodes.write().unwrap();
        f(&mut nodes)
    }

    /// Read the graph under its read lock.
    pub fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&GraphNodes) -> T,
    {
        let nodes = self.nodes.read().unwrap();
        f(&nodes)
    }

    /// Compute the graph's current checksum without caching it.
    pub fn compute_checksum(&self) -> u32 {
        self.read(GraphNodes::checksum)
    }

    /// Compute and cache the graph's checksum.
    pub fn calculate_checksum(&self) -> u32 {
        let checksum = self.compute_checksum();
        self.checksum.store(checksum, Ordering::SeqCst);
        checksum
    }

    // Cache a checksum computed elsewhere, usually by a caller already
    // holding the graph's lock.
    pub(crate) fn set_checksum(&self, checksum: u32) {
        self.checksum.store(checksum, Ordering::SeqCst);
    }

    /// The cached checksum from the last call to
    /// [calculate_checksum](Self::calculate_checksum).
    pub fn checksum(&self) -> u32 {
        self.checksum.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn set_retry_count(&self, n: u32) {
        self.retry_count.store(n, Ordering::SeqCst);
    }

    /// Take a deep copy of the graph for publishing.
    ///
    /// Every copy uses up one retry. The copy shares nothing with this graph
    /// and can be read without any locking.
    pub fn get_copy(&self) -> ObjectGraph {
        let nodes = self.nodes.read().unwrap();

        let retries = self
            .retry_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_or(0, |prev| prev - 1);

        tracing::trace!(model = %self.name, retries, "copied graph");
        ObjectGraph {
            name: self.name.clone(),
            is_vrf: self.is_vrf,
            nodes: RwLock::new(nodes.clone()),
            checksum: AtomicU32::new(self.checksum()),
            retry_count: AtomicU32::new(retries),
        }
    }
}

impl serde::Serialize for ObjectGraph {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let nodes = self.nodes.read().unwrap();

        let mut graph = serializer.serialize_struct("ObjectGraph", 3)?;
        graph.serialize_field("name", &self.name)?;
        graph.serialize_field("checksum", &self.checksum())?;
        graph.serialize_field("nodes", &nodes.0)?;
        graph.end()
    }
}
