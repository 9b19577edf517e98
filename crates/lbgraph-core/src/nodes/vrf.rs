use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::hash::checksum;

use super::{Checksum, NodeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IpFamily {
    V4,
    V6,
}

/// A route to a pod CIDR through the node that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StaticRoute {
    pub route_id: String,
    pub prefix: String,
    pub next_hop: String,
    pub family: IpFamily,
}

/// The slice of a VRF's routes that belong to a single node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NodeRoutes {
    pub route_id_prefix: String,
    pub count: usize,
}

/// The static routes for a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VrfNode {
    pub name: String,
    pub static_routes: Vec<StaticRoute>,
    /// Per-node bookkeeping, keyed by node name.
    pub node_routes: BTreeMap<String, NodeRoutes>,
}

impl VrfNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if any route prefix appears more than once.
    pub fn has_duplicate_prefixes(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.static_routes.len());
        !self
            .static_routes
            .iter()
            .all(|r| seen.insert(r.prefix.as_str()))
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.static_routes.iter().any(|r| r.prefix == prefix)
    }

    /// Drop every route and all per-node bookkeeping.
    pub fn clear(&mut self) {
        self.static_routes.clear();
        self.node_routes.clear();
    }
}

impl Checksum for VrfNode {
    fn checksum(&self) -> u32 {
        let mut routes: Vec<_> = self.static_routes.iter().collect();
        routes.sort();
        checksum(&(&self.name, &routes))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Vrf
    }
}
