//! Static routes to pod CIDRs.
//!
//! Every node's pod CIDRs become static routes on the cluster's VRF, with the
//! node's address as the next hop. A node's routes all share a route ID prefix
//! derived from its UID, so they can be found and replaced as a set wherever
//! they sit in the VRF's route list.
//!
//! Prefixes must be unique across the whole VRF. A new node that would add a
//! prefix another node already owns is refused. Duplicates that show up anyway
//! are treated as drift and repaired by rebuilding every node's routes from
//! scratch, in node name order, so that every replica doing the same repair
//! converges on the same result.

use lbgraph_api::K8sNode;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cache::NodeCache;
use crate::naming::Naming;
use crate::nodes::{IpFamily, NodeRoutes, StaticRoute, VrfNode};
use crate::{Error, Result};

static IPV4_CIDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}/\d{1,2}$").expect("invalid regex"));

static IPV6_CIDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F:]*:[0-9a-fA-F:.]*/\d{1,3}$").expect("invalid regex"));

fn cidr_family(cidr: &str) -> Option<IpFamily> {
    if IPV4_CIDR.is_match(cidr) {
        Some(IpFamily::V4)
    } else if IPV6_CIDR.is_match(cidr) {
        Some(IpFamily::V6)
    } else {
        None
    }
}

/// Compute the static routes for a node.
///
/// Malformed CIDRs are skipped, as are CIDRs in an address family the node has
/// no address in. Returns an error if the node has no address at all.
pub fn routes_for_node(naming: &Naming, node: &K8sNode) -> Result<Vec<StaticRoute>> {
    if node.ipv4.is_none() && node.ipv6.is_none() {
        return Err(Error::NodeIpNotFound(node.name.clone()));
    }

    let prefix = naming.route_id_prefix(node.uid_prefix());
    let mut routes = Vec::with_capacity(node.pod_cidrs.len());
    for cidr in &node.pod_cidrs {
        let Some(family) = cidr_family(cidr) else {
            let err = Error::InvalidPodCidr {
                node: node.name.clone(),
                cidr: cidr.clone(),
            };
            tracing::warn!(%err, "skipping pod CIDR");
            continue;
        };

        let next_hop = match family {
            IpFamily::V4 => &node.ipv4,
            IpFamily::V6 => &node.ipv6,
        };
        let Some(next_hop) = next_hop else {
            tracing::debug!(node = %node.name, %cidr, ?family, "node has no address for pod CIDR family");
            continue;
        };

        routes.push(StaticRoute {
            route_id: Naming::route_id(&prefix, routes.len() + 1),
            prefix: cidr.clone(),
            next_hop: next_hop.clone(),
            family,
        });
    }

    Ok(routes)
}

// Returns true if a route was generated under a route ID prefix.
fn owned_by(route: &StaticRoute, route_id_prefix: &str) -> bool {
    route
        .route_id
        .strip_prefix(route_id_prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

/// Keeps a VRF's static routes in sync with the cluster's nodes.
#[derive(Clone, Copy, Debug)]
pub struct VrfReconciler<'a> {
    naming: &'a Naming,
    key: &'a str,
}

impl<'a> VrfReconciler<'a> {
    /// Create a reconciler. `key` is only used for logging.
    pub fn new(naming: &'a Naming, key: &'a str) -> Self {
        Self { naming, key }
    }

    /// Add or replace a node's routes.
    ///
    /// `nodes` must already reflect the update. If the VRF has duplicate
    /// prefixes before or after the update, every route is rebuilt from
    /// `nodes`.
    pub fn upsert_node(&self, vrf: &mut VrfNode, node: &K8sNode, nodes: &NodeCache) {
        if vrf.has_duplicate_prefixes() {
            tracing::warn!(key = %self.key, vrf = %vrf.name, "duplicate static route prefixes, rebuilding");
            self.rebuild(vrf, &nodes.sorted());
            return;
        }

        let routes = match routes_for_node(self.naming, node) {
            Ok(routes) => routes,
            Err(err) => {
                tracing::warn!(key = %self.key, %err, "removing static routes for node");
                Vec::new()
            }
        };

        if vrf.node_routes.contains_key(&node.name) {
            self.replace_node_routes(vrf, &node.name, routes);
        } else {
            self.add_node_routes(vrf, &node.name, routes);
        }

        if vrf.has_duplicate_prefixes() {
            tracing::warn!(key = %self.key, vrf = %vrf.name, node = %node.name, "update added duplicate static route prefixes, rebuilding");
            self.rebuild(vrf, &nodes.sorted());
        }
    }

    /// Remove a node's routes.
    pub fn delete_node(&self, vrf: &mut VrfNode, node_name: &str, nodes: &NodeCache) {
        if vrf.has_duplicate_prefixes() {
            tracing::warn!(key = %self.key, vrf = %vrf.name, "duplicate static route prefixes, rebuilding");
            self.rebuild(vrf, &nodes.sorted());
            return;
        }

        match vrf.node_routes.remove(node_name) {
            Some(entry) => {
                vrf.static_routes
                    .retain(|r| !owned_by(r, &entry.route_id_prefix));
                tracing::debug!(key = %self.key, node = node_name, routes = entry.count, "removed static routes");
            }
            None => {
                tracing::debug!(key = %self.key, node = node_name, "no static routes for node");
            }
        }
    }

    /// Drop every route and rebuild from `nodes`, in order. A node whose
    /// routes would collide with a node earlier in the list is skipped.
    pub fn rebuild(&self, vrf: &mut VrfNode, nodes: &[K8sNode]) {
        vrf.clear();
        for node in nodes {
            match routes_for_node(self.naming, node) {
                Ok(routes) => self.add_node_routes(vrf, &node.name, routes),
                Err(err) => tracing::warn!(key = %self.key, %err, "skipping node in rebuild"),
            }
        }
        tracing::info!(
            key = %self.key,
            vrf = %vrf.name,
            nodes = nodes.len(),
            routes = vrf.static_routes.len(),
            "rebuilt static routes"
        );
    }

    // Append a new node's routes. Leaves the VRF untouched if any of the
    // routes' prefixes are already present.
    fn add_node_routes(&self, vrf: &mut VrfNode, node_name: &str, routes: Vec<StaticRoute>) {
        if routes.is_empty() {
            return;
        }
        if let Some(dup) = routes.iter().find(|r| vrf.has_prefix(&r.prefix)) {
            tracing::warn!(
                key = %self.key,
                node = node_name,
                prefix = %dup.prefix,
                "pod CIDR already routed to another node, skipping node"
            );
            return;
        }

        let route_id_prefix = route_id_prefix_of(&routes);
        if let Some(owner) = prefix_owner(vrf, node_name, &route_id_prefix) {
            tracing::warn!(
                key = %self.key,
                node = node_name,
                %owner,
                %route_id_prefix,
                "route ID prefix already used by another node, skipping node"
            );
            return;
        }

        vrf.node_routes.insert(
            node_name.to_string(),
            NodeRoutes {
                route_id_prefix,
                count: routes.len(),
            },
        );
        vrf.static_routes.extend(routes);
    }

    // Replace an existing node's routes. Zero routes purges the node, and so
    // does a new route ID prefix that belongs to another node.
    fn replace_node_routes(&self, vrf: &mut VrfNode, node_name: &str, routes: Vec<StaticRoute>) {
        if let Some(entry) = vrf.node_routes.get(node_name) {
            let old_prefix = entry.route_id_prefix.clone();
            vrf.static_routes.retain(|r| !owned_by(r, &old_prefix));
        }

        if routes.is_empty() {
            vrf.node_routes.remove(node_name);
            tracing::debug!(key = %self.key, node = node_name, "node has no routes, purged");
            return;
        }

        let route_id_prefix = route_id_prefix_of(&routes);
        if let Some(owner) = prefix_owner(vrf, node_name, &route_id_prefix).map(str::to_owned) {
            vrf.node_routes.remove(node_name);
            tracing::warn!(
                key = %self.key,
                node = node_name,
                %owner,
                %route_id_prefix,
                "route ID prefix already used by another node, purged node"
            );
            return;
        }

        let entry = NodeRoutes {
            route_id_prefix,
            count: routes.len(),
        };
        vrf.node_routes.insert(node_name.to_string(), entry);
        vrf.static_routes.extend(routes);
    }
}

// The node other than `node_name` whose routes were generated under
// `route_id_prefix`, if any. Nodes whose UIDs share a first group, or that
// have no UID at all, would otherwise claim each other's routes.
fn prefix_owner<'v>(vrf: &'v VrfNode, node_name: &str, route_id_prefix: &str) -> Option<&'v str> {
    vrf.node_routes
        .iter()
        .find(|(name, entry)| name.as_str() != node_name && entry.route_id_prefix == route_id_prefix)
        .map(|(name, _)| name.as_str())
}

// every route for a node shares a prefix, so the first route's ID is enough
fn route_id_prefix_of(routes: &[StaticRoute]) -> String {
    routes
        .first()
        .and_then(|r| r.route_id.rsplit_once('-'))
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nodes::Checksum;
    use lbgraph_api::Config;

    fn naming() -> Naming {
        Naming::new(&Config::new("c1"))
    }

    fn node(name: &str, uid: &str, ip: &str, cidrs: &[&str]) -> K8sNode {
        let mut node = K8sNode::new(name, uid).with_ipv4(ip);
        for cidr in cidrs {
            node = node.with_pod_cidr(*cidr);
        }
        node
    }

    fn prefixes(vrf: &VrfNode) -> Vec<&str> {
        vrf.static_routes.iter().map(|r| r.prefix.as_str()).collect()
    }

    fn cache(nodes: &[K8sNode]) -> NodeCache {
        let cache = NodeCache::default();
        for node in nodes {
            cache.insert(node.clone());
        }
        cache
    }

    #[test]
    fn test_routes_for_node() {
        let node = K8sNode::new("node-a", "aaaa-1111")
            .with_ipv4("10.0.0.1")
            .with_pod_cidr("10.244.1.0/24")
            .with_pod_cidr("not-a-cidr")
            .with_pod_cidr("fd00:10:244::/64")
            .with_pod_cidr("10.244.2.0/24");

        let routes = routes_for_node(&naming(), &node).unwrap();
        assert_eq!(
            routes,
            vec![
                StaticRoute {
                    route_id: "c1-aaaa-1".to_string(),
                    prefix: "10.244.1.0/24".to_string(),
                    next_hop: "10.0.0.1".to_string(),
                    family: IpFamily::V4,
                },
                StaticRoute {
                    route_id: "c1-aaaa-2".to_string(),
                    prefix: "10.244.2.0/24".to_string(),
                    next_hop: "10.0.0.1".to_string(),
                    family: IpFamily::V4,
                },
            ]
        );

        let dual = node.clone().with_ipv6("fd00::1");
        let routes = routes_for_node(&naming(), &dual).unwrap();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[1].family, IpFamily::V6);
        assert_eq!(routes[1].next_hop, "fd00::1");
    }

    #[test]
    fn test_routes_for_node_without_ip() {
        let node = K8sNode::new("node-a", "aaaa").with_pod_cidr("10.244.1.0/24");
        let err = routes_for_node(&naming(), &node).unwrap_err();
        assert!(matches!(err, Error::NodeIpNotFound(name) if name == "node-a"));
    }

    #[test]
    fn test_owned_by() {
        let route = |id: &str| StaticRoute {
            route_id: id.to_string(),
            prefix: String::new(),
            next_hop: String::new(),
            family: IpFamily::V4,
        };
        assert!(owned_by(&route("c1-abc-1"), "c1-abc"));
        assert!(owned_by(&route("c1-abc-12"), "c1-abc"));
        assert!(!owned_by(&route("c1-abcd-1"), "c1-abc"));
        assert!(!owned_by(&route("c1-abc-"), "c1-abc"));
    }

    #[test]
    fn test_add_update_remove() {
        let naming = naming();
        let reconciler = VrfReconciler::new(&naming, "test");
        let a = node("node-a", "aaaa", "10.0.0.1", &["10.244.1.0/24"]);
        let b = node("node-b", "bbbb", "10.0.0.2", &["10.244.2.0/24"]);
        let nodes = cache(&[a.clone(), b.clone()]);

        let mut vrf = VrfNode::new("global");
        reconciler.upsert_node(&mut vrf, &a, &nodes);
        reconciler.upsert_node(&mut vrf, &b, &nodes);
        assert_eq!(prefixes(&vrf), ["10.244.1.0/24", "10.244.2.0/24"]);

        // updating node-a only touches node-a's routes
        let a = node("node-a", "aaaa", "10.0.0.1", &["10.244.3.0/24", "10.244.4.0/24"]);
        let nodes = cache(&[a.clone(), b.clone()]);
        reconciler.upsert_node(&mut vrf, &a, &nodes);
        assert_eq!(
            prefixes(&vrf),
            ["10.244.2.0/24", "10.244.3.0/24", "10.244.4.0/24"]
        );
        assert_eq!(vrf.node_routes["node-a"].count, 2);
        assert_eq!(vrf.node_routes["node-a"].route_id_prefix, "c1-aaaa");

        // no more pod CIDRs purges the node
        let a = node("node-a", "aaaa", "10.0.0.1", &[]);
        reconciler.upsert_node(&mut vrf, &a, &cache(&[a.clone(), b.clone()]));
        assert_eq!(prefixes(&vrf), ["10.244.2.0/24"]);
        assert!(!vrf.node_routes.contains_key("node-a"));

        reconciler.delete_node(&mut vrf, "node-b", &cache(&[]));
        assert!(vrf.static_routes.is_empty());
        assert!(vrf.node_routes.is_empty());
    }

    #[test]
    fn test_new_node_with_duplicate_prefix_is_skipped() {
        let naming = naming();
        let reconciler = VrfReconciler::new(&naming, "test");
        let a = node("node-a", "aaaa", "10.0.0.1", &["10.1.0.0/24"]);
        let b = node("node-b", "bbbb", "10.0.0.2", &["10.1.0.0/24"]);
        let nodes = cache(&[a.clone(), b.clone()]);

        let mut vrf = VrfNode::new("global");
        reconciler.upsert_node(&mut vrf, &a, &nodes);
        reconciler.upsert_node(&mut vrf, &b, &nodes);

        assert_eq!(prefixes(&vrf), ["10.1.0.0/24"]);
        assert_eq!(vrf.static_routes[0].next_hop, "10.0.0.1");
        assert!(!vrf.node_routes.contains_key("node-b"));
    }

    #[test]
    fn test_shared_route_id_prefix_is_skipped() {
        let naming = naming();
        let reconciler = VrfReconciler::new(&naming, "test");
        // both UIDs start with the same group
        let a = node("node-a", "abcd-0001", "10.0.0.1", &["10.1.0.0/24"]);
        let b = node("node-b", "abcd-0002", "10.0.0.2", &["10.2.0.0/24"]);
        let nodes = cache(&[a.clone(), b.clone()]);

        let mut vrf = VrfNode::new("global");
        reconciler.upsert_node(&mut vrf, &a, &nodes);
        reconciler.upsert_node(&mut vrf, &b, &nodes);
        assert_eq!(prefixes(&vrf), ["10.1.0.0/24"]);
        assert!(!vrf.node_routes.contains_key("node-b"));

        // updating node-a leaves it as the only owner of the prefix
        let a = node("node-a", "abcd-0001", "10.0.0.1", &["10.3.0.0/24"]);
        reconciler.upsert_node(&mut vrf, &a, &cache(&[a.clone(), b.clone()]));
        assert_eq!(prefixes(&vrf), ["10.3.0.0/24"]);

        // a node that changes UID into node-a's prefix loses its routes
        // rather than taking node-a's
        let c = node("node-c", "cccc", "10.0.0.3", &["10.4.0.0/24"]);
        reconciler.upsert_node(&mut vrf, &c, &cache(&[a.clone(), c.clone()]));
        let c = node("node-c", "abcd-0003", "10.0.0.3", &["10.4.0.0/24"]);
        reconciler.upsert_node(&mut vrf, &c, &cache(&[a.clone(), c.clone()]));
        assert_eq!(prefixes(&vrf), ["10.3.0.0/24"]);
        assert_eq!(vrf.node_routes["node-a"].count, 1);
        assert!(!vrf.node_routes.contains_key("node-c"));

        // nodes without a UID collide with each other the same way
        let mut vrf = VrfNode::new("global");
        let d = node("node-d", "", "10.0.0.4", &["10.5.0.0/24"]);
        let e = node("node-e", "", "10.0.0.5", &["10.6.0.0/24"]);
        let nodes = cache(&[d.clone(), e.clone()]);
        reconciler.upsert_node(&mut vrf, &d, &nodes);
        reconciler.upsert_node(&mut vrf, &e, &nodes);
        assert_eq!(prefixes(&vrf), ["10.5.0.0/24"]);
    }

    #[test]
    fn test_drift_triggers_rebuild() {
        let naming = naming();
        let reconciler = VrfReconciler::new(&naming, "test");
        let a = node("node-a", "aaaa", "10.0.0.1", &["10.1.0.0/24"]);
        let b = node("node-b", "bbbb", "10.0.0.2", &["10.1.0.0/24", "10.2.0.0/24"]);
        let c = node("node-c", "cccc", "10.0.0.3", &["10.3.0.0/24"]);
        let nodes = cache(&[a.clone(), b.clone(), c.clone()]);

        // simulate drift: node-b's routes snuck in alongside node-a's
        let mut vrf = VrfNode::new("global");
        vrf.static_routes
            .extend(routes_for_node(&naming, &b).unwrap());
        vrf.static_routes
            .extend(routes_for_node(&naming, &a).unwrap());
        assert!(vrf.has_duplicate_prefixes());

        reconciler.upsert_node(&mut vrf, &c, &nodes);
        assert!(!vrf.has_duplicate_prefixes());

        // node-a sorts first, so it keeps the prefix and node-b is dropped
        assert_eq!(prefixes(&vrf), ["10.1.0.0/24", "10.3.0.0/24"]);
        assert_eq!(vrf.static_routes[0].next_hop, "10.0.0.1");
        assert!(vrf.node_routes.contains_key("node-a"));
        assert!(!vrf.node_routes.contains_key("node-b"));
    }

    #[test]
    fn test_update_into_duplicate_triggers_rebuild() {
        let naming = naming();
        let reconciler = VrfReconciler::new(&naming, "test");
        let a = node("node-a", "aaaa", "10.0.0.1", &["10.1.0.0/24"]);
        let b = node("node-b", "bbbb", "10.0.0.2", &["10.2.0.0/24"]);

        let mut vrf = VrfNode::new("global");
        let nodes = cache(&[a.clone(), b.clone()]);
        reconciler.upsert_node(&mut vrf, &a, &nodes);
        reconciler.upsert_node(&mut vrf, &b, &nodes);

        // node-b now claims node-a's CIDR
        let b = node("node-b", "bbbb", "10.0.0.2", &["10.1.0.0/24"]);
        reconciler.upsert_node(&mut vrf, &b, &cache(&[a.clone(), b.clone()]));
        assert_eq!(prefixes(&vrf), ["10.1.0.0/24"]);
        assert_eq!(vrf.static_routes[0].next_hop, "10.0.0.1");
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let naming = naming();
        let reconciler = VrfReconciler::new(&naming, "test");
        let nodes = [
            node("node-c", "cccc", "10.0.0.3", &["10.3.0.0/24"]),
            node("node-a", "aaaa", "10.0.0.1", &["10.1.0.0/24"]),
            node("node-b", "bbbb", "10.0.0.2", &["10.2.0.0/24", "10.1.0.0/24"]),
        ];

        let mut first = VrfNode::new("global");
        reconciler.rebuild(&mut first, &cache(&nodes).sorted());

        let mut reversed = nodes.clone();
        reversed.reverse();
        let mut second = VrfNode::new("global");
        reconciler.rebuild(&mut second, &cache(&reversed).sorted());

        assert_eq!(first, second);
        assert_eq!(first.checksum(), second.checksum());
        assert_eq!(prefixes(&first), ["10.1.0.0/24", "10.3.0.0/24"]);
    }
}
