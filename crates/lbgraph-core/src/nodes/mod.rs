//! The load balancer object catalog.
//!
//! Every node computes a 32 bit checksum over its own configuration and the
//! checksums of everything it owns. Parents fold in child checksums with a
//! wrapping sum, so a change anywhere in a tree changes the checksum of the
//! root. Unordered collections (servers, hosts, pool group members) are sorted
//! before they're hashed, so the order objects were discovered in never
//! changes a checksum.
//!
//! Nodes own their children outright. Cloning a node is always a deep copy.

use serde::Serialize;

mod policy;
mod pool;
mod tls;
mod vrf;
mod vs;
mod vsvip;

pub use policy::{
    DataScriptEvent, HeaderRewrite, HostPathPoolPg, HttpDataScriptNode, HttpPolicySetNode,
    L4PolicyNode, PathMatch, PortPool, RedirectPort,
};
pub use pool::{PoolGroupMember, PoolGroupNode, PoolNode};
pub use tls::{CertType, PkiProfileNode, TlsKeyCertNode};
pub use vrf::{IpFamily, NodeRoutes, StaticRoute, VrfNode};
pub use vs::{PortProtocol, Protocol, VirtualServiceNode, VsOverlay};
pub use vsvip::VsVipNode;

/// The kind of a node in an object graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NodeKind {
    VirtualService,
    VsVip,
    Pool,
    PoolGroup,
    HttpPolicySet,
    TlsKeyCert,
    PkiProfile,
    L4Policy,
    HttpDataScript,
    Vrf,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::VirtualService => "VirtualService",
            NodeKind::VsVip => "VSVIP",
            NodeKind::Pool => "Pool",
            NodeKind::PoolGroup => "PoolGroup",
            NodeKind::HttpPolicySet => "HTTPPolicySet",
            NodeKind::TlsKeyCert => "TLSKeyCert",
            NodeKind::PkiProfile => "PKIProfile",
            NodeKind::L4Policy => "L4Policy",
            NodeKind::HttpDataScript => "HTTPDataScript",
            NodeKind::Vrf => "VrfContext",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node with a content checksum.
pub trait Checksum {
    /// A stable hash of this node's configuration, including everything it
    /// owns.
    fn checksum(&self) -> u32;

    fn kind(&self) -> NodeKind;
}

/// A node with a name that identifies it among its siblings.
pub trait Named {
    fn name(&self) -> &str;
}

/// Fold the checksums of a set of nodes together. The result doesn't depend
/// on the order of `nodes`.
pub(crate) fn rollup<'a, T, I>(nodes: I) -> u32
where
    T: Checksum + 'a,
    I: IntoIterator<Item = &'a T>,
{
    nodes
        .into_iter()
        .fold(0u32, |sum, n| sum.wrapping_add(n.checksum()))
}

/// The outcome of [replace_in_place].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// A node with the same name and checksum already existed.
    Unchanged,
    /// A node with the same name but a different checksum was replaced. The
    /// new node is now at the end of the list.
    Replaced,
    /// No node with this name existed.
    Added,
}

/// Insert a node into a list, replacing any node with the same name.
///
/// A node with the same checksum as the existing one is dropped and the list
/// is left untouched. A changed node is removed and the new one appended, so
/// replacing a node moves it to the end of the list.
pub(crate) fn replace_in_place<T: Named + Checksum>(items: &mut Vec<T>, node: T) -> Upsert {
    match items.iter().position(|n| n.name() == node.name()) {
        Some(idx) if items[idx].checksum() == node.checksum() => {
            tracing::trace!(name = node.name(), kind = %node.kind(), "unchanged");
            Upsert::Unchanged
        }
        Some(idx) => {
            tracing::trace!(name = node.name(), kind = %node.kind(), "replaced");
            items.remove(idx);
            items.push(node);
            Upsert::Replaced
        }
        None => {
            tracing::trace!(name = node.name(), kind = %node.kind(), "added");
            items.push(node);
            Upsert::Added
        }
    }
}

/// Remove a node by name, returning it if it existed.
pub(crate) fn remove_by_name<T: Named>(items: &mut Vec<T>, name: &str) -> Option<T> {
    let idx = items.iter().position(|n| n.name() == name)?;
    Some(items.remove(idx))
}

pub(crate) fn find_by_name<'a, T: Named>(items: &'a [T], name: &str) -> Option<&'a T> {
    items.iter().find(|n| n.name() == name)
}

pub(crate) fn find_by_name_mut<'a, T: Named>(items: &'a mut [T], name: &str) -> Option<&'a mut T> {
    items.iter_mut().find(|n| n.name() == name)
}

/// Add a string to a list if it isn't already there.
pub(crate) fn push_unique(items: &mut Vec<String>, s: &str) -> bool {
    if items.iter().any(|i| i == s) {
        return false;
    }
    items.push(s.to_string());
    true
}

/// Status reported back on a HostRule or HTTPRule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrdState {
    Active,
    Inactive,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CrdStatus {
    pub kind: &'static str,
    /// The `namespace/name` of the rule.
    pub name: String,
    pub state: CrdState,
}

/// A back-reference from a node to the Kubernetes objects it was built
/// from.
///
/// Metadata is only used for status reporting and isn't part of any node's
/// checksum.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// `namespace/name` keys of the ingresses or routes that contributed to
    /// the node.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ingress_names: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    /// `namespace/name` keys of the services behind an L4 virtual service.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,

    /// The weight of a pool within its pool group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_ratio: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub crd_status: Option<CrdStatus>,
}

impl ServiceMetadata {
    pub fn for_ingress(namespace: &str, ingress_key: String, host: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ingress_names: vec![ingress_key],
            hostnames: vec![host.to_string()],
            services: Vec::new(),
            pool_ratio: None,
            crd_status: None,
        }
    }
}

/// A node at the root of an object graph.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ModelNode {
    VirtualService(VirtualServiceNode),
    VsVip(VsVipNode),
    Pool(PoolNode),
    PoolGroup(PoolGroupNode),
    HttpPolicySet(HttpPolicySetNode),
    TlsKeyCert(TlsKeyCertNode),
    PkiProfile(PkiProfileNode),
    L4Policy(L4PolicyNode),
    HttpDataScript(HttpDataScriptNode),
    Vrf(VrfNode),
}

macro_rules! model_nodes {
    ($($variant:ident => $node_ty:ty),* $(,)?) => {
        $(
            impl From<$node_ty> for ModelNode {
                fn from(node: $node_ty) -> Self {
                    ModelNode::$variant(node)
                }
            }

            impl Named for $node_ty {
                fn name(&self) -> &str {
                    &self.name
                }
            }
        )*

        impl ModelNode {
            fn as_checksum(&self) -> &dyn Checksum {
                match self {
                    $(ModelNode::$variant(n) => n,)*
                }
            }
        }

        impl Named for ModelNode {
            fn name(&self) -> &str {
                match self {
                    $(ModelNode::$variant(n) => &n.name,)*
                }
            }
        }
    };
}

model_nodes! {
    VirtualService => VirtualServiceNode,
    VsVip => VsVipNode,
    Pool => PoolNode,
    PoolGroup => PoolGroupNode,
    HttpPolicySet => HttpPolicySetNode,
    TlsKeyCert => TlsKeyCertNode,
    PkiProfile => PkiProfileNode,
    L4Policy => L4PolicyNode,
    HttpDataScript => HttpDataScriptNode,
    Vrf => VrfNode,
}

impl Checksum for ModelNode {
    fn checksum(&self) -> u32 {
        self.as_checksum().checksum()
    }

    fn kind(&self) -> NodeKind {
        self.as_checksum().kind()
    }
}

impl ModelNode {
    pub fn as_virtual_service(&self) -> Option<&VirtualServiceNode> {
        match self {
            ModelNode::VirtualService(vs) => Some(vs),
            _ => None,
        }
    }

    pub fn as_virtual_service_mut(&mut self) -> Option<&mut VirtualServiceNode> {
        match self {
            ModelNode::VirtualService(vs) => Some(vs),
            _ => None,
        }
    }

    pub fn as_vrf(&self) -> Option<&VrfNode> {
        match self {
            ModelNode::Vrf(vrf) => Some(vrf),
            _ => None,
        }
    }

    pub fn as_vrf_mut(&mut self) -> Option<&mut VrfNode> {
        match self {
            ModelNode::Vrf(vrf) => Some(vrf),
            _ => None,
        }
    }
}
