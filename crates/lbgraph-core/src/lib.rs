//! A configuration graph engine for a Kubernetes ingress controller.
//!
//! `lbgraph-core` turns parsed ingresses, routes, LoadBalancer services,
//! secrets, policy rules and nodes into checksummed load balancer object graphs, and decides when a graph
//! has actually changed and needs to be published. It never talks to the
//! network: cluster state comes in through an [ObjectLister], and finished
//! graphs go out through a [GraphStore].
//!
//! Most callers only need a [GraphBuilder]:
//!
//! ```
//! use lbgraph_api::{Config, HostPath, IngressSpec, Server};
//! use lbgraph_core::{GraphBuilder, StaticObjects};
//!
//! let objects = StaticObjects::default()
//!     .with_service("default", "svc1", vec![Server::new("10.1.1.1", 8080)]);
//! let builder = GraphBuilder::new(Config::new("c1"), objects);
//!
//! let mut ingress = IngressSpec::new("default", "ing");
//! ingress
//!     .hosts
//!     .insert("foo.com".to_string(), vec![HostPath::new("/", "svc1", 80)]);
//!
//! let changed = builder.upsert_ingress("default/ing", &ingress);
//! assert_eq!(changed.len(), 1);
//!
//! // nothing changed, so nothing needs to be published
//! assert!(builder.upsert_ingress("default/ing", &ingress).is_empty());
//! ```

use std::collections::HashMap;

use lbgraph_api::{HostRule, HttpRule, Server, TlsSecret};

mod error;
pub use error::{Error, Result};

pub(crate) mod hash;

pub mod naming;
pub use naming::Naming;

pub mod shard;

pub mod nodes;

mod graph;
pub use graph::{GraphNodes, ObjectGraph};

mod store;
pub use store::GraphStore;

pub mod cache;

mod hierarchy;
mod l4;
mod overlay;
mod passthrough;
pub mod vrf;

mod builder;
pub use builder::GraphBuilder;

/// Already-resolved cluster state.
///
/// Implementations are expected to be fast local reads, like lookups against
/// an informer cache. Nothing in this crate holds a lock on an [ObjectGraph]
/// across a call that could block.
pub trait ObjectLister {
    /// The ready endpoints of a service. Returns `None` if the service
    /// doesn't exist.
    fn service_servers(&self, namespace: &str, name: &str) -> Option<Vec<Server>>;

    fn secret(&self, namespace: &str, name: &str) -> Option<TlsSecret>;

    /// The HostRule that applies to a host, if any.
    fn host_rule(&self, host: &str) -> Option<HostRule>;

    /// Every HTTPRule that applies to a host.
    fn http_rules(&self, host: &str) -> Vec<HttpRule>;
}

/// An [ObjectLister] backed by in-memory maps.
#[derive(Clone, Debug, Default)]
pub struct StaticObjects {
    services: HashMap<(String, String), Vec<Server>>,
    secrets: HashMap<(String, String), TlsSecret>,
    host_rules: HashMap<String, HostRule>,
    http_rules: HashMap<String, Vec<HttpRule>>,
}

impl StaticObjects {
    pub fn with_service(mut self, namespace: &str, name: &str, servers: Vec<Server>) -> Self {
        self.set_service(namespace, name, servers);
        self
    }

    pub fn with_secret(mut self, namespace: &str, name: &str, secret: TlsSecret) -> Self {
        self.set_secret(namespace, name, secret);
        self
    }

    pub fn with_host_rule(mut self, rule: HostRule) -> Self {
        self.set_host_rule(rule);
        self
    }

    pub fn with_http_rule(mut self, rule: HttpRule) -> Self {
        self.http_rules
            .entry(rule.fqdn.clone())
            .or_default()
            .push(rule);
        self
    }

    pub fn set_service(&mut self, namespace: &str, name: &str, servers: Vec<Server>) {
        self.services
            .insert((namespace.to_string(), name.to_string()), servers);
    }

    pub fn set_secret(&mut self, namespace: &str, name: &str, secret: TlsSecret) {
        self.secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    pub fn remove_secret(&mut self, namespace: &str, name: &str) {
        self.secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn set_host_rule(&mut self, rule: HostRule) {
        self.host_rules.insert(rule.fqdn.clone(), rule);
    }

    pub fn remove_host_rule(&mut self, fqdn: &str) {
        self.host_rules.remove(fqdn);
    }
}

impl ObjectLister for StaticObjects {
    fn service_servers(&self, namespace: &str, name: &str) -> Option<Vec<Server>> {
        self.services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<TlsSecret> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn host_rule(&self, host: &str) -> Option<HostRule> {
        self.host_rules.get(host).cloned()
    }

    fn http_rules(&self, host: &str) -> Vec<HttpRule> {
        self.http_rules.get(host).cloned().unwrap_or_default()
    }
}

impl<L: ObjectLister> ObjectLister for std::sync::Arc<L> {
    fn service_servers(&self, namespace: &str, name: &str) -> Option<Vec<Server>> {
        L::service_servers(self, namespace, name)
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<TlsSecret> {
        L::secret(self, namespace, name)
    }

    fn host_rule(&self, host: &str) -> Option<HostRule> {
        L::host_rule(self, host)
    }

    fn http_rules(&self, host: &str) -> Vec<HttpRule> {
        L::http_rules(self, host)
    }
}
