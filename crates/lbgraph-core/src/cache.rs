//! Relationship caches kept alongside the graph store.
//!
//! These track which Kubernetes objects contributed to which hosts, so that a
//! later update can tell what it has to tear down and so that an external
//! layer can work out what to reprocess when a secret or rule changes. Every
//! cache is guarded by a single coarse mutex and every method is one atomic
//! read-modify-write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use lbgraph_api::{K8sNode, ObjectKind};

/// Secure hosts and the ingresses that serve them.
#[derive(Debug, Default)]
pub struct HostNameCache {
    // host -> ingress key -> secret name
    secure: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl HostNameCache {
    /// Record that an ingress serves a secure host with a secret.
    pub fn add_secure_host(&self, host: &str, ingress: &str, secret: &str) {
        let mut secure = self.secure.lock().unwrap();
        secure
            .entry(host.to_string())
            .or_default()
            .insert(ingress.to_string(), secret.to_string());
    }

    /// Remove an ingress from a secure host, returning the number of ingresses
    /// still serving the host. The host's entry is dropped when no ingresses
    /// are left.
    pub fn remove_secure_host(&self, host: &str, ingress: &str) -> usize {
        let mut secure = self.secure.lock().unwrap();
        let Some(ingresses) = secure.get_mut(host) else {
            return 0;
        };
        ingresses.remove(ingress);

        let remaining = ingresses.len();
        if remaining == 0 {
            secure.remove(host);
        }
        remaining
    }

    /// The ingresses serving a secure host.
    pub fn secure_ingresses(&self, host: &str) -> Vec<String> {
        let secure = self.secure.lock().unwrap();
        secure
            .get(host)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.secure.lock().unwrap().contains_key(host)
    }

    pub fn delete_host(&self, host: &str) {
        self.secure.lock().unwrap().remove(host);
    }
}

/// TLS secrets and the ingresses that use them.
#[derive(Debug, Default)]
pub struct SecretIngressCache {
    // namespace/secret -> ingress keys
    secrets: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl SecretIngressCache {
    pub fn add(&self, secret_key: &str, ingress: &str) {
        let mut secrets = self.secrets.lock().unwrap();
        secrets
            .entry(secret_key.to_string())
            .or_default()
            .insert(ingress.to_string());
    }

    pub fn remove(&self, secret_key: &str, ingress: &str) {
        let mut secrets = self.secrets.lock().unwrap();
        if let Some(ingresses) = secrets.get_mut(secret_key) {
            ingresses.remove(ingress);
            if ingresses.is_empty() {
                secrets.remove(secret_key);
            }
        }
    }

    /// Remove an ingress from every secret.
    pub fn remove_ingress(&self, ingress: &str) {
        let mut secrets = self.secrets.lock().unwrap();
        secrets.retain(|_, ingresses| {
            ingresses.remove(ingress);
            !ingresses.is_empty()
        });
    }

    /// The ingresses that use a secret.
    pub fn ingresses(&self, secret_key: &str) -> Vec<String> {
        let secrets = self.secrets.lock().unwrap();
        secrets
            .get(secret_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// The FQDN aliases last applied to each host.
#[derive(Debug, Default)]
pub struct FqdnAliasCache {
    aliases: Mutex<BTreeMap<String, Vec<String>>>,
}

impl FqdnAliasCache {
    pub fn get(&self, host: &str) -> Vec<String> {
        let aliases = self.aliases.lock().unwrap();
        aliases.get(host).cloned().unwrap_or_default()
    }

    /// Replace the aliases for a host, returning the previous list.
    pub fn replace(&self, host: &str, new: Vec<String>) -> Vec<String> {
        let mut aliases = self.aliases.lock().unwrap();
        let prev = if new.is_empty() {
            aliases.remove(host)
        } else {
            aliases.insert(host.to_string(), new)
        };
        prev.unwrap_or_default()
    }
}

/// How a host was built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostMode {
    Insecure,
    Secure,
    Passthrough,
}

/// A path on a host and the service behind it. Passthrough hosts record an
/// empty path for every backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathRecord {
    pub path: String,
    pub service: String,
}

/// The record of how one host on an ingress was last built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRecord {
    pub mode: HostMode,
    pub kind: ObjectKind,
    pub model_name: String,
    pub vs_name: String,
    pub dedicated: bool,
    pub infra_setting: Option<String>,
    pub paths: Vec<PathRecord>,
    pub secret: Option<String>,
    pub redirect: bool,
}

impl HostRecord {
    /// Returns `true` if `other` was built into the same place as this
    /// record, so that moving between them only needs the paths that
    /// changed to be torn down.
    pub fn same_placement(&self, other: &HostRecord) -> bool {
        self.mode == other.mode
            && self.kind == other.kind
            && self.model_name == other.model_name
            && self.dedicated == other.dedicated
            && self.infra_setting == other.infra_setting
    }
}

/// The hosts each ingress was last built with.
#[derive(Debug, Default)]
pub struct IngressHostCache {
    ingresses: Mutex<BTreeMap<String, BTreeMap<String, HostRecord>>>,
}

impl IngressHostCache {
    pub fn get(&self, ingress: &str) -> BTreeMap<String, HostRecord> {
        let ingresses = self.ingresses.lock().unwrap();
        ingresses.get(ingress).cloned().unwrap_or_default()
    }

    /// Replace the stored hosts for an ingress, returning the previous
    /// hosts.
    pub fn replace(
        &self,
        ingress: &str,
        hosts: BTreeMap<String, HostRecord>,
    ) -> BTreeMap<String, HostRecord> {
        let mut ingresses = self.ingresses.lock().unwrap();
        let prev = if hosts.is_empty() {
            ingresses.remove(ingress)
        } else {
            ingresses.insert(ingress.to_string(), hosts)
        };
        prev.unwrap_or_default()
    }

    pub fn remove(&self, ingress: &str) -> BTreeMap<String, HostRecord> {
        let mut ingresses = self.ingresses.lock().unwrap();
        ingresses.remove(ingress).unwrap_or_default()
    }

    /// The keys of every ingress that serves a host.
    pub fn ingresses_for_host(&self, host: &str) -> Vec<String> {
        let ingresses = self.ingresses.lock().unwrap();
        ingresses
            .iter()
            .filter(|(_, hosts)| hosts.contains_key(host))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns `true` if any ingress has a host placed in a model.
    pub fn references_model(&self, model: &str) -> bool {
        let ingresses = self.ingresses.lock().unwrap();
        ingresses
            .values()
            .flat_map(|hosts| hosts.values())
            .any(|record| record.model_name == model)
    }
}

/// Every known Kubernetes node, sorted by name.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: Mutex<BTreeMap<String, K8sNode>>,
}

impl NodeCache {
    pub fn insert(&self, node: K8sNode) -> Option<K8sNode> {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(node.name.clone(), node)
    }

    pub fn remove(&self, name: &str) -> Option<K8sNode> {
        self.nodes.lock().unwrap().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<K8sNode> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// A snapshot of every node, in name order.
    pub fn sorted(&self) -> Vec<K8sNode> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }
}

/// Every relationship cache a builder maintains.
#[derive(Debug, Default)]
pub struct Caches {
    pub hostnames: HostNameCache,
    pub secrets: SecretIngressCache,
    pub fqdn_aliases: FqdnAliasCache,
    pub ingress_hosts: IngressHostCache,
    pub nodes: NodeCache,
}
