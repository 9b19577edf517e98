use lbgraph_api::Server;
use serde::Serialize;

use crate::hash::{checksum, checksum_unordered};

use super::{rollup, Checksum, NodeKind, PkiProfileNode, ServiceMetadata};

/// A set of backend servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolNode {
    pub name: String,
    pub tenant: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    pub servers: Vec<Server>,

    /// The `host[/path]` label a shared pool group routes on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lb_algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lb_algorithm_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lb_consistent_hash_header: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub health_monitors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_persistence_profile: Option<String>,

    /// Re-encrypt traffic to the backend.
    pub sni_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_profile_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pki_profile: Option<PkiProfileNode>,

    pub service_metadata: ServiceMetadata,
}

impl PoolNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            ..Default::default()
        }
    }
}

impl Checksum for PoolNode {
    fn checksum(&self) -> u32 {
        let mut servers: Vec<_> = self.servers.iter().collect();
        servers.sort();

        let fields = checksum(&(
            &self.name,
            self.port,
            self.target_port,
            &self.port_name,
            &servers,
            &self.priority_label,
            &self.lb_algorithm,
            &self.lb_algorithm_hash,
            &self.lb_consistent_hash_header,
            &self.application_persistence_profile,
            self.sni_enabled,
            &self.ssl_profile_ref,
        ));

        fields
            .wrapping_add(checksum_unordered(&self.health_monitors))
            .wrapping_add(rollup(&self.pki_profile))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Pool
    }
}

/// A reference to a pool from a pool group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PoolGroupMember {
    pub pool_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_label: Option<String>,
}

impl PoolGroupMember {
    pub fn new(pool_ref: impl Into<String>) -> Self {
        Self {
            pool_ref: pool_ref.into(),
            ratio: None,
            priority_label: None,
        }
    }
}

/// A weighted group of pools.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolGroupNode {
    pub name: String,
    pub tenant: String,
    pub members: Vec<PoolGroupMember>,
    /// Route on member priority labels instead of ratios.
    pub implicit_priority_labels: bool,
}

impl PoolGroupNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    /// Add or update a member, keyed by pool reference.
    pub fn upsert_member(&mut self, member: PoolGroupMember) {
        match self
            .members
            .iter_mut()
            .find(|m| m.pool_ref == member.pool_ref)
        {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    pub fn remove_member(&mut self, pool_ref: &str) -> bool {
        let len = self.members.len();
        self.members.retain(|m| m.pool_ref != pool_ref);
        self.members.len() != len
    }
}

impl Checksum for PoolGroupNode {
    fn checksum(&self) -> u32 {
        let mut members: Vec<_> = self.members.iter().collect();
        members.sort();
        checksum(&(&self.name, &members, self.implicit_priority_labels))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::PoolGroup
    }
}
