use serde::Serialize;

use crate::hash::{checksum, checksum_unordered};

use super::{push_unique, Checksum, NodeKind};

/// The virtual IP of a virtual service and the FQDNs it answers for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VsVipNode {
    pub name: String,
    pub tenant: String,
    pub fqdns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vrf_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_engine_group: Option<String>,
    /// A requested address. The load balancer allocates one when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl VsVipNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    /// Add an FQDN. Returns `false` if it was already present.
    pub fn add_fqdn(&mut self, fqdn: &str) -> bool {
        push_unique(&mut self.fqdns, fqdn)
    }

    /// Remove an FQDN. Returns `false` if it wasn't present.
    pub fn remove_fqdn(&mut self, fqdn: &str) -> bool {
        let len = self.fqdns.len();
        self.fqdns.retain(|f| f != fqdn);
        self.fqdns.len() != len
    }

    pub fn has_fqdn(&self, fqdn: &str) -> bool {
        self.fqdns.iter().any(|f| f == fqdn)
    }
}

impl Checksum for VsVipNode {
    fn checksum(&self) -> u32 {
        checksum(&(
            &self.name,
            &self.vrf_context,
            &self.service_engine_group,
            &self.ip_address,
        ))
            .wrapping_add(checksum_unordered(&self.fqdns))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::VsVip
    }
}
