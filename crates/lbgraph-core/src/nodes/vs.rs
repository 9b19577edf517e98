use lbgraph_api::L4Protocol;
use serde::Serialize;

use crate::hash::{checksum, checksum_unordered};

use super::{
    rollup, Checksum, HttpDataScriptNode, HttpPolicySetNode, L4PolicyNode, NodeKind,
    PoolGroupNode, PoolNode, ServiceMetadata, TlsKeyCertNode, VsVipNode,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
    Udp,
}

impl From<L4Protocol> for Protocol {
    fn from(protocol: L4Protocol) -> Self {
        match protocol {
            L4Protocol::Tcp => Protocol::Tcp,
            L4Protocol::Udp => Protocol::Udp,
        }
    }
}

/// A listener port on a virtual service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortProtocol {
    pub port: u16,
    pub protocol: Protocol,
    pub enable_ssl: bool,
}

impl PortProtocol {
    pub fn http(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Http,
            enable_ssl: false,
        }
    }

    pub fn https(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Http,
            enable_ssl: true,
        }
    }

    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            enable_ssl: false,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
            enable_ssl: false,
        }
    }
}

/// Settings applied to a virtual service from a HostRule.
///
/// The default overlay has every field unset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct VsOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key_cert_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_profile_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waf_policy_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_profile_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics_profile_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_page_profile_ref: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub http_policy_set_refs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub datascript_refs: Vec<String>,
}

impl VsOverlay {
    pub fn is_empty(&self) -> bool {
        self == &VsOverlay::default()
    }
}

/// A virtual service.
///
/// The same node type models every shape of virtual service: a shared parent
/// carries SNI, EVH, or passthrough children, a child carries the pools and
/// certificates for a single host, and a dedicated virtual service carries a
/// single host's configuration directly with no children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VirtualServiceNode {
    pub name: String,
    pub tenant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vrf_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_engine_group: Option<String>,
    pub port_proto: Vec<PortProtocol>,
    pub application_profile: String,
    pub network_profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub enable_rhi: bool,

    pub shared_vs: bool,
    pub sni_parent: bool,
    pub evh_parent: bool,
    pub is_sni_child: bool,
    pub is_evh_child: bool,
    pub dedicated: bool,
    pub secure: bool,

    /// The parent of a child virtual service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vh_parent_name: Option<String>,
    /// The hosts a child virtual service matches on.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vh_domain_names: Vec<String>,

    pub overlay: VsOverlay,
    pub service_metadata: ServiceMetadata,

    pub vsvips: Vec<VsVipNode>,
    pub pools: Vec<PoolNode>,
    pub pool_groups: Vec<PoolGroupNode>,
    pub http_policies: Vec<HttpPolicySetNode>,
    pub ssl_key_certs: Vec<TlsKeyCertNode>,
    pub ca_certs: Vec<TlsKeyCertNode>,
    pub l4_policies: Vec<L4PolicyNode>,
    pub datascripts: Vec<HttpDataScriptNode>,

    pub sni_children: Vec<VirtualServiceNode>,
    pub evh_children: Vec<VirtualServiceNode>,
    pub passthrough_children: Vec<VirtualServiceNode>,
}

impl VirtualServiceNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    /// The virtual service's VSVIP. Parents have exactly one, children have
    /// none.
    pub fn vsvip(&self) -> Option<&VsVipNode> {
        self.vsvips.first()
    }

    pub fn vsvip_mut(&mut self) -> Option<&mut VsVipNode> {
        self.vsvips.first_mut()
    }

    /// Add a listener port if the virtual service isn't already listening on
    /// the same port number with the same protocol.
    pub fn add_port(&mut self, port: PortProtocol) {
        if !self
            .port_proto
            .iter()
            .any(|p| p.port == port.port && p.protocol == port.protocol)
        {
            self.port_proto.push(port);
        }
    }

    /// The SNI or EVH children of this virtual service.
    pub fn vh_children(&self, evh: bool) -> &Vec<VirtualServiceNode> {
        if evh {
            &self.evh_children
        } else {
            &self.sni_children
        }
    }

    pub fn vh_children_mut(&mut self, evh: bool) -> &mut Vec<VirtualServiceNode> {
        if evh {
            &mut self.evh_children
        } else {
            &mut self.sni_children
        }
    }

    fn scalar_checksum(&self) -> u32 {
        let mut ports: Vec<_> = self.port_proto.iter().collect();
        ports.sort();

        let shape = checksum(&(
            &self.name,
            &self.vrf_context,
            &self.service_engine_group,
            &ports,
            &self.application_profile,
            &self.network_profile,
            self.enabled,
            self.enable_rhi,
            &self.vh_parent_name,
            &self.overlay,
        ));
        let flags = checksum(&[
            self.shared_vs,
            self.sni_parent,
            self.evh_parent,
            self.is_sni_child,
            self.is_evh_child,
            self.dedicated,
            self.secure,
        ]);

        shape
            .wrapping_add(flags)
            .wrapping_add(checksum_unordered(&self.vh_domain_names))
    }
}

impl Checksum for VirtualServiceNode {
    fn checksum(&self) -> u32 {
        [
            self.scalar_checksum(),
            rollup(&self.vsvips),
            rollup(&self.pools),
            rollup(&self.pool_groups),
            rollup(&self.http_policies),
            rollup(&self.ssl_key_certs),
            rollup(&self.ca_certs),
            rollup(&self.l4_policies),
            rollup(&self.datascripts),
            rollup(&self.sni_children),
            rollup(&self.evh_children),
            rollup(&self.passthrough_children),
        ]
        .into_iter()
        .fold(0u32, u32::wrapping_add)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::VirtualService
    }
}
