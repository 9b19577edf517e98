use serde::Serialize;

use crate::hash::{checksum, checksum_unordered};

use super::{push_unique, Checksum, NodeKind, Protocol};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathMatch {
    #[default]
    BeginsWith,
    Equals,
}

/// Route requests for a set of hosts and paths to a pool group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostPathPoolPg {
    pub name: String,
    pub hosts: Vec<String>,
    pub paths: Vec<String>,
    pub match_criteria: PathMatch,
    pub pool_group: String,
}

/// Redirect requests for a set of hosts arriving on `vs_port` to
/// `redirect_port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RedirectPort {
    pub hosts: Vec<String>,
    pub vs_port: u16,
    pub redirect_port: u16,
    pub status_code: u16,
}

impl RedirectPort {
    /// An HTTP to HTTPS redirect.
    pub fn https(host: &str) -> Self {
        Self {
            hosts: vec![host.to_string()],
            vs_port: 80,
            redirect_port: 443,
            status_code: 302,
        }
    }
}

/// Rewrite the Host header of requests for `source_host` to `target_host`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct HeaderRewrite {
    pub source_host: String,
    pub target_host: String,
}

/// An HTTP request policy. A single set carries host/path switching rules, a
/// redirect, or a header rewrite.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HttpPolicySetNode {
    pub name: String,
    pub tenant: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hpp_map: Vec<HostPathPoolPg>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub redirect_ports: Vec<RedirectPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_rewrite: Option<HeaderRewrite>,
}

impl HttpPolicySetNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    /// Add a host to the policy's redirect, creating the redirect if
    /// necessary.
    pub fn add_redirect_host(&mut self, host: &str) -> bool {
        match self.redirect_ports.first_mut() {
            Some(redirect) => push_unique(&mut redirect.hosts, host),
            None => {
                self.redirect_ports.push(RedirectPort::https(host));
                true
            }
        }
    }

    /// Remove a host from every redirect. Redirects with no hosts left are
    /// dropped.
    pub fn remove_redirect_host(&mut self, host: &str) -> bool {
        let mut removed = false;
        for redirect in &mut self.redirect_ports {
            let len = redirect.hosts.len();
            redirect.hosts.retain(|h| h != host);
            removed |= redirect.hosts.len() != len;
        }
        self.redirect_ports.retain(|r| !r.hosts.is_empty());
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.hpp_map.is_empty() && self.redirect_ports.is_empty() && self.header_rewrite.is_none()
    }
}

impl Checksum for HttpPolicySetNode {
    fn checksum(&self) -> u32 {
        let mut hpp_map: Vec<_> = self.hpp_map.iter().collect();
        hpp_map.sort();

        let redirects = self.redirect_ports.iter().fold(0u32, |sum, r| {
            let ports = checksum(&(r.vs_port, r.redirect_port, r.status_code));
            sum.wrapping_add(ports.wrapping_add(checksum_unordered(&r.hosts)))
        });

        checksum(&(&self.name, &hpp_map, &self.header_rewrite)).wrapping_add(redirects)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::HttpPolicySet
    }
}

/// Send traffic arriving on a listener port to a pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortPool {
    pub port: u16,
    pub protocol: Protocol,
    pub pool_ref: String,
}

/// A layer 4 switching policy. Picks a pool for each connection by the port
/// it arrived on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct L4PolicyNode {
    pub name: String,
    pub tenant: String,
    pub port_pools: Vec<PortPool>,
}

impl L4PolicyNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            port_pools: Vec::new(),
        }
    }

    /// The protocols the policy switches on, sorted and deduplicated.
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<_> = self.port_pools.iter().map(|p| p.protocol).collect();
        protocols.sort();
        protocols.dedup();
        protocols
    }
}

impl Checksum for L4PolicyNode {
    fn checksum(&self) -> u32 {
        let mut port_pools: Vec<_> = self.port_pools.iter().collect();
        port_pools.sort();
        checksum(&(&self.name, &port_pools))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::L4Policy
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum DataScriptEvent {
    #[default]
    #[serde(rename = "VS_DATASCRIPT_EVT_HTTP_REQ")]
    HttpRequest,
    #[serde(rename = "VS_DATASCRIPT_EVT_L4_REQUEST")]
    L4Request,
}

/// A script run on every request or connection to a virtual service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct HttpDataScriptNode {
    pub name: String,
    pub tenant: String,
    pub event: DataScriptEvent,
    pub script: String,
    pub pool_group_refs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protocol_parsers: Vec<String>,
}

impl Checksum for HttpDataScriptNode {
    fn checksum(&self) -> u32 {
        checksum(&(&self.name, self.event, &self.script, &self.protocol_parsers))
            .wrapping_add(checksum_unordered(&self.pool_group_refs))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::HttpDataScript
    }
}
