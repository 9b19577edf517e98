//! Per-host and per-path policy overlays.

use serde::{Deserialize, Serialize};

/// The admission status of a rule. Rejected rules are never applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleStatus {
    #[default]
    Accepted,
    Rejected,
}

/// Overlay configuration for every virtual service that serves a host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRule {
    pub namespace: String,
    pub name: String,
    pub fqdn: String,
    pub status: RuleStatus,

    /// Use an SSL key and certificate already present on the load balancer
    /// instead of the one from the ingress's secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key_cert_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waf_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_page_profile: Option<String>,
    pub http_policy_sets: Vec<String>,
    /// Replace the generated HTTP policies instead of adding to them.
    pub http_policy_overwrite: bool,
    pub datascripts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_virtual_host: Option<bool>,
    pub fqdn_aliases: Vec<String>,
    /// A global FQDN that should be rewritten to this host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gslb_fqdn: Option<String>,
}

impl HostRule {
    /// The `namespace/name` key for this rule.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_rejected(&self) -> bool {
        self.status == RuleStatus::Rejected
    }
}

/// Overlay configuration for the pools that serve a host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRule {
    pub namespace: String,
    pub name: String,
    pub fqdn: String,
    pub status: RuleStatus,
    pub paths: Vec<HttpRulePath>,
}

impl HttpRule {
    /// The `namespace/name` key for this rule.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_rejected(&self) -> bool {
        self.status == RuleStatus::Rejected
    }
}

/// Settings for every pool whose path starts with `target`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRulePath {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<HttpRuleTls>,
    pub health_monitors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_persistence: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerPolicy {
    pub algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_header: Option<String>,
}

/// Re-encrypt settings for a path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRuleTls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_ca: Option<String>,
}
