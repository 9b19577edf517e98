use serde::{Deserialize, Serialize};

/// The facts about a Kubernetes node that static routes are built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sNode {
    pub name: String,

    /// The node's UID. The first dash-separated group identifies the node's
    /// routes.
    pub uid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,

    /// Pod CIDRs assigned to the node, e.g. `10.244.1.0/24`.
    pub pod_cidrs: Vec<String>,
}

impl K8sNode {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn with_ipv4(mut self, ip: impl Into<String>) -> Self {
        self.ipv4 = Some(ip.into());
        self
    }

    pub fn with_ipv6(mut self, ip: impl Into<String>) -> Self {
        self.ipv6 = Some(ip.into());
        self
    }

    pub fn with_pod_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.pod_cidrs.push(cidr.into());
        self
    }

    /// The prefix of this node's UID used in static route IDs.
    pub fn uid_prefix(&self) -> &str {
        self.uid.split('-').next().unwrap_or_default()
    }
}
