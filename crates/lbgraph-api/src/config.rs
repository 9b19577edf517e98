//! Controller configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorContext};

/// The number of shared virtual services hosts are spread across.
///
/// `Dedicated` gives every host its own virtual service with no children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardSize {
    #[default]
    Large,
    Medium,
    Small,
    Dedicated,
}

impl ShardSize {
    /// The number of shard slots for this size. A dedicated size has no
    /// slots.
    pub fn count(&self) -> u32 {
        match self {
            ShardSize::Large => 8,
            ShardSize::Medium => 4,
            ShardSize::Small => 1,
            ShardSize::Dedicated => 0,
        }
    }

    pub fn is_dedicated(&self) -> bool {
        matches!(self, ShardSize::Dedicated)
    }
}

/// What a shared virtual service slot is picked by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardScheme {
    #[default]
    Hostname,
    Namespace,
}

/// How per-host children hang off a shared parent virtual service.
///
/// In `Sni` mode only secure hosts become children and insecure hosts are
/// served directly from the parent's pools. In `Evh` mode every host is a
/// child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualHostMode {
    #[default]
    Sni,
    Evh,
}

/// Configuration for a graph builder.
///
/// Every field but `cluster_name` has a default, so a minimal config is a
/// single line of YAML:
///
/// ```
/// # use lbgraph_api::Config;
/// let config = Config::from_yaml("cluster_name: my-cluster").unwrap();
/// assert_eq!(config.tenant, "admin");
/// assert_eq!(config.shard_size.count(), 8);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The name of the cluster. Used to prefix every generated object name
    /// and static route ID.
    pub cluster_name: String,

    /// The tenant generated objects are placed in.
    pub tenant: String,

    /// The VRF context static routes are written to.
    pub vrf_name: String,

    pub shard_scheme: ShardScheme,

    pub shard_size: ShardSize,

    /// Shard size for TLS passthrough virtual services. Passthrough hosts are
    /// always sharded by hostname.
    pub passthrough_shard_size: ShardSize,

    pub virtual_host_mode: VirtualHostMode,

    /// A DNS subdomain used to give every shared virtual service a default
    /// FQDN of `<vs>.<tenant>.<subdomain>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_subdomain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_engine_group: Option<String>,

    /// The number of times a published graph may be copied for a publish
    /// attempt before retries stop.
    pub retry_count: u32,

    pub l7_application_profile: String,

    pub l7_secure_application_profile: String,

    pub tcp_network_profile: String,

    /// The network profile for L4 virtual services with no TCP ports.
    pub udp_network_profile: String,

    pub l4_application_profile: String,

    pub default_pool_ssl_profile: String,

    /// Skip VRF static route reconciliation entirely.
    pub disable_static_routes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            tenant: "admin".to_string(),
            vrf_name: "global".to_string(),
            shard_scheme: ShardScheme::default(),
            shard_size: ShardSize::default(),
            passthrough_shard_size: ShardSize::Small,
            virtual_host_mode: VirtualHostMode::default(),
            default_subdomain: None,
            service_engine_group: None,
            retry_count: 10,
            l7_application_profile: "System-HTTP".to_string(),
            l7_secure_application_profile: "System-Secure-HTTP".to_string(),
            tcp_network_profile: "System-TCP-Proxy".to_string(),
            udp_network_profile: "System-UDP-Fast-Path".to_string(),
            l4_application_profile: "System-L4-Application".to_string(),
            default_pool_ssl_profile: "System-Standard".to_string(),
            disable_static_routes: false,
        }
    }
}

impl Config {
    /// A default config for a named cluster.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a config from YAML.
    pub fn from_yaml(s: &str) -> Result<Self, Error> {
        let config: Config = serde_yml::from_str(s).map_err(|e| Error::new(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from JSON.
    pub fn from_json(s: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(s).map_err(|e| Error::new(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_name.is_empty() {
            return Err(Error::new_static("cluster name must not be empty"))
                .with_field("cluster_name");
        }
        if self.cluster_name.contains('/') {
            return Err(Error::new_static("cluster name may not contain '/'"))
                .with_field("cluster_name");
        }
        if self.tenant.is_empty() {
            return Err(Error::new_static("tenant must not be empty")).with_field("tenant");
        }
        if self.retry_count == 0 {
            return Err(Error::new_static("retry count must be at least 1"))
                .with_field("retry_count");
        }
        if self.passthrough_shard_size.is_dedicated() {
            return Err(Error::new_static(
                "passthrough virtual services cannot be dedicated",
            ))
            .with_field("passthrough_shard_size");
        }

        let profiles = [
            ("l7_application_profile", &self.l7_application_profile),
            (
                "l7_secure_application_profile",
                &self.l7_secure_application_profile,
            ),
            ("tcp_network_profile", &self.tcp_network_profile),
            ("udp_network_profile", &self.udp_network_profile),
            ("l4_application_profile", &self.l4_application_profile),
            ("default_pool_ssl_profile", &self.default_pool_ssl_profile),
        ];
        for (field, profile) in profiles {
            if profile.is_empty() {
                return Err(Error::new_static("profile name must not be empty")).with_field(field);
            }
        }

        Ok(())
    }

    /// The prefix every generated object name starts with.
    pub fn name_prefix(&self) -> String {
        format!("{}--", self.cluster_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_minimal_yaml() {
        let config = Config::from_yaml("cluster_name: c1").unwrap();
        assert_eq!(config, Config::new("c1"));
        assert_eq!(config.name_prefix(), "c1--");
        assert_eq!(config.retry_count, 10);
        assert_eq!(config.shard_scheme, ShardScheme::Hostname);
        assert_eq!(config.virtual_host_mode, VirtualHostMode::Sni);
    }

    #[test]
    fn test_full_yaml() {
        let config = Config::from_yaml(
            r#"
cluster_name: c1
tenant: team-a
vrf_name: vrf-blue
shard_scheme: namespace
shard_size: MEDIUM
passthrough_shard_size: LARGE
virtual_host_mode: evh
default_subdomain: avi.internal
retry_count: 3
"#,
        )
        .unwrap();

        assert_eq!(config.tenant, "team-a");
        assert_eq!(config.vrf_name, "vrf-blue");
        assert_eq!(config.shard_scheme, ShardScheme::Namespace);
        assert_eq!(config.shard_size, ShardSize::Medium);
        assert_eq!(config.passthrough_shard_size.count(), 8);
        assert_eq!(config.virtual_host_mode, VirtualHostMode::Evh);
        assert_eq!(config.default_subdomain.as_deref(), Some("avi.internal"));
        assert_eq!(config.retry_count, 3);
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = Config::new("c1");
        config.shard_size = ShardSize::Dedicated;

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_validate() {
        let err = Config::from_yaml("tenant: admin").unwrap_err();
        assert_eq!(err.path(), "cluster_name");

        let err = Config::from_yaml("{cluster_name: c1, retry_count: 0}").unwrap_err();
        assert_eq!(err.path(), "retry_count");

        let err =
            Config::from_yaml("{cluster_name: c1, passthrough_shard_size: DEDICATED}").unwrap_err();
        assert_eq!(err.path(), "passthrough_shard_size");

        let err = Config::from_yaml("{cluster_name: c1, tcp_network_profile: ''}").unwrap_err();
        assert_eq!(err.path(), "tcp_network_profile");
    }

    #[test]
    fn test_unknown_shard_size() {
        let err = Config::from_yaml("{cluster_name: c1, shard_size: HUGE}").unwrap_err();
        assert!(err.path().is_empty());
        assert!(err.message().contains("HUGE"), "{err}");
    }

    #[test]
    fn test_shard_counts() {
        assert_eq!(ShardSize::Large.count(), 8);
        assert_eq!(ShardSize::Medium.count(), 4);
        assert_eq!(ShardSize::Small.count(), 1);
        assert_eq!(ShardSize::Dedicated.count(), 0);
        assert!(ShardSize::Dedicated.is_dedicated());
    }
}
