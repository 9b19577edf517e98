//! Shard slot selection.
//!
//! Every path that needs to find a host's parent virtual service goes through
//! [Sharding::parent_vs]. Creating a model and looking one up for deletion
//! must agree on the bucket, or deleted hosts leak orphaned models.

use lbgraph_api::{Config, IngressSpec, ShardScheme, ShardSize, VirtualHostMode};

use crate::hash::thread_local_xxhash;
use crate::naming::Naming;

/// Pick a shard bucket in `[0, shard_count)` for a key.
///
/// A `shard_count` of zero has no buckets and always returns zero.
pub fn bucket(key: &str, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    (thread_local_xxhash::hash(key) % shard_count as u64) as u32
}

/// The parent virtual service a host is attached to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentVs {
    pub vs_name: String,
    pub model_name: String,
    pub dedicated: bool,
}

/// Shard configuration for a builder.
#[derive(Clone, Debug)]
pub struct Sharding {
    scheme: ShardScheme,
    size: ShardSize,
    passthrough_size: ShardSize,
    evh: bool,
    naming: Naming,
}

impl Sharding {
    pub fn new(config: &Config) -> Self {
        Self {
            scheme: config.shard_scheme,
            size: config.shard_size,
            passthrough_size: config.passthrough_shard_size,
            evh: config.virtual_host_mode == VirtualHostMode::Evh,
            naming: Naming::new(config),
        }
    }

    pub fn is_evh(&self) -> bool {
        self.evh
    }

    /// The shard size that applies to an ingress. An infra setting with its own
    /// shard size overrides the global one.
    pub fn shard_size(&self, ingress: &IngressSpec) -> ShardSize {
        ingress
            .infra_setting
            .as_ref()
            .and_then(|s| s.shard_size)
            .unwrap_or(self.size)
    }

    /// Find the parent virtual service for a host on an ingress.
    pub fn parent_vs(&self, ingress: &IngressSpec, host: &str) -> ParentVs {
        let infra = ingress.infra_setting_name();
        let size = self.shard_size(ingress);

        let (vs_name, dedicated) = if size.is_dedicated() {
            (self.naming.dedicated_vs_name(infra, host), true)
        } else {
            let key = match self.scheme {
                ShardScheme::Hostname => host,
                ShardScheme::Namespace => &ingress.namespace,
            };
            let n = bucket(key, size.count());
            (self.naming.shard_vs_name(infra, n, self.evh), false)
        };

        let model_name = self.naming.model_name(&vs_name);
        ParentVs {
            vs_name,
            model_name,
            dedicated,
        }
    }

    /// Find the passthrough virtual service for a host. Passthrough hosts are
    /// always sharded by hostname.
    pub fn passthrough_vs(&self, infra: Option<&str>, host: &str) -> ParentVs {
        let n = bucket(host, self.passthrough_size.count());
        let vs_name = self.naming.passthrough_vs_name(infra, n);
        let model_name = self.naming.model_name(&vs_name);
        ParentVs {
            vs_name,
            model_name,
            dedicated: false,
        }
    }
}
