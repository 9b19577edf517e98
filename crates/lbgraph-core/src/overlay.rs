//! HostRule and HTTPRule overlays.
//!
//! Overlays are applied after a host's nodes are built, so they only ever
//! adjust fields on nodes that already exist and never add or remove nodes
//! of their own.

use lbgraph_api::{HostRule, HttpRulePath};
use regex::Regex;

use crate::hierarchy::{BuildContext, IngressRef};
use crate::nodes::{
    push_unique, CrdState, CrdStatus, PkiProfileNode, PoolNode, VirtualServiceNode, VsOverlay,
};
use crate::{Error, Naming, ObjectLister};

const HOST_RULE: &str = "HostRule";
const HTTP_RULE: &str = "HTTPRule";

/// The parts of a HostRule that apply to a host's parent rather than the
/// virtual service serving the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct HostRuleOverlay {
    pub aliases: Vec<String>,
    pub gslb_fqdn: Option<String>,
}

impl HostRuleOverlay {
    fn from_rule(rule: &HostRule, host: &str) -> Self {
        let mut aliases = Vec::with_capacity(rule.fqdn_aliases.len());
        for alias in &rule.fqdn_aliases {
            if alias != host && !alias.is_empty() {
                push_unique(&mut aliases, alias);
            }
        }
        Self {
            aliases,
            gslb_fqdn: rule.gslb_fqdn.clone().filter(|f| !f.is_empty()),
        }
    }
}

impl<L: ObjectLister> BuildContext<'_, L> {
    /// Apply the HostRule for `host` to the virtual service serving it.
    ///
    /// Returns `None` if the rule exists but was rejected. The virtual service
    /// keeps whatever overlay it had, and the caller should keep any aliases
    /// it already applied.
    pub(crate) fn apply_host_rule(
        &self,
        vs: &mut VirtualServiceNode,
        host: &str,
        secure: bool,
    ) -> Option<HostRuleOverlay> {
        let Some(rule) = self.lister.host_rule(host) else {
            if !vs.overlay.is_empty() || vs.enabled.is_some() {
                tracing::debug!(key = %self.key, vs = %vs.name, host, "removing host rule overlay");
            }
            vs.overlay = VsOverlay::default();
            vs.enabled = None;
            if let Some(status) = &mut vs.service_metadata.crd_status {
                status.state = CrdState::Inactive;
            }
            return Some(HostRuleOverlay::default());
        };

        if rule.is_rejected() {
            let err = Error::RejectedRule {
                kind: HOST_RULE,
                name: rule.key(),
            };
            tracing::warn!(key = %self.key, host, %err, "skipping host rule");
            return None;
        }

        let mut overlay = VsOverlay {
            waf_policy_ref: rule.waf_policy.clone(),
            application_profile_ref: rule.application_profile.clone(),
            analytics_profile_ref: rule.analytics_profile.clone(),
            error_page_profile_ref: rule.error_page_profile.clone(),
            ..Default::default()
        };
        if secure {
            overlay.ssl_key_cert_ref = rule.ssl_key_cert_ref.clone();
            overlay.ssl_profile_ref = rule.ssl_profile.clone();
        }
        for policy in &rule.http_policy_sets {
            push_unique(&mut overlay.http_policy_set_refs, policy);
        }
        for script in &rule.datascripts {
            push_unique(&mut overlay.datascript_refs, script);
        }

        // a certificate that already lives on the load balancer replaces the
        // one built from the ingress.
        if overlay.ssl_key_cert_ref.is_some() {
            vs.ssl_key_certs.clear();
            vs.ca_certs.clear();
        }
        if rule.http_policy_overwrite && !overlay.http_policy_set_refs.is_empty() {
            vs.http_policies.clear();
        }

        vs.overlay = overlay;
        vs.enabled = rule.enable_virtual_host;
        vs.service_metadata.crd_status = Some(CrdStatus {
            kind: HOST_RULE,
            name: rule.key(),
            state: CrdState::Active,
        });

        tracing::debug!(key = %self.key, vs = %vs.name, host, rule = %rule.key(), "applied host rule");
        Some(HostRuleOverlay::from_rule(&rule, host))
    }

    /// The parent-level parts of the HostRule for an insecure host served
    /// directly by a shared virtual service. Returns `None` for a rejected
    /// rule.
    pub(crate) fn host_rule_for_insecure_host(&self, host: &str) -> Option<HostRuleOverlay> {
        match self.lister.host_rule(host) {
            None => Some(HostRuleOverlay::default()),
            Some(rule) if rule.is_rejected() => {
                let err = Error::RejectedRule {
                    kind: HOST_RULE,
                    name: rule.key(),
                };
                tracing::warn!(key = %self.key, host, %err, "skipping host rule");
                None
            }
            Some(rule) => Some(HostRuleOverlay::from_rule(&rule, host)),
        }
    }

    /// Apply every HTTPRule for `host` to the pools built for it.
    ///
    /// Pools are matched by name. `vh_pools` selects between the naming used
    /// for pools on a child or dedicated virtual service and the naming used
    /// for pools directly on a shared parent. A pool matched by more than one
    /// path gets the settings of the most specific one.
    pub(crate) fn apply_http_rules(
        &self,
        pools: &mut [PoolNode],
        ing: &IngressRef,
        host: &str,
        vh_pools: bool,
    ) {
        let mut paths: Vec<(String, HttpRulePath)> = Vec::new();
        for rule in self.lister.http_rules(host) {
            if rule.is_rejected() {
                let err = Error::RejectedRule {
                    kind: HTTP_RULE,
                    name: rule.key(),
                };
                tracing::warn!(key = %self.key, host, %err, "skipping http rule");
                continue;
            }
            let key = rule.key();
            paths.extend(rule.paths.into_iter().map(|p| (key.clone(), p)));
        }
        if paths.is_empty() {
            return;
        }
        paths.sort_by(|(_, a), (_, b)| a.target.cmp(&b.target));

        for (rule_key, path) in &paths {
            let Some(pattern) = self.http_rule_pattern(ing, host, &path.target, vh_pools) else {
                continue;
            };
            for pool in pools.iter_mut().filter(|p| pattern.is_match(&p.name)) {
                self.apply_http_rule_path(pool, rule_key, path);
            }
        }
    }

    fn http_rule_pattern(
        &self,
        ing: &IngressRef,
        host: &str,
        target: &str,
        vh_pools: bool,
    ) -> Option<Regex> {
        let scoped = regex::escape(&self.naming.scoped(ing.infra));
        let host = regex::escape(host);
        let target = regex::escape(&target.replace('/', "_"));
        let namespace = regex::escape(ing.namespace);
        let name = regex::escape(ing.name);

        let pattern = if vh_pools {
            format!("^{scoped}{namespace}-{host}{target}.*-{name}")
        } else {
            format!("^{scoped}{host}{target}.*-{namespace}-{name}")
        };

        match Regex::new(&pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(key = %self.key, %pattern, err = %e, "invalid http rule pattern");
                None
            }
        }
    }

    fn apply_http_rule_path(&self, pool: &mut PoolNode, rule_key: &str, path: &HttpRulePath) {
        if let Some(lb) = &path.load_balancer_policy {
            pool.lb_algorithm = Some(lb.algorithm.clone());
            pool.lb_algorithm_hash = lb.hash.clone();
            pool.lb_consistent_hash_header = lb.host_header.clone();
        }

        if let Some(tls) = &path.tls {
            pool.sni_enabled = true;
            pool.ssl_profile_ref = Some(
                tls.ssl_profile
                    .clone()
                    .unwrap_or_else(|| self.config.default_pool_ssl_profile.clone()),
            );
            if let Some(ca) = &tls.destination_ca {
                pool.pki_profile = Some(PkiProfileNode::new(
                    Naming::pki_profile_name(&pool.name),
                    self.tenant(),
                    ca,
                ));
            }
        }

        for monitor in &path.health_monitors {
            push_unique(&mut pool.health_monitors, monitor);
        }
        if path.application_persistence.is_some() {
            pool.application_persistence_profile = path.application_persistence.clone();
        }

        pool.service_metadata.crd_status = Some(CrdStatus {
            kind: HTTP_RULE,
            name: rule_key.to_string(),
            state: CrdState::Active,
        });
        tracing::debug!(key = %self.key, pool = %pool.name, rule = rule_key, target = %path.target, "applied http rule");
    }
}
