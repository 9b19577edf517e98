// Building hosts into virtual services.
//
// There are three places a host can end up:
//
// - Insecure hosts in SNI mode are served directly by a shared parent. Every
//   path gets a pool on the parent, and the parent's shared pool group picks a
//   pool by priority label (`host/path`) with a datascript.
//
// - Secure hosts in SNI mode, and every host in EVH mode, get a child virtual
//   service under the shared parent. The child carries the host's pools, pool
//   groups, switching policy and certificates. The parent's VSVIP lists every
//   child's host, and the parent's redirect policy lists every host that wants
//   HTTP redirected to HTTPS.
//
// - Hosts on a dedicated shard get all of that directly on a dedicated virtual
//   service with no children.
//
// Everything here runs with the owning graph's write lock held, and never
// fails outward. A host that can't be built because something it depends on
// is missing gets torn down and reported back to the caller, and every other
// host carries on.
//
// Deletes are driven by the names of the paths that were built, not by
// scanning the tree, so any name computed here has to come from `Naming` and
// has to use exactly the same inputs in the build and delete paths.

use lbgraph_api::{Config, HostPath, IngressSpec, ObjectKind, PathType, Server, TlsSettings};

use crate::cache::{Caches, HostRecord, PathRecord};
use crate::naming::Naming;
use crate::nodes::{
    find_by_name, find_by_name_mut, push_unique, remove_by_name, replace_in_place,
    DataScriptEvent, HeaderRewrite, HostPathPoolPg, HttpDataScriptNode, HttpPolicySetNode,
    PathMatch, PkiProfileNode, PoolGroupMember, PoolGroupNode, PoolNode, PortProtocol,
    ServiceMetadata, TlsKeyCertNode, VirtualServiceNode, VsVipNode,
};
use crate::{Error, ObjectLister, Result};

const HTTP_DATASCRIPT: &str = r#"host = avi.http.get_host_tokens(1)
path = avi.http.get_path_tokens(1)
if host and path then
lbl = host.."/"..path
else
lbl = host
end
avi.poolgroup.select("POOLGROUP", string.lower(lbl) )"#;

/// The ingress a host belongs to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IngressRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub kind: ObjectKind,
    pub infra: Option<&'a str>,
}

impl<'a> IngressRef<'a> {
    pub(crate) fn from_spec(spec: &'a IngressSpec) -> Self {
        Self {
            namespace: &spec.namespace,
            name: &spec.name,
            kind: spec.kind,
            infra: spec.infra_setting_name(),
        }
    }

    pub(crate) fn from_record(namespace: &'a str, name: &'a str, record: &'a HostRecord) -> Self {
        Self {
            namespace,
            name,
            kind: record.kind,
            infra: record.infra_setting.as_deref(),
        }
    }

    pub(crate) fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    // routes can send a path to more than one service, so their pools are
    // named per service.
    fn service<'s>(&self, service: &'s str) -> Option<&'s str> {
        match self.kind {
            ObjectKind::Route => Some(service),
            ObjectKind::Ingress => None,
        }
    }
}

/// Everything a build step needs besides the graph it's mutating.
pub(crate) struct BuildContext<'a, L> {
    /// The correlation key for log lines.
    pub key: &'a str,
    pub config: &'a Config,
    pub naming: &'a Naming,
    pub lister: &'a L,
    pub caches: &'a Caches,
}

impl<L: ObjectLister> BuildContext<'_, L> {
    pub(crate) fn tenant(&self) -> &str {
        &self.config.tenant
    }

    pub(crate) fn vsvip(&self, vs_name: &str) -> VsVipNode {
        let mut vsvip = VsVipNode::new(Naming::vsvip_name(vs_name), self.tenant());
        vsvip.vrf_context = Some(self.config.vrf_name.clone());
        vsvip.service_engine_group = self.config.service_engine_group.clone();
        vsvip
    }

    pub(crate) fn base_vs(&self, vs_name: &str) -> VirtualServiceNode {
        let mut vs = VirtualServiceNode::new(vs_name, self.tenant());
        vs.vrf_context = Some(self.config.vrf_name.clone());
        vs.service_engine_group = self.config.service_engine_group.clone();
        vs.network_profile = self.config.tcp_network_profile.clone();
        vs
    }

    /// Build an empty shared parent virtual service.
    pub(crate) fn construct_shared_vs(&self, vs_name: &str, evh: bool) -> VirtualServiceNode {
        let mut vs = self.base_vs(vs_name);
        vs.shared_vs = true;
        vs.evh_parent = evh;
        vs.sni_parent = !evh;
        vs.add_port(PortProtocol::http(80));
        vs.add_port(PortProtocol::https(443));
        vs.application_profile = self.config.l7_application_profile.clone();

        // EVH parents never serve a host directly, so they don't need
        // anything to pick a pool with.
        if !evh {
            let pg_name = Naming::shared_pg_name(vs_name);
            let mut pg = PoolGroupNode::new(&pg_name, self.tenant());
            pg.implicit_priority_labels = true;
            vs.pool_groups.push(pg);

            vs.datascripts.push(HttpDataScriptNode {
                name: Naming::shared_datascript_name(vs_name),
                tenant: self.tenant().to_string(),
                event: DataScriptEvent::HttpRequest,
                script: HTTP_DATASCRIPT.replacen("POOLGROUP", &pg_name, 1),
                pool_group_refs: vec![pg_name],
                protocol_parsers: Vec::new(),
            });
        }

        let mut vsvip = self.vsvip(vs_name);
        match &self.config.default_subdomain {
            Some(subdomain) if subdomain.starts_with('.') => {
                vsvip.add_fqdn(&format!("{vs_name}.{}{subdomain}", self.tenant()));
            }
            Some(subdomain) => {
                vsvip.add_fqdn(&format!("{vs_name}.{}.{subdomain}", self.tenant()));
            }
            None => {
                tracing::debug!(key = %self.key, vs = vs_name, "no default subdomain, skipping default fqdn");
            }
        }
        vs.vsvips.push(vsvip);

        tracing::debug!(key = %self.key, vs = vs_name, evh, "constructed shared virtual service");
        vs
    }

    /// Build an empty dedicated virtual service.
    pub(crate) fn construct_dedicated_vs(&self, vs_name: &str) -> VirtualServiceNode {
        let mut vs = self.base_vs(vs_name);
        vs.dedicated = true;
        vs.add_port(PortProtocol::http(80));
        vs.application_profile = self.config.l7_application_profile.clone();
        vs.vsvips.push(self.vsvip(vs_name));

        tracing::debug!(key = %self.key, vs = vs_name, "constructed dedicated virtual service");
        vs
    }

    pub(crate) fn servers(&self, namespace: &str, service: &str) -> Vec<Server> {
        match self.lister.service_servers(namespace, service) {
            Some(servers) => servers,
            None => {
                let err = Error::ServiceNotFound {
                    namespace: namespace.to_string(),
                    name: service.to_string(),
                };
                tracing::warn!(key = %self.key, %err, "building pool with no servers");
                Vec::new()
            }
        }
    }

    fn build_pool(&self, name: String, ing: &IngressRef, host: &str, hp: &HostPath) -> PoolNode {
        let mut pool = PoolNode::new(name, self.tenant());
        pool.port = hp.port;
        pool.target_port = hp.target_port;
        pool.port_name = hp.port_name.clone();
        pool.servers = self.servers(ing.namespace, &hp.service_name);
        pool.service_metadata = ServiceMetadata::for_ingress(ing.namespace, ing.key(), host);
        pool.service_metadata.pool_ratio = Some(hp.weight);
        pool
    }

    /// Resolve the certificate for a secure host. Returns the key and
    /// certificate and, if the secret has one, the CA certificate.
    pub(crate) fn build_tls_key_cert(
        &self,
        ing: &IngressRef,
        host: &str,
        tls: &TlsSettings,
    ) -> Result<(TlsKeyCertNode, Option<TlsKeyCertNode>)> {
        let (cert, key, ca_cert) = match &tls.inline_cert {
            Some(inline) => {
                if inline.cert.is_empty() || inline.key.is_empty() {
                    return Err(Error::MissingInlineCert);
                }
                (inline.cert.clone(), inline.key.clone(), inline.ca_cert.clone())
            }
            None if tls.secret_name.is_empty() => return Err(Error::MissingInlineCert),
            None => {
                let namespace = tls.secret_namespace.as_deref().unwrap_or(ing.namespace);
                let secret = self
                    .lister
                    .secret(namespace, &tls.secret_name)
                    .ok_or_else(|| Error::SecretNotFound {
                        namespace: namespace.to_string(),
                        name: tls.secret_name.clone(),
                    })?;

                let invalid = |field| Error::InvalidSecret {
                    namespace: namespace.to_string(),
                    name: tls.secret_name.clone(),
                    field,
                };
                let cert = secret
                    .cert
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| invalid("tls.crt"))?;
                let key = secret
                    .key
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| invalid("tls.key"))?;
                (cert, key, secret.ca_cert)
            }
        };

        let name = self
            .naming
            .tls_key_cert_name(ing.infra, host, &tls.secret_name);
        let mut key_cert = TlsKeyCertNode::server(&name, self.tenant(), cert, key);

        let ca = ca_cert.filter(|c| !c.is_empty()).map(|ca| {
            let ca_name = Naming::ca_cert_name(&name);
            key_cert.ca_cert_ref = Some(ca_name.clone());
            TlsKeyCertNode::ca(ca_name, self.tenant(), ca)
        });

        Ok((key_cert, ca))
    }

    /// Build an insecure host directly onto a shared SNI parent.
    pub(crate) fn build_insecure_host(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        paths: &[HostPath],
    ) {
        let mut pools = Vec::with_capacity(paths.len());
        for hp in paths {
            let label = priority_label(host, &hp.path);
            let name = self.naming.l7_pool_name(
                ing.infra,
                &label,
                ing.namespace,
                ing.name,
                ing.service(&hp.service_name),
            );
            let mut pool = self.build_pool(name, ing, host, hp);
            pool.priority_label = Some(label);
            pools.push(pool);
        }
        self.apply_http_rules(&mut pools, ing, host, false);

        for pool in pools {
            replace_in_place(&mut vs.pools, pool);
        }
        rebuild_shared_pg(vs);

        if let Some(vsvip) = vs.vsvip_mut() {
            vsvip.add_fqdn(host);
        }

        let aliases = match self.host_rule_for_insecure_host(host) {
            Some(overlay) => {
                set_header_rewrite(self.tenant(), vs, host, overlay.gslb_fqdn.as_deref());
                overlay.aliases
            }
            None => self.caches.fqdn_aliases.get(host),
        };
        self.reconcile_aliases(vs, host, aliases);

        tracing::debug!(key = %self.key, vs = %vs.name, host, paths = paths.len(), "built insecure host");
    }

    /// Remove an insecure host's paths from a shared SNI parent.
    pub(crate) fn delete_insecure_host(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        paths: &[PathRecord],
    ) {
        for p in paths {
            let label = priority_label(host, &p.path);
            let name = self.naming.l7_pool_name(
                ing.infra,
                &label,
                ing.namespace,
                ing.name,
                ing.service(&p.service),
            );
            remove_by_name(&mut vs.pools, &name);
        }
        rebuild_shared_pg(vs);

        if !host_in_use(vs, host) {
            self.release_host(vs, host);
        }
        tracing::debug!(key = %self.key, vs = %vs.name, host, "deleted insecure host");
    }

    /// Build a host as an SNI or EVH child of a shared parent.
    ///
    /// Secure hosts whose certificate can't be built are removed from the
    /// parent and the error is returned. Insecure hosts (EVH only) never
    /// fail.
    pub(crate) fn build_vh_child(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        tls: Option<&TlsSettings>,
        paths: &[HostPath],
        evh: bool,
    ) -> Result<()> {
        let child_name = self.naming.child_vs_name(ing.infra, host);
        let ing_key = ing.key();

        let certs = match tls.map(|tls| self.build_tls_key_cert(ing, host, tls)) {
            Some(Ok(certs)) => Some(certs),
            Some(Err(err)) => {
                tracing::warn!(key = %self.key, host, %err, "failed to build certificate, removing host");
                let remaining = self.caches.hostnames.remove_secure_host(host, &ing_key);
                if remaining == 0 {
                    remove_by_name(vs.vh_children_mut(evh), &child_name);
                    remove_redirect_host(vs, host);
                    if !host_in_use(vs, host) {
                        self.release_host(vs, host);
                    }
                }
                return Err(err);
            }
            None => None,
        };

        let mut child = match find_by_name(vs.vh_children(evh), &child_name) {
            Some(child) => child.clone(),
            None => {
                tracing::debug!(key = %self.key, vs = %vs.name, child = %child_name, "adding child virtual service");
                self.construct_child(&vs.name, &child_name, host, evh)
            }
        };
        child.service_metadata.namespace = ing.namespace.to_string();
        push_unique(&mut child.service_metadata.ingress_names, &ing_key);
        child.service_metadata.hostnames = vec![host.to_string()];

        let secure = certs.is_some();
        if let Some((key_cert, ca)) = certs {
            child.secure = true;
            child.application_profile = self.config.l7_secure_application_profile.clone();
            attach_certs(&mut child, key_cert, ca);
        }
        self.build_host_paths(&mut child, ing, host, paths, tls, false);

        let aliases = match self.apply_host_rule(&mut child, host, secure) {
            Some(overlay) => {
                set_header_rewrite(self.tenant(), &mut child, host, overlay.gslb_fqdn.as_deref());
                overlay.aliases
            }
            None => self.caches.fqdn_aliases.get(host),
        };
        child.vh_domain_names = std::iter::once(host.to_string())
            .chain(aliases.iter().cloned())
            .collect();

        replace_in_place(vs.vh_children_mut(evh), child);
        if let Some(vsvip) = vs.vsvip_mut() {
            vsvip.add_fqdn(host);
        }

        remove_redirect_host(vs, host);
        if let Some(tls) = tls {
            if tls.redirect {
                add_redirect_host(self.tenant(), vs, host);
            }
            self.caches
                .hostnames
                .add_secure_host(host, &ing_key, &tls.secret_name);
        }
        self.reconcile_aliases(vs, host, aliases);

        tracing::debug!(key = %self.key, vs = %vs.name, host, secure, evh, "built child virtual service");
        Ok(())
    }

    fn construct_child(
        &self,
        parent_name: &str,
        child_name: &str,
        host: &str,
        evh: bool,
    ) -> VirtualServiceNode {
        let mut child = self.base_vs(child_name);
        child.is_evh_child = evh;
        child.is_sni_child = !evh;
        child.vh_parent_name = Some(parent_name.to_string());
        child.vh_domain_names = vec![host.to_string()];
        child.application_profile = self.config.l7_application_profile.clone();
        child
    }

    /// Remove an ingress's paths from a child. A child with no pools left is
    /// removed from its parent along with everything else the host
    /// contributed.
    pub(crate) fn delete_vh_child_paths(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        paths: &[PathRecord],
        evh: bool,
    ) {
        let child_name = self.naming.child_vs_name(ing.infra, host);
        let ing_key = ing.key();

        let children = vs.vh_children_mut(evh);
        let Some(child) = find_by_name_mut(children, &child_name) else {
            tracing::debug!(key = %self.key, child = %child_name, "no child to delete paths from");
            return;
        };
        self.remove_host_paths(child, ing, host, paths, false);
        child
            .service_metadata
            .ingress_names
            .retain(|i| i != &ing_key);

        if !child.pools.is_empty() {
            self.caches.hostnames.remove_secure_host(host, &ing_key);
            return;
        }

        remove_by_name(children, &child_name);
        self.caches.hostnames.delete_host(host);
        remove_redirect_host(vs, host);
        if !host_in_use(vs, host) {
            self.release_host(vs, host);
        }
        tracing::debug!(key = %self.key, vs = %vs.name, child = %child_name, "removed child virtual service");
    }

    /// Build a host directly onto a dedicated virtual service.
    pub(crate) fn build_dedicated_host(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        tls: Option<&TlsSettings>,
        paths: &[HostPath],
    ) -> Result<()> {
        let ing_key = ing.key();

        let certs = match tls.map(|tls| self.build_tls_key_cert(ing, host, tls)) {
            Some(Ok(certs)) => Some(certs),
            Some(Err(err)) => {
                tracing::warn!(key = %self.key, host, %err, "failed to build certificate, removing host");
                if self.caches.hostnames.remove_secure_host(host, &ing_key) == 0 {
                    clear_secure(self.config, vs);
                    remove_redirect_host(vs, host);
                }
                return Err(err);
            }
            None => None,
        };

        vs.service_metadata.namespace = ing.namespace.to_string();
        push_unique(&mut vs.service_metadata.ingress_names, &ing_key);
        vs.service_metadata.hostnames = vec![host.to_string()];

        let secure = certs.is_some();
        if let Some((key_cert, ca)) = certs {
            vs.secure = true;
            vs.add_port(PortProtocol::https(443));
            vs.application_profile = self.config.l7_secure_application_profile.clone();
            attach_certs(vs, key_cert, ca);
        }
        self.build_host_paths(vs, ing, host, paths, tls, true);

        remove_redirect_host(vs, host);
        if let Some(tls) = tls {
            if tls.redirect {
                add_redirect_host(self.tenant(), vs, host);
            }
            self.caches
                .hostnames
                .add_secure_host(host, &ing_key, &tls.secret_name);
        }

        let aliases = match self.apply_host_rule(vs, host, secure) {
            Some(overlay) => {
                set_header_rewrite(self.tenant(), vs, host, overlay.gslb_fqdn.as_deref());
                overlay.aliases
            }
            None => self.caches.fqdn_aliases.get(host),
        };
        if let Some(vsvip) = vs.vsvip_mut() {
            vsvip.add_fqdn(host);
        }
        self.reconcile_aliases(vs, host, aliases);

        tracing::debug!(key = %self.key, vs = %vs.name, host, secure, "built dedicated host");
        Ok(())
    }

    /// Remove an ingress's paths from a dedicated virtual service. When no
    /// pools are left, the virtual service is cleared back to an empty shell
    /// but not removed.
    pub(crate) fn delete_dedicated_host_paths(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        paths: &[PathRecord],
    ) {
        let ing_key = ing.key();
        self.remove_host_paths(vs, ing, host, paths, true);
        vs.service_metadata.ingress_names.retain(|i| i != &ing_key);

        if !vs.pools.is_empty() {
            self.caches.hostnames.remove_secure_host(host, &ing_key);
            return;
        }

        clear_secure(self.config, vs);
        vs.pool_groups.clear();
        vs.http_policies.clear();
        vs.overlay = Default::default();
        vs.enabled = None;
        self.caches.hostnames.delete_host(host);
        self.release_host(vs, host);

        tracing::debug!(key = %self.key, vs = %vs.name, host, "cleared dedicated virtual service");
    }

    // Build pools, pool groups and switching rules for a host's paths onto
    // a child or dedicated virtual service.
    fn build_host_paths(
        &self,
        target: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        paths: &[HostPath],
        tls: Option<&TlsSettings>,
        dedicated: bool,
    ) {
        let mut pools = Vec::with_capacity(paths.len());
        let mut pool_groups: Vec<PoolGroupNode> = Vec::new();
        let mut hpp_map: Vec<HostPathPoolPg> = Vec::new();

        for hp in paths {
            let pool_name = self.naming.child_pool_name(
                ing.infra,
                ing.namespace,
                host,
                &hp.path,
                ing.name,
                ing.service(&hp.service_name),
                dedicated,
            );
            let mut pool = self.build_pool(pool_name, ing, host, hp);
            if let Some(tls) = tls.filter(|t| t.reencrypt) {
                pool.sni_enabled = true;
                pool.ssl_profile_ref = Some(self.config.default_pool_ssl_profile.clone());
                pool.pki_profile = tls.destination_ca.as_ref().map(|ca| {
                    PkiProfileNode::new(Naming::pki_profile_name(&pool.name), self.tenant(), ca)
                });
            }

            let pg_name = self.naming.child_pg_name(
                ing.infra,
                ing.namespace,
                host,
                &hp.path,
                ing.name,
                dedicated,
            );
            let member = PoolGroupMember {
                pool_ref: pool.name.clone(),
                ratio: Some(hp.weight),
                priority_label: None,
            };
            match find_by_name_mut(&mut pool_groups, &pg_name) {
                Some(pg) => pg.upsert_member(member),
                None => {
                    let mut pg = PoolGroupNode::new(&pg_name, self.tenant());
                    pg.upsert_member(member);
                    pool_groups.push(pg);

                    let path = if hp.path.is_empty() { "/" } else { &hp.path };
                    hpp_map.push(HostPathPoolPg {
                        name: self.naming.child_hpp_map_name(
                            ing.infra,
                            ing.namespace,
                            host,
                            &hp.path,
                            ing.name,
                            dedicated,
                        ),
                        hosts: vec![host.to_string()],
                        paths: vec![path.to_string()],
                        match_criteria: match hp.path_type {
                            PathType::Exact => PathMatch::Equals,
                            PathType::Prefix => PathMatch::BeginsWith,
                        },
                        pool_group: pg_name,
                    });
                }
            }
            pools.push(pool);
        }
        self.apply_http_rules(&mut pools, ing, host, true);

        for pool in pools {
            replace_in_place(&mut target.pools, pool);
        }
        for pg in pool_groups {
            replace_in_place(&mut target.pool_groups, pg);
        }

        let policy_name =
            self.naming
                .child_http_policy_name(ing.infra, ing.namespace, host, dedicated);
        let mut policy = find_by_name(&target.http_policies, &policy_name)
            .cloned()
            .unwrap_or_else(|| HttpPolicySetNode::new(&policy_name, self.tenant()));
        for hpp in hpp_map {
            match policy.hpp_map.iter_mut().find(|e| e.name == hpp.name) {
                Some(existing) => *existing = hpp,
                None => policy.hpp_map.push(hpp),
            }
        }
        if !policy.is_empty() {
            replace_in_place(&mut target.http_policies, policy);
        }
    }

    // Remove the pools, pool group members and switching rules for a set of
    // paths. Pool groups and policies are dropped once they're empty.
    fn remove_host_paths(
        &self,
        target: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        paths: &[PathRecord],
        dedicated: bool,
    ) {
        let policy_name =
            self.naming
                .child_http_policy_name(ing.infra, ing.namespace, host, dedicated);

        for p in paths {
            let pool_name = self.naming.child_pool_name(
                ing.infra,
                ing.namespace,
                host,
                &p.path,
                ing.name,
                ing.service(&p.service),
                dedicated,
            );
            let pg_name =
                self.naming
                    .child_pg_name(ing.infra, ing.namespace, host, &p.path, ing.name, dedicated);

            remove_by_name(&mut target.pools, &pool_name);

            let Some(pg) = find_by_name_mut(&mut target.pool_groups, &pg_name) else {
                continue;
            };
            pg.remove_member(&pool_name);
            if pg.members.is_empty() {
                remove_by_name(&mut target.pool_groups, &pg_name);
                if let Some(policy) = find_by_name_mut(&mut target.http_policies, &policy_name) {
                    policy.hpp_map.retain(|hpp| hpp.pool_group != pg_name);
                }
            }
        }

        if find_by_name(&target.http_policies, &policy_name).is_some_and(|p| p.is_empty()) {
            remove_by_name(&mut target.http_policies, &policy_name);
        }
    }

    // Drop everything a host contributed to a parent's VSVIP and policies once
    // nothing serves the host anymore.
    fn release_host(&self, vs: &mut VirtualServiceNode, host: &str) {
        if let Some(vsvip) = vs.vsvip_mut() {
            vsvip.remove_fqdn(host);
        }
        set_header_rewrite(self.tenant(), vs, host, None);
        remove_redirect_host(vs, host);
        self.reconcile_aliases(vs, host, Vec::new());
    }

    /// Bring a host's FQDN aliases on a virtual service in line with
    /// `aliases`. Aliases that were applied last time but aren't in
    /// `aliases` anymore are removed from the VSVIP and redirect policy.
    /// The rest follow the host in or out of the redirect policy.
    pub(crate) fn reconcile_aliases(
        &self,
        vs: &mut VirtualServiceNode,
        host: &str,
        aliases: Vec<String>,
    ) {
        let previous = self.caches.fqdn_aliases.replace(host, aliases.clone());
        let redirect = redirects_host(vs, host);

        for stale in previous.iter().filter(|a| !aliases.contains(a)) {
            if let Some(vsvip) = vs.vsvip_mut() {
                vsvip.remove_fqdn(stale);
            }
            remove_redirect_host(vs, stale);
            tracing::debug!(key = %self.key, host, alias = %stale, "removed fqdn alias");
        }

        for alias in &aliases {
            if let Some(vsvip) = vs.vsvip_mut() {
                vsvip.add_fqdn(alias);
            }
            if redirect {
                add_redirect_host(self.tenant(), vs, alias);
            } else {
                remove_redirect_host(vs, alias);
            }
        }
    }
}

fn priority_label(host: &str, path: &str) -> String {
    format!("{host}{path}")
}

// The shared pool group picks a pool by priority label, so it has one member
// for every pool on the parent.
fn rebuild_shared_pg(vs: &mut VirtualServiceNode) {
    let pg_name = Naming::shared_pg_name(&vs.name);
    let members: Vec<_> = vs
        .pools
        .iter()
        .map(|pool| PoolGroupMember {
            pool_ref: pool.name.clone(),
            ratio: pool.service_metadata.pool_ratio,
            priority_label: pool.priority_label.clone(),
        })
        .collect();

    if let Some(pg) = find_by_name_mut(&mut vs.pool_groups, &pg_name) {
        pg.members = members;
    }
}

fn attach_certs(vs: &mut VirtualServiceNode, key_cert: TlsKeyCertNode, ca: Option<TlsKeyCertNode>) {
    vs.ssl_key_certs.retain(|c| c.name == key_cert.name);
    replace_in_place(&mut vs.ssl_key_certs, key_cert);
    match ca {
        Some(ca) => {
            vs.ca_certs.retain(|c| c.name == ca.name);
            replace_in_place(&mut vs.ca_certs, ca);
        }
        None => vs.ca_certs.clear(),
    }
}

fn clear_secure(config: &Config, vs: &mut VirtualServiceNode) {
    vs.ssl_key_certs.clear();
    vs.ca_certs.clear();
    vs.secure = false;
    vs.port_proto.retain(|p| !p.enable_ssl);
    vs.application_profile = config.l7_application_profile.clone();
}

// Returns true if anything on a parent still serves a host: a pool with the
// host's priority label, or a child for the host.
fn host_in_use(vs: &VirtualServiceNode, host: &str) -> bool {
    let host_path = format!("{host}/");
    let has_pool = vs.pools.iter().any(|p| match &p.priority_label {
        Some(label) => label == host || label.starts_with(&host_path),
        None => false,
    });
    let has_child = vs
        .sni_children
        .iter()
        .chain(&vs.evh_children)
        .any(|c| c.vh_domain_names.first().is_some_and(|h| h == host));

    has_pool || has_child
}

pub(crate) fn redirects_host(vs: &VirtualServiceNode, host: &str) -> bool {
    let name = Naming::redirect_policy_name(&vs.name);
    find_by_name(&vs.http_policies, &name)
        .is_some_and(|p| p.redirect_ports.iter().any(|r| r.hosts.iter().any(|h| h == host)))
}

/// Add a host to a virtual service's HTTP to HTTPS redirect.
pub(crate) fn add_redirect_host(tenant: &str, vs: &mut VirtualServiceNode, host: &str) {
    let name = Naming::redirect_policy_name(&vs.name);
    match find_by_name_mut(&mut vs.http_policies, &name) {
        Some(policy) => {
            policy.add_redirect_host(host);
        }
        None => {
            let mut policy = HttpPolicySetNode::new(name, tenant);
            policy.add_redirect_host(host);
            vs.http_policies.push(policy);
        }
    }
}

/// Remove a host from a virtual service's redirect, dropping the redirect
/// policy when no hosts are left.
pub(crate) fn remove_redirect_host(vs: &mut VirtualServiceNode, host: &str) {
    let name = Naming::redirect_policy_name(&vs.name);
    let Some(policy) = find_by_name_mut(&mut vs.http_policies, &name) else {
        return;
    };
    policy.remove_redirect_host(host);
    if policy.is_empty() {
        remove_by_name(&mut vs.http_policies, &name);
    }
}

// Rewrite requests for a global FQDN to a host, or remove the rewrite.
fn set_header_rewrite(
    tenant: &str,
    vs: &mut VirtualServiceNode,
    host: &str,
    gslb_fqdn: Option<&str>,
) {
    let name = Naming::header_rewrite_policy_name(&vs.name, host);
    match gslb_fqdn {
        Some(gslb_fqdn) => {
            let mut policy = HttpPolicySetNode::new(name, tenant);
            policy.header_rewrite = Some(HeaderRewrite {
                source_host: gslb_fqdn.to_string(),
                target_host: host.to_string(),
            });
            replace_in_place(&mut vs.http_policies, policy);
        }
        None => {
            remove_by_name(&mut vs.http_policies, &name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nodes::Checksum;
    use crate::StaticObjects;
    use lbgraph_api::{HostRule, InlineCert, TlsSecret};

    struct Fixture {
        config: Config,
        naming: Naming,
        objects: StaticObjects,
        caches: Caches,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config::new("c1");
            let naming = Naming::new(&config);
            let objects = StaticObjects::default()
                .with_service(
                    "default",
                    "svc1",
                    vec![Server::new("10.1.1.1", 8080), Server::new("10.1.1.2", 8080)],
                )
                .with_secret("default", "bar-secret", TlsSecret::new("CERT", "KEY"));
            Self {
                config,
                naming,
                objects,
                caches: Caches::default(),
            }
        }

        fn ctx(&self) -> BuildContext<'_, StaticObjects> {
            BuildContext {
                key: "test",
                config: &self.config,
                naming: &self.naming,
                lister: &self.objects,
                caches: &self.caches,
            }
        }
    }

    fn ingress() -> IngressRef<'static> {
        IngressRef {
            namespace: "default",
            name: "ing",
            kind: ObjectKind::Ingress,
            infra: None,
        }
    }

    fn tls(secret: &str, redirect: bool) -> TlsSettings {
        TlsSettings {
            secret_name: secret.to_string(),
            redirect,
            ..Default::default()
        }
    }

    fn path_records(paths: &[&str]) -> Vec<PathRecord> {
        paths
            .iter()
            .map(|p| PathRecord {
                path: p.to_string(),
                service: "svc1".to_string(),
            })
            .collect()
    }

    fn fqdns(vs: &VirtualServiceNode) -> Vec<String> {
        let mut fqdns = vs.vsvip().unwrap().fqdns.clone();
        fqdns.sort();
        fqdns
    }

    #[test]
    fn test_construct_shared_vs() {
        let mut f = Fixture::new();
        f.config.default_subdomain = Some("avi.internal".to_string());
        let vs = f.ctx().construct_shared_vs("c1--Shared-L7-0", false);

        assert!(vs.shared_vs && vs.sni_parent && !vs.evh_parent);
        assert_eq!(
            vs.port_proto,
            vec![PortProtocol::http(80), PortProtocol::https(443)]
        );
        assert_eq!(vs.application_profile, "System-HTTP");
        assert_eq!(vs.network_profile, "System-TCP-Proxy");
        assert_eq!(vs.pool_groups[0].name, "c1--Shared-L7-0");
        assert!(vs.pool_groups[0].implicit_priority_labels);
        assert_eq!(vs.datascripts[0].pool_group_refs, ["c1--Shared-L7-0"]);
        assert!(vs.datascripts[0]
            .script
            .contains(r#"avi.poolgroup.select("c1--Shared-L7-0""#));
        assert_eq!(
            vs.vsvip().unwrap().fqdns,
            ["c1--Shared-L7-0.admin.avi.internal"]
        );

        let evh = f.ctx().construct_shared_vs("c1--Shared-L7-EVH-0", true);
        assert!(evh.evh_parent && !evh.sni_parent);
        assert!(evh.pool_groups.is_empty());
        assert!(evh.datascripts.is_empty());
    }

    #[test]
    fn test_insecure_host() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let mut vs = ctx.construct_shared_vs("c1--Shared-L7-0", false);

        let paths = [HostPath::new("/", "svc1", 80)];
        ctx.build_insecure_host(&mut vs, &ingress(), "foo.example.com", &paths);

        assert_eq!(vs.pools.len(), 1);
        assert_eq!(vs.pools[0].name, "c1--foo.example.com_-default-ing");
        assert_eq!(vs.pools[0].servers.len(), 2);
        assert_eq!(
            vs.pool_groups[0].members,
            vec![PoolGroupMember {
                pool_ref: "c1--foo.example.com_-default-ing".to_string(),
                ratio: Some(100),
                priority_label: Some("foo.example.com/".to_string()),
            }]
        );
        assert_eq!(fqdns(&vs), ["foo.example.com"]);

        // rebuilding is a no-op
        let before = vs.checksum();
        ctx.build_insecure_host(&mut vs, &ingress(), "foo.example.com", &paths);
        assert_eq!(vs.checksum(), before);

        ctx.delete_insecure_host(&mut vs, &ingress(), "foo.example.com", &path_records(&["/"]));
        assert!(vs.pools.is_empty());
        assert!(vs.pool_groups[0].members.is_empty());
        assert!(fqdns(&vs).is_empty());
    }

    #[test]
    fn test_secure_child_hierarchy() {
        let mut f = Fixture::new();
        f.objects
            .set_secret("default", "foo-secret", TlsSecret::new("FOO", "FOOKEY"));
        let ctx = f.ctx();
        let mut vs = ctx.construct_shared_vs("c1--Shared-L7-0", false);
        let paths = [HostPath::new("/", "svc1", 80)];

        ctx.build_vh_child(&mut vs, &ingress(), "foo.com", Some(&tls("foo-secret", true)), &paths, false)
            .unwrap();
        ctx.build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", false)), &paths, false)
            .unwrap();

        assert_eq!(vs.sni_children.len(), 2);
        assert_eq!(fqdns(&vs), ["bar.com", "foo.com"]);
        assert!(redirects_host(&vs, "foo.com"));
        assert!(!redirects_host(&vs, "bar.com"));

        let child = &vs.sni_children[1];
        assert_eq!(child.name, "c1--bar.com");
        assert!(child.is_sni_child && child.secure);
        assert_eq!(child.vh_parent_name.as_deref(), Some("c1--Shared-L7-0"));
        assert_eq!(child.vh_domain_names, ["bar.com"]);
        assert_eq!(child.application_profile, "System-Secure-HTTP");
        assert_eq!(child.ssl_key_certs.len(), 1);
        assert_eq!(child.ssl_key_certs[0].name, "c1--bar.com");
        assert_eq!(child.pools[0].name, "c1--default-bar.com_-ing");
        assert_eq!(child.pool_groups[0].members.len(), 1);
        assert_eq!(child.http_policies[0].name, "c1--default-bar.com");
        assert_eq!(child.http_policies[0].hpp_map[0].paths, ["/"]);
        assert_eq!(f.caches.hostnames.secure_ingresses("bar.com"), ["default/ing"]);

        // removing foo.com leaves exactly bar.com
        ctx.delete_vh_child_paths(&mut vs, &ingress(), "foo.com", &path_records(&["/"]), false);
        assert_eq!(vs.sni_children.len(), 1);
        assert_eq!(fqdns(&vs), ["bar.com"]);
        assert!(!redirects_host(&vs, "foo.com"));
        assert!(vs.http_policies.is_empty());
        assert!(!f.caches.hostnames.contains("foo.com"));
    }

    #[test]
    fn test_child_shared_by_two_ingresses() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let mut vs = ctx.construct_shared_vs("c1--Shared-L7-0", false);
        let other = IngressRef {
            name: "other",
            ..ingress()
        };

        ctx.build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", false)), &[HostPath::new("/a", "svc1", 80)], false)
            .unwrap();
        ctx.build_vh_child(&mut vs, &other, "bar.com", Some(&tls("bar-secret", false)), &[HostPath::new("/b", "svc1", 80)], false)
            .unwrap();

        let child = &vs.sni_children[0];
        assert_eq!(vs.sni_children.len(), 1);
        assert_eq!(child.pools.len(), 2);
        assert_eq!(child.http_policies[0].hpp_map.len(), 2);
        assert_eq!(child.service_metadata.ingress_names, ["default/ing", "default/other"]);

        ctx.delete_vh_child_paths(&mut vs, &ingress(), "bar.com", &path_records(&["/a"]), false);
        let child = &vs.sni_children[0];
        assert_eq!(child.pools.len(), 1);
        assert_eq!(child.pools[0].name, "c1--default-bar.com_b-other");
        assert_eq!(child.http_policies[0].hpp_map.len(), 1);
        assert_eq!(fqdns(&vs), ["bar.com"]);
        assert_eq!(f.caches.hostnames.secure_ingresses("bar.com"), ["default/other"]);
    }

    #[test]
    fn test_missing_secret_removes_child() {
        let mut f = Fixture::new();
        let paths = [HostPath::new("/", "svc1", 80)];
        let mut vs = f.ctx().construct_shared_vs("c1--Shared-L7-0", false);

        f.ctx()
            .build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", true)), &paths, false)
            .unwrap();
        assert_eq!(vs.sni_children.len(), 1);

        f.objects.remove_secret("default", "bar-secret");
        let err = f
            .ctx()
            .build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", true)), &paths, false)
            .unwrap_err();
        assert!(err.is_missing_dependency());
        assert!(vs.sni_children.is_empty());
        assert!(fqdns(&vs).is_empty());
        assert!(!redirects_host(&vs, "bar.com"));
        assert!(!f.caches.hostnames.contains("bar.com"));
    }

    #[test]
    fn test_invalid_secret() {
        let mut f = Fixture::new();
        f.objects.set_secret(
            "default",
            "no-key",
            TlsSecret {
                cert: Some("CERT".to_string()),
                ..Default::default()
            },
        );

        let err = f
            .ctx()
            .build_tls_key_cert(&ingress(), "bar.com", &tls("no-key", false))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSecret { field: "tls.key", .. }));

        let err = f
            .ctx()
            .build_tls_key_cert(&ingress(), "bar.com", &tls("", false))
            .unwrap_err();
        assert!(matches!(err, Error::MissingInlineCert));
    }

    #[test]
    fn test_inline_cert_with_ca() {
        let f = Fixture::new();
        let tls = TlsSettings {
            inline_cert: Some(InlineCert {
                cert: "CERT".to_string(),
                key: "KEY".to_string(),
                ca_cert: Some("CA".to_string()),
            }),
            ..Default::default()
        };
        let route = IngressRef {
            kind: ObjectKind::Route,
            ..ingress()
        };

        let (key_cert, ca) = f.ctx().build_tls_key_cert(&route, "bar.com", &tls).unwrap();
        let ca = ca.unwrap();
        assert_eq!(key_cert.name, "c1--bar.com");
        assert_eq!(ca.name, "c1--bar.com-cacert");
        assert_eq!(key_cert.ca_cert_ref.as_deref(), Some("c1--bar.com-cacert"));
    }

    #[test]
    fn test_reencrypt_pools() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let mut vs = ctx.construct_shared_vs("c1--Shared-L7-0", false);
        let tls = TlsSettings {
            reencrypt: true,
            destination_ca: Some("DEST-CA".to_string()),
            ..tls("bar-secret", false)
        };

        ctx.build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls), &[HostPath::new("/", "svc1", 80)], false)
            .unwrap();

        let pool = &vs.sni_children[0].pools[0];
        assert!(pool.sni_enabled);
        assert_eq!(pool.ssl_profile_ref.as_deref(), Some("System-Standard"));
        let pki = pool.pki_profile.as_ref().unwrap();
        assert_eq!(pki.name, "c1--default-bar.com_-ing-pkiprofile");
        assert_eq!(pki.ca_certs, ["DEST-CA"]);
    }

    #[test]
    fn test_evh_insecure_child() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let mut vs = ctx.construct_shared_vs("c1--Shared-L7-EVH-0", true);

        ctx.build_vh_child(&mut vs, &ingress(), "foo.com", None, &[HostPath::new("/", "svc1", 80)], true)
            .unwrap();

        assert!(vs.sni_children.is_empty());
        let child = &vs.evh_children[0];
        assert!(child.is_evh_child && !child.secure);
        assert!(child.ssl_key_certs.is_empty());
        assert_eq!(fqdns(&vs), ["foo.com"]);
    }

    #[test]
    fn test_dedicated_host() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let mut vs = ctx.construct_dedicated_vs("c1--bar.com-dedicated");
        let paths = [HostPath::new("/", "svc1", 80)];

        ctx.build_dedicated_host(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", true)), &paths)
            .unwrap();

        assert!(vs.dedicated && vs.secure);
        assert!(vs.sni_children.is_empty());
        assert!(vs.port_proto.contains(&PortProtocol::https(443)));
        assert_eq!(vs.application_profile, "System-Secure-HTTP");
        assert_eq!(vs.pools[0].name, "c1--default-bar.com_-ing-dedicated");
        assert_eq!(vs.ssl_key_certs[0].name, "c1--bar.com");
        assert!(redirects_host(&vs, "bar.com"));
        assert_eq!(fqdns(&vs), ["bar.com"]);

        ctx.delete_dedicated_host_paths(&mut vs, &ingress(), "bar.com", &path_records(&["/"]));
        assert!(vs.pools.is_empty());
        assert!(vs.ssl_key_certs.is_empty());
        assert!(vs.pool_groups.is_empty());
        assert!(vs.http_policies.is_empty());
        assert!(!vs.secure);
        assert_eq!(vs.port_proto, vec![PortProtocol::http(80)]);
        assert!(fqdns(&vs).is_empty());
    }

    #[test]
    fn test_fqdn_aliases() {
        let mut f = Fixture::new();
        f.objects.set_host_rule(HostRule {
            namespace: "default".to_string(),
            name: "hr".to_string(),
            fqdn: "bar.com".to_string(),
            fqdn_aliases: vec!["alias1.com".to_string(), "alias2.com".to_string()],
            ..Default::default()
        });
        let paths = [HostPath::new("/", "svc1", 80)];
        let mut vs = f.ctx().construct_shared_vs("c1--Shared-L7-0", false);

        f.ctx()
            .build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", true)), &paths, false)
            .unwrap();
        assert_eq!(fqdns(&vs), ["alias1.com", "alias2.com", "bar.com"]);
        assert_eq!(
            vs.sni_children[0].vh_domain_names,
            ["bar.com", "alias1.com", "alias2.com"]
        );
        assert!(redirects_host(&vs, "alias1.com"));

        // dropping an alias removes it everywhere
        f.objects.set_host_rule(HostRule {
            namespace: "default".to_string(),
            name: "hr".to_string(),
            fqdn: "bar.com".to_string(),
            fqdn_aliases: vec!["alias2.com".to_string()],
            ..Default::default()
        });
        f.ctx()
            .build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", true)), &paths, false)
            .unwrap();
        assert_eq!(fqdns(&vs), ["alias2.com", "bar.com"]);
        assert!(!redirects_host(&vs, "alias1.com"));
        assert_eq!(f.caches.fqdn_aliases.get("bar.com"), ["alias2.com"]);

        // turning the redirect off takes the aliases out of it too
        f.ctx()
            .build_vh_child(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", false)), &paths, false)
            .unwrap();
        assert!(!redirects_host(&vs, "bar.com"));
        assert!(!redirects_host(&vs, "alias2.com"));
        assert_eq!(fqdns(&vs), ["alias2.com", "bar.com"]);
        assert!(find_by_name(&vs.http_policies, &Naming::redirect_policy_name(&vs.name)).is_none());
    }

    #[test]
    fn test_dedicated_redirect_off_removes_aliases() {
        let mut f = Fixture::new();
        f.objects.set_host_rule(HostRule {
            namespace: "default".to_string(),
            name: "hr".to_string(),
            fqdn: "bar.com".to_string(),
            fqdn_aliases: vec!["alias1.com".to_string()],
            ..Default::default()
        });
        let paths = [HostPath::new("/", "svc1", 80)];
        let mut vs = f.ctx().construct_dedicated_vs("c1--bar.com-dedicated");

        f.ctx()
            .build_dedicated_host(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", true)), &paths)
            .unwrap();
        assert!(redirects_host(&vs, "bar.com"));
        assert!(redirects_host(&vs, "alias1.com"));

        f.ctx()
            .build_dedicated_host(&mut vs, &ingress(), "bar.com", Some(&tls("bar-secret", false)), &paths)
            .unwrap();
        assert!(!redirects_host(&vs, "bar.com"));
        assert!(!redirects_host(&vs, "alias1.com"));
        assert_eq!(fqdns(&vs), ["alias1.com", "bar.com"]);
    }

    #[test]
    fn test_gslb_header_rewrite() {
        let mut f = Fixture::new();
        f.objects.set_host_rule(HostRule {
            namespace: "default".to_string(),
            name: "hr".to_string(),
            fqdn: "foo.com".to_string(),
            gslb_fqdn: Some("foo.global.com".to_string()),
            ..Default::default()
        });
        let mut vs = f.ctx().construct_shared_vs("c1--Shared-L7-0", false);

        f.ctx()
            .build_insecure_host(&mut vs, &ingress(), "foo.com", &[HostPath::new("/", "svc1", 80)]);

        let policy = find_by_name(
            &vs.http_policies,
            "c1--Shared-L7-0--host-hdr-re-write--foo.com",
        )
        .unwrap();
        assert_eq!(
            policy.header_rewrite,
            Some(HeaderRewrite {
                source_host: "foo.global.com".to_string(),
                target_host: "foo.com".to_string(),
            })
        );

        f.objects.remove_host_rule("foo.com");
        f.ctx()
            .build_insecure_host(&mut vs, &ingress(), "foo.com", &[HostPath::new("/", "svc1", 80)]);
        assert!(vs.http_policies.is_empty());
    }
}
