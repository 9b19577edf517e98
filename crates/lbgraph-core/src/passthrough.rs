// TLS passthrough hosts.
//
// A passthrough virtual service never terminates TLS. It listens on 443,
// reads the SNI out of the client hello with an L4 datascript, and picks the
// pool group named after the host. Every host on the virtual service gets one
// pool group with a pool per backend service, and the datascript lists every
// pool group it's allowed to pick.
//
// Hosts that want plain HTTP redirected to HTTPS share a single insecure child
// listening on 80 whose only job is carrying the redirect policy. The child
// exists exactly as long as at least one host wants a redirect.

use lbgraph_api::HostPath;

use crate::hierarchy::{add_redirect_host, remove_redirect_host, BuildContext, IngressRef};
use crate::naming::Naming;
use crate::nodes::{
    find_by_name, find_by_name_mut, push_unique, remove_by_name, replace_in_place,
    DataScriptEvent, HttpDataScriptNode, PoolGroupMember, PoolGroupNode, PoolNode, PortProtocol,
    ServiceMetadata, VirtualServiceNode, VsVipNode,
};
use crate::ObjectLister;

const L4_DATASCRIPT: &str = r#"local avi_tls = require "Default-TLS"
buffered = avi.l4.collect(20)
payload = avi.l4.read()
len = avi_tls.get_req_buffer_size(payload)
if ( buffered < len ) then
  avi.l4.collect(len)
end
if ( avi_tls.sanity_check(payload) ) then
   local h = avi_tls.parse_record(payload)
   local sname = avi_tls.get_sni(h)
   if sname == nil then
      avi.vs.log('SNI not present')
      avi.vs.close_conn()
   else
      avi.vs.log("SNI=".. sname)
      pg_name = "PGPREFIX"..sname
      avi.poolgroup.select(pg_name)
   end
else
   avi.vs.close_conn()
end
avi.l4.ds_done()
avi_tls = nil"#;

const TLS_PROTOCOL_PARSER: &str = "Default-TLS";

impl<L: ObjectLister> BuildContext<'_, L> {
    /// Build an empty passthrough virtual service.
    pub(crate) fn construct_passthrough_vs(
        &self,
        vs_name: &str,
        infra: Option<&str>,
    ) -> VirtualServiceNode {
        let mut vs = VirtualServiceNode::new(vs_name, self.tenant());
        vs.shared_vs = true;
        vs.vrf_context = Some(self.config.vrf_name.clone());
        vs.service_engine_group = self.config.service_engine_group.clone();
        vs.add_port(PortProtocol::tcp(443));
        vs.application_profile = self.config.l4_application_profile.clone();
        vs.network_profile = self.config.tcp_network_profile.clone();

        // the script picks a pool group by name, so it has to build names the
        // same way passthrough_pg_name does.
        vs.datascripts.push(HttpDataScriptNode {
            name: Naming::shared_datascript_name(vs_name),
            tenant: self.tenant().to_string(),
            event: DataScriptEvent::L4Request,
            script: L4_DATASCRIPT.replacen("PGPREFIX", &self.naming.scoped(infra), 1),
            pool_group_refs: Vec::new(),
            protocol_parsers: vec![TLS_PROTOCOL_PARSER.to_string()],
        });

        let mut vsvip = VsVipNode::new(Naming::vsvip_name(vs_name), self.tenant());
        vsvip.vrf_context = Some(self.config.vrf_name.clone());
        vsvip.service_engine_group = self.config.service_engine_group.clone();
        vs.vsvips.push(vsvip);

        tracing::debug!(key = %self.key, vs = vs_name, "constructed passthrough virtual service");
        vs
    }

    /// Build or rebuild a passthrough host. Pools for backends that are no
    /// longer listed are removed.
    pub(crate) fn build_passthrough_host(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
        backends: &[HostPath],
        redirect: bool,
    ) {
        let pg_name = self.naming.passthrough_pg_name(ing.infra, host);
        let ing_key = ing.key();

        if let Some(old) = find_by_name(&vs.pool_groups, &pg_name) {
            let stale: Vec<_> = old.members.iter().map(|m| m.pool_ref.clone()).collect();
            for pool in stale {
                remove_by_name(&mut vs.pools, &pool);
            }
        }

        let mut pg = PoolGroupNode::new(&pg_name, self.tenant());
        for backend in backends {
            let name = self
                .naming
                .passthrough_pool_name(ing.infra, host, &backend.service_name);
            let mut pool = PoolNode::new(&name, self.tenant());
            pool.port = backend.port;
            pool.target_port = backend.target_port;
            pool.port_name = backend.port_name.clone();
            pool.servers = self.servers(ing.namespace, &backend.service_name);
            pool.service_metadata = ServiceMetadata::for_ingress(ing.namespace, ing_key.clone(), host);
            pool.service_metadata.pool_ratio = Some(backend.weight);

            pg.upsert_member(PoolGroupMember {
                pool_ref: name,
                ratio: Some(backend.weight),
                priority_label: None,
            });
            replace_in_place(&mut vs.pools, pool);
        }
        replace_in_place(&mut vs.pool_groups, pg);

        if let Some(ds) = vs.datascripts.first_mut() {
            push_unique(&mut ds.pool_group_refs, &pg_name);
        }
        if let Some(vsvip) = vs.vsvip_mut() {
            vsvip.add_fqdn(host);
        }

        if redirect {
            let child = self.passthrough_insecure_child(vs);
            add_redirect_host(self.tenant(), child, host);
        } else {
            self.remove_passthrough_redirect(vs, host);
        }

        tracing::debug!(
            key = %self.key,
            vs = %vs.name,
            host,
            backends = backends.len(),
            redirect,
            "built passthrough host"
        );
    }

    /// Remove everything a passthrough host contributed to a virtual
    /// service.
    pub(crate) fn delete_passthrough_host(
        &self,
        vs: &mut VirtualServiceNode,
        ing: &IngressRef,
        host: &str,
    ) {
        let pg_name = self.naming.passthrough_pg_name(ing.infra, host);
        let Some(pg) = remove_by_name(&mut vs.pool_groups, &pg_name) else {
            tracing::debug!(key = %self.key, vs = %vs.name, host, "no passthrough pool group to delete");
            return;
        };
        for member in &pg.members {
            remove_by_name(&mut vs.pools, &member.pool_ref);
        }

        if let Some(ds) = vs.datascripts.first_mut() {
            ds.pool_group_refs.retain(|r| r != &pg_name);
        }
        if let Some(vsvip) = vs.vsvip_mut() {
            vsvip.remove_fqdn(host);
        }
        self.remove_passthrough_redirect(vs, host);

        tracing::debug!(key = %self.key, vs = %vs.name, host, "deleted passthrough host");
    }

    fn passthrough_insecure_child<'v>(
        &self,
        vs: &'v mut VirtualServiceNode,
    ) -> &'v mut VirtualServiceNode {
        let child_name = Naming::passthrough_insecure_vs_name(&vs.name);
        let existing = vs
            .passthrough_children
            .iter()
            .position(|c| c.name == child_name);

        let idx = match existing {
            Some(idx) => idx,
            None => {
                let mut child = VirtualServiceNode::new(&child_name, self.tenant());
                child.vrf_context = Some(self.config.vrf_name.clone());
                child.service_engine_group = self.config.service_engine_group.clone();
                child.application_profile = self.config.l7_application_profile.clone();
                child.network_profile = self.config.tcp_network_profile.clone();
                child.add_port(PortProtocol::http(80));
                child.vh_parent_name = Some(vs.name.clone());
                vs.passthrough_children.push(child);

                tracing::debug!(key = %self.key, vs = %vs.name, child = %child_name, "added passthrough insecure child");
                vs.passthrough_children.len() - 1
            }
        };
        &mut vs.passthrough_children[idx]
    }

    fn remove_passthrough_redirect(&self, vs: &mut VirtualServiceNode, host: &str) {
        let child_name = Naming::passthrough_insecure_vs_name(&vs.name);
        let Some(child) = find_by_name_mut(&mut vs.passthrough_children, &child_name) else {
            return;
        };
        remove_redirect_host(child, host);

        if child.http_policies.is_empty() {
            remove_by_name(&mut vs.passthrough_children, &child_name);
            tracing::debug!(key = %self.key, vs = %vs.name, child = %child_name, "removed passthrough insecure child");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Caches;
    use crate::hierarchy::redirects_host;
    use crate::nodes::Checksum;
    use crate::StaticObjects;
    use lbgraph_api::{Config, ObjectKind, Server};

    const VS: &str = "c1--Shared-Passthrough-0";

    fn with_ctx<F>(f: F)
    where
        F: FnOnce(&BuildContext<'_, StaticObjects>),
    {
        let config = Config::new("c1");
        let naming = Naming::new(&config);
        let caches = Caches::default();
        let objects = StaticObjects::default()
            .with_service("default", "svc1", vec![Server::new("10.1.1.1", 8443)])
            .with_service("default", "svc2", vec![Server::new("10.1.1.2", 8443)]);
        let ctx = BuildContext {
            key: "test",
            config: &config,
            naming: &naming,
            lister: &objects,
            caches: &caches,
        };
        f(&ctx)
    }

    fn route() -> IngressRef<'static> {
        IngressRef {
            namespace: "default",
            name: "route",
            kind: ObjectKind::Route,
            infra: None,
        }
    }

    fn pool_names(vs: &VirtualServiceNode) -> Vec<&str> {
        let mut names: Vec<_> = vs.pools.iter().map(|p| p.name.as_str()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_construct_passthrough_vs() {
        with_ctx(|ctx| {
            let vs = ctx.construct_passthrough_vs(VS, None);
            assert!(vs.shared_vs);
            assert_eq!(vs.port_proto, vec![PortProtocol::tcp(443)]);
            assert_eq!(vs.application_profile, "System-L4-Application");

            let ds = &vs.datascripts[0];
            assert_eq!(ds.event, DataScriptEvent::L4Request);
            assert_eq!(ds.protocol_parsers, ["Default-TLS"]);
            assert!(ds.script.contains(r#"pg_name = "c1--"..sname"#));
            assert_eq!(vs.vsvip().unwrap().name, VS);
        });
    }

    #[test]
    fn test_passthrough_hosts() {
        with_ctx(|ctx| {
            let mut vs = ctx.construct_passthrough_vs(VS, None);
            ctx.build_passthrough_host(
                &mut vs,
                &route(),
                "foo.com",
                &[HostPath::new("", "svc1", 443), HostPath::new("", "svc2", 443)],
                false,
            );
            ctx.build_passthrough_host(
                &mut vs,
                &route(),
                "bar.com",
                &[HostPath::new("", "svc1", 443)],
                false,
            );

            assert_eq!(
                pool_names(&vs),
                ["c1--bar.com-svc1", "c1--foo.com-svc1", "c1--foo.com-svc2"]
            );
            assert_eq!(vs.datascripts[0].pool_group_refs, ["c1--foo.com", "c1--bar.com"]);
            assert_eq!(vs.vsvip().unwrap().fqdns, ["foo.com", "bar.com"]);
            assert!(vs.passthrough_children.is_empty());

            // dropping a backend drops its pool
            let before = vs.checksum();
            ctx.build_passthrough_host(
                &mut vs,
                &route(),
                "foo.com",
                &[HostPath::new("", "svc2", 443)],
                false,
            );
            assert_ne!(vs.checksum(), before);
            assert_eq!(pool_names(&vs), ["c1--bar.com-svc1", "c1--foo.com-svc2"]);

            ctx.delete_passthrough_host(&mut vs, &route(), "foo.com");
            assert_eq!(pool_names(&vs), ["c1--bar.com-svc1"]);
            assert_eq!(vs.pool_groups.len(), 1);
            assert_eq!(vs.datascripts[0].pool_group_refs, ["c1--bar.com"]);
            assert_eq!(vs.vsvip().unwrap().fqdns, ["bar.com"]);
        });
    }

    #[test]
    fn test_passthrough_redirect_child() {
        with_ctx(|ctx| {
            let mut vs = ctx.construct_passthrough_vs(VS, None);
            let backends = [HostPath::new("", "svc1", 443)];

            ctx.build_passthrough_host(&mut vs, &route(), "foo.com", &backends, true);
            ctx.build_passthrough_host(&mut vs, &route(), "bar.com", &backends, true);

            assert_eq!(vs.passthrough_children.len(), 1);
            let child = &vs.passthrough_children[0];
            assert_eq!(child.name, "c1--Shared-Passthrough-0-insecure");
            assert_eq!(child.port_proto, vec![PortProtocol::http(80)]);
            assert!(redirects_host(child, "foo.com"));
            assert!(redirects_host(child, "bar.com"));

            // turning off the redirect for one host keeps the child
            ctx.build_passthrough_host(&mut vs, &route(), "foo.com", &backends, false);
            assert_eq!(vs.passthrough_children.len(), 1);
            assert!(!redirects_host(&vs.passthrough_children[0], "foo.com"));

            ctx.delete_passthrough_host(&mut vs, &route(), "bar.com");
            assert!(vs.passthrough_children.is_empty());
        });
    }
}
