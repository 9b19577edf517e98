// Layer 4 virtual services for LoadBalancer services.
//
// Every LoadBalancer service gets a virtual service of its own, in a model of
// its own, listening on each of the service's ports. Each port gets a pool of
// the endpoints behind it, and a single L4 policy on the virtual service maps
// every listener port to its pool.
//
// There's nothing shared between services, so an update rebuilds the whole
// virtual service from the service and lets the publish gate decide whether
// anything actually changed.

use lbgraph_api::{L4Protocol, L4Service, Server, ServicePort};

use crate::hierarchy::BuildContext;
use crate::nodes::{
    L4PolicyNode, PoolNode, PortPool, PortProtocol, ServiceMetadata, VirtualServiceNode,
};
use crate::ObjectLister;

impl<L: ObjectLister> BuildContext<'_, L> {
    /// Build the virtual service for a LoadBalancer service.
    pub(crate) fn build_l4_vs(&self, svc: &L4Service) -> VirtualServiceNode {
        let vs_name = self.naming.l4_vs_name(&svc.namespace, &svc.name);
        let metadata = ServiceMetadata {
            namespace: svc.namespace.clone(),
            hostnames: svc.fqdns.clone(),
            services: vec![svc.key()],
            ..Default::default()
        };

        let mut vs = self.base_vs(&vs_name);
        vs.application_profile = svc
            .application_profile
            .clone()
            .unwrap_or_else(|| self.config.l4_application_profile.clone());
        if !svc.ports.iter().any(|p| p.protocol == L4Protocol::Tcp) {
            vs.network_profile = self.config.udp_network_profile.clone();
        }
        vs.service_metadata = metadata.clone();

        let mut vsvip = self.vsvip(&vs_name);
        for fqdn in &svc.fqdns {
            vsvip.add_fqdn(fqdn);
        }
        vsvip.ip_address = svc.load_balancer_ip.clone();
        vs.vsvips.push(vsvip);

        let servers = self.servers(&svc.namespace, &svc.name);
        let mut policy = L4PolicyNode::new(&vs_name, self.tenant());
        for port in &svc.ports {
            vs.add_port(match port.protocol {
                L4Protocol::Tcp => PortProtocol::tcp(port.port),
                L4Protocol::Udp => PortProtocol::udp(port.port),
            });

            let name = self.naming.l4_pool_name(
                &svc.namespace,
                &svc.name,
                port.protocol.as_str(),
                port.port,
            );
            let mut pool = PoolNode::new(name, self.tenant());
            pool.port = port.port;
            pool.target_port = port.target_port;
            pool.port_name = (!port.name.is_empty()).then(|| port.name.clone());
            pool.servers = port_servers(svc, port, &servers);
            pool.service_metadata = metadata.clone();

            policy.port_pools.push(PortPool {
                port: port.port,
                protocol: port.protocol.into(),
                pool_ref: pool.name.clone(),
            });
            vs.pools.push(pool);
        }
        vs.l4_policies.push(policy);

        tracing::debug!(
            key = %self.key,
            vs = %vs_name,
            ports = svc.ports.len(),
            servers = servers.len(),
            "built L4 virtual service"
        );
        vs
    }
}

// The endpoints serving a port. Endpoints of a single port service all serve
// that port, whatever they listen on.
fn port_servers(svc: &L4Service, port: &ServicePort, servers: &[Server]) -> Vec<Server> {
    if svc.ports.len() == 1 {
        return servers.to_vec();
    }
    let endpoint_port = port.endpoint_port();
    servers
        .iter()
        .filter(|s| s.port == Some(endpoint_port))
        .cloned()
        .collect()
}
