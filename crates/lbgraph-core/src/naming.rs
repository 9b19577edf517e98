//! Deterministic object names.
//!
//! Names are the only way nodes are found again across independent update
//! cycles, so every function here has to produce byte-identical output for the
//! same logical inputs. Don't change a format without a migration plan for the
//! objects that already exist on the load balancer.

use lbgraph_api::Config;

const SHARED_L7_PREFIX: &str = "Shared-L7-";
const SHARED_EVH_PREFIX: &str = "Shared-L7-EVH-";
const PASSTHROUGH_PREFIX: &str = "Shared-Passthrough-";
const DEDICATED_SUFFIX: &str = "-dedicated";
const INSECURE_SUFFIX: &str = "-insecure";
const ALT_CERT_SUFFIX: &str = "-alt";

/// Object naming for a single cluster and tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Naming {
    cluster: String,
    tenant: String,
    prefix: String,
}

impl Naming {
    pub fn new(config: &Config) -> Self {
        Self {
            cluster: config.cluster_name.clone(),
            tenant: config.tenant.clone(),
            prefix: config.name_prefix(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The `<cluster>--` prefix shared by every generated name.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The name of the model that holds a virtual service.
    pub fn model_name(&self, vs_name: &str) -> String {
        format!("{}/{}", self.tenant, vs_name)
    }

    // the cluster prefix plus an optional infra setting name
    pub(crate) fn scoped(&self, infra: Option<&str>) -> String {
        match infra {
            Some(infra) => format!("{}{}-", self.prefix, infra),
            None => self.prefix.clone(),
        }
    }

    /// The name of shared virtual service slot `bucket`.
    pub fn shard_vs_name(&self, infra: Option<&str>, bucket: u32, evh: bool) -> String {
        let shard_prefix = if evh {
            SHARED_EVH_PREFIX
        } else {
            SHARED_L7_PREFIX
        };
        let mut name = format!("{}{}", self.prefix, shard_prefix);
        if let Some(infra) = infra {
            name.push_str(infra);
            name.push('-');
        }
        name.push_str(&bucket.to_string());
        name
    }

    /// The name of a dedicated virtual service for a sharding key.
    pub fn dedicated_vs_name(&self, infra: Option<&str>, key: &str) -> String {
        format!("{}{}{}", self.scoped(infra), key, DEDICATED_SUFFIX)
    }

    pub fn passthrough_vs_name(&self, infra: Option<&str>, bucket: u32) -> String {
        let mut name = format!("{}{}", self.prefix, PASSTHROUGH_PREFIX);
        if let Some(infra) = infra {
            name.push_str(infra);
            name.push('-');
        }
        name.push_str(&bucket.to_string());
        name
    }

    pub fn passthrough_insecure_vs_name(vs_name: &str) -> String {
        format!("{vs_name}{INSECURE_SUFFIX}")
    }

    pub fn passthrough_pg_name(&self, infra: Option<&str>, host: &str) -> String {
        format!("{}{}", self.scoped(infra), host)
    }

    pub fn passthrough_pool_name(&self, infra: Option<&str>, host: &str, service: &str) -> String {
        format!("{}{}-{}", self.scoped(infra), host, service)
    }

    /// The name of the L4 virtual service for a LoadBalancer service.
    pub fn l4_vs_name(&self, namespace: &str, service: &str) -> String {
        format!("{}{}-{}", self.prefix, namespace, service)
    }

    pub fn l4_pool_name(&self, namespace: &str, service: &str, protocol: &str, port: u16) -> String {
        format!("{}{}-{}-{}-{}", self.prefix, namespace, service, protocol, port)
    }

    pub fn shared_pg_name(vs_name: &str) -> String {
        vs_name.to_string()
    }

    pub fn shared_datascript_name(vs_name: &str) -> String {
        vs_name.to_string()
    }

    pub fn vsvip_name(vs_name: &str) -> String {
        vs_name.to_string()
    }

    pub fn redirect_policy_name(vs_name: &str) -> String {
        vs_name.to_string()
    }

    pub fn header_rewrite_policy_name(vs_name: &str, host: &str) -> String {
        format!("{vs_name}--host-hdr-re-write--{host}")
    }

    /// The name of a pool attached directly to a shared parent. Routes add the
    /// backend service name, ingresses don't.
    pub fn l7_pool_name(
        &self,
        infra: Option<&str>,
        priority_label: &str,
        namespace: &str,
        ingress: &str,
        service: Option<&str>,
    ) -> String {
        let mut name = format!(
            "{}{}-{}-{}",
            self.scoped(infra),
            priority_label.replace('/', "_"),
            namespace,
            ingress,
        );
        if let Some(service) = service {
            name.push('-');
            name.push_str(service);
        }
        name
    }

    /// The name of a child virtual service for a host.
    pub fn child_vs_name(&self, infra: Option<&str>, host: &str) -> String {
        format!("{}{}", self.scoped(infra), host)
    }

    fn child_path_name(
        &self,
        infra: Option<&str>,
        namespace: &str,
        host: &str,
        path: &str,
        ingress: &str,
    ) -> String {
        format!(
            "{}{}-{}{}-{}",
            self.scoped(infra),
            namespace,
            host,
            path.replace('/', "_"),
            ingress,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn child_pool_name(
        &self,
        infra: Option<&str>,
        namespace: &str,
        host: &str,
        path: &str,
        ingress: &str,
        service: Option<&str>,
        dedicated: bool,
    ) -> String {
        let mut name = self.child_path_name(infra, namespace, host, path, ingress);
        if let Some(service) = service {
            name.push('-');
            name.push_str(service);
        }
        if dedicated {
            name.push_str(DEDICATED_SUFFIX);
        }
        name
    }

    pub fn child_pg_name(
        &self,
        infra: Option<&str>,
        namespace: &str,
        host: &str,
        path: &str,
        ingress: &str,
        dedicated: bool,
    ) -> String {
        let mut name = self.child_path_name(infra, namespace, host, path, ingress);
        if dedicated {
            name.push_str(DEDICATED_SUFFIX);
        }
        name
    }

    /// Host/path match entries share their pool group's name.
    pub fn child_hpp_map_name(
        &self,
        infra: Option<&str>,
        namespace: &str,
        host: &str,
        path: &str,
        ingress: &str,
        dedicated: bool,
    ) -> String {
        self.child_pg_name(infra, namespace, host, path, ingress, dedicated)
    }

    pub fn child_http_policy_name(
        &self,
        infra: Option<&str>,
        namespace: &str,
        host: &str,
        dedicated: bool,
    ) -> String {
        let mut name = format!("{}{}-{}", self.scoped(infra), namespace, host);
        if dedicated {
            name.push_str(DEDICATED_SUFFIX);
        }
        name
    }

    /// The name of the key and certificate for a host. Secrets named with an
    /// `-alt` suffix get an alternate certificate name so both can exist at
    /// once.
    pub fn tls_key_cert_name(&self, infra: Option<&str>, host: &str, secret: &str) -> String {
        let mut name = format!("{}{}", self.scoped(infra), host);
        if secret.ends_with(ALT_CERT_SUFFIX) {
            name.push_str(ALT_CERT_SUFFIX);
        }
        name
    }

    /// The name of the CA certificate that signed a key and certificate.
    pub fn ca_cert_name(key_cert_name: &str) -> String {
        format!("{key_cert_name}-cacert")
    }

    pub fn pki_profile_name(pool_name: &str) -> String {
        format!("{pool_name}-pkiprofile")
    }

    /// The prefix shared by every static route ID for a node.
    pub fn route_id_prefix(&self, uid_prefix: &str) -> String {
        format!("{}-{}", self.cluster, uid_prefix)
    }

    pub fn route_id(route_id_prefix: &str, index: usize) -> String {
        format!("{route_id_prefix}-{index}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn naming() -> Naming {
        Naming::new(&Config::new("c1"))
    }

    #[test]
    fn test_vs_names() {
        let n = naming();
        assert_eq!(n.prefix(), "c1--");
        assert_eq!(n.shard_vs_name(None, 3, false), "c1--Shared-L7-3");
        assert_eq!(n.shard_vs_name(Some("infra"), 3, false), "c1--Shared-L7-infra-3");
        assert_eq!(n.shard_vs_name(None, 0, true), "c1--Shared-L7-EVH-0");
        assert_eq!(n.dedicated_vs_name(None, "foo.com"), "c1--foo.com-dedicated");
        assert_eq!(
            n.dedicated_vs_name(Some("infra"), "foo.com"),
            "c1--infra-foo.com-dedicated"
        );
        assert_eq!(n.model_name("c1--Shared-L7-3"), "admin/c1--Shared-L7-3");
    }

    #[test]
    fn test_passthrough_names() {
        let n = naming();
        let vs = n.passthrough_vs_name(None, 0);
        assert_eq!(vs, "c1--Shared-Passthrough-0");
        assert_eq!(
            Naming::passthrough_insecure_vs_name(&vs),
            "c1--Shared-Passthrough-0-insecure"
        );
        assert_eq!(n.passthrough_pg_name(None, "foo.com"), "c1--foo.com");
        assert_eq!(
            n.passthrough_pool_name(Some("infra"), "foo.com", "svc"),
            "c1--infra-foo.com-svc"
        );
    }

    #[test]
    fn test_l4_names() {
        let n = naming();
        assert_eq!(n.l4_vs_name("default", "dns"), "c1--default-dns");
        assert_eq!(n.l4_pool_name("default", "dns", "UDP", 53), "c1--default-dns-UDP-53");
    }

    #[test]
    fn test_pool_names() {
        let n = naming();
        assert_eq!(
            n.l7_pool_name(None, "foo.com/bar", "default", "ing", None),
            "c1--foo.com_bar-default-ing"
        );
        assert_eq!(
            n.l7_pool_name(Some("infra"), "foo.com", "default", "route", Some("svc")),
            "c1--infra-foo.com-default-route-svc"
        );
        assert_eq!(
            n.child_pool_name(None, "default", "foo.com", "/bar", "ing", None, false),
            "c1--default-foo.com_bar-ing"
        );
        assert_eq!(
            n.child_pool_name(None, "default", "foo.com", "/", "ing", Some("svc"), true),
            "c1--default-foo.com_-ing-svc-dedicated"
        );
        assert_eq!(
            n.child_pg_name(Some("infra"), "default", "foo.com", "/bar", "ing", false),
            "c1--infra-default-foo.com_bar-ing"
        );
        assert_eq!(
            n.child_http_policy_name(None, "default", "foo.com", false),
            "c1--default-foo.com"
        );
    }

    #[test]
    fn test_cert_names() {
        let n = naming();
        assert_eq!(n.tls_key_cert_name(None, "bar.com", "secret"), "c1--bar.com");
        assert_eq!(
            n.tls_key_cert_name(Some("infra"), "bar.com", "secret-alt"),
            "c1--infra-bar.com-alt"
        );
        assert_eq!(Naming::ca_cert_name("c1--bar.com"), "c1--bar.com-cacert");
        assert_eq!(Naming::pki_profile_name("pool"), "pool-pkiprofile");
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(Naming::redirect_policy_name("vs"), "vs");
        assert_eq!(
            Naming::header_rewrite_policy_name("vs", "foo.com"),
            "vs--host-hdr-re-write--foo.com"
        );
    }

    #[test]
    fn test_route_ids() {
        let n = naming();
        let prefix = n.route_id_prefix("4f2b1c9e");
        assert_eq!(prefix, "c1-4f2b1c9e");
        assert_eq!(Naming::route_id(&prefix, 2), "c1-4f2b1c9e-2");
    }
}
