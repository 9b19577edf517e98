//! Parsed ingress and route inputs.
//!
//! These are the already-validated, already-resolved shapes an informer layer
//! hands to a graph builder. A single [IngressSpec] covers both Kubernetes
//! Ingresses and OpenShift-style Routes; the only differences that matter to
//! graph construction are naming ([ObjectKind]) and whether TLS material is
//! inline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorContext};

/// The kind of object an [IngressSpec] was parsed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    #[default]
    Ingress,
    Route,
}

/// How a path matches a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    #[default]
    Prefix,
}

/// A single host/path to backend service mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPath {
    pub path: String,
    pub path_type: PathType,
    pub service_name: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    /// Relative weight of this backend when a path has more than one.
    pub weight: u32,
}

impl HostPath {
    pub fn new(path: impl Into<String>, service_name: impl Into<String>, port: u16) -> Self {
        Self {
            path: path.into(),
            service_name: service_name.into(),
            port,
            weight: 100,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.service_name.is_empty() {
            return Err(Error::new_static("service name must not be empty"))
                .with_field("service_name");
        }
        if !self.path.is_empty() && !self.path.starts_with('/') {
            return Err(Error::new(format!(
                "path {:?} must start with '/'",
                self.path
            )))
            .with_field("path");
        }
        Ok(())
    }
}

/// TLS certificate material carried inline on a route instead of in a
/// secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineCert {
    pub cert: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

/// TLS settings for a group of hosts on an ingress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub secret_name: String,

    /// The namespace of the secret. Defaults to the ingress namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_namespace: Option<String>,

    pub hosts: BTreeMap<String, Vec<HostPath>>,

    /// Redirect plain-text requests for these hosts to HTTPS.
    pub redirect: bool,

    /// Re-encrypt traffic to the backend.
    pub reencrypt: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_ca: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_cert: Option<InlineCert>,
}

/// A TLS passthrough host. The load balancer only routes on SNI and never
/// terminates TLS.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughHost {
    pub backends: Vec<HostPath>,
    /// Add an insecure listener that redirects to the passthrough listener.
    pub redirect: bool,
}

/// An infrastructure setting applied to an ingress. Named settings isolate an
/// ingress's hosts into their own set of virtual services.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraSetting {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_size: Option<crate::ShardSize>,
}

/// A parsed ingress or route.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSpec {
    pub namespace: String,
    pub name: String,
    pub kind: ObjectKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub infra_setting: Option<InfraSetting>,

    /// Plain-text hosts and their paths.
    pub hosts: BTreeMap<String, Vec<HostPath>>,

    pub tls: Vec<TlsSettings>,

    pub passthrough: BTreeMap<String, PassthroughHost>,
}

impl IngressSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// The `namespace/name` key for this object.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn infra_setting_name(&self) -> Option<&str> {
        self.infra_setting
            .as_ref()
            .map(|s| s.name.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::new_static("namespace must not be empty")).with_field("namespace");
        }
        if self.name.is_empty() {
            return Err(Error::new_static("name must not be empty")).with_field("name");
        }

        validate_hosts(&self.hosts).with_field("hosts")?;
        for (i, tls) in self.tls.iter().enumerate() {
            if tls.secret_name.is_empty() && tls.inline_cert.is_none() {
                return Err(Error::new_static(
                    "either a secret name or an inline certificate is required",
                ))
                .with_field_index("tls", i);
            }
            validate_hosts(&tls.hosts)
                .with_field("hosts")
                .with_field_index("tls", i)?;
        }
        for (host, passthrough) in &self.passthrough {
            if host.is_empty() {
                return Err(Error::new_static("host must not be empty")).with_field("passthrough");
            }
            for (i, backend) in passthrough.backends.iter().enumerate() {
                backend
                    .validate()
                    .with_field_index("backends", i)
                    .with_field("passthrough")?;
            }
        }

        Ok(())
    }
}

fn validate_hosts(hosts: &BTreeMap<String, Vec<HostPath>>) -> Result<(), Error> {
    for (host, paths) in hosts {
        if host.is_empty() {
            return Err(Error::new_static("host must not be empty"));
        }
        for (i, path) in paths.iter().enumerate() {
            path.validate().with_index(i)?;
        }
    }
    Ok(())
}

/// Certificate and key data from a TLS secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSecret {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

impl TlsSecret {
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: Some(cert.into()),
            key: Some(key.into()),
            ca_cert: None,
        }
    }
}

/// A single backend endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl Server {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port: Some(port),
            node_name: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_paths() {
        let mut spec = IngressSpec::new("default", "ing");
        spec.hosts.insert(
            "foo.com".to_string(),
            vec![HostPath::new("/", "svc", 80), HostPath::new("bar", "svc", 80)],
        );

        let err = spec.validate().unwrap_err();
        assert_eq!(err.path(), "hosts[1].path");
    }

    #[test]
    fn test_validate_tls() {
        let mut spec = IngressSpec::new("default", "ing");
        spec.tls.push(TlsSettings {
            secret_name: "s1".to_string(),
            ..Default::default()
        });
        spec.tls.push(TlsSettings::default());

        let err = spec.validate().unwrap_err();
        assert_eq!(err.path(), "tls[1]");
    }

    #[test]
    fn test_parse_ingress() {
        let spec: IngressSpec = serde_json::from_value(serde_json::json!({
            "namespace": "default",
            "name": "ing",
            "hosts": {
                "foo.com": [{"path": "/", "service_name": "svc1", "port": 80, "weight": 100}],
            },
            "infra_setting": {"name": "infra-1", "shard_size": "SMALL"},
        }))
        .unwrap();

        assert!(spec.validate().is_ok());
        assert_eq!(spec.key(), "default/ing");
        assert_eq!(spec.infra_setting_name(), Some("infra-1"));
        assert_eq!(spec.hosts["foo.com"][0], HostPath::new("/", "svc1", 80));
    }
}
