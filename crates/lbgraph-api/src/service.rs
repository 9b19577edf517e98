use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L4Protocol {
    #[default]
    Tcp,
    Udp,
}

impl L4Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            L4Protocol::Tcp => "TCP",
            L4Protocol::Udp => "UDP",
        }
    }
}

/// A port exposed by a [L4Service].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePort {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub protocol: L4Protocol,
    pub port: u16,

    /// The port on the endpoints. Defaults to `port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

impl ServicePort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: L4Protocol::Udp,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_target_port(mut self, target_port: u16) -> Self {
        self.target_port = Some(target_port);
        self
    }

    /// The port endpoints listen on.
    pub fn endpoint_port(&self) -> u16 {
        self.target_port.unwrap_or(self.port)
    }
}

/// A `LoadBalancer` Service. Each one is exposed on a layer 4 virtual service
/// of its own.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct L4Service {
    pub namespace: String,
    pub name: String,
    pub ports: Vec<ServicePort>,

    /// FQDNs to publish for the service's VIP, e.g. from an external-dns
    /// hostname annotation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fqdns: Vec<String>,

    /// A requested VIP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    /// Overrides the configured L4 application profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_profile: Option<String>,
}

impl L4Service {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }

    /// The `namespace/name` key of this service.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::new_static("namespace must not be empty")).with_field("namespace");
        }
        if self.name.is_empty() {
            return Err(Error::new_static("name must not be empty")).with_field("name");
        }
        if self.ports.is_empty() {
            return Err(Error::new_static("at least one port is required")).with_field("ports");
        }

        for (i, port) in self.ports.iter().enumerate() {
            if port.port == 0 {
                return Err(Error::new_static("port must not be zero"))
                    .with_field("port")
                    .with_field_index("ports", i);
            }
            let duplicate = self.ports[..i]
                .iter()
                .any(|p| p.port == port.port && p.protocol == port.protocol);
            if duplicate {
                return Err(Error::new(format!(
                    "{}/{} is listed more than once",
                    port.port,
                    port.protocol.as_str()
                )))
                .with_field_index("ports", i);
            }
        }
        Ok(())
    }
}
