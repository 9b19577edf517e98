use serde::Serialize;

use crate::hash::checksum;

use super::{Checksum, NodeKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertType {
    #[default]
    Server,
    Ca,
}

/// A certificate, and for server certificates the matching key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TlsKeyCertNode {
    pub name: String,
    pub tenant: String,
    pub cert_type: CertType,
    pub cert: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// The name of the CA certificate that signed `cert`, if one was
    /// supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_ref: Option<String>,
}

impl TlsKeyCertNode {
    pub fn server(
        name: impl Into<String>,
        tenant: impl Into<String>,
        cert: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            cert_type: CertType::Server,
            cert: cert.into(),
            key: key.into(),
            ca_cert_ref: None,
        }
    }

    pub fn ca(name: impl Into<String>, tenant: impl Into<String>, cert: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            cert_type: CertType::Ca,
            cert: cert.into(),
            key: String::new(),
            ca_cert_ref: None,
        }
    }
}

impl Checksum for TlsKeyCertNode {
    fn checksum(&self) -> u32 {
        checksum(self)
    }

    fn kind(&self) -> NodeKind {
        NodeKind::TlsKeyCert
    }
}

/// CA certificates used to validate a backend's certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct PkiProfileNode {
    pub name: String,
    pub tenant: String,
    pub ca_certs: Vec<String>,
}

impl PkiProfileNode {
    pub fn new(name: impl Into<String>, tenant: impl Into<String>, ca_cert: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            ca_certs: vec![ca_cert.into()],
        }
    }
}

impl Checksum for PkiProfileNode {
    fn checksum(&self) -> u32 {
        checksum(&(&self.name, &self.ca_certs))
    }

    fn kind(&self) -> NodeKind {
        NodeKind::PkiProfile
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_cert_checksum() {
        let cert = TlsKeyCertNode::server("c1--foo.com", "admin", "CERT", "KEY");
        assert_eq!(
            cert.checksum(),
            TlsKeyCertNode::server("c1--foo.com", "admin", "CERT", "KEY").checksum()
        );
        assert_ne!(
            cert.checksum(),
            TlsKeyCertNode::server("c1--foo.com", "admin", "CERT", "KEY2").checksum()
        );

        let mut with_ca = cert.clone();
        with_ca.ca_cert_ref = Some("c1--foo.com-cacert".to_string());
        assert_ne!(cert.checksum(), with_ca.checksum());
    }

    #[test]
    fn test_ca_cert() {
        let ca = TlsKeyCertNode::ca("c1--foo.com-cacert", "admin", "CA");
        assert_eq!(ca.cert_type, CertType::Ca);
        assert!(ca.key.is_empty());
        assert_eq!(ca.kind(), NodeKind::TlsKeyCert);
    }
}
