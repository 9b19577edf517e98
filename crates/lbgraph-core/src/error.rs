/// A `Result` alias where the `Err` case is `lbgraph_core::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("secret not found: {namespace}/{name}")]
    SecretNotFound { namespace: String, name: String },

    #[error("secret {namespace}/{name} has no {field}")]
    InvalidSecret {
        namespace: String,
        name: String,
        field: &'static str,
    },

    #[error("no cert/key specified inline for TLS route")]
    MissingInlineCert,

    #[error("service not found: {namespace}/{name}")]
    ServiceNotFound { namespace: String, name: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("no IP address found for node: {0}")]
    NodeIpNotFound(String),

    #[error("invalid pod CIDR {cidr:?} on node {node}")]
    InvalidPodCidr { node: String, cidr: String },

    #[error("{kind} {name} is rejected")]
    RejectedRule { kind: &'static str, name: String },

    #[error("no virtual service found in model: {0}")]
    MissingVirtualService(String),
}

impl Error {
    /// Returns `true` if this error was caused by a missing object that may
    /// show up later. Retrying the build once the object exists should
    /// succeed.
    pub fn is_missing_dependency(&self) -> bool {
        matches!(
            self,
            Error::SecretNotFound { .. }
                | Error::InvalidSecret { .. }
                | Error::MissingInlineCert
                | Error::ServiceNotFound { .. }
                | Error::NodeNotFound(_)
                | Error::NodeIpNotFound(_)
        )
    }
}
