//! lbgraph API types.
//!
//! These types describe the inputs to an lbgraph graph builder: controller
//! [Config], parsed ingresses and routes, LoadBalancer services, TLS material,
//! per-host and per-path policy rules, and Kubernetes node facts. They're plain data and do no
//! graph construction of their own.
//!
//! Use the `lbgraph-core` crate to turn these into load balancer object
//! graphs.

mod error;
pub use error::Error;

mod config;
pub use config::{Config, ShardScheme, ShardSize, VirtualHostMode};

pub mod ingress;
pub use ingress::{
    HostPath, IngressSpec, InfraSetting, InlineCert, ObjectKind, PassthroughHost, PathType,
    Server, TlsSecret, TlsSettings,
};

pub mod service;
pub use service::{L4Protocol, L4Service, ServicePort};

pub mod rules;
pub use rules::{HostRule, HttpRule, HttpRulePath, RuleStatus};

mod node;
pub use node::K8sNode;
