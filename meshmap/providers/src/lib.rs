#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Concrete provider backends: remote shell over the system ssh client,
//! Kubernetes over the cluster API, and the no-op stubs backing the seed and
//! hint built-ins.

mod builtin;
mod k8s;
mod ssh;

pub use self::{
    builtin::{HintProvider, SeedProvider},
    k8s::{K8sConfig, K8sProvider},
    ssh::{SshConfig, SshProvider},
};
