//! Concrete backend drivers.

pub mod docker;
pub mod dummy;
pub mod kubernetes;
pub mod openstack;

pub use docker::DockerDriver;
pub use dummy::{DummyDriver, DummyStats};
pub use kubernetes::KubernetesDriver;
pub use openstack::{OpenStackDriver, OpenStackHostProvider};
