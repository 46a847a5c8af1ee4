//! The resource requests and scheduling context passed into the scheduler

use std::collections::HashMap;

/// The label that lists comma separated require any constraints for a host
pub const REQUIRE_ANY_LABEL: &str = "io.stevedore.scheduler.require_any";

/// The label that declares a hosts per host subnet CIDR
pub const PER_HOST_SUBNET_LABEL: &str = "io.stevedore.network.per_host_subnet.subnet";

/// The label that declares a hosts vpc subnet CIDR
pub const VPC_SUBNET_LABEL: &str = "io.stevedore.vpc.subnet";

/// The label a container uses to request a specific IP
pub const REQUESTED_IP_LABEL: &str = "io.stevedore.container.requested_ip";

/// The label tying a container to its deployment unit
pub const DEPLOYMENT_UNIT_LABEL: &str = "io.stevedore.service.deployment.unit";

/// A single resource demand to reserve or release on a host
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ResourceRequest {
    /// A demand for some amount of a scalar consumable
    Amount {
        /// The name of the resource being consumed
        resource: String,
        /// The amount being requested
        amount: i64,
    },
    /// A demand for a specific port on the host
    Port {
        /// The port being requested
        port: u16,
    },
}

impl ResourceRequest {
    /// Create an amount based request
    ///
    /// # Arguments
    ///
    /// * `resource` - The name of the resource to consume
    /// * `amount` - The amount to consume
    pub fn amount<R: Into<String>>(resource: R, amount: i64) -> Self {
        ResourceRequest::Amount {
            resource: resource.into(),
            amount,
        }
    }

    /// Create a port based request
    ///
    /// # Arguments
    ///
    /// * `port` - The port to bind
    pub fn port(port: u16) -> Self {
        ResourceRequest::Port { port }
    }
}

/// One container being scheduled in a call
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextEntry {
    /// The deployment unit this container belongs to
    pub deployment_unit: String,
    /// The labels on this container
    pub labels: HashMap<String, String>,
}

impl ContextEntry {
    /// Create a new context entry
    ///
    /// # Arguments
    ///
    /// * `deployment_unit` - The deployment unit this container belongs to
    /// * `labels` - The labels on this container
    pub fn new<D: Into<String>>(deployment_unit: D, labels: HashMap<String, String>) -> Self {
        ContextEntry {
            deployment_unit: deployment_unit.into(),
            labels,
        }
    }
}

/// The ordered set of containers being scheduled together in one call
pub type Context = Vec<ContextEntry>;
