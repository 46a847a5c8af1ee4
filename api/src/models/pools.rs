//! The per host resource pool ledgers tracked by the scheduler

use std::collections::{HashMap, HashSet};

/// The resource name for the synthetic instance slot pool
pub const INSTANCE_POOL: &str = "instanceReservation";

/// The resource name for the memory pool
pub const MEMORY_POOL: &str = "memoryReservation";

/// The resource name for the cpu pool
pub const CPU_POOL: &str = "cpuReservation";

/// The resource name for the local storage pool
pub const STORAGE_POOL: &str = "storageSize";

/// The resource name for the port pool
pub const PORT_POOL: &str = "portReservation";

/// The resource name for the host label pool
pub const HOST_LABELS_POOL: &str = "hostLabels";

/// The resource name for the observed deployment unit membership pool
pub const CURRENT_DEPLOYMENT_UNIT_POOL: &str = "currentDeploymentUnitPool";

/// The resource name for the in flight deployment unit bookkeeping pool
pub const TEMP_DEPLOYMENT_UNIT_POOL: &str = "tempDeploymentUnitPool";

/// The cap on the synthetic instance slot pool
pub const TOTAL_AVAILABLE_INSTANCES: i64 = 1_000_000;

/// A ledger for a scalar consumable resource on a host
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputePool {
    /// The name of the resource this pool tracks
    pub resource: String,
    /// The total capacity of this resource on the host
    pub total: i64,
    /// The amount of this resource currently reserved
    pub used: i64,
    /// Whether a refresh should also overwrite the used amount
    #[serde(default)]
    pub update_all: bool,
}

impl ComputePool {
    /// Create a new compute pool
    ///
    /// # Arguments
    ///
    /// * `resource` - The name of the resource to track
    /// * `total` - The total capacity on the host
    /// * `used` - The amount already reserved
    pub fn new<R: Into<String>>(resource: R, total: i64, used: i64) -> Self {
        ComputePool {
            resource: resource.into(),
            total,
            used,
            update_all: false,
        }
    }
}

/// The ports currently bound or reserved on a host
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPool {
    /// The ports that are currently in use on this host
    pub used: HashSet<u16>,
    /// Whether a refresh should replace the used set
    #[serde(default)]
    pub should_update: bool,
}

/// The labels observed on a host
///
/// Label values are stored exactly as observed. Any comparisons against them
/// are case folded at comparison time instead.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPool {
    /// The labels on this host keyed by label name
    pub labels: HashMap<String, String>,
}

/// The deployment units associated with a host
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentUnitPool {
    /// Which lifetime of membership this pool tracks (current or temp)
    pub resource: String,
    /// The deployment unit ids in this pool
    pub units: HashSet<String>,
}

impl DeploymentUnitPool {
    /// Create a new deployment unit pool
    ///
    /// # Arguments
    ///
    /// * `resource` - The lifetime this pool tracks (current or temp)
    /// * `units` - The deployment unit ids to start with
    pub fn new<R: Into<String>>(resource: R, units: HashSet<String>) -> Self {
        DeploymentUnitPool {
            resource: resource.into(),
            units,
        }
    }
}

/// A single resource ledger on a host
///
/// All variants share the same capability set (type tag, create, refresh) so
/// the registry can treat them uniformly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ResourcePool {
    /// A scalar consumable like cpu millis or memory MB
    Compute(ComputePool),
    /// The ports bound on a host
    Port(PortPool),
    /// The labels observed on a host
    Label(LabelPool),
    /// The deployment units associated with a host
    DeploymentUnit(DeploymentUnitPool),
}

impl ResourcePool {
    /// Get the resource type this pool is keyed under on its host
    pub fn resource_type(&self) -> &str {
        match self {
            ResourcePool::Compute(pool) => &pool.resource,
            ResourcePool::Port(_) => PORT_POOL,
            ResourcePool::Label(_) => HOST_LABELS_POOL,
            ResourcePool::DeploymentUnit(pool) => &pool.resource,
        }
    }

    /// Refresh this pool in place from a freshly observed pool of the same type
    ///
    /// A compute pool only overwrites its used amount when the incoming pool
    /// asks for it. This keeps reservations made after the last observation
    /// from being erased by a refresh that has not seen them yet. The temp
    /// deployment unit pool is never the target of a reconciliation refresh
    /// so a deployment unit refresh always replaces the set wholesale.
    ///
    /// # Arguments
    ///
    /// * `incoming` - The freshly observed pool to refresh from
    ///
    /// # Panics
    ///
    /// Refreshing from a pool of a different variant is a programming error
    /// since pools are keyed by resource type on their host.
    pub fn refresh(&mut self, incoming: ResourcePool) {
        match (self, incoming) {
            (ResourcePool::Compute(pool), ResourcePool::Compute(observed)) => {
                // always refresh the total capacity
                pool.total = observed.total;
                // only replace the used amount when told to
                if observed.update_all {
                    pool.used = observed.used;
                }
            }
            (ResourcePool::Port(pool), ResourcePool::Port(observed)) => {
                // only replace our port set when this observation is flagged for it
                if observed.should_update {
                    pool.used = observed.used;
                }
            }
            (ResourcePool::Label(pool), ResourcePool::Label(observed)) => {
                // labels are always replaced wholesale
                pool.labels = observed.labels;
            }
            (ResourcePool::DeploymentUnit(pool), ResourcePool::DeploymentUnit(observed)) => {
                // membership is always replaced wholesale
                pool.units = observed.units;
            }
            (current, incoming) => panic!(
                "Refreshed pool {} with mismatched pool {}",
                current.resource_type(),
                incoming.resource_type()
            ),
        }
    }
}
