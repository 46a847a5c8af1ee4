//! The structures shared between the scheduler and its callers

mod metadata;
mod pools;
mod requests;

pub use metadata::{ContainerInfo, HostInfo, UsedResources};
pub use pools::{
    ComputePool, DeploymentUnitPool, LabelPool, PortPool, ResourcePool, CPU_POOL,
    CURRENT_DEPLOYMENT_UNIT_POOL, HOST_LABELS_POOL, INSTANCE_POOL, MEMORY_POOL, PORT_POOL,
    STORAGE_POOL, TEMP_DEPLOYMENT_UNIT_POOL, TOTAL_AVAILABLE_INSTANCES,
};
pub use requests::{
    Context, ContextEntry, ResourceRequest, DEPLOYMENT_UNIT_LABEL, PER_HOST_SUBNET_LABEL,
    REQUESTED_IP_LABEL, REQUIRE_ANY_LABEL, VPC_SUBNET_LABEL,
};
