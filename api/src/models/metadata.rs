//! The records observed from the cluster metadata source

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::pools::{CPU_POOL, INSTANCE_POOL, MEMORY_POOL, STORAGE_POOL};

/// A host as observed from the metadata source
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HostInfo {
    /// The uuid of this host
    pub uuid: Uuid,
    /// The labels on this host
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// The cpu capacity of this host in millis
    pub milli_cpu: i64,
    /// The memory capacity of this host in MB
    pub memory_mb: i64,
    /// The local storage capacity of this host in MB
    pub local_storage_mb: i64,
}

/// A container as observed from the metadata source
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ContainerInfo {
    /// The uuid of the host this container runs on if it is placed
    pub host_uuid: Option<Uuid>,
    /// The labels on this container
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// The cpu millis reserved by this container
    #[serde(default)]
    pub milli_cpu_reservation: i64,
    /// The memory MB reserved by this container
    #[serde(default)]
    pub memory_reservation_mb: i64,
    /// The local storage MB reserved by this container
    #[serde(default)]
    pub storage_reservation_mb: i64,
    /// The host ports bound by this container
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// The resources already consumed on each host by resource kind
#[derive(Debug, Clone, Default)]
pub struct UsedResources {
    /// The used amounts keyed by host then resource kind
    used: HashMap<Uuid, HashMap<&'static str, i64>>,
    /// The ports bound on each host
    ports: HashMap<Uuid, HashSet<u16>>,
}

impl UsedResources {
    /// Aggregate the used resources per host from the observed containers
    ///
    /// Each placed container consumes one synthetic instance slot plus
    /// whatever scalar reservations it declares.
    ///
    /// # Arguments
    ///
    /// * `containers` - The containers observed from the metadata source
    pub fn aggregate(containers: &[ContainerInfo]) -> Self {
        let mut aggregated = UsedResources::default();
        // crawl the observed containers and fold their reservations in
        for container in containers {
            // skip containers that are not placed on a host yet
            let Some(host) = container.host_uuid else {
                continue;
            };
            let entry = aggregated.used.entry(host).or_default();
            *entry.entry(INSTANCE_POOL).or_default() += 1;
            *entry.entry(CPU_POOL).or_default() += container.milli_cpu_reservation;
            *entry.entry(MEMORY_POOL).or_default() += container.memory_reservation_mb;
            *entry.entry(STORAGE_POOL).or_default() += container.storage_reservation_mb;
            // track the ports this container has bound on its host
            aggregated
                .ports
                .entry(host)
                .or_default()
                .extend(container.ports.iter().copied());
        }
        aggregated
    }

    /// Get the used amount of one resource kind on a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to look up
    /// * `resource` - The resource kind to look up
    pub fn amount(&self, host: &Uuid, resource: &str) -> i64 {
        self.used
            .get(host)
            .and_then(|kinds| kinds.get(resource))
            .copied()
            .unwrap_or_default()
    }

    /// Get the ports bound on a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to look up
    pub fn ports(&self, host: &Uuid) -> HashSet<u16> {
        self.ports.get(host).cloned().unwrap_or_default()
    }
}
