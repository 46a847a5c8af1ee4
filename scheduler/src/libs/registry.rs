//! The process wide host registry and its transactional reserve protocol
//!
//! One registry is built at process start and shared by reference for the
//! life of the process. Two nested locks guard it: an outer lock taken in
//! read mode by every ordinary scheduling call and in write mode only while
//! a reconciliation pass replaces host state, and an inner lock owning the
//! host map that serializes individual scheduling calls with each other.

use chrono::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stevedore::models::{
    ComputePool, Context, DeploymentUnitPool, HostInfo, LabelPool, PortPool, ResourcePool,
    ResourceRequest, UsedResources, CPU_POOL, CURRENT_DEPLOYMENT_UNIT_POOL, DEPLOYMENT_UNIT_LABEL,
    HOST_LABELS_POOL, INSTANCE_POOL, MEMORY_POOL, STORAGE_POOL, TEMP_DEPLOYMENT_UNIT_POOL,
    TOTAL_AVAILABLE_INSTANCES,
};
use stevedore::{Conf, Error, MetadataSource, WorkloadApi};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::filters::{filters, rank_hosts};
use super::steps::{release_steps, reserve_steps};

/// A host and its resource pool ledgers
#[derive(Debug, Clone)]
pub struct Host {
    /// The uuid of this host
    pub id: Uuid,
    /// The pools on this host keyed by resource type
    pub pools: HashMap<String, ResourcePool>,
}

impl Host {
    /// Create a new host with no pools yet
    ///
    /// # Arguments
    ///
    /// * `id` - The uuid of this host
    pub fn new(id: Uuid) -> Self {
        Host {
            id,
            pools: HashMap::default(),
        }
    }
}

/// The map of all currently registered hosts
pub type HostMap = HashMap<Uuid, Host>;

/// The result data accumulated by the reserve steps in one call
pub type SchedulerData = HashMap<String, serde_json::Value>;

/// Tracks reconciliation progress between passes
#[derive(Default)]
struct InitState {
    /// Whether an initial pass has completed
    initialized: bool,
    /// The hosts seen in the last pass
    known_hosts: HashSet<Uuid>,
}

/// The process wide scheduling registry
pub struct Registry {
    /// The outer lock scheduling calls share and reconciliation owns
    global: RwLock<()>,
    /// The inner lock serializing individual scheduling calls
    hosts: Mutex<HostMap>,
    /// Guards initialization between reconciliation passes
    init: Mutex<InitState>,
    /// When the last scheduling event happened
    last_event: Mutex<Option<DateTime<Utc>>>,
    /// The clock used for debounce decisions
    clock: Box<dyn Clock>,
    /// How long after an event to skip unforced reconciliation
    debounce: chrono::Duration,
    /// How long simulated reservations live before being released
    simulated_release_delay: Option<u64>,
    /// The handle to the cluster metadata source
    metadata: RwLock<Option<Arc<dyn MetadataSource>>>,
    /// The handle to the workload placement api
    api: RwLock<Option<Arc<dyn WorkloadApi>>>,
    /// The timers for in flight simulated releases
    sim_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    /// Create a new registry on the system clock
    ///
    /// # Arguments
    ///
    /// * `conf` - The Stevedore config
    pub fn new(conf: &Conf) -> Self {
        Self::with_clock(conf, Box::new(SystemClock))
    }

    /// Create a new registry on an injected clock
    ///
    /// # Arguments
    ///
    /// * `conf` - The Stevedore config
    /// * `clock` - The clock to make debounce decisions with
    pub fn with_clock(conf: &Conf, clock: Box<dyn Clock>) -> Self {
        Registry {
            global: RwLock::new(()),
            hosts: Mutex::new(HostMap::default()),
            init: Mutex::new(InitState::default()),
            last_event: Mutex::new(None),
            clock,
            debounce: chrono::Duration::seconds(conf.scheduler.debounce as i64),
            simulated_release_delay: conf.scheduler.simulated_release_delay,
            metadata: RwLock::new(None),
            api: RwLock::new(None),
            sim_handles: Mutex::new(Vec::default()),
        }
    }

    /// Set the metadata source handle
    ///
    /// # Arguments
    ///
    /// * `metadata` - The metadata source to reconcile against
    pub async fn set_metadata_source(&self, metadata: Arc<dyn MetadataSource>) {
        *self.metadata.write().await = Some(metadata);
    }

    /// Get the metadata source handle if one has been set
    pub async fn metadata_source(&self) -> Option<Arc<dyn MetadataSource>> {
        self.metadata.read().await.clone()
    }

    /// Set the workload api handle
    ///
    /// # Arguments
    ///
    /// * `api` - The workload api to look up primary ips with
    pub async fn set_workload_api(&self, api: Arc<dyn WorkloadApi>) {
        *self.api.write().await = Some(api);
    }

    /// Register a pool on a host, creating the host entry if it is new
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to attach this pool to
    /// * `pool` - The pool to attach
    pub async fn create_pool(&self, host_id: Uuid, pool: ResourcePool) -> Result<(), Error> {
        let mut hosts = self.hosts.lock().await;
        let host = hosts.entry(host_id).or_insert_with(|| Host::new(host_id));
        let resource_type = pool.resource_type().to_owned();
        // fail without mutating if this pool type is already attached
        if host.pools.contains_key(&resource_type) {
            return Err(Error::new(format!(
                "Pool {} already exists on host {}",
                resource_type, host_id
            )));
        }
        host.pools.insert(resource_type, pool);
        Ok(())
    }

    /// Refresh an existing pool on a host in place
    ///
    /// Returns false when the host or pool type is absent so the caller can
    /// create it instead.
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to refresh a pool on
    /// * `pool` - The freshly observed pool to refresh from
    pub async fn update_pool(&self, host_id: Uuid, pool: ResourcePool) -> bool {
        let mut hosts = self.hosts.lock().await;
        let Some(host) = hosts.get_mut(&host_id) else {
            return false;
        };
        let Some(current) = host.pools.get_mut(pool.resource_type()) else {
            return false;
        };
        current.refresh(pool);
        true
    }

    /// Check whether a pool type exists on a host
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to check
    /// * `resource_type` - The pool type to check for
    pub async fn pool_exists(&self, host_id: Uuid, resource_type: &str) -> bool {
        let hosts = self.hosts.lock().await;
        hosts
            .get(&host_id)
            .map(|host| host.pools.contains_key(resource_type))
            .unwrap_or(false)
    }

    /// Get a snapshot of a pool on a host
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to read
    /// * `resource_type` - The pool type to read
    pub async fn pool(&self, host_id: Uuid, resource_type: &str) -> Option<ResourcePool> {
        let hosts = self.hosts.lock().await;
        hosts
            .get(&host_id)
            .and_then(|host| host.pools.get(resource_type))
            .cloned()
    }

    /// Delete a host and all of its pools
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to delete
    pub async fn remove_host(&self, host_id: Uuid) {
        let mut hosts = self.hosts.lock().await;
        event!(Level::INFO, host = %host_id, "Removing host");
        hosts.remove(&host_id);
    }

    /// Narrow and order the candidate hosts for a set of resource requests
    ///
    /// The whole evaluation runs under the call lock so no concurrent
    /// reservation can mutate pool state mid evaluation.
    ///
    /// # Arguments
    ///
    /// * `requests` - The resources being requested
    /// * `context` - The containers being scheduled in this call
    #[instrument(name = "Registry::prioritize", skip_all)]
    pub async fn prioritize(
        &self,
        requests: &[ResourceRequest],
        context: &Context,
    ) -> Result<Vec<Uuid>, Error> {
        let _global = self.global.read().await;
        let hosts = self.hosts.lock().await;
        let api = self.api.read().await.clone();
        // snapshot the known hosts
        let mut candidates: Vec<Uuid> = hosts.keys().copied().collect();
        // narrow them through each filter in its fixed order
        for filter in filters() {
            candidates = filter
                .filter(&hosts, api.as_ref(), requests, context, candidates)
                .await;
        }
        // order what survived by free capacity
        let ranked = rank_hosts(&hosts, requests, candidates);
        self.set_last_event().await;
        Ok(ranked)
    }

    /// Reserve resources on a host transactionally
    ///
    /// Runs every reserve step in its fixed order, rolling the completed
    /// steps back in reverse order if one fails. An unknown host is a no op
    /// returning no data since the next reconciliation pass will account for
    /// the workload once the host registers.
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to reserve resources on
    /// * `force` - Whether to bypass soft capacity checks
    /// * `requests` - The resources being reserved
    /// * `context` - The containers being scheduled in this call
    #[instrument(name = "Registry::reserve", skip(self, requests, context))]
    pub async fn reserve(
        &self,
        host_id: Uuid,
        force: bool,
        requests: &[ResourceRequest],
        context: &Context,
    ) -> Result<Option<SchedulerData>, Error> {
        let _global = self.global.read().await;
        let mut hosts = self.hosts.lock().await;
        let result = Self::reserve_locked(&mut hosts, host_id, force, requests, context);
        self.set_last_event().await;
        result
    }

    /// Run the reserve steps while holding the call lock
    ///
    /// # Arguments
    ///
    /// * `hosts` - The locked host map
    /// * `host_id` - The host to reserve resources on
    /// * `force` - Whether to bypass soft capacity checks
    /// * `requests` - The resources being reserved
    /// * `context` - The containers being scheduled in this call
    fn reserve_locked(
        hosts: &mut HostMap,
        host_id: Uuid,
        force: bool,
        requests: &[ResourceRequest],
        context: &Context,
    ) -> Result<Option<SchedulerData>, Error> {
        event!(
            Level::INFO,
            host = %host_id,
            force,
            requests = requests.len(),
            "Reserving resources"
        );
        let Some(host) = hosts.get_mut(&host_id) else {
            // the host most likely has not registered with the scheduler yet
            // and this reservation will be counted by its initial population
            event!(Level::WARN, host = %host_id, "Host not found for reservation. Skipping");
            return Ok(None);
        };
        let steps = reserve_steps();
        let mut data = SchedulerData::default();
        for (index, step) in steps.iter().enumerate() {
            if let Err(error) = step.reserve(host, requests, context, force, &mut data) {
                event!(
                    Level::ERROR,
                    step = step.name(),
                    error = %error,
                    "Reservation step failed. Rolling back"
                );
                // unwind the completed steps in reverse order since later
                // steps may depend on earlier side effects
                for done in steps[..index].iter().rev() {
                    done.rollback(host, requests, context);
                }
                return Err(error);
            }
        }
        Ok(Some(data))
    }

    /// Release resources on a host
    ///
    /// Every release step runs unconditionally with no rollback and no
    /// failure reporting. An unknown host is a no op.
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to release resources on
    /// * `requests` - The resources being released
    /// * `context` - The containers being released in this call
    #[instrument(name = "Registry::release", skip(self, requests, context))]
    pub async fn release(&self, host_id: Uuid, requests: &[ResourceRequest], context: &Context) {
        let _global = self.global.read().await;
        let mut hosts = self.hosts.lock().await;
        event!(Level::INFO, host = %host_id, requests = requests.len(), "Releasing resources");
        match hosts.get_mut(&host_id) {
            Some(host) => {
                for step in release_steps() {
                    step.release(host, requests, context);
                }
            }
            None => {
                event!(Level::INFO, host = %host_id, "Host not found for release. Nothing to do");
            }
        }
        self.set_last_event().await;
    }

    /// Compare observed host labels against the registered label pools
    ///
    /// Used by the reconciliation loop to decide when label drift warrants a
    /// forced refresh.
    ///
    /// # Arguments
    ///
    /// * `observed` - The hosts observed from the metadata source
    pub async fn labels_changed(&self, observed: &[HostInfo]) -> bool {
        let hosts = self.hosts.lock().await;
        if hosts.len() != observed.len() {
            return true;
        }
        for host in observed {
            let Some(registered) = hosts.get(&host.uuid) else {
                return true;
            };
            match registered.pools.get(HOST_LABELS_POOL) {
                Some(ResourcePool::Label(pool)) => {
                    if pool.labels != host.labels {
                        return true;
                    }
                }
                _ => return true,
            }
        }
        false
    }

    /// Reconcile the registry against the metadata source
    ///
    /// Skipped without fetching when a scheduling event happened inside the
    /// debounce window, unless forced. Returns whether a refresh actually
    /// occurred. A fetch failure aborts the pass before any host state is
    /// replaced.
    ///
    /// # Arguments
    ///
    /// * `force` - Whether to refresh even inside the debounce window
    #[instrument(name = "Registry::update_with_metadata", skip(self), err(Debug))]
    pub async fn update_with_metadata(&self, force: bool) -> Result<bool, Error> {
        // serialize reconciliation passes
        let mut init = self.init.lock().await;
        // scheduling is bursty so skip unforced passes while events are fresh
        if init.initialized && !force {
            if let Some(last) = self.last_event().await {
                if last + self.debounce >= self.clock.now() {
                    return Ok(false);
                }
            }
        }
        // block new scheduling calls while host state is replaced
        let _global = self.global.write().await;
        let Some(metadata) = self.metadata_source().await else {
            return Err(Error::new("No metadata source has been set"));
        };
        // fetch everything up front so a failure replaces nothing
        let observed = metadata.hosts().await?;
        let containers = metadata.containers().await?;
        let used = UsedResources::aggregate(&containers);
        // derive the current deployment unit membership per host
        let mut memberships: HashMap<Uuid, HashSet<String>> = HashMap::default();
        for container in &containers {
            if let (Some(host), Some(unit)) = (
                container.host_uuid,
                container.labels.get(DEPLOYMENT_UNIT_LABEL),
            ) {
                memberships.entry(host).or_default().insert(unit.clone());
            }
        }
        for host in &observed {
            // refresh the compute pools, overwriting totals and used amounts
            // with observed truth
            let totals = [
                (INSTANCE_POOL, TOTAL_AVAILABLE_INSTANCES),
                (CPU_POOL, host.milli_cpu),
                (MEMORY_POOL, host.memory_mb),
                (STORAGE_POOL, host.local_storage_mb),
            ];
            for (resource, total) in totals {
                let mut pool = ComputePool::new(resource, total, used.amount(&host.uuid, resource));
                pool.update_all = true;
                self.refresh_pool(host.uuid, ResourcePool::Compute(pool))
                    .await;
            }
            // refresh the port pool
            let ports = PortPool {
                used: used.ports(&host.uuid),
                should_update: true,
            };
            self.refresh_pool(host.uuid, ResourcePool::Port(ports)).await;
            // refresh the label pool
            let labels = LabelPool {
                labels: host.labels.clone(),
            };
            self.refresh_pool(host.uuid, ResourcePool::Label(labels))
                .await;
            // refresh the observed deployment unit membership
            let units = memberships.get(&host.uuid).cloned().unwrap_or_default();
            let current = DeploymentUnitPool::new(CURRENT_DEPLOYMENT_UNIT_POOL, units.clone());
            self.refresh_pool(host.uuid, ResourcePool::DeploymentUnit(current))
                .await;
            // seed the temp pool on first registration only since afterwards
            // it is owned by the reservation protocol
            if !self.pool_exists(host.uuid, TEMP_DEPLOYMENT_UNIT_POOL).await {
                let temp = DeploymentUnitPool::new(TEMP_DEPLOYMENT_UNIT_POOL, units);
                if let Err(error) = self
                    .create_pool(host.uuid, ResourcePool::DeploymentUnit(temp))
                    .await
                {
                    panic!("Failed to create a resource pool that should not exist: {error}");
                }
            }
        }
        // drop the hosts that vanished from observed truth
        let known: HashSet<Uuid> = observed.iter().map(|host| host.uuid).collect();
        let stale: Vec<Uuid> = init.known_hosts.difference(&known).copied().collect();
        for host in stale {
            self.remove_host(host).await;
        }
        init.known_hosts = known;
        init.initialized = true;
        // a completed refresh counts as an event so unforced passes debounce
        self.set_last_event().await;
        event!(
            Level::INFO,
            hosts = observed.len(),
            containers = containers.len(),
            "Refreshed registry from metadata"
        );
        Ok(true)
    }

    /// Refresh a pool in place, creating it on first registration
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to refresh a pool on
    /// * `pool` - The freshly observed pool
    ///
    /// # Panics
    ///
    /// A pool reported absent by update yet conflicting on create means the
    /// registry has broken its one pool per type invariant.
    async fn refresh_pool(&self, host_id: Uuid, pool: ResourcePool) {
        if !self.update_pool(host_id, pool.clone()).await {
            if let Err(error) = self.create_pool(host_id, pool).await {
                panic!("Failed to create a resource pool that should not exist: {error}");
            }
        }
    }

    /// Simulate a reservation that releases itself after a delay
    ///
    /// This exists for testing and simulated latency only and makes no
    /// production guarantee. The instance slot pool is bumped immediately
    /// and a cancellable timer decrements it after the configured delay,
    /// taking only the inner lock for the decrement.
    ///
    /// # Arguments
    ///
    /// * `host_id` - The host to simulate a reservation on
    /// * `requests` - The resources being reserved
    pub async fn simulate_delayed_release(self: Arc<Self>, host_id: Uuid, requests: &[ResourceRequest]) {
        let Some(delay) = self.simulated_release_delay else {
            return;
        };
        let mut hosts = self.hosts.lock().await;
        let Some(host) = hosts.get_mut(&host_id) else {
            return;
        };
        for request in requests {
            // only instance slot demands are simulated
            let ResourceRequest::Amount { resource, amount } = request else {
                continue;
            };
            if resource != INSTANCE_POOL {
                continue;
            }
            let Some(ResourcePool::Compute(pool)) = host.pools.get_mut(INSTANCE_POOL) else {
                continue;
            };
            pool.used += amount;
            // schedule the decrement on a cancellable timer
            let registry = Arc::clone(&self);
            let amount = *amount;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                let mut hosts = registry.hosts.lock().await;
                if let Some(host) = hosts.get_mut(&host_id) {
                    if let Some(ResourcePool::Compute(pool)) = host.pools.get_mut(INSTANCE_POOL) {
                        pool.used -= amount;
                    }
                }
            });
            self.sim_handles.lock().await.push(handle);
        }
    }

    /// Cancel any in flight simulated releases
    pub async fn abort_simulated_releases(&self) {
        for handle in self.sim_handles.lock().await.drain(..) {
            handle.abort();
        }
    }

    /// Record that a scheduling event just happened
    async fn set_last_event(&self) {
        *self.last_event.lock().await = Some(self.clock.now());
    }

    /// Get when the last scheduling event happened
    async fn last_event(&self) -> Option<DateTime<Utc>> {
        *self.last_event.lock().await
    }
}
