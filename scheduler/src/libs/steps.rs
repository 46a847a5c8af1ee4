//! The ordered reserve and release steps of the reservation protocol
//!
//! Each reserve step validates every request before mutating any pool so a
//! failing step leaves no partial work behind. That keeps rolling back the
//! steps that completed before a failure an exact identity transform on pool
//! state. Rollback itself is best effort: a rollback failure is swallowed and
//! does not guarantee restored pool state.

use serde_json::json;
use std::collections::HashMap;
use stevedore::models::{
    Context, ResourcePool, ResourceRequest, PORT_POOL, TEMP_DEPLOYMENT_UNIT_POOL,
};
use stevedore::Error;
use tracing::{event, Level};

use super::registry::{Host, SchedulerData};

/// A single stage of the transactional reserve protocol
pub trait ReserveStep: Send + Sync {
    /// The name of this step for logging
    fn name(&self) -> &'static str;

    /// Commit this steps resource consumption on a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to reserve resources on
    /// * `requests` - The resources being reserved
    /// * `context` - The containers being scheduled in this call
    /// * `force` - Whether to bypass soft capacity checks
    /// * `data` - The shared result map to accumulate into
    fn reserve(
        &self,
        host: &mut Host,
        requests: &[ResourceRequest],
        context: &Context,
        force: bool,
        data: &mut SchedulerData,
    ) -> Result<(), Error>;

    /// Undo this steps resource consumption on a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to roll resources back on
    /// * `requests` - The resources that were being reserved
    /// * `context` - The containers being scheduled in this call
    fn rollback(&self, host: &mut Host, requests: &[ResourceRequest], context: &Context);
}

/// A single stage of the release protocol
///
/// Release steps run unconditionally with no rollback and no failure
/// reporting.
pub trait ReleaseStep: Send + Sync {
    /// Release this steps resources on a host
    ///
    /// # Arguments
    ///
    /// * `host` - The host to release resources on
    /// * `requests` - The resources being released
    /// * `context` - The containers being released in this call
    fn release(&self, host: &mut Host, requests: &[ResourceRequest], context: &Context);
}

/// Get the reserve steps to run in their fixed order
pub fn reserve_steps() -> Vec<Box<dyn ReserveStep>> {
    vec![
        Box::new(ComputeStep),
        Box::new(PortStep),
        Box::new(DeploymentUnitStep),
    ]
}

/// Get the release steps to run in their fixed order
pub fn release_steps() -> Vec<Box<dyn ReleaseStep>> {
    vec![
        Box::new(ComputeStep),
        Box::new(PortStep),
        Box::new(DeploymentUnitStep),
    ]
}

/// Consumes amount based requests against the hosts compute pools
pub struct ComputeStep;

impl ReserveStep for ComputeStep {
    /// The name of this step for logging
    fn name(&self) -> &'static str {
        "Compute"
    }

    /// Decrement the requested amounts from this hosts compute pools
    fn reserve(
        &self,
        host: &mut Host,
        requests: &[ResourceRequest],
        _context: &Context,
        force: bool,
        data: &mut SchedulerData,
    ) -> Result<(), Error> {
        // total up the requested amounts per resource so repeated requests
        // for the same resource are validated against their combined demand
        let mut pending: HashMap<&str, i64> = HashMap::default();
        for request in requests {
            if let ResourceRequest::Amount { resource, amount } = request {
                *pending.entry(resource).or_default() += amount;
            }
        }
        // validate every request before mutating anything
        for (resource, amount) in &pending {
            match host.pools.get(*resource) {
                Some(ResourcePool::Compute(pool)) => {
                    if !force && pool.used + amount > pool.total {
                        return Err(Error::new(format!(
                            "Host {} does not have enough {}: requested {} used {} total {}",
                            host.id, resource, amount, pool.used, pool.total
                        )));
                    }
                }
                // a missing pool is skipped rather than failed so hosts that
                // have not registered a resource yet stay schedulable
                _ => event!(
                    Level::WARN,
                    host = %host.id,
                    resource,
                    "Host does not have a pool for this resource. Skipping"
                ),
            }
        }
        // every request fits so apply them all
        for (resource, amount) in pending {
            if let Some(ResourcePool::Compute(pool)) = host.pools.get_mut(resource) {
                pool.used += amount;
                data.insert(resource.to_owned(), json!(pool.used));
            }
        }
        Ok(())
    }

    /// Add the requested amounts back to this hosts compute pools
    fn rollback(&self, host: &mut Host, requests: &[ResourceRequest], _context: &Context) {
        for request in requests {
            if let ResourceRequest::Amount { resource, amount } = request {
                if let Some(ResourcePool::Compute(pool)) = host.pools.get_mut(resource) {
                    pool.used -= amount;
                }
            }
        }
    }
}

impl ReleaseStep for ComputeStep {
    /// Add the released amounts back to this hosts compute pools
    fn release(&self, host: &mut Host, requests: &[ResourceRequest], _context: &Context) {
        for request in requests {
            if let ResourceRequest::Amount { resource, amount } = request {
                if let Some(ResourcePool::Compute(pool)) = host.pools.get_mut(resource) {
                    pool.used -= amount;
                    // a negative ledger means a release outpaced our observations
                    if pool.used < 0 {
                        event!(
                            Level::WARN,
                            host = %host.id,
                            resource,
                            used = pool.used,
                            "Compute pool went negative on release"
                        );
                    }
                }
            }
        }
    }
}

/// Consumes port requests against the hosts port pool
pub struct PortStep;

impl ReserveStep for PortStep {
    /// The name of this step for logging
    fn name(&self) -> &'static str {
        "Port"
    }

    /// Mark the requested ports as bound on this host
    fn reserve(
        &self,
        host: &mut Host,
        requests: &[ResourceRequest],
        _context: &Context,
        force: bool,
        data: &mut SchedulerData,
    ) -> Result<(), Error> {
        // get the ports requested in this call
        let ports: Vec<u16> = requests
            .iter()
            .filter_map(|request| match request {
                ResourceRequest::Port { port } => Some(*port),
                _ => None,
            })
            .collect();
        if ports.is_empty() {
            return Ok(());
        }
        let Some(ResourcePool::Port(pool)) = host.pools.get_mut(PORT_POOL) else {
            event!(
                Level::WARN,
                host = %host.id,
                "Host does not have a port pool. Skipping port reservation"
            );
            return Ok(());
        };
        // validate every port before binding anything
        if !force {
            let mut seen = std::collections::HashSet::with_capacity(ports.len());
            for port in &ports {
                if pool.used.contains(port) || !seen.insert(*port) {
                    return Err(Error::new(format!(
                        "Port {} is already reserved on host {}",
                        port, host.id
                    )));
                }
            }
        }
        // every port is free so bind them all
        for port in &ports {
            pool.used.insert(*port);
        }
        data.insert("ports".to_owned(), json!(ports));
        Ok(())
    }

    /// Unbind the requested ports on this host
    ///
    /// A forced reservation over an already bound port cannot be told apart
    /// from the prior binding here, so rolling it back releases that binding
    /// too. Rollback is best effort by design.
    fn rollback(&self, host: &mut Host, requests: &[ResourceRequest], _context: &Context) {
        if let Some(ResourcePool::Port(pool)) = host.pools.get_mut(PORT_POOL) {
            for request in requests {
                if let ResourceRequest::Port { port } = request {
                    pool.used.remove(port);
                }
            }
        }
    }
}

impl ReleaseStep for PortStep {
    /// Unbind the released ports on this host
    fn release(&self, host: &mut Host, requests: &[ResourceRequest], _context: &Context) {
        if let Some(ResourcePool::Port(pool)) = host.pools.get_mut(PORT_POOL) {
            for request in requests {
                if let ResourceRequest::Port { port } = request {
                    pool.used.remove(port);
                }
            }
        }
    }
}

/// Maintains the in flight deployment unit bookkeeping for subnet affinity
///
/// Reserving claims a context deployment unit on this host by removing it
/// from the temp pool. Releasing adds the context units back, deduplicated.
/// A later prioritization pass can then see that a unit is already pinned.
pub struct DeploymentUnitStep;

impl ReserveStep for DeploymentUnitStep {
    /// The name of this step for logging
    fn name(&self) -> &'static str {
        "DeploymentUnit"
    }

    /// Claim the first matching context deployment unit on this host
    fn reserve(
        &self,
        host: &mut Host,
        _requests: &[ResourceRequest],
        context: &Context,
        _force: bool,
        _data: &mut SchedulerData,
    ) -> Result<(), Error> {
        if context.is_empty() {
            return Ok(());
        }
        let Some(ResourcePool::DeploymentUnit(pool)) =
            host.pools.get_mut(TEMP_DEPLOYMENT_UNIT_POOL)
        else {
            event!(
                Level::INFO,
                host = %host.id,
                "Host does not have a temp deployment unit pool. Nothing to do"
            );
            return Ok(());
        };
        // claim the first context unit still present in the temp pool
        for entry in context {
            if pool.units.remove(&entry.deployment_unit) {
                event!(
                    Level::DEBUG,
                    host = %host.id,
                    unit = %entry.deployment_unit,
                    "Claimed deployment unit"
                );
                break;
            }
        }
        Ok(())
    }

    /// Claims are rebuilt by reconciliation so there is nothing to unwind
    fn rollback(&self, _host: &mut Host, _requests: &[ResourceRequest], _context: &Context) {}
}

impl ReleaseStep for DeploymentUnitStep {
    /// Return the context deployment units to this hosts temp pool
    fn release(&self, host: &mut Host, _requests: &[ResourceRequest], context: &Context) {
        if context.is_empty() {
            return;
        }
        let Some(ResourcePool::DeploymentUnit(pool)) =
            host.pools.get_mut(TEMP_DEPLOYMENT_UNIT_POOL)
        else {
            event!(
                Level::INFO,
                host = %host.id,
                "Host does not have a temp deployment unit pool. Nothing to do"
            );
            return;
        };
        for entry in context {
            pool.units.insert(entry.deployment_unit.clone());
        }
    }
}
