//! Fakes for exercising the scheduler without live cluster services

use async_trait::async_trait;
use chrono::prelude::*;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use stevedore::models::{ContainerInfo, HostInfo};
use stevedore::{Error, MetadataSource, WorkloadApi};

use crate::Clock;

/// A clock that only moves when a test advances it
#[derive(Clone)]
pub struct TestClock {
    /// The current frozen time
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    /// Create a new test clock frozen at the current time
    pub fn new() -> Self {
        TestClock {
            now: Arc::new(Mutex::new(Utc::now())),
        }
    }

    /// Advance this clock by some duration
    ///
    /// # Arguments
    ///
    /// * `duration` - The amount of time to advance by
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + duration;
    }
}

impl Default for TestClock {
    /// Create a default test clock
    fn default() -> Self {
        TestClock::new()
    }
}

impl Clock for TestClock {
    /// Get the current frozen time
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// An in memory metadata source with settable observations
#[derive(Default)]
pub struct MemoryMetadataSource {
    /// The hosts to report
    hosts: Mutex<Vec<HostInfo>>,
    /// The containers to report
    containers: Mutex<Vec<ContainerInfo>>,
    /// Whether fetches should fail
    fail: AtomicBool,
    /// How many host fetches have happened
    fetches: AtomicU64,
}

impl MemoryMetadataSource {
    /// Replace the hosts this source reports
    ///
    /// # Arguments
    ///
    /// * `hosts` - The hosts to report from now on
    pub fn set_hosts(&self, hosts: Vec<HostInfo>) {
        *self.hosts.lock().unwrap() = hosts;
    }

    /// Replace the containers this source reports
    ///
    /// # Arguments
    ///
    /// * `containers` - The containers to report from now on
    pub fn set_containers(&self, containers: Vec<ContainerInfo>) {
        *self.containers.lock().unwrap() = containers;
    }

    /// Make all fetches fail or succeed from now on
    ///
    /// # Arguments
    ///
    /// * `fail` - Whether fetches should fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Get how many host fetches have happened
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for MemoryMetadataSource {
    /// List the hosts this source reports
    async fn hosts(&self) -> Result<Vec<HostInfo>, Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::new("Simulated metadata outage"));
        }
        Ok(self.hosts.lock().unwrap().clone())
    }

    /// List the containers this source reports
    async fn containers(&self) -> Result<Vec<ContainerInfo>, Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::new("Simulated metadata outage"));
        }
        Ok(self.containers.lock().unwrap().clone())
    }
}

/// A workload api backed by a fixed deployment unit to ip map
#[derive(Default)]
pub struct StaticWorkloadApi {
    /// The primary ips keyed by deployment unit
    ips: HashMap<String, IpAddr>,
}

impl StaticWorkloadApi {
    /// Add a primary ip for a deployment unit
    ///
    /// # Arguments
    ///
    /// * `deployment_unit` - The deployment unit to map
    /// * `ip` - The primary ip to report for it
    pub fn insert<D: Into<String>>(mut self, deployment_unit: D, ip: IpAddr) -> Self {
        self.ips.insert(deployment_unit.into(), ip);
        self
    }
}

#[async_trait]
impl WorkloadApi for StaticWorkloadApi {
    /// Look up the primary ip for a deployment unit
    ///
    /// # Arguments
    ///
    /// * `deployment_unit` - The deployment unit to look up
    async fn primary_ip(&self, deployment_unit: &str) -> Result<Option<IpAddr>, Error> {
        Ok(self.ips.get(deployment_unit).copied())
    }
}
