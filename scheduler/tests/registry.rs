//! Tests the registry against fake cluster services

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use stevedore::conf::{Api, Metadata, Scheduler, Tracing};
use stevedore::models::{
    ComputePool, ContainerInfo, ContextEntry, HostInfo, LabelPool, PortPool,
    ResourcePool, ResourceRequest, CPU_POOL, CURRENT_DEPLOYMENT_UNIT_POOL, DEPLOYMENT_UNIT_LABEL,
    HOST_LABELS_POOL, INSTANCE_POOL, MEMORY_POOL, PORT_POOL, REQUIRE_ANY_LABEL,
    TEMP_DEPLOYMENT_UNIT_POOL, VPC_SUBNET_LABEL,
};
use stevedore::Conf;
use stevedore_scheduler::test_utilities::{MemoryMetadataSource, StaticWorkloadApi, TestClock};
use stevedore_scheduler::{Clock, Registry};
use uuid::Uuid;

/// build a config pointing at nothing
fn conf() -> Conf {
    Conf {
        metadata: Metadata {
            url: "http://localhost:9100".to_owned(),
        },
        api: Api {
            url: "http://localhost:9101".to_owned(),
        },
        scheduler: Scheduler::default(),
        tracing: Tracing::default(),
    }
}

/// build a host observation
fn host_info(labels: &[(&str, &str)]) -> HostInfo {
    HostInfo {
        uuid: Uuid::new_v4(),
        labels: labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect(),
        milli_cpu: 2000,
        memory_mb: 4096,
        local_storage_mb: 10_000,
    }
}

/// build a placed container observation
fn placed(host: Uuid, unit: &str, cpu: i64, ports: Vec<u16>) -> ContainerInfo {
    ContainerInfo {
        host_uuid: Some(host),
        labels: HashMap::from([(DEPLOYMENT_UNIT_LABEL.to_owned(), unit.to_owned())]),
        milli_cpu_reservation: cpu,
        memory_reservation_mb: 512,
        storage_reservation_mb: 0,
        ports,
    }
}

/// attach a cpu pool to a host in a registry
async fn with_cpu_pool(registry: &Registry, host: Uuid, total: i64) {
    registry
        .create_pool(host, ResourcePool::Compute(ComputePool::new(CPU_POOL, total, 0)))
        .await
        .unwrap();
}

/// get the used amount of a compute pool snapshot
fn compute_used(pool: Option<ResourcePool>) -> i64 {
    match pool {
        Some(ResourcePool::Compute(pool)) => pool.used,
        other => panic!("expected a compute pool: {other:?}"),
    }
}

/// get the port set of a port pool snapshot
fn port_set(pool: Option<ResourcePool>) -> HashSet<u16> {
    match pool {
        Some(ResourcePool::Port(pool)) => pool.used,
        other => panic!("expected a port pool: {other:?}"),
    }
}

/// get the unit set of a deployment unit pool snapshot
fn unit_set(pool: Option<ResourcePool>) -> HashSet<String> {
    match pool {
        Some(ResourcePool::DeploymentUnit(pool)) => pool.units,
        other => panic!("expected a deployment unit pool: {other:?}"),
    }
}

#[tokio::test]
async fn create_pool_conflict_preserves_existing() {
    let registry = Registry::new(&conf());
    let host = Uuid::new_v4();
    with_cpu_pool(&registry, host, 1000).await;
    // creating the same pool type again must fail without mutating
    let conflict = registry
        .create_pool(host, ResourcePool::Compute(ComputePool::new(CPU_POOL, 9999, 50)))
        .await;
    assert!(conflict.is_err());
    let snapshot = registry.pool(host, CPU_POOL).await;
    match snapshot {
        Some(ResourcePool::Compute(pool)) => {
            assert_eq!(pool.total, 1000);
            assert_eq!(pool.used, 0);
        }
        other => panic!("expected a compute pool: {other:?}"),
    }
}

#[tokio::test]
async fn reserve_on_unknown_host_is_a_noop() {
    let registry = Registry::new(&conf());
    let requests = vec![ResourceRequest::amount(CPU_POOL, 100)];
    let data = registry
        .reserve(Uuid::new_v4(), false, &requests, &vec![])
        .await
        .unwrap();
    assert!(data.is_none());
}

#[tokio::test]
async fn release_on_unknown_host_is_a_noop() {
    let registry = Registry::new(&conf());
    let requests = vec![ResourceRequest::amount(CPU_POOL, 100)];
    registry.release(Uuid::new_v4(), &requests, &vec![]).await;
}

#[tokio::test]
async fn reserve_and_release_round_trip() {
    let registry = Registry::new(&conf());
    let host = Uuid::new_v4();
    with_cpu_pool(&registry, host, 1000).await;
    registry
        .create_pool(host, ResourcePool::Port(PortPool::default()))
        .await
        .unwrap();
    let requests = vec![
        ResourceRequest::amount(CPU_POOL, 400),
        ResourceRequest::port(8080),
    ];
    // the result data must carry the new used amount and bound ports
    let data = registry
        .reserve(host, false, &requests, &vec![])
        .await
        .unwrap()
        .expect("host should be known");
    assert_eq!(data.get(CPU_POOL), Some(&serde_json::json!(400)));
    assert_eq!(data.get("ports"), Some(&serde_json::json!([8080])));
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 400);
    assert!(port_set(registry.pool(host, PORT_POOL).await).contains(&8080));
    // releasing the same requests must restore both pools
    registry.release(host, &requests, &vec![]).await;
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 0);
    assert!(!port_set(registry.pool(host, PORT_POOL).await).contains(&8080));
}

#[tokio::test]
async fn failed_reserve_rolls_back_earlier_steps() {
    let registry = Registry::new(&conf());
    let host = Uuid::new_v4();
    with_cpu_pool(&registry, host, 1000).await;
    // a port pool where 8080 is already bound
    registry
        .create_pool(
            host,
            ResourcePool::Port(PortPool {
                used: HashSet::from([8080]),
                should_update: false,
            }),
        )
        .await
        .unwrap();
    let requests = vec![
        ResourceRequest::amount(CPU_POOL, 400),
        ResourceRequest::port(8080),
    ];
    // the port step must fail and the compute step must be rolled back
    let outcome = registry.reserve(host, false, &requests, &vec![]).await;
    assert!(outcome.is_err());
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 0);
    assert!(port_set(registry.pool(host, PORT_POOL).await).contains(&8080));
}

#[tokio::test]
async fn prioritize_applies_label_admission() {
    let registry = Registry::new(&conf());
    // a host demanding gpu workloads and a plain host
    let picky = Uuid::new_v4();
    registry
        .create_pool(
            picky,
            ResourcePool::Label(LabelPool {
                labels: HashMap::from([(REQUIRE_ANY_LABEL.to_owned(), "gpu=true".to_owned())]),
            }),
        )
        .await
        .unwrap();
    let plain = Uuid::new_v4();
    registry
        .create_pool(plain, ResourcePool::Label(LabelPool::default()))
        .await
        .unwrap();
    // a context without a gpu label must only be admitted to the plain host
    let context = vec![ContextEntry::new("unit-1", HashMap::default())];
    let ranked = registry.prioritize(&[], &context).await.unwrap();
    assert_eq!(ranked, vec![plain]);
    // a gpu context must be admitted to both
    let labels = HashMap::from([("gpu".to_owned(), "true".to_owned())]);
    let context = vec![ContextEntry::new("unit-1", labels)];
    let ranked = registry.prioritize(&[], &context).await.unwrap();
    assert_eq!(ranked.len(), 2);
}

#[tokio::test]
async fn vpc_subnet_pins_the_matching_host() {
    let registry = Registry::new(&conf());
    // two hosts in different vpc subnets
    let far = Uuid::new_v4();
    registry
        .create_pool(
            far,
            ResourcePool::Label(LabelPool {
                labels: HashMap::from([(VPC_SUBNET_LABEL.to_owned(), "10.1.0.0/16".to_owned())]),
            }),
        )
        .await
        .unwrap();
    let near = Uuid::new_v4();
    registry
        .create_pool(
            near,
            ResourcePool::Label(LabelPool {
                labels: HashMap::from([(VPC_SUBNET_LABEL.to_owned(), "10.2.0.0/16".to_owned())]),
            }),
        )
        .await
        .unwrap();
    // the deployment units primary ip lives in the second subnet
    let ip: IpAddr = "10.2.44.7".parse().unwrap();
    let api = StaticWorkloadApi::default().insert("unit-1", ip);
    registry.set_workload_api(Arc::new(api)).await;
    let context = vec![ContextEntry::new("unit-1", HashMap::default())];
    let ranked = registry.prioritize(&[], &context).await.unwrap();
    // the matching host must be the sole survivor
    assert_eq!(ranked, vec![near]);
    // a unit with no known ip must leave the candidates untouched
    let context = vec![ContextEntry::new("unit-unknown", HashMap::default())];
    let ranked = registry.prioritize(&[], &context).await.unwrap();
    assert_eq!(ranked.len(), 2);
}

#[tokio::test]
async fn reconciliation_populates_and_converges() {
    let registry = Registry::new(&conf());
    let observed = host_info(&[("zone", "a")]);
    let host = observed.uuid;
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![observed]);
    metadata.set_containers(vec![placed(host, "unit-1", 500, vec![80])]);
    registry.set_metadata_source(metadata.clone()).await;
    // the first pass must build every pool from observed truth
    assert!(registry.update_with_metadata(true).await.unwrap());
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 500);
    assert_eq!(compute_used(registry.pool(host, INSTANCE_POOL).await), 1);
    assert_eq!(compute_used(registry.pool(host, MEMORY_POOL).await), 512);
    assert_eq!(
        port_set(registry.pool(host, PORT_POOL).await),
        HashSet::from([80])
    );
    assert_eq!(
        unit_set(registry.pool(host, CURRENT_DEPLOYMENT_UNIT_POOL).await),
        HashSet::from(["unit-1".to_owned()])
    );
    match registry.pool(host, HOST_LABELS_POOL).await {
        Some(ResourcePool::Label(pool)) => {
            assert_eq!(pool.labels.get("zone"), Some(&"a".to_owned()));
        }
        other => panic!("expected a label pool: {other:?}"),
    }
    // drift the ledger with a reservation the metadata source cannot see
    let requests = vec![ResourceRequest::amount(CPU_POOL, 300)];
    registry.reserve(host, false, &requests, &vec![]).await.unwrap();
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 800);
    // a forced pass must converge the ledger back onto observed truth
    assert!(registry.update_with_metadata(true).await.unwrap());
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 500);
}

#[tokio::test]
async fn debounce_skips_unforced_passes() {
    let clock = TestClock::new();
    let registry = Registry::with_clock(&conf(), Box::new(clock.clone()));
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![host_info(&[])]);
    registry.set_metadata_source(metadata.clone()).await;
    // the initial pass always fetches
    assert!(registry.update_with_metadata(false).await.unwrap());
    assert_eq!(metadata.fetches(), 1);
    // an unforced pass inside the window must not fetch at all
    assert!(!registry.update_with_metadata(false).await.unwrap());
    assert_eq!(metadata.fetches(), 1);
    // a forced pass inside the window still fetches
    assert!(registry.update_with_metadata(true).await.unwrap());
    assert_eq!(metadata.fetches(), 2);
    // once the window passes an unforced pass fetches again
    clock.advance(chrono::Duration::seconds(6));
    assert!(registry.update_with_metadata(false).await.unwrap());
    assert_eq!(metadata.fetches(), 3);
}

#[tokio::test]
async fn scheduling_activity_extends_the_debounce_window() {
    let clock = TestClock::new();
    let registry = Registry::with_clock(&conf(), Box::new(clock.clone()));
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![host_info(&[])]);
    registry.set_metadata_source(metadata.clone()).await;
    registry.update_with_metadata(true).await.unwrap();
    // move past the window then schedule something
    clock.advance(chrono::Duration::seconds(6));
    registry.prioritize(&[], &vec![]).await.unwrap();
    // the fresh event must debounce the next unforced pass
    assert!(!registry.update_with_metadata(false).await.unwrap());
    assert_eq!(metadata.fetches(), 1);
}

#[tokio::test]
async fn vanished_hosts_are_removed() {
    let registry = Registry::new(&conf());
    let keep = host_info(&[]);
    let gone = host_info(&[]);
    let dropped = gone.uuid;
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![keep.clone(), gone]);
    registry.set_metadata_source(metadata.clone()).await;
    registry.update_with_metadata(true).await.unwrap();
    assert!(registry.pool_exists(dropped, CPU_POOL).await);
    // drop one host from observed truth
    metadata.set_hosts(vec![keep.clone()]);
    registry.update_with_metadata(true).await.unwrap();
    assert!(!registry.pool_exists(dropped, CPU_POOL).await);
    assert!(registry.pool_exists(keep.uuid, CPU_POOL).await);
}

#[tokio::test]
async fn temp_pool_is_seeded_once_then_owned_by_reservations() {
    let registry = Registry::new(&conf());
    let observed = host_info(&[]);
    let host = observed.uuid;
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![observed]);
    metadata.set_containers(vec![placed(host, "unit-1", 100, vec![])]);
    registry.set_metadata_source(metadata.clone()).await;
    registry.update_with_metadata(true).await.unwrap();
    // the first pass seeds the temp pool from observed membership
    assert_eq!(
        unit_set(registry.pool(host, TEMP_DEPLOYMENT_UNIT_POOL).await),
        HashSet::from(["unit-1".to_owned()])
    );
    // reserving against the unit claims it out of the temp pool
    let context = vec![ContextEntry::new("unit-1", HashMap::default())];
    registry.reserve(host, false, &[], &context).await.unwrap();
    assert!(unit_set(registry.pool(host, TEMP_DEPLOYMENT_UNIT_POOL).await).is_empty());
    // another pass must not undo the claim
    registry.update_with_metadata(true).await.unwrap();
    assert!(unit_set(registry.pool(host, TEMP_DEPLOYMENT_UNIT_POOL).await).is_empty());
    // releasing returns the unit
    registry.release(host, &[], &context).await;
    assert_eq!(
        unit_set(registry.pool(host, TEMP_DEPLOYMENT_UNIT_POOL).await),
        HashSet::from(["unit-1".to_owned()])
    );
}

#[tokio::test]
async fn label_drift_is_detected() {
    let registry = Registry::new(&conf());
    let mut observed = host_info(&[("zone", "a")]);
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![observed.clone()]);
    registry.set_metadata_source(metadata.clone()).await;
    registry.update_with_metadata(true).await.unwrap();
    // identical observations mean no drift
    assert!(!registry.labels_changed(&[observed.clone()]).await);
    // a changed label value is drift
    observed
        .labels
        .insert("zone".to_owned(), "b".to_owned());
    assert!(registry.labels_changed(&[observed.clone()]).await);
    // a new host is drift too
    observed.labels.insert("zone".to_owned(), "a".to_owned());
    assert!(
        registry
            .labels_changed(&[observed, host_info(&[])])
            .await
    );
}

#[tokio::test]
async fn fetch_failure_aborts_without_partial_state() {
    let registry = Registry::new(&conf());
    let observed = host_info(&[]);
    let host = observed.uuid;
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![observed]);
    metadata.set_containers(vec![placed(host, "unit-1", 700, vec![])]);
    registry.set_metadata_source(metadata.clone()).await;
    registry.update_with_metadata(true).await.unwrap();
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 700);
    // a failing source must abort the pass and leave the ledger alone
    metadata.set_fail(true);
    assert!(registry.update_with_metadata(true).await.is_err());
    assert_eq!(compute_used(registry.pool(host, CPU_POOL).await), 700);
}

#[tokio::test]
async fn simulated_releases_can_be_cancelled() {
    let mut conf = conf();
    // a delay long enough that the timer cannot fire during this test
    conf.scheduler.simulated_release_delay = Some(3600);
    let registry = Arc::new(Registry::new(&conf));
    let host = Uuid::new_v4();
    registry
        .create_pool(
            host,
            ResourcePool::Compute(ComputePool::new(INSTANCE_POOL, 100, 0)),
        )
        .await
        .unwrap();
    let requests = vec![ResourceRequest::amount(INSTANCE_POOL, 2)];
    registry
        .clone()
        .simulate_delayed_release(host, &requests)
        .await;
    assert_eq!(compute_used(registry.pool(host, INSTANCE_POOL).await), 2);
    // cancelling the timers must leave the bump in place
    registry.abort_simulated_releases().await;
    assert_eq!(compute_used(registry.pool(host, INSTANCE_POOL).await), 2);
}

#[tokio::test]
async fn test_clock_advances() {
    let clock = TestClock::new();
    let start = clock.now();
    clock.advance(chrono::Duration::seconds(30));
    assert_eq!(clock.now() - start, chrono::Duration::seconds(30));
}

#[tokio::test]
async fn deployment_unit_filter_seeds_from_new_hosts() {
    // a freshly observed host with no containers still gets empty unit pools
    let registry = Registry::new(&conf());
    let observed = host_info(&[]);
    let host = observed.uuid;
    let metadata = Arc::new(MemoryMetadataSource::default());
    metadata.set_hosts(vec![observed]);
    registry.set_metadata_source(metadata).await;
    registry.update_with_metadata(true).await.unwrap();
    assert!(unit_set(registry.pool(host, CURRENT_DEPLOYMENT_UNIT_POOL).await).is_empty());
    assert!(unit_set(registry.pool(host, TEMP_DEPLOYMENT_UNIT_POOL).await).is_empty());
}
