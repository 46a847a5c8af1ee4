//! The admission filters that narrow and order candidate hosts

use cidr::IpCidr;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use stevedore::models::{
    Context, ResourcePool, ResourceRequest, HOST_LABELS_POOL, PER_HOST_SUBNET_LABEL,
    REQUESTED_IP_LABEL, REQUIRE_ANY_LABEL, VPC_SUBNET_LABEL,
};
use stevedore::WorkloadApi;
use tracing::{event, Level};
use uuid::Uuid;

use super::registry::{Host, HostMap};

/// A narrowing or reordering step applied to the candidate host set
#[async_trait::async_trait]
pub trait HostFilter: Send + Sync {
    /// Narrow or reorder the candidate hosts for one scheduling call
    ///
    /// # Arguments
    ///
    /// * `hosts` - The current host map
    /// * `api` - The workload api handle if one has been set
    /// * `requests` - The resources being requested
    /// * `context` - The containers being scheduled in this call
    /// * `candidates` - The candidate hosts to narrow
    async fn filter(
        &self,
        hosts: &HostMap,
        api: Option<&Arc<dyn WorkloadApi>>,
        requests: &[ResourceRequest],
        context: &Context,
        candidates: Vec<Uuid>,
    ) -> Vec<Uuid>;
}

/// Get the filters to apply in their fixed order
pub fn filters() -> Vec<Box<dyn HostFilter>> {
    vec![Box::new(LabelFilter), Box::new(VpcSubnetFilter)]
}

/// Get a non empty label value from a hosts label pool
///
/// # Arguments
///
/// * `host` - The host to read labels from
/// * `label` - The label to look up
fn host_label<'a>(host: &'a Host, label: &str) -> Option<&'a str> {
    match host.pools.get(HOST_LABELS_POOL) {
        Some(ResourcePool::Label(pool)) => pool.labels.get(label).map(String::as_str),
        _ => None,
    }
    .filter(|value| !value.is_empty())
}

/// Parse a comma separated `key` / `key=value` constraint list
///
/// The whole value is case folded before parsing since label comparisons are
/// case insensitive.
///
/// # Arguments
///
/// * `value` - The raw label value to parse
fn parse_label(value: &str) -> HashMap<String, String> {
    let value = value.to_lowercase();
    let mut parsed = HashMap::default();
    for part in value.split(',') {
        let part = part.trim();
        match part.split_once('=') {
            Some((key, value)) => parsed.insert(key.to_owned(), value.to_owned()),
            None => parsed.insert(part.to_owned(), String::new()),
        };
    }
    parsed
}

/// Get the case folded labels of every container in a scheduling context
///
/// # Arguments
///
/// * `context` - The containers being scheduled in this call
fn context_labels(context: &Context) -> Vec<HashMap<String, String>> {
    context
        .iter()
        .map(|entry| {
            entry
                .labels
                .iter()
                .map(|(key, value)| (key.to_lowercase(), value.to_lowercase()))
                .collect()
        })
        .collect()
}

/// A label based admission constraint evaluated per host
trait Constraint: Send + Sync {
    /// Check whether a host satisfies this constraint for a context
    ///
    /// # Arguments
    ///
    /// * `host` - The host to check
    /// * `labels` - The case folded labels of every context container
    fn matches(&self, host: &Host, labels: &[HashMap<String, String>]) -> bool;
}

/// Get all label constraints in their fixed order
fn constraints() -> Vec<Box<dyn Constraint>> {
    vec![Box::new(RequireAny), Box::new(RequestedIp)]
}

/// Admits a host only if some context container satisfies one of the tokens
/// in the hosts require any label
///
/// A bare `key` token means the container must carry the key at any value
/// while `key=value` requires an exact match. Hosts without the label always
/// match.
struct RequireAny;

impl Constraint for RequireAny {
    fn matches(&self, host: &Host, labels: &[HashMap<String, String>]) -> bool {
        // hosts without a require any label are always admitted
        let Some(value) = host_label(host, REQUIRE_ANY_LABEL) else {
            return true;
        };
        let tokens = parse_label(value);
        for (key, value) in &tokens {
            for container in labels {
                let satisfied = if value.is_empty() {
                    container.contains_key(key)
                } else {
                    container.get(key) == Some(value)
                };
                if satisfied {
                    return true;
                }
            }
        }
        false
    }
}

/// Admits a host only if any requested IP in the context falls inside the
/// hosts declared per host subnet
///
/// A malformed CIDR always rejects the host. A missing subnet label or a
/// context without a requested IP is permissive.
struct RequestedIp;

impl Constraint for RequestedIp {
    fn matches(&self, host: &Host, labels: &[HashMap<String, String>]) -> bool {
        let Some(subnet) = host_label(host, PER_HOST_SUBNET_LABEL) else {
            return true;
        };
        // a malformed subnet must reject the host rather than misplace an ip
        let Ok(subnet) = subnet.parse::<IpCidr>() else {
            return false;
        };
        for container in labels {
            if let Some(requested) = container.get(REQUESTED_IP_LABEL) {
                return requested
                    .parse::<IpAddr>()
                    .map(|ip| subnet.contains(&ip))
                    .unwrap_or(false);
            }
        }
        true
    }
}

/// Admits only the hosts that satisfy every label constraint
pub struct LabelFilter;

#[async_trait::async_trait]
impl HostFilter for LabelFilter {
    /// Narrow the candidates to the hosts matching all label constraints
    async fn filter(
        &self,
        hosts: &HostMap,
        _api: Option<&Arc<dyn WorkloadApi>>,
        _requests: &[ResourceRequest],
        context: &Context,
        candidates: Vec<Uuid>,
    ) -> Vec<Uuid> {
        let constraints = constraints();
        // fold the context labels once for all hosts
        let labels = context_labels(context);
        candidates
            .into_iter()
            .filter(|id| match hosts.get(id) {
                Some(host) => constraints
                    .iter()
                    .all(|constraint| constraint.matches(host, &labels)),
                None => false,
            })
            .collect()
    }
}

/// Pins the candidates to the first host whose vpc subnet contains a context
/// deployment units primary IP
///
/// This is not an AND constraint like the label filter. The first match wins
/// and becomes the sole surviving candidate. When nothing matches the
/// original candidate list passes through unchanged.
pub struct VpcSubnetFilter;

#[async_trait::async_trait]
impl HostFilter for VpcSubnetFilter {
    /// Narrow the candidates to a matching vpc subnet host if one exists
    async fn filter(
        &self,
        hosts: &HostMap,
        api: Option<&Arc<dyn WorkloadApi>>,
        _requests: &[ResourceRequest],
        context: &Context,
        candidates: Vec<Uuid>,
    ) -> Vec<Uuid> {
        // without a workload api we cannot look anything up
        let Some(api) = api else {
            return candidates;
        };
        for id in &candidates {
            let Some(host) = hosts.get(id) else {
                continue;
            };
            let Some(subnet) = host_label(host, VPC_SUBNET_LABEL) else {
                continue;
            };
            let Ok(subnet) = subnet.parse::<IpCidr>() else {
                continue;
            };
            // this lookup runs while the scheduling locks are held which is
            // an accepted latency trade off
            for entry in context {
                let ip = match api.primary_ip(&entry.deployment_unit).await {
                    Ok(Some(ip)) => ip,
                    Ok(None) => continue,
                    Err(error) => {
                        event!(
                            Level::ERROR,
                            unit = %entry.deployment_unit,
                            error = %error,
                            "Failed to look up a primary ip"
                        );
                        continue;
                    }
                };
                if subnet.contains(&ip) {
                    event!(Level::DEBUG, host = %id, "Vpc subnet filter matched host");
                    return vec![*id];
                }
            }
        }
        candidates
    }
}

/// Order candidates by descending free capacity
///
/// Hosts are ranked on the compute pools named by the amount requests, or on
/// every compute pool when no amounts were requested. Ordering among equally
/// ranked hosts is unspecified.
///
/// # Arguments
///
/// * `hosts` - The current host map
/// * `requests` - The resources being requested
/// * `candidates` - The candidate hosts to order
pub fn rank_hosts(
    hosts: &HostMap,
    requests: &[ResourceRequest],
    candidates: Vec<Uuid>,
) -> Vec<Uuid> {
    // the resources to rank on
    let requested: Vec<&str> = requests
        .iter()
        .filter_map(|request| match request {
            ResourceRequest::Amount { resource, .. } => Some(resource.as_str()),
            _ => None,
        })
        .collect();
    // score each candidate by its summed free capacity fractions
    let mut scored: Vec<(f64, Uuid)> = candidates
        .into_iter()
        .map(|id| (free_capacity(hosts, &id, &requested), id))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, id)| id).collect()
}

/// Sum the free capacity fractions of a hosts compute pools
///
/// # Arguments
///
/// * `hosts` - The current host map
/// * `id` - The host to score
/// * `requested` - The resources to score on, or empty for all of them
fn free_capacity(hosts: &HostMap, id: &Uuid, requested: &[&str]) -> f64 {
    let Some(host) = hosts.get(id) else {
        return 0.0;
    };
    host.pools
        .values()
        .filter_map(|pool| match pool {
            ResourcePool::Compute(pool) => Some(pool),
            _ => None,
        })
        .filter(|pool| requested.is_empty() || requested.contains(&pool.resource.as_str()))
        .map(|pool| (pool.total - pool.used) as f64 / pool.total.max(1) as f64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stevedore::models::{ComputePool, ContextEntry, LabelPool, CPU_POOL};

    /// build a host carrying some labels
    fn labeled_host(labels: &[(&str, &str)]) -> Host {
        let mut host = Host::new(Uuid::new_v4());
        let labels = labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        host.pools.insert(
            HOST_LABELS_POOL.to_owned(),
            ResourcePool::Label(LabelPool { labels }),
        );
        host
    }

    /// build a context with one container carrying some labels
    fn context(labels: &[(&str, &str)]) -> Context {
        let labels = labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        vec![ContextEntry::new("unit-1", labels)]
    }

    #[test]
    fn parse_label_tokens() {
        let parsed = parse_label("GPU=True, ssd");
        assert_eq!(parsed.get("gpu"), Some(&"true".to_owned()));
        assert_eq!(parsed.get("ssd"), Some(&String::new()));
    }

    #[test]
    fn require_any_missing_label_always_matches() {
        let host = labeled_host(&[]);
        // any context must match a host without the label
        assert!(RequireAny.matches(&host, &context_labels(&context(&[]))));
        assert!(RequireAny.matches(&host, &context_labels(&context(&[("a", "b")]))));
    }

    #[test]
    fn require_any_admission() {
        let host = labeled_host(&[(REQUIRE_ANY_LABEL, "key=value,key2")]);
        // a container with key2 at any value is admitted
        let labels = context_labels(&context(&[("key2", "anything")]));
        assert!(RequireAny.matches(&host, &labels));
        // a container with the exact key=value is admitted
        let labels = context_labels(&context(&[("key", "value")]));
        assert!(RequireAny.matches(&host, &labels));
        // a container with neither is rejected
        let labels = context_labels(&context(&[("key", "other")]));
        assert!(!RequireAny.matches(&host, &labels));
    }

    #[test]
    fn require_any_gpu_example() {
        let host = labeled_host(&[(REQUIRE_ANY_LABEL, "gpu=true")]);
        let admitted = context_labels(&context(&[("gpu", "true")]));
        assert!(RequireAny.matches(&host, &admitted));
        let rejected = context_labels(&context(&[("gpu", "false")]));
        assert!(!RequireAny.matches(&host, &rejected));
    }

    #[test]
    fn requested_ip_inside_subnet() {
        let host = labeled_host(&[(PER_HOST_SUBNET_LABEL, "10.42.0.0/16")]);
        let inside = context_labels(&context(&[(REQUESTED_IP_LABEL, "10.42.7.9")]));
        assert!(RequestedIp.matches(&host, &inside));
        let outside = context_labels(&context(&[(REQUESTED_IP_LABEL, "10.43.0.1")]));
        assert!(!RequestedIp.matches(&host, &outside));
        // no requested ip in the context is permissive
        assert!(RequestedIp.matches(&host, &context_labels(&context(&[]))));
    }

    #[test]
    fn malformed_subnet_rejects_host() {
        let host = labeled_host(&[(PER_HOST_SUBNET_LABEL, "not-a-cidr")]);
        let labels = context_labels(&context(&[(REQUESTED_IP_LABEL, "10.42.7.9")]));
        assert!(!RequestedIp.matches(&host, &labels));
    }

    #[test]
    fn rank_orders_by_free_capacity() {
        let mut hosts = HostMap::default();
        // a nearly full host
        let mut full = Host::new(Uuid::new_v4());
        full.pools.insert(
            CPU_POOL.to_owned(),
            ResourcePool::Compute(ComputePool::new(CPU_POOL, 1000, 900)),
        );
        // a mostly empty host
        let mut empty = Host::new(Uuid::new_v4());
        empty.pools.insert(
            CPU_POOL.to_owned(),
            ResourcePool::Compute(ComputePool::new(CPU_POOL, 1000, 100)),
        );
        let (full_id, empty_id) = (full.id, empty.id);
        hosts.insert(full.id, full);
        hosts.insert(empty.id, empty);
        let requests = vec![ResourceRequest::amount(CPU_POOL, 100)];
        let ranked = rank_hosts(&hosts, &requests, vec![full_id, empty_id]);
        assert_eq!(ranked, vec![empty_id, full_id]);
    }
}
