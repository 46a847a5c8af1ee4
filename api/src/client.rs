//! The clients for the collaborators the scheduler consumes
//!
//! The scheduler never speaks the metadata protocol itself. It consumes the
//! cluster metadata feed and the workload placement api through these traits
//! so tests can swap in fakes.

use std::net::IpAddr;
use url::Url;

use crate::models::{ContainerInfo, HostInfo};

mod error;

pub use error::Error;

/// The full current truth from the cluster metadata source
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    /// Get the full current host list
    async fn hosts(&self) -> Result<Vec<HostInfo>, Error>;

    /// Get the full current container list
    async fn containers(&self) -> Result<Vec<ContainerInfo>, Error>;
}

/// The auxiliary lookups served by the workload placement api
#[async_trait::async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Get the primary IP of any container in a deployment unit
    ///
    /// # Arguments
    ///
    /// * `deployment_unit` - The deployment unit to look up
    async fn primary_ip(&self, deployment_unit: &str) -> Result<Option<IpAddr>, Error>;
}

/// A metadata source backed by an http metadata service
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    /// The base url of the metadata service
    base: Url,
    /// The client to send requests with
    client: reqwest::Client,
}

impl HttpMetadataSource {
    /// Create a new http metadata source
    ///
    /// # Arguments
    ///
    /// * `base` - The base url of the metadata service
    pub fn new(base: &str) -> Result<Self, Error> {
        // parse and validate the base url once up front
        let base = Url::parse(base)?;
        Ok(HttpMetadataSource {
            base,
            client: reqwest::Client::new(),
        })
    }

    /// Get and deserialize one listing from the metadata service
    ///
    /// # Arguments
    ///
    /// * `route` - The route to list
    async fn list<T: serde::de::DeserializeOwned>(&self, route: &str) -> Result<Vec<T>, Error> {
        // build the url to this listing
        let url = self.base.join(route)?;
        // send our request and bail on any non success codes
        let resp = self.client.get(url).send().await?.error_for_status()?;
        // deserialize the listing
        Ok(resp.json().await?)
    }
}

#[async_trait::async_trait]
impl MetadataSource for HttpMetadataSource {
    /// Get the full current host list
    async fn hosts(&self) -> Result<Vec<HostInfo>, Error> {
        self.list("hosts").await
    }

    /// Get the full current container list
    async fn containers(&self) -> Result<Vec<ContainerInfo>, Error> {
        self.list("containers").await
    }
}

/// A container returned by the workload placement api
#[derive(Serialize, Deserialize, Debug, Clone)]
struct ApiContainer {
    /// The primary ip of this container if one has been assigned
    #[serde(default)]
    primary_ip: Option<IpAddr>,
}

/// A workload api client backed by the placement api over http
#[derive(Debug, Clone)]
pub struct HttpWorkloadApi {
    /// The base url of the placement api
    base: Url,
    /// The client to send requests with
    client: reqwest::Client,
}

impl HttpWorkloadApi {
    /// Create a new http workload api client
    ///
    /// # Arguments
    ///
    /// * `base` - The base url of the placement api
    pub fn new(base: &str) -> Result<Self, Error> {
        let base = Url::parse(base)?;
        Ok(HttpWorkloadApi {
            base,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl WorkloadApi for HttpWorkloadApi {
    /// Get the primary IP of any container in a deployment unit
    ///
    /// # Arguments
    ///
    /// * `deployment_unit` - The deployment unit to look up
    async fn primary_ip(&self, deployment_unit: &str) -> Result<Option<IpAddr>, Error> {
        // build the url listing the containers in this deployment unit
        let mut url = self.base.join("containers")?;
        url.query_pairs_mut()
            .append_pair("deploymentUnit", deployment_unit);
        // list the containers in this deployment unit
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let containers: Vec<ApiContainer> = resp.json().await?;
        // return the first container that has a primary ip
        Ok(containers.into_iter().find_map(|cont| cont.primary_ip))
    }
}
