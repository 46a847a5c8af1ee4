use clap::Parser;
use std::sync::Arc;

mod args;
mod libs;

use libs::Registry;

/// The Stevedore scheduler
#[tokio::main]
async fn main() {
    // get command line args
    let args = args::Args::parse();
    // try to load a config file
    let conf = stevedore::Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer
    stevedore::utils::trace::setup("StevedoreScheduler", &conf.tracing);
    // build the clients for our collaborators
    let metadata = stevedore::HttpMetadataSource::new(&conf.metadata.url)
        .expect("Failed to build metadata source");
    let api =
        stevedore::HttpWorkloadApi::new(&conf.api.url).expect("Failed to build workload api");
    // build our registry and hand it the collaborator handles
    let registry = Arc::new(Registry::new(&conf));
    registry.set_metadata_source(Arc::new(metadata)).await;
    registry.set_workload_api(Arc::new(api)).await;
    // drive the reconciliation loop for the life of the process
    libs::reconcile::run(registry, &conf)
        .await
        .expect("Scheduler crashed");
}
