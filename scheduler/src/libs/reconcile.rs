//! The periodic loop driving the registry toward observed cluster truth

use std::sync::Arc;
use stevedore::{Conf, Error};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{event, Level};

use super::registry::Registry;

/// Reconcile the registry against the metadata source forever
///
/// # Arguments
///
/// * `registry` - The registry to reconcile
/// * `conf` - The Stevedore config
pub async fn run(registry: Arc<Registry>, conf: &Conf) -> Result<(), Error> {
    let mut ticker = interval(Duration::from_secs(conf.scheduler.interval));
    // a slow pass must not cause ticks to pile up behind it
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        // one failed pass must not kill the loop
        if let Err(error) = once(&registry).await {
            event!(Level::ERROR, error = %error, "Reconciliation pass failed");
        }
    }
}

/// Run a single reconciliation pass
///
/// Peeks at the observed hosts first and forces a refresh when host labels
/// have drifted since drift changes admission decisions immediately. All
/// other passes stay debounced behind recent scheduling activity.
///
/// # Arguments
///
/// * `registry` - The registry to reconcile
pub async fn once(registry: &Arc<Registry>) -> Result<(), Error> {
    let Some(metadata) = registry.metadata_source().await else {
        return Err(Error::new("No metadata source has been set"));
    };
    // peek at the observed hosts to detect label drift
    let observed = metadata.hosts().await?;
    let force = registry.labels_changed(&observed).await;
    let refreshed = registry.update_with_metadata(force).await?;
    if refreshed {
        event!(Level::INFO, forced = force, "Registry refreshed");
    } else {
        event!(Level::DEBUG, "Refresh debounced by recent scheduling activity");
    }
    Ok(())
}
