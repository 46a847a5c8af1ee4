//! Sets up tracing for Stevedore on stdout

use tracing_subscriber::prelude::*;

use crate::conf::Tracing;

/// Setup our local tracer
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    // build our local tracing layer with the configured level
    let local = tracing_subscriber::fmt::layer().with_filter(conf.level.to_filter());
    // init our tracing registry
    tracing_subscriber::registry()
        .with(local)
        .try_init()
        .expect("Failed to register tracers/subscribers");
    tracing::event!(
        tracing::Level::INFO,
        service = name,
        level = %format!("{:?}", conf.level),
        "Sending traces to stdout"
    );
}
