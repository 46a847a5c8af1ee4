//! The shared config for Stevedore

use std::path::Path;

/// Helps serde default the reconciliation debounce window to 5 seconds
fn default_debounce() -> u64 {
    5
}

/// Helps serde default the reconciliation tick interval to 30 seconds
fn default_interval() -> u64 {
    30
}

/// The log level to use
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Do not log any info
    Off,
    /// Log at the error level
    Error,
    /// Log at the warning level
    Warn,
    /// Log at the info level
    Info,
    /// Log at the debug level
    Debug,
    /// Log at the tracing level
    Trace,
}

/// Default the log level to Info
impl Default for LogLevel {
    /// Set the default log level to info
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Cast this log level to a tracing filter
    #[must_use]
    pub fn to_filter(&self) -> tracing::metadata::LevelFilter {
        match self {
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
        }
    }
}

/// Where to find the cluster metadata source
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// The base url of the metadata service
    pub url: String,
}

/// Where to find the workload placement api
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Api {
    /// The base url of the placement api
    pub url: String,
}

/// Settings for the scheduling engine itself
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Scheduler {
    /// How long after a scheduling event to skip unforced reconciliation
    #[serde(default = "default_debounce")]
    pub debounce: u64,
    /// How often the reconciliation loop ticks in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// How long simulated reservations live before being released
    ///
    /// This exists for testing and simulated latency only and is off
    /// by default.
    #[serde(default)]
    pub simulated_release_delay: Option<u64>,
}

impl Default for Scheduler {
    /// Create a default scheduler config
    fn default() -> Self {
        Scheduler {
            debounce: default_debounce(),
            interval: default_interval(),
            simulated_release_delay: None,
        }
    }
}

/// The tracing settings for Stevedore
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Tracing {
    /// The level to log at
    #[serde(default)]
    pub level: LogLevel,
}

/// The config for Stevedore
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Conf {
    /// The metadata source settings
    pub metadata: Metadata,
    /// The workload placement api settings
    pub api: Api,
    /// The scheduling engine settings
    #[serde(default)]
    pub scheduler: Scheduler,
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let conf: Conf = config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("stevedore")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(conf)
    }
}
