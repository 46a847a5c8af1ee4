//! The scheduling engine deciding which hosts can legally accept new workloads

mod libs;

pub use libs::{Clock, Host, HostMap, Registry, SchedulerData, SystemClock};

// expose test utilities if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;
