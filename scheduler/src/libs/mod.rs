mod clock;
mod filters;
pub mod reconcile;
mod registry;
mod steps;

pub use clock::{Clock, SystemClock};
pub use registry::{Host, HostMap, Registry, SchedulerData};
