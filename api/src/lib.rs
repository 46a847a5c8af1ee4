//! The shared models, clients, and config for the Stevedore scheduler

#[macro_use]
extern crate serde_derive;

pub mod client;
pub mod conf;
pub mod models;
pub mod utils;

pub use client::{Error, HttpMetadataSource, HttpWorkloadApi, MetadataSource, WorkloadApi};
pub use conf::Conf;
