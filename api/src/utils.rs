//! Utilities for Stevedore

pub mod trace;
