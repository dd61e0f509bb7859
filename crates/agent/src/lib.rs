//! Pod billing agent: configuration and the probe/metrics HTTP surface

pub mod api;
pub mod config;
