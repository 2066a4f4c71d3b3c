//! Host-local instance registration.
//!
//! Keeps the instances recorded in a shared, multi-host store in line
//! with the containers running on this host and with explicit local
//! overrides.  Two independent reconcilers do the work:
//!
//! * [`sync_instances`] matches containers to services by rule and
//!   registers them as instances;
//! * [`set_instances`] writes explicitly assigned instances.
//!
//! Both only ever prune instances this host owns.

pub mod address;
pub mod config;
pub mod container;
pub mod error;
pub mod feed;
pub mod hosts;
pub mod runtime;
pub mod set_instances;
pub mod store;
pub mod sync_instances;
pub mod types;
