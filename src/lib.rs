//! Streaming downsampling plus a query-rewriting proxy for a Prometheus
//! remote read/write backend.
//!
//! The downsampling engine periodically pulls raw samples over remote read,
//! aggregates them per configured resolution and writes the results back
//! under `<metric>:downsample_<interval>_<agg>` names. The proxy rewrites
//! eligible queries onto those pre-aggregated series when the queried span
//! makes the coarser resolution adequate.

pub mod common;
pub mod config;
pub mod downsample;
pub mod error;
pub mod naming;
pub mod proxy;
pub mod remote;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
