//! Server discovery.
//!
//! A [`DiscoveryService`] polls a [`CandidateSource`] (the Docker daemon in
//! production, a fake in tests), keeps the candidates carrying the marker
//! label and hands each one to a [`ServerDiscoveryHandler`] as a
//! [`crate::router::ServerRecord`]. The router is the usual handler;
//! re-reporting a known server is an idempotent upsert there.

pub mod docker;
pub mod service;
pub mod types;

pub use docker::DockerSource;
pub use service::DiscoveryService;
pub use types::{
    to_server_record, CandidateSource, DiscoverySettings, RawRecord, ServerDiscoveryHandler,
};
