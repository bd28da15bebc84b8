//! Hestia — on-demand HTTP gateway
//!
//! Sits in front of a fleet of heterogeneous backend services and proxies
//! client requests transparently while managing each service's lifecycle:
//! cold services are started on demand, requests queue until readiness, and
//! idle services are shut down after a configurable period of inactivity.

pub mod api;
pub mod cli;
pub mod config;
pub mod executor;
pub mod idle;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod proxy;
pub mod queue;
pub mod readiness;
pub mod registry;
pub mod startup;
pub mod strategy;
