//! review-operator: Kubernetes operator for code-review server clusters
//!
//! The crate is built around a reusable reconciliation engine
//! ([`controller`]): a per-key work queue, a watch dispatcher, a DAG
//! executor over dependent resources, an applier with conflict retry,
//! garbage collection and a status aggregator. [`crd::ReviewCluster`] and
//! its workflow in [`controller::resources`] are the first consumer.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
