//! FnStack-K8s: Kubernetes control-plane bridge for the FnStack functions platform
//!
//! This crate translates FnStack function definitions into Kubernetes
//! Deployments and Services, watches the resulting workloads, and serves the
//! provider REST API used by the FnStack gateway.

pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod rest_api;
pub mod router;

pub use crate::error::{Error, Result};
