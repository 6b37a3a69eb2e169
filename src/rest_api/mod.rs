//! Provider REST API
//!
//! Serves the management surface (deploy, list, scale, delete) and the
//! invocation proxy. The same routes run in both modes; only the
//! [`WorkloadWriter`] behind the write endpoints differs.

use std::sync::Arc;

use kube::Client;

use crate::cache::ClusterCache;
use crate::config::OperatorConfig;
use crate::metrics::PrometheusQuery;
use crate::router::FunctionLookup;

mod dto;
mod handlers;
mod proxy;
mod server;
mod writer;

pub use dto::{
    DeleteFunctionRequest, ErrorResponse, FunctionDeployment, FunctionStatus, ScaleRequest,
};
pub use server::{build_router, run_server};
pub use writer::{ensure_secrets_exist, CustomResourceWriter, DirectWriter, WorkloadWriter};

/// Shared state behind every route
pub struct ApiState {
    pub client: Client,
    pub cache: ClusterCache,
    pub lookup: FunctionLookup,
    pub writer: Arc<dyn WorkloadWriter>,
    pub prometheus: PrometheusQuery,
    pub config: OperatorConfig,
    /// Client the invocation proxy forwards through
    pub proxy_client: reqwest::Client,
}
