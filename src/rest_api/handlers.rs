//! HTTP handlers for the provider API

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{error, instrument, warn};

use crate::cache::ObjectKey;
use crate::controller::replicas::update_replicas;
use crate::crd::{validate_function_name, Function};
use crate::error::Error;

use super::dto::{DeleteFunctionRequest, ErrorResponse, FunctionDeployment, FunctionStatus, ScaleRequest};
use super::writer::ensure_secrets_exist;
use super::ApiState;

type ErrorReply = (StatusCode, Json<ErrorResponse>);

/// Map an error onto the wire, logging the ones that are our fault
pub(super) fn error_response(err: Error) -> ErrorReply {
    let (status, code) = match &err {
        Error::ValidationError(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::FunctionNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        Error::NoReadyReplicas(_) => (StatusCode::SERVICE_UNAVAILABLE, "no_ready_replicas"),
        Error::KubeError(kube::Error::Api(e)) if e.code == 404 => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        Error::KubeError(kube::Error::Api(e)) if e.code == 409 => {
            (StatusCode::CONFLICT, "conflict")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {err}");
    }
    (status, Json(ErrorResponse::new(code, &err.to_string())))
}

#[derive(Debug, Deserialize)]
pub struct NamespaceQuery {
    namespace: Option<String>,
}

/// `GET /system/functions`
#[instrument(skip(state))]
pub async fn list_functions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<Vec<FunctionStatus>>, ErrorReply> {
    let namespace = state
        .config
        .resolve_namespace(query.namespace.as_deref())
        .map_err(error_response)?;

    let functions: Vec<FunctionStatus> = state
        .cache
        .deployments()
        .state()
        .iter()
        .filter(|d| d.metadata.namespace.as_deref() == Some(namespace.as_str()))
        .filter_map(|d| FunctionStatus::from_deployment(d))
        .collect();

    Ok(Json(functions))
}

/// `GET /system/function/{name}`
#[instrument(skip(state), fields(name = %name))]
pub async fn get_function(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<FunctionStatus>, ErrorReply> {
    let namespace = state
        .config
        .resolve_namespace(query.namespace.as_deref())
        .map_err(error_response)?;
    let key = ObjectKey::new(namespace.clone(), name.clone());

    let deployment = state
        .cache
        .deployment(&key)
        .ok_or_else(|| error_response(Error::FunctionNotFound(key.to_string())))?;
    let mut status = FunctionStatus::from_deployment(&deployment)
        .ok_or_else(|| error_response(Error::FunctionNotFound(key.to_string())))?;

    // Traffic reading is best effort, a cold metrics backend never 500s this.
    match state.prometheus.query_invocation_total(&name, &namespace).await {
        Ok(total) => status.invocation_count = Some(total),
        Err(err) => warn!(function = %key, "invocation count unavailable: {err}"),
    }

    Ok(Json(status))
}

/// `POST /system/functions`
#[instrument(skip(state, request), fields(name = %request.service))]
pub async fn deploy_function(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<FunctionDeployment>,
) -> Result<StatusCode, ErrorReply> {
    let function = prepare_function(&state, request).await?;
    state
        .writer
        .deploy(&function)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

/// `PUT /system/functions`
#[instrument(skip(state, request), fields(name = %request.service))]
pub async fn update_function(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<FunctionDeployment>,
) -> Result<StatusCode, ErrorReply> {
    let function = prepare_function(&state, request).await?;
    state
        .writer
        .update(&function)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

/// `DELETE /system/functions`
#[instrument(skip(state, request), fields(name = %request.function_name))]
pub async fn delete_function(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<DeleteFunctionRequest>,
) -> Result<StatusCode, ErrorReply> {
    let namespace = state
        .config
        .resolve_namespace(request.namespace.as_deref())
        .map_err(error_response)?;

    state
        .writer
        .delete(&namespace, &request.function_name)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

/// `POST /system/scale-function/{name}`
#[instrument(skip(state, request), fields(name = %name))]
pub async fn scale_function(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<StatusCode, ErrorReply> {
    let namespace = state
        .config
        .resolve_namespace(request.namespace.as_deref())
        .map_err(error_response)?;
    let key = ObjectKey::new(namespace, name);

    update_replicas(&state.client, &state.cache, &key, request.replicas)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

/// Validate a deploy or update request and turn it into a Function
async fn prepare_function(
    state: &ApiState,
    request: FunctionDeployment,
) -> Result<Function, ErrorReply> {
    validate_function_name(&request.service)
        .map_err(|e| error_response(Error::ValidationError(format!("{}: {}", e.field, e.message))))?;

    let namespace = state
        .config
        .resolve_namespace(request.namespace.as_deref())
        .map_err(error_response)?;

    let function = request.into_function(&namespace);
    if let Some(message) = function.spec.validate_message() {
        return Err(error_response(Error::ValidationError(message)));
    }

    ensure_secrets_exist(&state.client, &namespace, function.spec.secrets.as_ref())
        .await
        .map_err(error_response)?;

    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_statuses() {
        let (status, _) = error_response(Error::ValidationError("bad".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(Error::FunctionNotFound("figlet".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(Error::Conflict("figlet".into()));
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = error_response(Error::NoReadyReplicas("figlet".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = error_response(Error::CacheSync("deployments".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_response_passes_kube_api_codes() {
        let api_error = |code: u16| {
            Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Tested".to_string(),
                code,
            }))
        };

        let (status, _) = error_response(api_error(404));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = error_response(api_error(409));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = error_response(api_error(500));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_carries_message() {
        let (_, Json(body)) = error_response(Error::ValidationError(
            "spec.image: image must not be empty".to_string(),
        ));
        assert_eq!(body.error, "invalid_request");
        assert!(body.message.contains("spec.image"));
    }
}
