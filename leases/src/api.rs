// REST surface of the lease manager

use crate::{
    abort::AbortLeaseRequest,
    manager::LeaseManager,
    report::render_cluster,
    Error, ServerId,
};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub const LEASE_MANAGER_PATH: &str = "/_api/lease-manager";

#[derive(Clone)]
struct ApiState {
    manager: LeaseManager,
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    /// Only this member's report
    server: Option<String>,
    /// Only this node's report, no fan out
    #[serde(default)]
    local: bool,
    /// Render descriptions instead of bare ids
    #[serde(default)]
    details: bool,
}

/// Error reply in the `{"error":true,...}` envelope
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status.as_u16();
        let body = json!({
            "error": true,
            "code": code,
            "errorNum": code,
            "errorMessage": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

fn ok(result: Option<Value>) -> Json<Value> {
    let mut body = json!({"error": false, "code": 200});
    if let (Some(result), Some(object)) = (result, body.as_object_mut()) {
        object.insert("result".to_string(), result);
    }
    Json(body)
}

/// Router serving `GET` and `DELETE` on [`LEASE_MANAGER_PATH`]. Every other
/// verb on that path, and every other path, answers 404.
pub fn router(manager: LeaseManager) -> Router {
    Router::new()
        .route(
            LEASE_MANAGER_PATH,
            get(get_leases)
                .delete(abort_leases)
                .fallback(unsupported_verb),
        )
        .fallback(unknown_path)
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { manager })
}

async fn get_leases(
    State(state): State<ApiState>,
    query: Result<Query<ReportQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;

    let report = if query.local {
        state.manager.local_report()
    } else if let Some(server) = query.server {
        state
            .manager
            .collect_report_for_server(&ServerId::from(server))
            .await?
    } else {
        state.manager.collect_full_report().await?
    };

    Ok(ok(Some(render_cluster(&report, query.details))))
}

async fn abort_leases(State(state): State<ApiState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: AbortLeaseRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Rejecting malformed abort request");
        Error::MalformedRequest(e.to_string())
    })?;

    let aborted = state.manager.abort_leases_for_server(&request);
    debug!(server = %request.server, aborted, "Abort request served");
    Ok(ok(None))
}

async fn unsupported_verb(method: Method) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        format!("unsupported method {method} for {LEASE_MANAGER_PATH}"),
    )
}

async fn unknown_path(uri: Uri) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, format!("unknown path {}", uri.path()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_status() {
        let error = ApiError::from(Error::UnknownServer {
            server: ServerId::from("PRMR-9"),
        });
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert!(error.message.contains("PRMR-9"));

        let error = ApiError::from(Error::MalformedRequest("bad".into()));
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_success_envelope() {
        assert_eq!(ok(None).0, json!({"error": false, "code": 200}));
        assert_eq!(
            ok(Some(json!({}))).0,
            json!({"error": false, "code": 200, "result": {}})
        );
    }
}
