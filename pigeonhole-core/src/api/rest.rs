//! REST layer: one POST route per operation, JSON in and out, service
//! errors mapped onto HTTP status codes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::schemas::*;
use super::service::IpamService;
use crate::error::{Error, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IpamService>,
    pub request_timeout: Duration,
}

/// Build the service router.
pub fn router(service: Arc<IpamService>, request_timeout: Duration) -> Router {
    let state = AppState {
        service,
        request_timeout,
    };
    Router::new()
        .route("/v1/network/add", post(network_add))
        .route("/v1/network/range", post(network_range))
        .route("/v1/pool/add", post(pool_add))
        .route("/v1/pool/range", post(pool_range))
        .route("/v1/pool/setmax", post(pool_set_max))
        .route("/v1/binding/range", post(binding_range))
        .route("/v1/address/allocate", post(allocate_address))
        .route("/v1/address/bulkallocate", post(bulk_allocate_address))
        .route("/v1/address/bind", post(bind_address))
        .route("/v1/address/release", post(release_address))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Status mapping for the error kinds the core distinguishes.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidArgument { .. } | Error::InvalidFilter { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. } | Error::Capacity { .. } | Error::NoFree { .. } => {
            StatusCode::CONFLICT
        }
        // 499 is the de-facto "client closed request" code.
        Error::Cancelled { .. } => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => {
            let status = status_for(&err);
            (
                status,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Apply the per-request deadline; an elapsed timer surfaces as CANCELLED.
async fn with_deadline<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Cancelled {
            operation: operation.to_string(),
        }),
    }
}

async fn network_add(State(state): State<AppState>, Json(req): Json<NetworkAddRequest>) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "NetworkAdd",
            state.service.network_add(req),
        )
        .await,
    )
}

async fn network_range(
    State(state): State<AppState>,
    Json(req): Json<NetworkRangeRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "NetworkRange",
            state.service.network_range(req),
        )
        .await,
    )
}

async fn pool_add(State(state): State<AppState>, Json(req): Json<PoolAddRequest>) -> Response {
    respond(
        with_deadline(state.request_timeout, "PoolAdd", state.service.pool_add(req)).await,
    )
}

async fn pool_range(State(state): State<AppState>, Json(req): Json<PoolRangeRequest>) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "PoolRange",
            state.service.pool_range(req),
        )
        .await,
    )
}

async fn pool_set_max(
    State(state): State<AppState>,
    Json(req): Json<PoolSetMaxRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "PoolSetMax",
            state.service.pool_set_max(req),
        )
        .await,
    )
}

async fn binding_range(
    State(state): State<AppState>,
    Json(req): Json<BindingRangeRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "BindingRange",
            state.service.binding_range(req),
        )
        .await,
    )
}

async fn allocate_address(
    State(state): State<AppState>,
    Json(req): Json<AllocateAddressRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "AllocateAddress",
            state.service.allocate_address(req),
        )
        .await,
    )
}

async fn bulk_allocate_address(
    State(state): State<AppState>,
    Json(req): Json<BulkAllocateAddressRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "BulkAllocateAddress",
            state.service.bulk_allocate_address(req),
        )
        .await,
    )
}

async fn bind_address(
    State(state): State<AppState>,
    Json(req): Json<BindAddressRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "BindAddress",
            state.service.bind_address(req),
        )
        .await,
    )
}

async fn release_address(
    State(state): State<AppState>,
    Json(req): Json<ReleaseAddressRequest>,
) -> Response {
    respond(
        with_deadline(
            state.request_timeout,
            "ReleaseAddress",
            state.service.release_address(req),
        )
        .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&Error::invalid_argument("cidr", "bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::not_found("network x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::already_exists("binding")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::Capacity {
                pool: "p".into(),
                maximum: 1
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::Cancelled {
                operation: "x".into()
            })
            .as_u16(),
            499
        );
        assert_eq!(
            status_for(&Error::Conflict {
                operation: "x".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
