//! HTTP surface of the Masterchef control plane.
//!
//! Every route lives under `/v1` except `/healthz`. Handlers are thin: they
//! decode the request, call into [`masterchef_core::ControlPlane`] and map
//! [`masterchef_core::ControlError`] kinds onto status codes via
//! [`errors::AppError`].

pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;

use axum::{Router, http::HeaderName, routing::get};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Router with request-id propagation and HTTP tracing applied.
pub fn create_app(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route("/healthz", get(handlers::health::health_handler))
        .merge(routes::create_api_router())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        .with_state(state)
}
