use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use data_model::{CallStatus, FuncCall, FuncCallContext, FunctionRegistry};
use metrics::{gateway_stats, Increment, Timer};
use serde::Deserialize;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    connections::{next_conn_id, HttpCallConnection},
    dispatch::DispatchCore,
    http_objects::{ApiError, FunctionInfo},
};

#[derive(Clone)]
pub struct RouteState {
    pub core: Arc<DispatchCore>,
    pub registry: Arc<FunctionRegistry>,
    pub stats: Arc<gateway_stats::Metrics>,
    pub metrics_registry: Arc<prometheus::Registry>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/invoke/:func", post(invoke_function))
        .route("/invoke/:service/:method", post(invoke_grpc_method))
        .route("/functions", get(list_functions))
        .route("/metrics", get(export_metrics))
        .with_state(route_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// The optional second listener carries only gRPC-flavored invocations,
/// addressed the way gRPC paths are shaped.
pub fn create_grpc_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/:service/:method", post(invoke_grpc_method))
        .with_state(route_state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
struct InvokeParams {
    /// `?async=true` acknowledges acceptance instead of waiting for the
    /// function's output.
    #[serde(rename = "async", default)]
    is_async: bool,
}

async fn invoke_function(
    State(state): State<RouteState>,
    Path(func_name): Path<String>,
    Query(params): Query<InvokeParams>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ctx = FuncCallContext::new(func_name, params.is_async, body);
    invoke(state, ctx).await
}

async fn invoke_grpc_method(
    State(state): State<RouteState>,
    Path((service, method)): Path<(String, String)>,
    Query(params): Query<InvokeParams>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ctx = FuncCallContext::with_method(service, method, params.is_async, body);
    invoke(state, ctx).await
}

async fn invoke(state: RouteState, ctx: FuncCallContext) -> Result<Response, ApiError> {
    let _inflight = Increment::inc(&state.stats.inflight_requests, &[]);
    let _timer = Timer::start(&state.stats.http_request_duration);
    let (finished_tx, finished_rx) = oneshot::channel();
    let conn = Arc::new(HttpCallConnection::new(next_conn_id(), finished_tx));
    state.core.register_client_connection(conn.clone());

    let mut guard = CallGuard {
        core: state.core.clone(),
        conn: conn.clone(),
        func_call: None,
    };
    guard.func_call = state.core.on_new_call(conn, ctx);

    match finished_rx.await {
        Ok(mut ctx) => Ok(render_finished(&mut ctx)),
        Err(_) => Err(ApiError::internal_error("call finished without a response")),
    }
}

/// Keeps the connection table honest: a handler that is dropped before the
/// call finished (client went away) cancels the call and always removes the
/// connection registration.
struct CallGuard {
    core: Arc<DispatchCore>,
    conn: Arc<HttpCallConnection>,
    func_call: Option<FuncCall>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        use crate::connections::ClientConnection;
        if !self.conn.finished() {
            if let Some(func_call) = self.func_call {
                self.core.on_call_cancelled(func_call);
            }
        }
        self.core.on_client_connection_closed(self.conn.id());
    }
}

fn render_finished(ctx: &mut FuncCallContext) -> Response {
    match ctx.status {
        CallStatus::Success => (StatusCode::OK, ctx.take_output()).into_response(),
        CallStatus::NotFound => ApiError::not_found("function not found").into_response(),
        CallStatus::Failed => ApiError::internal_error("function call failed").into_response(),
        CallStatus::Pending => {
            ApiError::internal_error("call delivered without a status").into_response()
        }
    }
}

async fn list_functions(State(state): State<RouteState>) -> Json<Vec<FunctionInfo>> {
    Json(state.registry.entries().iter().map(FunctionInfo::from).collect())
}

async fn export_metrics(State(state): State<RouteState>) -> Result<String, ApiError> {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&state.metrics_registry.gather())
        .map_err(|e| ApiError::internal_error(&format!("failed to encode metrics: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_statuses_map_to_http() {
        let mut ctx = FuncCallContext::new("echo", false, Bytes::new());
        ctx.status = CallStatus::Success;
        ctx.append_output(b"OUT");
        assert_eq!(render_finished(&mut ctx).status(), StatusCode::OK);

        let mut ctx = FuncCallContext::new("echo", false, Bytes::new());
        ctx.status = CallStatus::NotFound;
        assert_eq!(render_finished(&mut ctx).status(), StatusCode::NOT_FOUND);

        let mut ctx = FuncCallContext::new("echo", false, Bytes::new());
        ctx.status = CallStatus::Failed;
        assert_eq!(
            render_finished(&mut ctx).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
