use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("API error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct FunctionInfo {
    pub func_name: String,
    pub func_id: u16,
    pub is_grpc_service: bool,
    pub grpc_methods: Vec<String>,
}

impl From<&data_model::FunctionEntry> for FunctionInfo {
    fn from(entry: &data_model::FunctionEntry) -> Self {
        let mut grpc_methods: Vec<(String, u16)> = entry
            .grpc_method_ids
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        grpc_methods.sort_by_key(|(_, id)| *id);
        Self {
            func_name: entry.func_name.clone(),
            func_id: entry.func_id,
            is_grpc_service: entry.is_grpc_service,
            grpc_methods: grpc_methods.into_iter().map(|(name, _)| name).collect(),
        }
    }
}
