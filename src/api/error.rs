use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::handlers::ApiResponse;
use crate::error::ReconcileError;

/// 接口错误, 按错误类型映射 HTTP 状态码
#[derive(Debug)]
pub struct ApiError(pub ReconcileError);

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ReconcileError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::Conflict(_) => StatusCode::CONFLICT,
            ReconcileError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self.0);
        }
        let response: ApiResponse<()> = ApiResponse {
            success: false,
            message: format!("Error: {}", self.0),
            data: None,
        };
        (status, Json(response)).into_response()
    }
}
