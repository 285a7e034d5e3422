use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/**
 * \brief 代理层统一错误类型。
 */
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),

    #[error("Too many requests. Please wait a moment.")]
    RateLimited,

    #[error("{vendor} API key not configured")]
    MissingCredential { vendor: &'static str },

    #[error("API Error: {status} {status_text}")]
    Upstream { status: u16, status_text: String },

    #[error("No content returned from the model")]
    EmptyResponse,

    #[error("malformed stream line: {0}")]
    MalformedStreamLine(String),

    #[error("Provider {0} not supported")]
    UnsupportedProvider(String),

    #[error("Provider {0} not found")]
    ProviderNotFound(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("An error occurred while processing your request.")]
    Internal(String),
}

impl ProxyError {
    /**
     * \brief 缺少必填字段时的校验错误。
     */
    pub fn missing_fields(fields: &[&str]) -> Self {
        Self::Validation(format!("Missing required fields: {}", fields.join(", ")))
    }

    /**
     * \brief 错误对应的 HTTP 状态码。
     */
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::EmptyResponse | Self::UnsupportedProvider(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /**
     * \brief 序列化为 `{ok:false, message}`，用于流式响应末尾的错误片段。
     */
    pub fn to_json_fragment(&self) -> String {
        json!({ "ok": false, "message": self.to_string() }).to_string()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(detail = %detail, "internal error");
        }
        let body = json!({ "ok": false, "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
