use std::{convert::Infallible, sync::Arc};

use anyhow::{Context, Result};
use async_stream::stream;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap,
    },
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::{EnvVars, Settings, RATE_WINDOW},
    diagnostics,
    error::ProxyError,
    llm::{http_client, Dispatch, Dispatcher, StreamHandle},
    models::{ChatMessage, ChatRequest, ProviderCategory},
    rate_limit::{client_key, RateLimiter},
    registry::{ModelFilter, ProviderFilter, ProviderRegistry},
    secrets::{Credential, SecretResolver},
    telemetry,
    vendor::Vendor,
};

/**
 * \brief 进程级共享状态，通过 axum State 注入各处理函数。
 */
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub secrets: Arc<SecretResolver>,
    pub registry: Arc<ProviderRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: Arc<RateLimiter>,
    pub client: reqwest::Client,
}

impl AppState {
    /**
     * \brief 由配置与环境变量快照组装全部组件；不执行发现。
     */
    pub fn new(settings: Settings, env: EnvVars) -> Result<Self> {
        let client = http_client().context("failed to build HTTP client")?;
        let settings = Arc::new(settings);
        let secrets = Arc::new(SecretResolver::new(&settings, env));
        let registry = Arc::new(ProviderRegistry::new(
            client.clone(),
            settings.clone(),
            secrets.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            client.clone(),
            registry.clone(),
            secrets.clone(),
            settings.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(settings.max_requests_per_ip));
        Ok(Self {
            settings,
            secrets,
            registry,
            dispatcher,
            limiter,
            client,
        })
    }
}

/**
 * \brief 构建路由；UI 目录存在时作为静态资源回落服务。
 */
pub fn router(state: AppState) -> Router {
    let ui_dir = state.settings.ui_dir.clone();
    let app = Router::new()
        .route("/api/ask-ai-cloud", post(ask_ai_cloud).put(ask_ai_follow_up))
        .route("/api/chat", post(chat))
        .route(
            "/api/check-api-keys",
            get(key_status).post(validate_keys),
        )
        .route(
            "/api/test-api-key",
            post(test_api_key).get(connectivity),
        )
        .route("/api/providers", get(list_providers))
        .route("/api/providers/refresh", post(refresh_providers))
        .route("/api/models", get(list_models))
        .route("/api/config/validate", get(validate_config))
        .route("/api/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if ui_dir.exists() {
        let static_service =
            get_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
        app.fallback_service(static_service)
    } else {
        app
    }
}

/**
 * \brief 启动 HTTP 服务：先执行一次发现，再开启限流重置任务并监听。
 * \param addr 监听地址，如 "127.0.0.1:3000"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    state.registry.discover().await;
    let _reset = state.limiter.spawn_reset_task(RATE_WINDOW);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Deserialize, Debug, Default)]
struct ChatBody {
    /** \brief Provider 标识（云端接口中为厂商标签） */
    provider: Option<String>,
    model: Option<String>,
    messages: Option<Vec<ChatMessage>>,
    /** \brief 是否以流式返回（默认 true） */
    stream: Option<bool>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl ChatBody {
    fn into_request(self) -> Result<ChatRequest, ProxyError> {
        let missing: Vec<&str> = [
            ("provider", self.provider.as_deref().map_or(true, str::is_empty)),
            ("model", self.model.as_deref().map_or(true, str::is_empty)),
            ("messages", self.messages.is_none()),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(ProxyError::missing_fields(&missing));
        }

        let mut request = ChatRequest::new(
            self.provider.unwrap_or_default(),
            self.model.unwrap_or_default(),
            self.messages.unwrap_or_default(),
        )
        .streaming(self.stream.unwrap_or(true));
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;
        Ok(request)
    }
}

/**
 * \brief 解析请求体；无法解析的 JSON 视为缺少全部必填字段。
 */
fn parse_body(body: Result<Json<ChatBody>, JsonRejection>) -> Result<ChatRequest, ProxyError> {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected chat request body");
            ChatBody::default()
        }
    };
    body.into_request()
}

/**
 * \brief 限流检查；本地/开发模式下跳过。
 */
fn check_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    if !state.settings.rate_limit_enabled() {
        return Ok(());
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let key = client_key(forwarded);
    if state.limiter.allow(&key) {
        Ok(())
    } else {
        warn!(client = %key, "rate limit exceeded");
        Err(ProxyError::RateLimited)
    }
}

/**
 * \brief 把片段流写入分块文本响应；中途失败时追加一个 JSON 错误片段后结束。
 */
fn stream_response(handle: StreamHandle) -> Response {
    let StreamHandle {
        provider,
        model,
        mut fragments,
    } = handle;
    let body = stream! {
        while let Some(item) = fragments.next().await {
            match item {
                Ok(text) => yield Ok::<_, Infallible>(text),
                Err(err) => {
                    error!(provider = %provider, model = %model, error = %err, "stream failed mid-response");
                    telemetry::log_error("stream", &format!("provider={} error={}", provider, err));
                    yield Ok(err.to_json_fragment());
                    break;
                }
            }
        }
    };
    (
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

fn dispatch_response(dispatch: Dispatch) -> Response {
    match dispatch {
        Dispatch::Stream(handle) => stream_response(handle),
        Dispatch::Complete(result) => Json(result).into_response(),
    }
}

/**
 * \brief 云端聊天接口：POST /api/ask-ai-cloud，provider 为厂商标签。
 */
async fn ask_ai_cloud(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let request = parse_body(body)?;
    check_rate_limit(&state, &headers)?;
    let vendor = Vendor::cloud_from_tag(&request.provider_id)
        .ok_or_else(|| ProxyError::UnsupportedProvider(request.provider_id.clone()))?;
    let dispatch = state.dispatcher.send_cloud(vendor, request).await?;
    Ok(dispatch_response(dispatch))
}

/**
 * \brief 追问接口：PUT /api/ask-ai-cloud，始终非流式。
 */
async fn ask_ai_follow_up(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let request = parse_body(body)?.streaming(false);
    check_rate_limit(&state, &headers)?;
    let vendor = Vendor::cloud_from_tag(&request.provider_id)
        .ok_or_else(|| ProxyError::UnsupportedProvider(request.provider_id.clone()))?;
    let result = state
        .dispatcher
        .send_cloud(vendor, request)
        .await?
        .into_result()
        .await?;
    Ok(Json(result).into_response())
}

/**
 * \brief 按注册表分发的聊天接口：POST /api/chat，provider 可为 `auto`。
 */
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let request = parse_body(body)?;
    check_rate_limit(&state, &headers)?;
    let dispatch = state.dispatcher.send(request).await?;
    Ok(dispatch_response(dispatch))
}

/**
 * \brief 密钥状态：只返回布尔值，不返回密钥内容。
 */
async fn key_status(State(state): State<AppState>) -> Json<Value> {
    let available = state.secrets.availability();
    let has_cloud = available.values().any(|v| *v);
    let has_local = state
        .registry
        .snapshot()
        .providers()
        .iter()
        .any(|p| p.category == ProviderCategory::Local);
    Json(json!({
        "availableKeys": available,
        "config": {
            "localMode": state.settings.local_mode,
            "mixedMode": state.settings.mixed_mode,
            "ollamaUrl": state.settings.ollama_url(),
        },
        "hasLocalProviders": has_local,
        "hasCloudProviders": has_cloud,
    }))
}

/**
 * \brief 在线校验所有已配置的密钥。
 */
async fn validate_keys(State(state): State<AppState>) -> Json<Value> {
    let results =
        diagnostics::validate_configured_keys(&state.client, &state.settings, &state.secrets)
            .await;
    Json(json!({
        "validationResults": results,
        "timestamp": telemetry::timestamp(),
    }))
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct TestKeyBody {
    provider: Option<String>,
    api_key: Option<String>,
}

/**
 * \brief 测试调用方提供的密钥，不保存。
 */
async fn test_api_key(
    State(state): State<AppState>,
    body: Result<Json<TestKeyBody>, JsonRejection>,
) -> Result<Json<diagnostics::KeyTestReport>, ProxyError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let (Some(provider), Some(api_key)) = (
        body.provider.filter(|p| !p.is_empty()),
        body.api_key.filter(|k| !k.is_empty()),
    ) else {
        return Err(ProxyError::Validation(
            "Provider and API key are required".to_string(),
        ));
    };
    let credential = Credential::from_id(&provider)
        .filter(|c| diagnostics::testable(*c))
        .ok_or_else(|| ProxyError::UnsupportedProvider(provider.clone()))?;
    let report =
        diagnostics::test_key(&state.client, &state.settings.endpoints, credential, &api_key)
            .await;
    info!(vendor = credential.id(), valid = report.is_valid, "ad-hoc key tested");
    Ok(Json(report))
}

/**
 * \brief 厂商连通性诊断。
 */
async fn connectivity(State(state): State<AppState>) -> Json<Value> {
    let results = diagnostics::check_connectivity(&state.client, &state.settings.endpoints).await;
    Json(json!({
        "connectivity": results,
        "timestamp": telemetry::timestamp(),
    }))
}

#[derive(Deserialize, Debug, Default)]
struct ListQuery {
    category: Option<String>,
    provider: Option<String>,
}

impl ListQuery {
    fn category(&self) -> Result<Option<ProviderCategory>, ProxyError> {
        match self.category.as_deref().filter(|c| !c.is_empty()) {
            None => Ok(None),
            Some(raw) => ProviderCategory::parse(raw)
                .map(Some)
                .ok_or_else(|| ProxyError::Validation(format!("Unknown category: {}", raw))),
        }
    }
}

/**
 * \brief 列出可用 Provider。
 */
async fn list_providers(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ProxyError> {
    let providers = state.registry.get_providers(&ProviderFilter {
        category: q.category()?,
    });
    Ok(Json(json!({
        "providers": providers,
        "localMode": state.settings.local_mode,
        "mixedMode": state.settings.mixed_mode,
    })))
}

/**
 * \brief 列出模型并附带推荐模型。
 */
async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ProxyError> {
    let models = state.registry.get_models(&ModelFilter {
        category: q.category()?,
        provider: q.provider.clone().filter(|p| !p.is_empty()),
    });
    Ok(Json(json!({
        "models": models,
        "recommended": state.registry.get_recommended_model(),
    })))
}

/**
 * \brief 重新执行发现。
 */
async fn refresh_providers(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.discover().await;
    telemetry::log_event(
        "registry",
        &format!(
            "refresh providers={} models={}",
            snapshot.providers().len(),
            snapshot.models().len()
        ),
    );
    Json(json!({
        "providers": snapshot.providers(),
        "models": snapshot.models(),
    }))
}

async fn validate_config(State(state): State<AppState>) -> Json<diagnostics::ConfigReport> {
    Json(diagnostics::validate_config(&state.settings, &state.secrets))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "providers": snapshot.providers().len(),
        "models": snapshot.models().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_validation_lists_missing_fields() {
        let body = ChatBody {
            provider: Some("openai".into()),
            ..Default::default()
        };
        let err = body.into_request().err().expect("invalid");
        assert_eq!(err.to_string(), "Missing required fields: model, messages");
    }

    #[test]
    fn test_body_defaults() {
        let body: ChatBody = serde_json::from_value(json!({
            "provider": "groq",
            "model": "groq-llama-3.3-70b-versatile",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2
        }))
        .expect("body");
        let req = body.into_request().expect("valid");
        assert!(req.stream);
        assert_eq!(req.max_tokens, None);
        assert_eq!(req.temperature, Some(0.2));
    }

    #[test]
    fn test_rate_limit_skipped_in_dev_mode() {
        let env: EnvVars = [("DEV_MODE", "true"), ("MAX_REQUESTS_PER_IP", "1")]
            .into_iter()
            .collect();
        let state = AppState::new(Settings::from_env(&env), env).expect("state");
        let headers = HeaderMap::new();
        for _ in 0..5 {
            assert!(check_rate_limit(&state, &headers).is_ok());
        }
    }

    #[test]
    fn test_list_query_rejects_unknown_category() {
        let q = ListQuery {
            category: Some("edge".into()),
            provider: None,
        };
        assert!(matches!(q.category(), Err(ProxyError::Validation(_))));
    }
}
